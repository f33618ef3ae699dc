//! # strax_formatter_cli
//!
//! Part of the strax_formatter crate family.
//!
//! Replays raw digitizer dumps through the strax formatter from the command line.
//!
//! ## Use
//!
//! Make a template configuration with
//!
//! ```bash
//! strax_formatter_cli -p config.yml new
//! ```
//!
//! then edit it and replay one dump file per board:
//!
//! ```bash
//! strax_formatter_cli -p config.yml -d 0:board0.dat -d 1:board1.dat
//! ```
//!
//! A dump file holds the little endian 32-bit words read from a board, event after event.
//! Logs are written to `./strax_formatter.log`, and to the terminal except while the
//! progress bar is shown.
mod dump_file;

use clap::{Arg, ArgAction, Command};
use dump_file::FileDigitizer;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use libstrax_formatter::board::{read_packet, Digitizer};
use libstrax_formatter::config::Config;
use libstrax_formatter::error::BoardError;
use libstrax_formatter::formatter::StraxFormatter;

/// Producers back off while the formatter holds more than this
const MAX_BUFFERED_BYTES: i64 = 512 * 1024 * 1024;
const THROTTLE_DELAY: Duration = Duration::from_millis(10);

fn make_template_config(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::default();
    let yaml_str = serde_yaml::to_string(&config)?;
    let mut file = File::create(path)?;
    file.write_all(yaml_str.as_bytes())?;
    Ok(())
}

const LOG_PATH: &str = "./strax_formatter.log";

/// Both loggers write to the same log file; only `terminal` also writes to stdout
struct Loggers {
    terminal: Arc<spdlog::Logger>,
    file_only: Arc<spdlog::Logger>,
}

fn build_loggers(log_path: &Path) -> Result<Loggers, spdlog::Error> {
    let file_sink = Arc::new(
        spdlog::sink::FileSink::builder()
            .path(log_path.to_path_buf())
            .formatter(Box::new(spdlog::formatter::PatternFormatter::new(
                spdlog::formatter::pattern!(
                    "[{date_short} {time_short}] - [thread: {tid}] - [{^{level}}] - {payload}{eol}"
                ),
            )))
            .truncate(true)
            .build()?,
    );
    let terminal_sink = Arc::new(
        spdlog::sink::StdStreamSink::builder()
            .std_stream(spdlog::sink::StdStream::Stdout)
            .build()?,
    );
    let terminal = Arc::new(
        spdlog::Logger::builder()
            .flush_level_filter(spdlog::LevelFilter::All)
            .sink(file_sink.clone())
            .sink(terminal_sink)
            .build()?,
    );
    let file_only = Arc::new(
        spdlog::Logger::builder()
            .flush_level_filter(spdlog::LevelFilter::All)
            .sink(file_sink)
            .build()?,
    );
    Ok(Loggers {
        terminal,
        file_only,
    })
}

/// Parse a `board:path` argument
fn parse_dump_arg(arg: &str) -> Option<(u16, PathBuf)> {
    let (board, path) = arg.split_once(':')?;
    Some((board.trim().parse().ok()?, PathBuf::from(path)))
}

/// Feed every packet of a dump to the formatter, holding back while its buffers are full
fn replay(
    formatter: &StraxFormatter,
    mut digitizer: FileDigitizer,
    pb: &ProgressBar,
) -> Result<(), BoardError> {
    let id = digitizer.info().id;
    spdlog::info!(
        "Replaying {} ({}) as board {}",
        digitizer.path().to_string_lossy(),
        human_bytes::human_bytes(digitizer.size_bytes() as f64),
        id
    );
    loop {
        let (input, output) = formatter.buffer_sizes();
        if input + output > MAX_BUFFERED_BYTES {
            std::thread::sleep(THROTTLE_DELAY);
            continue;
        }
        let Some(packet) = read_packet(&mut digitizer)? else {
            break;
        };
        let size = packet.size_bytes() as u64;
        if let Err(e) = formatter.submit(id, vec![packet]) {
            spdlog::error!("{}", e);
            break;
        }
        pb.inc(size);
    }
    spdlog::info!("Board {} done", id);
    Ok(())
}

fn main() {
    // Create a cli
    let matches = Command::new("strax_formatter_cli")
        .arg_required_else_help(true)
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .arg(
            Arg::new("path")
                .short('p')
                .long("path")
                .required(true)
                .help("Path to the configuration file"),
        )
        .arg(
            Arg::new("dump")
                .short('d')
                .long("dump")
                .action(ArgAction::Append)
                .help("Raw dump of a board to replay, as board_id:path"),
        )
        .get_matches();

    let loggers = match build_loggers(Path::new(LOG_PATH)) {
        Ok(loggers) => {
            spdlog::set_default_logger(loggers.terminal.clone());
            Some(loggers)
        }
        Err(e) => {
            eprintln!("Could not set up logging, using the default logger: {e}");
            None
        }
    };

    let Some(config_path) = matches.get_one::<String>("path").map(PathBuf::from) else {
        spdlog::error!("A configuration path is required");
        return;
    };

    if let Some(("new", _)) = matches.subcommand() {
        spdlog::info!(
            "Making a template config at {}...",
            config_path.to_string_lossy()
        );
        match make_template_config(&config_path) {
            Ok(()) => spdlog::info!("Done."),
            Err(e) => spdlog::error!("Could not write template config: {e}"),
        }
        return;
    }

    // Load our config
    spdlog::info!("Loading config from {}...", config_path.to_string_lossy());
    let config = match Config::read_config_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            spdlog::error!("{e}");
            return;
        }
    };
    spdlog::info!("Config successfully loaded.");
    spdlog::info!("Output Path: {}", config.host_directory().to_string_lossy());
    spdlog::info!(
        "Chunk Length: {} ns Overlap: {} ns",
        config.chunk_length_ns,
        config.chunk_overlap_ns
    );

    let mut digitizers = Vec::new();
    for arg in matches.get_many::<String>("dump").into_iter().flatten() {
        let Some((board_id, path)) = parse_dump_arg(arg) else {
            spdlog::error!("Dump argument {arg} is not of the form board_id:path");
            return;
        };
        match FileDigitizer::open(board_id, &path) {
            Ok(d) => digitizers.push(d),
            Err(e) => {
                spdlog::error!("{e}");
                return;
            }
        }
    }
    if digitizers.is_empty() {
        spdlog::warn!("No dumps given, nothing to do.");
        return;
    }

    let formatter = match StraxFormatter::new(config) {
        Ok(f) => f,
        Err(e) => {
            spdlog::error!("{e}");
            return;
        }
    };

    // Setup the progress bar
    let total: usize = digitizers.iter().map(FileDigitizer::size_bytes).sum();
    let pb = ProgressBar::new(total as u64);
    if let Ok(style) = ProgressStyle::with_template(
        "{bar:40.cyan/blue} {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
    ) {
        pb.set_style(style);
    }
    // The bar owns the terminal until it finishes
    if let Some(loggers) = &loggers {
        spdlog::info!("Logging to {LOG_PATH} only while replaying");
        spdlog::set_default_logger(loggers.file_only.clone());
    }

    std::thread::scope(|scope| {
        let handles: Vec<_> = digitizers
            .into_iter()
            .map(|digitizer| {
                let formatter = &formatter;
                let pb = &pb;
                scope.spawn(move || replay(formatter, digitizer, pb))
            })
            .collect();

        // Report rates and buffer levels about once a second
        while !handles.iter().all(|h| h.is_finished()) {
            std::thread::sleep(Duration::from_secs(1));
            let rates = formatter.take_channel_rates();
            let total_rate: u64 = rates.values().sum();
            let (input, output) = formatter.buffer_sizes();
            spdlog::debug!(
                "{}/s over {} channels, buffered in: {} out: {}",
                human_bytes::human_bytes(total_rate as f64),
                rates.len(),
                human_bytes::human_bytes(input as f64),
                human_bytes::human_bytes(output as f64)
            );
        }
        for handle in handles {
            match handle.join() {
                Ok(Ok(())) => (),
                Ok(Err(e)) => spdlog::error!("Replay failed with error: {e}"),
                Err(_) => spdlog::error!("Failed to join replay task!"),
            }
        }
    });
    pb.finish();
    if let Some(loggers) = &loggers {
        spdlog::set_default_logger(loggers.terminal.clone());
    }

    for (channel, stats) in formatter.per_channel_stats() {
        spdlog::info!(
            "Channel {}: {} fragments, {}",
            channel,
            stats.fragments,
            human_bytes::human_bytes(stats.bytes as f64)
        );
    }

    match formatter.close() {
        Ok(failures) if failures.is_empty() => spdlog::info!("All chunks written."),
        Ok(failures) => {
            for (chunk, attempts) in failures {
                spdlog::error!("Chunk {} failed {} write attempts", chunk, attempts);
            }
        }
        Err(e) => spdlog::error!("Formatting failed with error: {e}"),
    }

    spdlog::info!("Done.");
}

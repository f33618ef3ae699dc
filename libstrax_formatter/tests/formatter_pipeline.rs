//! End to end tests of the threaded formatter: packets go in from several readout
//! threads, chunk directories come out.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use libstrax_formatter::chunk_writer::read_chunk_file;
use libstrax_formatter::compressor::Compressor;
use libstrax_formatter::config::Config;
use libstrax_formatter::constants::{EVENT_HEADER_MARKER, EVENT_MARKER_SHIFT};
use libstrax_formatter::formatter::StraxFormatter;
use libstrax_formatter::fragment::Fragment;
use libstrax_formatter::packet::{BoardInfo, RawPacket, WordBuffer};

const FULL_CHUNK_NS: i64 = 11_000;
const OVERLAP_NS: i64 = 1_000;
const PAYLOAD: [u32; 3] = [0x0001_0002, 0x0003_0004, 0x0005_0006];

fn config(output: &Path) -> Config {
    Config {
        output_path: output.to_path_buf(),
        hostname: String::from("test"),
        chunk_length_ns: 10_000,
        chunk_overlap_ns: OVERLAP_NS,
        fragment_payload_bytes: 8,
        buffer_num_chunks: 100,
        compressor: Compressor::Lz4,
        write_retries: 0,
        retry_delay_ms: 0,
        poll_timeout_ms: 5,
        deadtime_threshold_ms: 600_000,
        ..Default::default()
    }
}

/// One event reading channels 0 and 1 at `ticks`, each with the same 3 payload words.
/// Every readout becomes two fragments with 8 byte payloads.
fn packet(board: u16, ticks: u32) -> RawPacket {
    let mut words = vec![(EVENT_HEADER_MARKER << EVENT_MARKER_SHIFT) | 14, 0b11, 0, ticks];
    for _ in 0..2 {
        words.push(5);
        words.push(ticks);
        words.extend_from_slice(&PAYLOAD);
    }
    RawPacket::new(BoardInfo::new(board), WordBuffer::from_words(&words), ticks)
}

/// Chunk directories by index, checking that nothing else is left in the host directory
fn chunk_directories(host: &Path) -> BTreeMap<i64, std::path::PathBuf> {
    let mut chunks = BTreeMap::new();
    for entry in fs::read_dir(host).unwrap() {
        let entry = entry.unwrap();
        let name = entry.file_name().to_string_lossy().to_string();
        if name == "THE_END" {
            continue;
        }
        let index: i64 = name
            .parse()
            .unwrap_or_else(|_| panic!("unexpected entry {name}"));
        chunks.insert(index, entry.path());
    }
    chunks
}

fn read(path: &Path) -> Vec<Fragment> {
    read_chunk_file(path, Compressor::Lz4).unwrap()
}

#[test]
fn test_every_fragment_lands_in_its_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let formatter = StraxFormatter::new(config(dir.path())).unwrap();
    // chunks only wait for boards the formatter has heard from
    for board in 0..2u16 {
        formatter.submit(board, vec![packet(board, 50)]).unwrap();
    }

    std::thread::scope(|scope| {
        for board in 0..2u16 {
            let formatter = &formatter;
            scope.spawn(move || {
                for k in 1..40 {
                    formatter.submit(board, vec![packet(board, 50 + k * 250)]).unwrap();
                }
            });
        }
    });

    let expected = 2 * 40 * 4;
    let start = Instant::now();
    while formatter.per_channel_stats().values().map(|s| s.fragments).sum::<u64>() < expected {
        assert!(start.elapsed() < Duration::from_secs(10), "formatter stalled");
        std::thread::sleep(Duration::from_millis(5));
    }
    let stats = formatter.per_channel_stats();
    assert_eq!(stats.keys().copied().collect::<Vec<_>>(), vec![0, 1, 8, 9]);
    let rates = formatter.take_channel_rates();
    assert_eq!(rates[&8], stats[&8].bytes);
    let (input, output) = formatter.buffer_sizes();
    assert_eq!(input, 0);
    assert!(output > 0);

    let failures = formatter.close().unwrap();
    assert!(failures.is_empty());

    let host = dir.path().join("test");
    assert!(host.join("THE_END").is_file());
    let chunks = chunk_directories(&host);
    // chunk indices run from 0 without holes
    let indices: Vec<i64> = chunks.keys().copied().collect();
    // the last packets, at 98 us, sit in the overlap of chunk 8
    assert_eq!(indices, (0..=9).collect::<Vec<_>>());

    let mut written = 0;
    for (index, chunk) in chunks.iter() {
        for channel in [0, 1, 8, 9] {
            let fragments = read(&chunk.join(channel.to_string()));
            assert!(fragments
                .iter()
                .all(|f| f.time().div_euclid(FULL_CHUNK_NS) == *index && f.channel() == channel));
            written += fragments.len() as u64;

            // every overlap fragment is repeated in the next chunk's pre file
            let overlap: Vec<Fragment> = fragments
                .iter()
                .filter(|f| FULL_CHUNK_NS * (index + 1) - f.time() <= OVERLAP_NS)
                .cloned()
                .collect();
            let pre = host
                .join(format!("{:06}", index + 1))
                .join(format!("{channel}_pre"));
            if overlap.is_empty() {
                assert!(!pre.exists(), "unexpected {}", pre.to_string_lossy());
            } else {
                assert_eq!(read(&pre), overlap);
            }
        }
    }
    assert_eq!(written, expected);

    let last = &chunks[&9];
    for channel in [0, 1, 8, 9] {
        assert!(read(&last.join(channel.to_string())).is_empty());
        let pre = read(&last.join(format!("{channel}_pre")));
        let times: Vec<i64> = pre.iter().map(Fragment::time).collect();
        assert_eq!(times, vec![98_000, 98_040]);
    }
}

#[test]
fn test_overlap_fragments_are_repeated_in_next_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let formatter = StraxFormatter::new(config(dir.path())).unwrap();
    // 10 us is the start of the overlap region of chunk 0
    formatter
        .submit(0, vec![packet(0, 1_000), packet(0, 3_000)])
        .unwrap();
    let failures = formatter.close().unwrap();
    assert!(failures.is_empty());

    let host = dir.path().join("test");
    let owned = read(&host.join("000000").join("0"));
    let times: Vec<i64> = owned.iter().map(Fragment::time).collect();
    assert_eq!(times, vec![10_000, 10_040]);
    assert!(!host.join("000000").join("0_pre").exists());

    assert_eq!(read(&host.join("000001").join("0_pre")), owned);
    assert!(read(&host.join("000001").join("0")).is_empty());
    assert_eq!(read(&host.join("000002").join("1")).len(), 2);

    // the fragments put back together give the readout
    let rebuilt: Vec<u8> = owned.iter().flat_map(|f| f.payload().to_vec()).collect();
    assert_eq!(rebuilt, WordBuffer::from_words(&PAYLOAD).view().as_bytes());
}

#[test]
fn test_unwritable_output_reports_failures() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    fs::write(&blocker, b"").unwrap();
    let formatter = StraxFormatter::new(Config {
        write_retries: 1,
        ..config(&blocker)
    })
    .unwrap();
    formatter.submit(0, vec![packet(0, 100)]).unwrap();
    let failures = formatter.close().unwrap();
    assert_eq!(failures, BTreeMap::from([(0, 2)]));
}

#[test]
fn test_invalid_config_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let result = StraxFormatter::new(Config {
        chunk_overlap_ns: 20_000,
        ..config(dir.path())
    });
    assert!(result.is_err());
}

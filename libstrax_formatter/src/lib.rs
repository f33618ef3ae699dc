//! # strax_formatter
//!
//! strax_formatter is the live reformatter of a digitizer readout, written in Rust. It
//! takes the raw buffers read from CAEN V1724 style boards, cuts every channel readout into
//! fixed size strax fragments with absolute 64-bit timestamps, groups them into time
//! chunks and writes each chunk atomically to disk, one compressed file per channel.
//!
//! ## Usage
//!
//! The library is driven through [`formatter::StraxFormatter`]. Readout threads submit
//! packets from their boards, watch the buffer gauges to throttle themselves, and the
//! formatter thread writes chunks as soon as every board has moved past them. Closing the
//! formatter flushes everything and reports the chunks that could not be written.
//!
//! ```no_run
//! use libstrax_formatter::config::Config;
//! use libstrax_formatter::formatter::StraxFormatter;
//!
//! let formatter = StraxFormatter::new(Config::default()).unwrap();
//! // formatter.submit(board_id, packets) from any readout thread
//! let failures = formatter.close().unwrap();
//! assert!(failures.is_empty());
//! ```
//!
//! ## Configuration
//!
//! Configurations are YAML files; any field left out takes its default value:
//!
//! ```yml
//! output_path: ./strax_data
//! hostname: reader
//! chunk_length_ns: 5000000000
//! chunk_overlap_ns: 500000000
//! fragment_payload_bytes: 220
//! buffer_num_chunks: 2
//! warn_if_chunk_older_than: 3
//! chunk_name_length: 6
//! deadtime_threshold_ms: 5000
//! compressor: lz4
//! write_retries: 3
//! retry_delay_ms: 50
//! poll_timeout_ms: 100
//! channel_map_path: null
//! channels_per_board: 8
//! ```
//!
//! ### Channel Map Format
//!
//! The channel map is a CSV file with a header line and *no* whitespaces:
//!
//! ```csv
//! board,channel,strax_channel
//! ```
//!
//! If `channel_map_path` is `null`, board `b` channel `c` becomes strax channel
//! `b * channels_per_board + c`.
//!
//! ## Output
//!
//! ```text
//! <output_path>/<hostname>
//! |---- 000000
//! |    |---- 0            fragments of channel 0 in chunk 0
//! |    |---- 1
//! |---- 000001
//! |    |---- 0
//! |    |---- 0_pre        overlap fragments of channel 0 from chunk 0
//! |    |---- 1
//! |---- THE_END
//! ```
//!
//! Each channel file is a sequence of fragments, a 24 byte little endian header (time i64,
//! length i32, sample_width i16, channel i16, pulse_length i32, fragment_index i16,
//! baseline i16) followed by `length` samples of 2 bytes, compressed as a whole.
pub mod board;
pub mod channel_map;
pub mod chunk_store;
pub mod chunk_writer;
pub mod clock;
pub mod compressor;
pub mod config;
pub mod constants;
pub mod decoder;
pub mod error;
pub mod formatter;
pub mod fragment;
pub mod packet;
pub mod packet_queue;
pub mod stats;

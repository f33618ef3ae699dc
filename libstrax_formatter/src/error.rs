use std::path::PathBuf;
use thiserror::Error;

use super::constants::*;
use super::packet::RawPacket;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Config has an invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum ChannelMapError {
    #[error("ChannelMap failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("ChannelMap failed to parse an integer: {0}")]
    ParsingError(#[from] std::num::ParseIntError),
    #[error("ChannelMap was given a file with the incorrect format; most likely the number of columns is incorrect")]
    BadFileFormat,
    #[error("Default channel map cannot represent board {0} channel {1} as a strax channel")]
    ChannelOutOfRange(u16, u16),
}

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("Raw buffer of {0} bytes is not aligned to {size} byte words", size=BYTES_PER_WORD)]
    Misaligned(usize),
}

#[derive(Debug, Error)]
pub enum BoardError {
    #[error("Board {0} readout failed due to IO error: {1}")]
    IOError(u16, std::io::Error),
    #[error("Board {0} returned a bad buffer: {1}")]
    BadBuffer(u16, PacketError),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FragmentError {
    #[error("Fragment buffer of {0} bytes is too small for a strax header of {size} bytes", size=STRAX_HEADER_SIZE)]
    TruncatedHeader(usize),
    #[error("Fragment declares {0} payload bytes but only {1} remain")]
    TruncatedPayload(usize, usize),
    #[error("Fragment header declares a negative length {0}")]
    NegativeLength(i32),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Event on board {board} declares {declared} words but only {available} remain in the packet")]
    BadEventSize {
        board: u16,
        declared: usize,
        available: usize,
    },
    #[error("Channel {channel} on board {board} declares {declared} words but only {available} remain in the event")]
    BadChannelSize {
        board: u16,
        channel: u16,
        declared: usize,
        available: usize,
    },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChunkStoreError {
    #[error("Fragment at {time} ns belongs to chunk {chunk} which was already written")]
    LateFragment { chunk: i64, time: i64 },
}

#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("Compression failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("LZ4 frame compression failed: {0}")]
    Lz4Error(#[from] lz4_flex::frame::Error),
}

#[derive(Debug, Error)]
pub enum ChunkWriteError {
    #[error("ChunkWriter failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("ChunkWriter failed due to compression error: {0}")]
    CompressionError(#[from] CompressionError),
    #[error("ChunkWriter refused to overwrite existing chunk directory {0:?}")]
    ChunkExists(PathBuf),
}

#[derive(Debug, Error)]
pub enum ChunkReadError {
    #[error("Reading chunk file failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Reading chunk file failed due to compression error: {0}")]
    CompressionError(#[from] CompressionError),
    #[error("Chunk file holds a malformed fragment: {0}")]
    FragmentError(#[from] FragmentError),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("PacketQueue is closed; {count} packets from board {0} were returned", count=.1.len())]
    Closed(u16, Vec<RawPacket>),
}

#[derive(Debug, Error)]
pub enum FormatterError {
    #[error("StraxFormatter failed due to Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("StraxFormatter failed due to ChannelMap error: {0}")]
    MapError(#[from] ChannelMapError),
    #[error("StraxFormatter failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("StraxFormatter worker thread panicked")]
    WorkerPanic,
}

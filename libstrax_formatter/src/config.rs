use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::compressor::Compressor;
use super::constants::STRAX_HEADER_SIZE;
use super::error::ConfigError;

/// Structure representing the formatter configuration. Contains output pathing and
/// chunking information.
/// Configs are seralizable and deserializable to YAML using serde and serde_yaml. Any
/// field missing from the YAML takes its default value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub output_path: PathBuf,
    pub hostname: String,
    pub chunk_length_ns: i64,
    pub chunk_overlap_ns: i64,
    pub fragment_payload_bytes: usize,
    pub buffer_num_chunks: i64,
    pub warn_if_chunk_older_than: i64,
    pub chunk_name_length: usize,
    pub deadtime_threshold_ms: u64,
    pub compressor: Compressor,
    pub write_retries: u32,
    pub retry_delay_ms: u64,
    pub poll_timeout_ms: u64,
    pub channel_map_path: Option<PathBuf>,
    pub channels_per_board: u16,
}

impl Default for Config {
    /// Generate a new Config object with the standard strax chunking (5 s chunks, 0.5 s overlap)
    fn default() -> Self {
        Self {
            output_path: PathBuf::from("./strax_data"),
            hostname: String::from("reader"),
            chunk_length_ns: 5_000_000_000,
            chunk_overlap_ns: 500_000_000,
            fragment_payload_bytes: 220,
            buffer_num_chunks: 2,
            warn_if_chunk_older_than: 3,
            chunk_name_length: 6,
            deadtime_threshold_ms: 5000,
            compressor: Compressor::default(),
            write_retries: 3,
            retry_delay_ms: 50,
            poll_timeout_ms: 100,
            channel_map_path: None,
            channels_per_board: 8,
        }
    }
}

impl Config {
    /// Read the configuration in a YAML file
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;

        let config = serde_yaml::from_str::<Self>(&yaml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the chunking and fragment parameters are usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_length_ns <= 0 {
            return Err(invalid("chunk_length_ns", "must be positive"));
        }
        if self.chunk_overlap_ns < 0 || self.chunk_overlap_ns >= self.chunk_length_ns {
            return Err(invalid(
                "chunk_overlap_ns",
                "must be non-negative and smaller than chunk_length_ns",
            ));
        }
        if self.fragment_payload_bytes == 0 || self.fragment_payload_bytes % 2 != 0 {
            return Err(invalid(
                "fragment_payload_bytes",
                "must be a positive, even number of bytes",
            ));
        }
        if self.buffer_num_chunks < 0 {
            return Err(invalid("buffer_num_chunks", "must be non-negative"));
        }
        if self.warn_if_chunk_older_than < 0 {
            return Err(invalid("warn_if_chunk_older_than", "must be non-negative"));
        }
        if self.chunk_name_length == 0 {
            return Err(invalid("chunk_name_length", "must be at least 1"));
        }
        if self.hostname.is_empty() {
            return Err(invalid("hostname", "must not be empty"));
        }
        if self.channels_per_board == 0 {
            return Err(invalid("channels_per_board", "must be at least 1"));
        }
        Ok(())
    }

    /// Length of the window covered by one chunk index, including the overlap
    pub fn full_chunk_length(&self) -> i64 {
        self.chunk_length_ns + self.chunk_overlap_ns
    }

    /// Size of a full fragment, header plus payload
    pub fn full_fragment_size(&self) -> usize {
        STRAX_HEADER_SIZE + self.fragment_payload_bytes
    }

    /// Get the directory all chunks of this host are written into
    pub fn host_directory(&self) -> PathBuf {
        self.output_path.join(&self.hostname)
    }

    pub fn deadtime_threshold(&self) -> Duration {
        Duration::from_millis(self.deadtime_threshold_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.to_string(),
    }
}

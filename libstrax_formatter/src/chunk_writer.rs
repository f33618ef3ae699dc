use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use time::OffsetDateTime;

use super::chunk_store::ChunkPayload;
use super::compressor::Compressor;
use super::config::Config;
use super::constants::{END_MARKER_NAME, PRE_REGION_SUFFIX, TEMP_SUFFIX};
use super::error::{ChunkReadError, ChunkWriteError};
use super::fragment::{parse_fragments, Fragment};

/// Result of writing one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The chunk directory is in place; bytes on disk
    Written(u64),
    /// Every attempt failed and the chunk was dropped
    Failed(u32),
}

/// ChunkWriter writes chunks taken from the ChunkStore to disk.
///
/// Each chunk becomes a directory `<output_path>/<hostname>/<index>` holding one file per
/// channel, plus a `<channel>_pre` file with the previous chunk's overlap fragments. The
/// directory is filled under a temporary name and renamed into place, so a chunk
/// directory is either complete or absent.
// Structure
// <output_path>/<hostname>
// |---- 000000
// |    |---- 0
// |    |---- 1
// |    |---- 1_pre
// |---- 000001
// |---- THE_END
#[derive(Debug)]
pub struct ChunkWriter {
    host_directory: PathBuf,
    hostname: String,
    chunk_name_length: usize,
    compressor: Compressor,
    write_retries: u32,
    retry_delay: Duration,
    failures: BTreeMap<i64, u32>,
    compression_time: Duration,
}

impl ChunkWriter {
    pub fn new(config: &Config) -> Self {
        Self {
            host_directory: config.host_directory(),
            hostname: config.hostname.clone(),
            chunk_name_length: config.chunk_name_length,
            compressor: config.compressor,
            write_retries: config.write_retries,
            retry_delay: config.retry_delay(),
            failures: BTreeMap::new(),
            compression_time: Duration::ZERO,
        }
    }

    /// Zero padded directory name of a chunk
    pub fn chunk_name(&self, index: i64) -> String {
        format!("{:0>width$}", index, width = self.chunk_name_length)
    }

    pub fn chunk_directory(&self, index: i64) -> PathBuf {
        self.host_directory.join(self.chunk_name(index))
    }

    fn temp_directory(&self, index: i64) -> PathBuf {
        self.host_directory
            .join(format!("{}{}", self.chunk_name(index), TEMP_SUFFIX))
    }

    /// Write a chunk, retrying up to the configured number of times.
    ///
    /// `channels` are all channels known so far; those without primary data get an empty
    /// file. Every failed attempt is counted against the chunk index. The payload is
    /// consumed either way.
    pub fn flush(&mut self, payload: ChunkPayload, channels: &[i16]) -> FlushOutcome {
        let attempts = self.write_retries + 1;
        for attempt in 1..=attempts {
            match self.write_chunk(&payload, channels) {
                Ok(bytes) => {
                    spdlog::debug!(
                        "Wrote chunk {} ({})",
                        self.chunk_name(payload.index),
                        human_bytes::human_bytes(bytes as f64)
                    );
                    return FlushOutcome::Written(bytes);
                }
                Err(e) => {
                    *self.failures.entry(payload.index).or_default() += 1;
                    spdlog::warn!(
                        "Failed to write chunk {} (attempt {}/{}): {}",
                        self.chunk_name(payload.index),
                        attempt,
                        attempts,
                        e
                    );
                    if attempt < attempts {
                        std::thread::sleep(self.retry_delay);
                    }
                }
            }
        }

        spdlog::error!(
            "Giving up on chunk {} after {} attempts, {} fragments were not written",
            self.chunk_name(payload.index),
            attempts,
            payload.fragment_count()
        );
        // Do not leave a half written chunk behind
        let temp = self.temp_directory(payload.index);
        if temp.exists() {
            if let Err(e) = fs::remove_dir_all(&temp) {
                spdlog::warn!("Could not remove {}: {}", temp.to_string_lossy(), e);
            }
        }
        FlushOutcome::Failed(attempts)
    }

    fn write_chunk(&mut self, payload: &ChunkPayload, channels: &[i16]) -> Result<u64, ChunkWriteError> {
        fs::create_dir_all(&self.host_directory)?;
        let final_directory = self.chunk_directory(payload.index);
        if final_directory.exists() {
            return Err(ChunkWriteError::ChunkExists(final_directory));
        }
        let temp = self.temp_directory(payload.index);
        if temp.exists() {
            fs::remove_dir_all(&temp)?;
        }
        fs::create_dir(&temp)?;

        let mut written = 0;
        for (channel, fragments) in payload.primary.iter() {
            written += self.write_file(&temp.join(channel.to_string()), fragments)?;
        }
        for (channel, fragments) in payload.pre.iter() {
            let name = format!("{channel}{PRE_REGION_SUFFIX}");
            written += self.write_file(&temp.join(name), fragments)?;
        }
        for channel in channels {
            if !payload.primary.contains_key(channel) {
                written += self.create_empty(&temp, *channel)?;
            }
        }

        fs::rename(&temp, &final_directory)?;
        Ok(written)
    }

    fn write_file(&mut self, path: &Path, fragments: &[Fragment]) -> Result<u64, ChunkWriteError> {
        let size = fragments.iter().map(Fragment::len).sum();
        let mut data = Vec::with_capacity(size);
        for fragment in fragments {
            data.extend_from_slice(fragment.as_bytes());
        }
        let start = Instant::now();
        let packed = self.compressor.compress(&data)?;
        self.compression_time += start.elapsed();
        fs::write(path, &packed)?;
        Ok(packed.len() as u64)
    }

    /// Write the file of a channel that has no fragments in a chunk
    pub fn create_empty(&mut self, directory: &Path, channel: i16) -> Result<u64, ChunkWriteError> {
        self.write_file(&directory.join(channel.to_string()), &[])
    }

    /// Give a channel first seen after chunks were written an empty file in each of the
    /// chunk directories below `up_to` that lack one.
    ///
    /// Chunks that were dropped have no directory and are skipped. Returns the number of
    /// files created.
    pub fn backfill_channel(&mut self, channel: i16, up_to: i64) -> usize {
        let mut created = 0;
        for index in 0..up_to {
            let directory = self.chunk_directory(index);
            if !directory.is_dir() || directory.join(channel.to_string()).exists() {
                continue;
            }
            match self.create_empty(&directory, channel) {
                Ok(_) => created += 1,
                Err(e) => spdlog::warn!(
                    "Could not backfill channel {} in chunk {}: {}",
                    channel,
                    self.chunk_name(index),
                    e
                ),
            }
        }
        if created > 0 {
            spdlog::info!(
                "Channel {} appeared late, created {} empty files in earlier chunks",
                channel,
                created
            );
        }
        created
    }

    /// Mark the output as finished
    pub fn write_end_marker(&self) -> Result<(), ChunkWriteError> {
        fs::create_dir_all(&self.host_directory)?;
        let closed_at = OffsetDateTime::now_utc().unix_timestamp_nanos();
        fs::write(
            self.host_directory.join(END_MARKER_NAME),
            format!("{} {}\n", self.hostname, closed_at),
        )?;
        Ok(())
    }

    /// Failed write attempts per chunk index
    pub fn failures(&self) -> &BTreeMap<i64, u32> {
        &self.failures
    }

    pub fn into_failures(self) -> BTreeMap<i64, u32> {
        self.failures
    }

    /// Time spent compressing chunk files so far
    pub fn compression_time(&self) -> Duration {
        self.compression_time
    }
}

/// Read back the fragments of one chunk file
pub fn read_chunk_file(path: &Path, compressor: Compressor) -> Result<Vec<Fragment>, ChunkReadError> {
    let packed = fs::read(path)?;
    let data = compressor.decompress(&packed)?;
    Ok(parse_fragments(&data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::StraxHeader;

    fn fragment(time: i64, channel: i16) -> Fragment {
        Fragment::new(
            StraxHeader {
                time,
                length: 0,
                sample_width: 10,
                channel,
                pulse_length: 2,
                fragment_index: 0,
                baseline: 0,
            },
            &[5, 6, 7, 8],
        )
    }

    fn config(output: &Path) -> Config {
        Config {
            output_path: output.to_path_buf(),
            hostname: String::from("host"),
            retry_delay_ms: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_chunk_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ChunkWriter::new(&config(dir.path()));
        let mut payload = ChunkPayload {
            index: 3,
            ..Default::default()
        };
        payload.primary.insert(1, vec![fragment(10, 1), fragment(20, 1)]);
        payload.pre.insert(2, vec![fragment(5, 2)]);

        let outcome = writer.flush(payload, &[1, 2, 4]);
        assert!(matches!(outcome, FlushOutcome::Written(_)));
        assert!(writer.failures().is_empty());

        let chunk = dir.path().join("host").join("000003");
        assert!(chunk.is_dir());
        assert!(!dir.path().join("host").join("000003_temp").exists());
        let compressor = Compressor::default();
        assert_eq!(
            read_chunk_file(&chunk.join("1"), compressor).unwrap(),
            vec![fragment(10, 1), fragment(20, 1)]
        );
        assert_eq!(
            read_chunk_file(&chunk.join("2_pre"), compressor).unwrap(),
            vec![fragment(5, 2)]
        );
        assert!(read_chunk_file(&chunk.join("2"), compressor).unwrap().is_empty());
        assert!(read_chunk_file(&chunk.join("4"), compressor).unwrap().is_empty());
        assert!(!chunk.join("4_pre").exists());
    }

    #[test]
    fn test_existing_chunk_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ChunkWriter::new(&Config {
            write_retries: 1,
            ..config(dir.path())
        });
        let first = writer.flush(ChunkPayload::default(), &[0]);
        assert!(matches!(first, FlushOutcome::Written(_)));
        let second = writer.flush(ChunkPayload::default(), &[0]);
        assert_eq!(second, FlushOutcome::Failed(2));
        assert_eq!(writer.failures()[&0], 2);
    }

    #[test]
    fn test_unwritable_output_is_retried_then_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not_a_directory");
        fs::write(&blocker, b"").unwrap();
        let mut writer = ChunkWriter::new(&Config {
            write_retries: 2,
            ..config(&blocker)
        });
        let mut payload = ChunkPayload {
            index: 7,
            ..Default::default()
        };
        payload.primary.insert(0, vec![fragment(1, 0)]);

        assert_eq!(writer.flush(payload, &[0]), FlushOutcome::Failed(3));
        assert_eq!(writer.into_failures(), BTreeMap::from([(7, 3)]));
    }

    #[test]
    fn test_uncompressed_files_are_plain_fragments() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ChunkWriter::new(&Config {
            compressor: Compressor::None,
            ..config(dir.path())
        });
        let mut payload = ChunkPayload::default();
        payload.primary.insert(0, vec![fragment(1, 0)]);
        writer.flush(payload, &[]);
        let raw = fs::read(dir.path().join("host").join("000000").join("0")).unwrap();
        assert_eq!(raw, fragment(1, 0).as_bytes());
    }

    #[test]
    fn test_backfill_late_channel() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ChunkWriter::new(&config(dir.path()));
        for index in [0, 2] {
            let payload = ChunkPayload {
                index,
                ..Default::default()
            };
            writer.flush(payload, &[0]);
        }
        // chunk 1 was never written
        assert_eq!(writer.backfill_channel(5, 3), 2);
        let host = dir.path().join("host");
        let compressor = Compressor::default();
        assert!(read_chunk_file(&host.join("000000").join("5"), compressor)
            .unwrap()
            .is_empty());
        assert!(host.join("000002").join("5").is_file());
        assert!(!host.join("000001").exists());
        // nothing left to do the second time
        assert_eq!(writer.backfill_channel(5, 3), 0);
        assert_eq!(writer.backfill_channel(0, 3), 0);
    }

    #[test]
    fn test_end_marker() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ChunkWriter::new(&config(dir.path()));
        writer.write_end_marker().unwrap();
        let contents = fs::read_to_string(dir.path().join("host").join(END_MARKER_NAME)).unwrap();
        assert!(contents.starts_with("host "));
    }

    #[test]
    fn test_chunk_name() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ChunkWriter::new(&Config {
            chunk_name_length: 4,
            ..config(dir.path())
        });
        assert_eq!(writer.chunk_name(12), "0012");
        assert_eq!(writer.chunk_name(123456), "123456");
    }
}

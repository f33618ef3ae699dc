use byteorder::{ByteOrder, LittleEndian};
use std::path::{Path, PathBuf};

use libstrax_formatter::board::Digitizer;
use libstrax_formatter::constants::{
    BYTES_PER_WORD, EVENT_HEADER_MARKER, EVENT_HEADER_WORDS, EVENT_MARKER_SHIFT, EVENT_SIZE_MASK,
    TIME_TAG_MASK,
};
use libstrax_formatter::error::{BoardError, PacketError};
use libstrax_formatter::packet::BoardInfo;

/// Upper bound on the words handed out by one read, events are never split
const BUFFER_WORDS: usize = 256 * 1024;

/// A board replayed from a dump file of raw little endian readout words.
///
/// Each read returns whole events, like a block transfer from the board would.
#[derive(Debug)]
pub struct FileDigitizer {
    info: BoardInfo,
    path: PathBuf,
    words: Vec<u32>,
    position: usize,
    last_time: u32,
}

impl FileDigitizer {
    pub fn open(board_id: u16, path: &Path) -> Result<Self, BoardError> {
        let bytes = std::fs::read(path).map_err(|e| BoardError::IOError(board_id, e))?;
        if bytes.len() % BYTES_PER_WORD != 0 {
            return Err(BoardError::BadBuffer(
                board_id,
                PacketError::Misaligned(bytes.len()),
            ));
        }
        let mut words = vec![0; bytes.len() / BYTES_PER_WORD];
        LittleEndian::read_u32_into(&bytes, &mut words);
        Ok(Self {
            info: BoardInfo::new(board_id),
            path: path.to_path_buf(),
            words,
            position: 0,
            last_time: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size_bytes(&self) -> usize {
        self.words.len() * BYTES_PER_WORD
    }
}

impl Digitizer for FileDigitizer {
    fn info(&self) -> BoardInfo {
        self.info
    }

    fn read_buffer(&mut self) -> Result<Vec<u8>, BoardError> {
        let start = self.position;
        let total = self.words.len();
        let mut end = start;
        while end < total && end - start < BUFFER_WORDS {
            let word = self.words[end];
            if word >> EVENT_MARKER_SHIFT == EVENT_HEADER_MARKER {
                if end + EVENT_HEADER_WORDS <= total {
                    self.last_time = self.words[end + 3] & TIME_TAG_MASK;
                }
                let size = ((word & EVENT_SIZE_MASK) as usize).max(1);
                end = (end + size).min(total);
            } else {
                end += 1;
            }
        }
        self.position = end;

        let mut bytes = vec![0; (end - start) * BYTES_PER_WORD];
        LittleEndian::write_u32_into(&self.words[start..end], &mut bytes);
        Ok(bytes)
    }

    fn current_time(&mut self) -> Result<u32, BoardError> {
        Ok(self.last_time)
    }
}

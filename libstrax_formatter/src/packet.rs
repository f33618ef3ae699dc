use byteorder::{ByteOrder, LittleEndian};

use super::constants::{BYTES_PER_WORD, DEFAULT_SAMPLE_WIDTH_NS};
use super::error::PacketError;

/// Identity of the board a packet came from.
///
/// This is a plain copy of the board's identity; the board itself is owned by whoever
/// drives the readout, never by the formatter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BoardInfo {
    pub id: u16,
    pub sample_width_ns: i16,
}

impl BoardInfo {
    pub fn new(id: u16) -> Self {
        Self {
            id,
            sample_width_ns: DEFAULT_SAMPLE_WIDTH_NS,
        }
    }
}

/// An owned, word aligned byte buffer read from a board.
///
/// The digitizer speaks in 32-bit little-endian words; all access goes through a
/// [`WordView`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WordBuffer {
    bytes: Vec<u8>,
}

impl WordBuffer {
    /// Take ownership of raw bytes. Fails if the length is not a whole number of words.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, PacketError> {
        if bytes.len() % BYTES_PER_WORD != 0 {
            return Err(PacketError::Misaligned(bytes.len()));
        }
        Ok(Self { bytes })
    }

    pub fn from_words(words: &[u32]) -> Self {
        let mut bytes = vec![0; words.len() * BYTES_PER_WORD];
        LittleEndian::write_u32_into(words, &mut bytes);
        Self { bytes }
    }

    pub fn view(&self) -> WordView<'_> {
        WordView { bytes: &self.bytes }
    }

    pub fn len_bytes(&self) -> usize {
        self.bytes.len()
    }

    pub fn len_words(&self) -> usize {
        self.bytes.len() / BYTES_PER_WORD
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// A borrowed window of whole 32-bit words
#[derive(Debug, Clone, Copy)]
pub struct WordView<'a> {
    bytes: &'a [u8],
}

impl<'a> WordView<'a> {
    pub fn len(&self) -> usize {
        self.bytes.len() / BYTES_PER_WORD
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Read a word. Panics if out of range, callers check `len` first.
    pub fn word(&self, index: usize) -> u32 {
        let start = index * BYTES_PER_WORD;
        LittleEndian::read_u32(&self.bytes[start..start + BYTES_PER_WORD])
    }

    /// Sub-view of the words in `[start, end)`
    pub fn slice(&self, start: usize, end: usize) -> WordView<'a> {
        WordView {
            bytes: &self.bytes[start * BYTES_PER_WORD..end * BYTES_PER_WORD],
        }
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }
}

/// A batch of raw words read from one board in one readout.
///
/// Packets move through the queue into the formatter; they are never cloned on the way.
#[derive(Debug)]
pub struct RawPacket {
    pub board: BoardInfo,
    pub buffer: WordBuffer,
    /// Raw clock value of the readout, the trigger time tag of the first event
    pub header_time: u32,
}

impl RawPacket {
    pub fn new(board: BoardInfo, buffer: WordBuffer, header_time: u32) -> Self {
        Self {
            board,
            buffer,
            header_time,
        }
    }

    pub fn size_bytes(&self) -> usize {
        self.buffer.len_bytes()
    }
}

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use super::constants::{BYTES_PER_SAMPLE, STRAX_HEADER_SIZE};
use super::error::FragmentError;

/// The fixed strax record header preceding every fragment payload.
///
/// Layout (little-endian): time i64, length i32, sample_width i16, channel i16,
/// pulse_length i32, fragment_index i16, baseline i16.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StraxHeader {
    /// Absolute time of the first sample in ns
    pub time: i64,
    /// Samples in this fragment
    pub length: i32,
    pub sample_width: i16,
    pub channel: i16,
    /// Samples in the whole channel readout this fragment was cut from
    pub pulse_length: i32,
    pub fragment_index: i16,
    pub baseline: i16,
}

impl StraxHeader {
    /// Parse a header from the front of a buffer
    pub fn read_from(bytes: &[u8]) -> Result<Self, FragmentError> {
        if bytes.len() < STRAX_HEADER_SIZE {
            return Err(FragmentError::TruncatedHeader(bytes.len()));
        }
        let header = Self {
            time: LittleEndian::read_i64(&bytes[0..8]),
            length: LittleEndian::read_i32(&bytes[8..12]),
            sample_width: LittleEndian::read_i16(&bytes[12..14]),
            channel: LittleEndian::read_i16(&bytes[14..16]),
            pulse_length: LittleEndian::read_i32(&bytes[16..20]),
            fragment_index: LittleEndian::read_i16(&bytes[20..22]),
            baseline: LittleEndian::read_i16(&bytes[22..24]),
        };
        if header.length < 0 {
            return Err(FragmentError::NegativeLength(header.length));
        }
        Ok(header)
    }

    fn write_to(&self, buffer: &mut Vec<u8>) {
        // Writing into a Vec never fails
        let _ = buffer.write_i64::<LittleEndian>(self.time);
        let _ = buffer.write_i32::<LittleEndian>(self.length);
        let _ = buffer.write_i16::<LittleEndian>(self.sample_width);
        let _ = buffer.write_i16::<LittleEndian>(self.channel);
        let _ = buffer.write_i32::<LittleEndian>(self.pulse_length);
        let _ = buffer.write_i16::<LittleEndian>(self.fragment_index);
        let _ = buffer.write_i16::<LittleEndian>(self.baseline);
    }

    pub fn payload_bytes(&self) -> usize {
        self.length.max(0) as usize * BYTES_PER_SAMPLE
    }
}

/// A serialized strax fragment: header followed by its slice of the channel payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    header: StraxHeader,
    bytes: Vec<u8>,
}

impl Fragment {
    /// Serialize a fragment. The header length is taken from the payload.
    pub fn new(mut header: StraxHeader, payload: &[u8]) -> Self {
        header.length = (payload.len() / BYTES_PER_SAMPLE) as i32;
        let mut bytes = Vec::with_capacity(STRAX_HEADER_SIZE + payload.len());
        header.write_to(&mut bytes);
        bytes.extend_from_slice(payload);
        Self { header, bytes }
    }

    /// Synthetic fragment marking a channel as alive but silent at `time`
    pub fn deadtime_marker(time: i64, channel: i16, sample_width: i16) -> Self {
        Self::new(
            StraxHeader {
                time,
                length: 0,
                sample_width,
                channel,
                pulse_length: 0,
                fragment_index: 0,
                baseline: 0,
            },
            &[],
        )
    }

    pub fn is_deadtime_marker(&self) -> bool {
        self.header.length == 0 && self.header.pulse_length == 0
    }

    pub fn header(&self) -> &StraxHeader {
        &self.header
    }

    pub fn time(&self) -> i64 {
        self.header.time
    }

    pub fn channel(&self) -> i16 {
        self.header.channel
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[STRAX_HEADER_SIZE..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Split a concatenation of fragments (the contents of a chunk file) back into fragments
pub fn parse_fragments(mut bytes: &[u8]) -> Result<Vec<Fragment>, FragmentError> {
    let mut fragments = Vec::new();
    while !bytes.is_empty() {
        let header = StraxHeader::read_from(bytes)?;
        let end = STRAX_HEADER_SIZE + header.payload_bytes();
        if bytes.len() < end {
            return Err(FragmentError::TruncatedPayload(
                header.payload_bytes(),
                bytes.len() - STRAX_HEADER_SIZE,
            ));
        }
        fragments.push(Fragment {
            header,
            bytes: bytes[..end].to_vec(),
        });
        bytes = &bytes[end..];
    }
    Ok(fragments)
}

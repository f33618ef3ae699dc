use super::decoder::first_header_time;
use super::error::BoardError;
use super::packet::{BoardInfo, RawPacket, WordBuffer};

/// The readout side of a digitizer as seen by the formatter.
///
/// Implementations own the hardware (or a recording of it); the formatter only ever
/// receives the packets produced by [`read_packet`].
pub trait Digitizer {
    fn info(&self) -> BoardInfo;

    /// Drain the board's readout buffer. An empty buffer means no new data.
    fn read_buffer(&mut self) -> Result<Vec<u8>, BoardError>;

    /// Current value of the board's 31-bit clock
    fn current_time(&mut self) -> Result<u32, BoardError>;
}

/// Read one buffer from a board and wrap it as a packet.
///
/// The packet's header time is the trigger time tag of the first event in the buffer,
/// falling back to the board clock when the buffer holds no complete event header.
/// Returns None if the board had no data.
pub fn read_packet(board: &mut dyn Digitizer) -> Result<Option<RawPacket>, BoardError> {
    let info = board.info();
    let bytes = board.read_buffer()?;
    if bytes.is_empty() {
        return Ok(None);
    }
    let buffer = WordBuffer::from_bytes(bytes).map_err(|e| BoardError::BadBuffer(info.id, e))?;
    let header_time = match first_header_time(buffer.view()) {
        Some(time) => time,
        None => board.current_time()?,
    };
    Ok(Some(RawPacket::new(info, buffer, header_time)))
}

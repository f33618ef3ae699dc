use bitvec::prelude::*;

use super::channel_map::ChannelMap;
use super::clock::{absolute_time_ns, channel_epoch, ClockTracker};
use super::constants::*;
use super::error::DecodeError;
use super::fragment::{Fragment, StraxHeader};
use super::packet::{RawPacket, WordView};

/// Everything recovered from a single packet.
///
/// A decode error stops the packet at the point of failure; fragments found before it
/// are kept.
#[derive(Debug, Default)]
pub struct DecodedPacket {
    pub fragments: Vec<Fragment>,
    pub events: usize,
    pub channel_readouts: usize,
    pub skipped_words: usize,
    pub board_fail_events: usize,
    pub unmapped_readouts: usize,
    /// Fragments cut from each decoded event, in order
    pub event_fragments: Vec<usize>,
    /// Latest absolute fragment time in the packet
    pub max_time: Option<i64>,
    pub error: Option<DecodeError>,
}

/// PacketDecoder walks the event/channel header tree of raw digitizer packets and cuts
/// each channel readout into strax fragments.
#[derive(Debug, Clone)]
pub struct PacketDecoder {
    fragment_payload_bytes: usize,
    channel_map: ChannelMap,
}

impl PacketDecoder {
    pub fn new(fragment_payload_bytes: usize, channel_map: ChannelMap) -> Self {
        Self {
            fragment_payload_bytes,
            channel_map,
        }
    }

    pub fn channel_map(&self) -> &ChannelMap {
        &self.channel_map
    }

    /// Decode a packet using (and advancing) the clock of the board it came from
    pub fn decode(&self, packet: &RawPacket, clock: &mut ClockTracker) -> DecodedPacket {
        let mut decoded = DecodedPacket::default();
        let words = packet.buffer.view();
        if words.is_empty() {
            return decoded;
        }
        let packet_epoch = clock.resolve(packet.header_time);

        let mut idx = 0;
        while idx < words.len() {
            let word = words.word(idx);
            if word >> EVENT_MARKER_SHIFT != EVENT_HEADER_MARKER {
                // Filler between events
                decoded.skipped_words += 1;
                idx += 1;
                continue;
            }

            let event_words = (word & EVENT_SIZE_MASK) as usize;
            let available = words.len() - idx;
            if event_words < EVENT_HEADER_WORDS || event_words > available {
                decoded.error = Some(DecodeError::BadEventSize {
                    board: packet.board.id,
                    declared: event_words,
                    available,
                });
                break;
            }

            let event = words.slice(idx, idx + event_words);
            if let Err(e) = self.decode_event(event, packet, packet_epoch, &mut decoded) {
                decoded.error = Some(e);
                break;
            }
            idx += event_words;
        }

        if decoded.skipped_words > 0 {
            spdlog::debug!(
                "Skipped {} words outside of events on board {}",
                decoded.skipped_words,
                packet.board.id
            );
        }
        decoded
    }

    fn decode_event(
        &self,
        event: WordView<'_>,
        packet: &RawPacket,
        packet_epoch: i64,
        decoded: &mut DecodedPacket,
    ) -> Result<(), DecodeError> {
        let mask_word = event.word(1);
        if mask_word & BOARD_FAIL_BIT != 0 {
            decoded.board_fail_events += 1;
            spdlog::warn!(
                "Board {} has its fail flag set in event {}, skipping it",
                packet.board.id,
                event.word(2) & 0x00FF_FFFF
            );
            return Ok(());
        }
        decoded.events += 1;
        let first_fragment = decoded.fragments.len();

        let mask = mask_word & CHANNEL_MASK_BITS;
        let mut offset = EVENT_HEADER_WORDS;
        for channel in mask.view_bits::<Lsb0>().iter_ones() {
            let available = event.len() - offset;
            let channel_words = if available >= CHANNEL_HEADER_WORDS {
                (event.word(offset) & CHANNEL_SIZE_MASK) as usize
            } else {
                0
            };
            if channel_words <= CHANNEL_HEADER_WORDS || channel_words > available {
                return Err(DecodeError::BadChannelSize {
                    board: packet.board.id,
                    channel: channel as u16,
                    declared: channel_words,
                    available,
                });
            }

            let channel_time = event.word(offset + 1) & TIME_TAG_MASK;
            // A negative epoch can only come from a straggler before the first rollover. A
            // run whose clock starts late (>= HIGH) lands here too: its first stretch is put
            // in epoch 0, as are the times after its first wrap, so absolute time steps back
            // by up to one rollover period there.
            let epoch = channel_epoch(packet_epoch, packet.header_time, channel_time).max(0);
            let timestamp = absolute_time_ns(epoch, channel_time);
            let payload = event.slice(offset + CHANNEL_HEADER_WORDS, offset + channel_words);

            match self.channel_map.strax_channel(packet.board.id, channel as u16) {
                Some(strax_channel) => {
                    decoded.channel_readouts += 1;
                    self.fragment_readout(
                        payload.as_bytes(),
                        timestamp,
                        strax_channel,
                        packet.board.sample_width_ns,
                        decoded,
                    );
                }
                None => {
                    decoded.unmapped_readouts += 1;
                    spdlog::warn!(
                        "Board {} channel {} has no strax channel, dropping its readout",
                        packet.board.id,
                        channel
                    );
                }
            }
            offset += channel_words;
        }
        decoded
            .event_fragments
            .push(decoded.fragments.len() - first_fragment);
        Ok(())
    }

    /// Cut one channel readout into fragments of at most `fragment_payload_bytes`
    fn fragment_readout(
        &self,
        payload: &[u8],
        timestamp: i64,
        channel: i16,
        sample_width: i16,
        decoded: &mut DecodedPacket,
    ) {
        let samples_per_fragment = (self.fragment_payload_bytes / BYTES_PER_SAMPLE) as i64;
        let pulse_length = (payload.len() / BYTES_PER_SAMPLE) as i32;
        for (i, slice) in payload.chunks(self.fragment_payload_bytes).enumerate() {
            let time = timestamp + i as i64 * samples_per_fragment * sample_width as i64;
            let header = StraxHeader {
                time,
                length: 0,
                sample_width,
                channel,
                pulse_length,
                fragment_index: i16::try_from(i).unwrap_or(i16::MAX),
                baseline: 0,
            };
            decoded.max_time = Some(decoded.max_time.map_or(time, |t| t.max(time)));
            decoded.fragments.push(Fragment::new(header, slice));
        }
    }
}

/// Trigger time tag of the first event in a buffer, if there is one
pub fn first_header_time(words: WordView<'_>) -> Option<u32> {
    (0..words.len())
        .find(|idx| {
            words.word(*idx) >> EVENT_MARKER_SHIFT == EVENT_HEADER_MARKER
                && idx + EVENT_HEADER_WORDS <= words.len()
        })
        .map(|idx| words.word(idx + 3) & TIME_TAG_MASK)
}

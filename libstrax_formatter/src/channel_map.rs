// Maps the hardware address of a digitizer input, [board, board channel], onto the
// global channel number written into strax fragments. Without a map file the
// channels are simply numbered board by board.
use std::fs::File;
use std::io::Read;
use std::path::Path;

use fxhash::FxHashMap;

use super::error::ChannelMapError;

const ENTRIES_PER_LINE: usize = 3; //Number of elements in a single row in the CSV file (board, channel, strax channel)

/// Generate a unique key for a given hardware location
fn generate_key(board_id: u16, channel: u16) -> u32 {
    (channel as u32) + (board_id as u32) * 1_000
}

/// ChannelMap contains the mapping of the individual digitizer inputs (board ID, board channel) to strax channel.
///
/// This can change from detector to detector, so ChannelMap can read in a CSV file where each row contains 3 elements,
/// the board ID, the board channel, and the strax channel. If no file is given the default numbering
/// `board * channels_per_board + channel` is used.
#[derive(Debug, Clone)]
pub struct ChannelMap {
    map: Option<FxHashMap<u32, i16>>,
    channels_per_board: u16,
}

impl ChannelMap {
    /// Create a new ChannelMap
    /// If the path is None, we use the default board by board numbering
    pub fn new(path: Option<&Path>, channels_per_board: u16) -> Result<Self, ChannelMapError> {
        let Some(p) = path else {
            return Ok(Self {
                map: None,
                channels_per_board,
            });
        };

        let mut contents = String::new();
        let mut file = File::open(p)?;
        file.read_to_string(&mut contents)?;

        let mut map = FxHashMap::default();
        let mut lines = contents.lines();
        lines.next(); // Skip the header
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            let entries: Vec<&str> = line.split_terminator(",").map(str::trim).collect();
            if entries.len() != ENTRIES_PER_LINE {
                return Err(ChannelMapError::BadFileFormat);
            }

            let board_id: u16 = entries[0].parse()?;
            let channel: u16 = entries[1].parse()?;
            let strax_channel: i16 = entries[2].parse()?;
            map.insert(generate_key(board_id, channel), strax_channel);
        }

        Ok(Self {
            map: Some(map),
            channels_per_board,
        })
    }

    /// Get the strax channel for a given digitizer input.
    ///
    /// If returns None the input does not exist in the map
    pub fn strax_channel(&self, board_id: u16, channel: u16) -> Option<i16> {
        match &self.map {
            Some(map) => map.get(&generate_key(board_id, channel)).copied(),
            None => {
                if channel >= self.channels_per_board {
                    return None;
                }
                let global =
                    board_id as u32 * self.channels_per_board as u32 + channel as u32;
                i16::try_from(global).ok()
            }
        }
    }

    /// Every strax channel of an explicit map. Empty for the default numbering, where the
    /// set of channels is only known once data arrives.
    pub fn mapped_channels(&self) -> Vec<i16> {
        let mut channels: Vec<i16> = match &self.map {
            Some(map) => map.values().copied().collect(),
            None => Vec::new(),
        };
        channels.sort_unstable();
        channels.dedup();
        channels
    }

    /// Check that a board can be represented by the default numbering
    pub fn check_board(&self, board_id: u16) -> Result<(), ChannelMapError> {
        if self.map.is_none() {
            let last = self.channels_per_board - 1;
            if self.strax_channel(board_id, last).is_none() {
                return Err(ChannelMapError::ChannelOutOfRange(board_id, last));
            }
        }
        Ok(())
    }
}

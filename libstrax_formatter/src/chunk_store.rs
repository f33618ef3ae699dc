use bit_set::BitSet;
use std::collections::BTreeMap;

use super::error::ChunkStoreError;
use super::fragment::Fragment;

/// Fragments of one region of a chunk, per channel, in arrival order
pub type ChannelFragments = BTreeMap<i16, Vec<Fragment>>;

#[derive(Debug, Default)]
struct Chunk {
    primary: ChannelFragments,
    overlap: ChannelFragments,
}

/// A chunk removed from the store, ready to be written.
///
/// `pre` holds the overlap region of the previous chunk.
#[derive(Debug, Default)]
pub struct ChunkPayload {
    pub index: i64,
    pub primary: ChannelFragments,
    pub pre: ChannelFragments,
}

impl ChunkPayload {
    /// Fragments in the primary region
    pub fn fragment_count(&self) -> usize {
        self.primary.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.primary.is_empty() && self.pre.is_empty()
    }
}

fn region_bytes(region: &ChannelFragments) -> usize {
    region
        .values()
        .flat_map(|fragments| fragments.iter().map(Fragment::len))
        .sum()
}

/// ChunkStore buffers fragments by chunk index until they can be written.
///
/// A chunk covers `[index * full_chunk_length, (index + 1) * full_chunk_length)`, the
/// last `chunk_overlap` ns of which is also kept as the chunk's overlap region. Chunks
/// leave the store strictly in index order, starting from 0, so the written sequence
/// never has holes; indices that never saw data come out empty.
#[derive(Debug)]
pub struct ChunkStore {
    full_chunk_length: i64,
    chunk_overlap: i64,
    chunks: BTreeMap<i64, Chunk>,
    pre_regions: BTreeMap<i64, ChannelFragments>,
    next_index: i64,
    buffered_bytes: usize,
    known_channels: BitSet,
}

impl ChunkStore {
    pub fn new(full_chunk_length: i64, chunk_overlap: i64) -> Self {
        Self {
            full_chunk_length,
            chunk_overlap,
            chunks: BTreeMap::new(),
            pre_regions: BTreeMap::new(),
            next_index: 0,
            buffered_bytes: 0,
            known_channels: BitSet::new(),
        }
    }

    pub fn chunk_index(&self, time: i64) -> i64 {
        time.div_euclid(self.full_chunk_length)
    }

    /// Is this time inside the trailing overlap region of its chunk
    pub fn in_overlap(&self, time: i64) -> bool {
        let end = (self.chunk_index(time) + 1) * self.full_chunk_length;
        end - time <= self.chunk_overlap
    }

    /// Route a fragment to its chunk, and to the chunk's overlap region if it falls there
    pub fn add_fragment(&mut self, fragment: Fragment) -> Result<(), ChunkStoreError> {
        let index = self.chunk_index(fragment.time());
        if index < self.next_index {
            return Err(ChunkStoreError::LateFragment {
                chunk: index,
                time: fragment.time(),
            });
        }
        self.register_channel(fragment.channel());
        if self.in_overlap(fragment.time()) {
            self.assign_overlap(index, fragment.clone());
        }
        self.assign(index, fragment);
        Ok(())
    }

    /// Append to the primary region of a chunk, creating the chunk if needed
    pub fn assign(&mut self, index: i64, fragment: Fragment) {
        self.buffered_bytes += fragment.len();
        self.chunks
            .entry(index)
            .or_default()
            .primary
            .entry(fragment.channel())
            .or_default()
            .push(fragment);
    }

    /// Append to the overlap region of a chunk, creating the chunk if needed
    pub fn assign_overlap(&mut self, index: i64, fragment: Fragment) {
        self.buffered_bytes += fragment.len();
        self.chunks
            .entry(index)
            .or_default()
            .overlap
            .entry(fragment.channel())
            .or_default()
            .push(fragment);
    }

    /// Mark a channel as present so it gets a file in every chunk from now on
    pub fn register_channel(&mut self, channel: i16) {
        if let Ok(channel) = usize::try_from(channel) {
            self.known_channels.insert(channel);
        }
    }

    pub fn is_known(&self, channel: i16) -> bool {
        usize::try_from(channel).is_ok_and(|c| self.known_channels.contains(c))
    }

    pub fn known_channels(&self) -> Vec<i16> {
        self.known_channels.iter().map(|c| c as i16).collect()
    }

    /// Highest chunk index that may be written now, if any unwritten index qualifies.
    ///
    /// A chunk is complete once every board has moved at least one overlap past its end,
    /// i.e. `(index + 1) * full_chunk_length + chunk_overlap < min_board_time`. Independently,
    /// a chunk more than `buffer_num_chunks` behind the newest one is written regardless.
    /// Only reads the store.
    pub fn flush_target(&self, min_board_time: Option<i64>, buffer_num_chunks: i64) -> Option<i64> {
        let newest = self.newest_index()?;
        let complete = min_board_time.map(|time| {
            (time - self.chunk_overlap - 1).div_euclid(self.full_chunk_length) - 1
        });
        let forced = newest - buffer_num_chunks - 1;
        let target = complete.map_or(forced, |c| c.max(forced)).min(newest);
        (target >= self.next_index).then_some(target)
    }

    /// Remove the next chunk in sequence (empty if it never saw data).
    ///
    /// Its overlap region is kept back as the pre region of the following chunk.
    pub fn take_next(&mut self) -> ChunkPayload {
        let index = self.next_index;
        self.next_index += 1;

        let chunk = self.chunks.remove(&index).unwrap_or_default();
        let pre = self.pre_regions.remove(&index).unwrap_or_default();
        self.buffered_bytes -= region_bytes(&chunk.primary) + region_bytes(&pre);
        if !chunk.overlap.is_empty() {
            self.pre_regions.insert(index + 1, chunk.overlap);
        }

        ChunkPayload {
            index,
            primary: chunk.primary,
            pre,
        }
    }

    /// Index of the last chunk still holding anything, including a trailing pre region
    pub fn last_index(&self) -> Option<i64> {
        let chunk = self.chunks.keys().next_back().copied();
        let pre = self.pre_regions.keys().next_back().copied();
        chunk.max(pre)
    }

    /// Highest index holding buffered fragments
    pub fn newest_index(&self) -> Option<i64> {
        self.chunks.keys().next_back().copied()
    }

    /// Index the next call to `take_next` will return
    pub fn next_index(&self) -> i64 {
        self.next_index
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty() && self.pre_regions.is_empty()
    }
}

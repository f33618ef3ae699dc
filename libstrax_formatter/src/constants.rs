// Digitizer clock
/// Raw clock ticks before the 31-bit trigger time tag wraps
pub const CLOCK_ROLLOVER_TICKS: i64 = 1 << 31;
/// Width of a single clock tick in ns
pub const CLOCK_TICK_NS: i64 = 10;
/// Below this raw time a board is considered early in its epoch (5 s)
pub const CLOCK_LOW_THRESHOLD: u32 = 500_000_000;
/// Above this raw time a board is considered late in its epoch (15 s)
pub const CLOCK_HIGH_THRESHOLD: u32 = 1_500_000_000;

// Raw data words
pub const BYTES_PER_WORD: usize = 4;
pub const BYTES_PER_SAMPLE: usize = 2;
pub const EVENT_HEADER_WORDS: usize = 4;
pub const CHANNEL_HEADER_WORDS: usize = 2;
pub const EVENT_HEADER_MARKER: u32 = 0xA;
pub const EVENT_MARKER_SHIFT: u32 = 28;
pub const EVENT_SIZE_MASK: u32 = 0x0FFF_FFFF;
pub const CHANNEL_MASK_BITS: u32 = 0xFF;
pub const BOARD_FAIL_BIT: u32 = 0x0400_0000;
pub const CHANNEL_SIZE_MASK: u32 = 0x007F_FFFF;
pub const TIME_TAG_MASK: u32 = 0x7FFF_FFFF;
/// Sample width of the V1724 digitizer in ns
pub const DEFAULT_SAMPLE_WIDTH_NS: i16 = 10;

// Strax output
/// Size of the fixed strax record header in bytes
pub const STRAX_HEADER_SIZE: usize = 24;
pub const END_MARKER_NAME: &str = "THE_END";
pub const TEMP_SUFFIX: &str = "_temp";
pub const PRE_REGION_SUFFIX: &str = "_pre";

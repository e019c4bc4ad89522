//! Network-wide consensus constants, fixed at genesis

/// Base units per coin
pub const COIN: i64 = 100_000_000;

/// Maximum money supply: 21,000,000 coins in base units
pub const MAX_MONEY: i64 = 21_000_000 * COIN;

/// Confirmation depth before a coinbase output can be spent
pub const COINBASE_MATURITY: u32 = 100;

/// Maximum encoded block size: 4MB
pub const MAX_BLOCK_SIZE: usize = 4_000_000;

/// Maximum encoded transaction size: 1MB
pub const MAX_TX_SIZE: usize = 1_000_000;

/// Maximum number of keys held by one account / witness script
pub const ACCOUNT_KEY_MAX_SIZE: usize = 16;

/// Marker for "no arbitration key" in a witness script
pub const ARB_DISABLED: u8 = 0xff;

/// Coinbase script bounds (type byte + 4 byte height at minimum)
pub const MIN_COINBASE_SCRIPT_SIZE: usize = 5;
pub const MAX_COINBASE_SCRIPT_SIZE: usize = 128;

/// Maximum extension payload carried by a locking script
pub const MAX_EXT_SIZE: usize = 4096;

/// Lock time threshold: lock times below this are block heights
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// Sequence number for final inputs
pub const SEQUENCE_FINAL: u32 = 0xffffffff;

/// Relative lock disabled when this bit is set
pub const SEQUENCE_DISABLE_FLAG: u32 = 1 << 31;

/// Relative lock is time based (512 second units) when set, height based otherwise
pub const SEQUENCE_TYPE_FLAG: u32 = 1 << 22;

/// Relative lock value mask
pub const SEQUENCE_MASK: u32 = 0x0000ffff;

/// Time based relative locks count in units of 2^9 = 512 seconds
pub const SEQUENCE_GRANULARITY: u32 = 9;

/// Number of blocks used to compute the median time past
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Maximum number of headers returned for one get-headers request
pub const MAX_HEADERS_PER_MSG: usize = 200;

/// Height sentinel for "no block"
pub const INVALID_HEIGHT: u32 = u32::MAX;

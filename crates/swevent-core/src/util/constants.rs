use std::time::Duration;

/// Size of one kernel counter word (4 bytes)
pub const WORD_SIZE: u32 = 4;
/// Bit or'ed into every encoded offset so the kernel sees a negative event id
pub const INCREMENT_MARKER: u32 = 0x8000_0000;

/// Number of 64-bit words in the argument block of the counting call
pub const ATTR_WORDS: usize = 10;
/// First argument word: attribute size 0x48, software event type
pub const ATTR_HEADER: u64 = 0x48_0000_0001;
/// Flag word of the argument block
pub const ATTR_FLAGS: u64 = 0x300;

/// Maximum number of counting calls a single worker issues.
///
/// Every call keeps a handle open, so this stays below the usual 1024 open file limit.
pub const MAX_HANDLES_PER_WORKER: usize = 980;

/// Message a worker writes once its batch has finished
pub const COMPLETION_MARKER: &[u8] = b"Done\n";

/// Time between killing the workers and reaping them
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(1);

//! Default constants for the task runtime.

/// Initial number of levels reserved in a fiber's state chain.
pub const DEFAULT_CHAIN_CAPACITY: usize = 10;

/// Text shown for the default success exit result.
pub const SUCCESS_MARKER: &str = "OK";

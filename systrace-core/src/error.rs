use thiserror::Error;

/// Leaf error kinds that need to be matched on for recovery logic — this
/// enum exists only where a caller needs to distinguish "timed out" from
/// "other failure."
#[derive(Debug, Error)]
pub enum BarrierError {
    #[error("barrier '{name}' timed out after {secs}s waiting for {world_size} ranks")]
    Timeout {
        name: String,
        secs: u64,
        world_size: u32,
    },
    #[error("shared memory setup failed: {0}")]
    Shm(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum EnvParseError {
    #[error("invalid env var name '{0}': must match [A-Za-z][A-Za-z0-9_]*")]
    InvalidName(String),
    #[error("failed to parse '{name}'='{value}' as the registered type")]
    ParseFailed { name: String, value: String },
}

use thiserror::Error;

/// The five error kinds the control engine distinguishes between, each with
/// its own recovery policy applied by the caller (see `garden.rs`).
#[derive(Debug, Error)]
pub enum GardenError {
    #[error("transient serial fault on {port}: {reason}")]
    TransientSerialFault { port: String, reason: String },

    #[error("board identity mismatch on {port}: expected {expected}, got {actual}")]
    BoardIdentityMismatch {
        port: String,
        expected: String,
        actual: String,
    },

    #[error("persistence fault: {0}")]
    PersistenceFault(#[from] sqlx::Error),

    #[error("configuration fault: {0}")]
    ConfigurationFault(String),

    #[error("fatal host fault: {0}")]
    FatalHostFault(String),
}

pub type GardenResult<T> = std::result::Result<T, GardenError>;

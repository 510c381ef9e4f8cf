/// Core error type for the subsystem.
///
/// Adapter crates map their specific errors into this type so the embedding
/// client can handle failures consistently (fail-closed vs best-effort).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    /// Authentication-tag mismatch: tampering, corruption, or wrong key.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// A configured state-store collection could not be read.
    #[error("state store unavailable: {0}")]
    SourceUnavailable(String),

    /// Any pipeline stage failure while creating an archive.
    #[error("backup failed: {0}")]
    Backup(String),

    #[error("restore failed: {0}")]
    Restore(String),

    /// Remote-storage only; callers downgrade this to `uploaded = false`.
    #[error("upload failed: {0}")]
    Upload(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

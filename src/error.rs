//! Error types shared across the crate.

/// Errors reading one block from a [`crate::media::MediaHandler`].
#[derive(thiserror::Error, Debug)]
pub enum BlockReadError {
    #[error("{0}")]
    Error(#[from] std::io::Error),
    #[error("end of file")]
    EndOfFile,
    #[error("end of data stream")]
    EndOfStream,
}

impl From<anyhow::Error> for BlockReadError {
    fn from(err: anyhow::Error) -> Self {
        BlockReadError::Error(std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))
    }
}

/// Errors parsing the HIM guest-supplied EBCDIC configuration string.
#[derive(thiserror::Error, Debug)]
pub enum HimConfigError {
    #[error("malformed configuration string: {0}")]
    Malformed(String),
    #[error("unknown token: {0}")]
    UnknownToken(String),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the SCSI media handler's passthrough path.
#[derive(thiserror::Error, Debug)]
pub enum ScsiError {
    #[error("{0}")]
    Error(#[from] anyhow::Error),
    #[error("scsi command failed: {0}")]
    Io(#[from] std::io::Error),
}

use thiserror::Error;

pub type Result<T> = std::result::Result<T, VerifyError>;

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("digest mismatch: expected {}, got {}", hex::encode(expected), hex::encode(actual))]
    Mismatch { expected: Vec<u8>, actual: Vec<u8> },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    HexDecode(#[from] hex::FromHexError),
}

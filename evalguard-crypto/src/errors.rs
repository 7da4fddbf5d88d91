use thiserror::Error;

pub type CipherResult<T> = Result<T, CipherError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CipherError {
    /// Missing or malformed master key.
    #[error("encryption is not configured: {0}")]
    Configuration(String),
    #[error("invalid input: {0}")]
    Input(&'static str),
    /// Wrong key, malformed envelope, or a failed tag. Deliberately opaque.
    #[error("unable to decrypt value")]
    Decryption,
}

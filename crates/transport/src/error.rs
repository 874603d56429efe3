use thiserror::Error;

/// Errors raised while setting up QUIC endpoints and TLS.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("QUIC configuration error: {0}")]
    Config(String),

    #[error("invalid certificate fingerprint {0}")]
    InvalidFingerprint(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Transport(#[from] podlink_transport::TransportError),

    #[error("protocol error: {0}")]
    Protocol(#[from] protocol::Error),

    #[error("QUIC connection error: {0}")]
    QuicConnection(#[from] quinn::ConnectionError),
}

pub type Result<T> = std::result::Result<T, Error>;

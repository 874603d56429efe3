use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Forward(#[from] podlink_forward::ForwardError),

    #[error("{failed} of {total} mappings could not be kept alive")]
    Abandoned { failed: usize, total: usize },

    #[error(transparent)]
    Transport(#[from] podlink_transport::TransportError),
}

pub type Result<T> = std::result::Result<T, Error>;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RestreamError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Channel not found: {0}")]
    ChannelNotFound(u32),
}

pub type Result<T> = std::result::Result<T, RestreamError>;

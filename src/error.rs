use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupted data: {0}")]
    Corruption(String),

    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Fatal tap session error: {0}")]
    TapFatal(String),

    #[error("Store is closed")]
    StoreClosed,

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("Bucket already exists: {0}")]
    BucketExists(String),

    #[error("No such bucket: {0}")]
    NoSuchBucket(String),

    #[error("No such collection: {0}")]
    NoSuchCollection(String),
}

// Conversion for channel errors
impl<T> From<crossbeam_channel::SendError<T>> for StoreError {
    fn from(err: crossbeam_channel::SendError<T>) -> Self {
        StoreError::ChannelSend(err.to_string())
    }
}

impl From<crossbeam_channel::RecvError> for StoreError {
    fn from(_: crossbeam_channel::RecvError) -> Self {
        StoreError::StoreClosed
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

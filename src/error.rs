use std::io;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::error;

pub type Result<T> = std::result::Result<T, ChaosError>;

#[derive(Debug, Error)]
pub enum ChaosError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed input: {0}")]
    Malformed(String),
    #[error("decompression failed: {0}")]
    Decompression(String),
    #[error("key {0:?} not found")]
    KeyNotFound(String),
    #[error("index {index} out of range for list of length {len}")]
    IndexOutOfRange { index: u64, len: u64 },
    #[error("invalid list index: {0:?}")]
    MalformedIndex(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unsupported value: {0}")]
    Unsupported(&'static str),
}

pub fn acquire_lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| {
        error!("decoder lock poisoned - fatal error");
        ChaosError::Malformed("decoder lock poisoned - fatal error".into())
    })
}

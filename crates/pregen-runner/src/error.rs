use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("download of {label} from {url} failed with HTTP status {status}")]
    HttpStatus {
        label: String,
        url: String,
        status: u16,
    },
    #[error("download of {label} from {url} has digest {actual}, expected {expected}")]
    ChecksumMismatch {
        label: String,
        url: String,
        expected: String,
        actual: String,
    },
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("server output ended before any of {expected:?} appeared")]
    StreamEnded { expected: Vec<String> },
    #[error("gave up after {waited:?} waiting for any of {expected:?}")]
    TimedOut {
        expected: Vec<String>,
        waited: Duration,
    },
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot send {command:?}: server stdin is closed")]
    StdinClosed { command: String },
}

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedError {
    #[error("truncated message: needed {needed} bytes, got {got}")]
    TruncatedMessage { needed: usize, got: usize },

    #[error("unknown application id {0}")]
    UnknownApplication(i32),

    #[error("job not found: #{0}")]
    JobNotFound(i32),

    #[error("checksum mismatch for job #{job_id} revision {revision}")]
    ChecksumMismatch { job_id: i32, revision: i32 },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

pub type Result<T> = std::result::Result<T, SchedError>;

/// Exit status for unrecoverable protocol or programming errors.
pub const FATAL_EXIT_STATUS: i32 = 70;

/// Uniform fatal-error channel: log the error and leave the process with a
/// defined status. Used for protocol violations that must not be papered over
/// (duplicate callback registration, unknown tags, malformed fragment
/// trailers).
pub fn fatal(err: SchedError) -> ! {
    tracing::error!(error = %err, "fatal error, terminating process");
    std::process::exit(FATAL_EXIT_STATUS);
}

use conveyor_types::{DescriptorError, ErrorClass};
use thiserror::Error;

/// Everything that can go wrong while applying one publish job.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("malformed job description: {0}")]
    Malformed(#[from] DescriptorError),

    #[error("could not start transaction on {target}: {reason}")]
    BeginRejected { target: String, reason: String },

    #[error("could not fetch payload {uri}: {reason}")]
    Fetch { uri: String, reason: String },

    #[error("could not extract {archive} into {target_dir}: {reason}")]
    Extract {
        archive: String,
        target_dir: String,
        reason: String,
    },

    #[error("transaction script failed: {0}")]
    Script(String),

    #[error("could not commit transaction for {repo}: {reason}")]
    Commit { repo: String, reason: String },

    #[error("could not abort transaction for {repo}: {reason}")]
    Abort { repo: String, reason: String },

    #[error("staging area: {0}")]
    Staging(String),
}

impl JobError {
    /// Whether redelivering the message could ever succeed.
    ///
    /// Only an undecodable message is permanent; a corrupt archive or a bad
    /// script is still retried, matching how every other failure is handled.
    pub fn class(&self) -> ErrorClass {
        match self {
            JobError::Malformed(_) => ErrorClass::Permanent,
            _ => ErrorClass::Retryable,
        }
    }
}

/// Render an `anyhow` chain on one line.
pub(crate) fn reason(err: &anyhow::Error) -> String {
    format!("{err:#}")
}

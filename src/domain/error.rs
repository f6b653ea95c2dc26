use thiserror::Error;

use super::manifest::ValidationError;
use super::model::MAX_DESCRIPTION_LEN;

/// Domain error taxonomy. Pipeline and lifecycle tasks convert these into
/// terminal log entries; registry errors surface synchronously to the caller.
#[derive(Debug, Error)]
pub enum QuayError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("clone failed: {0}")]
    Clone(String),

    #[error("image build failed: {0}")]
    Build(String),

    #[error("App has not been built")]
    NotBuilt,

    #[error("App is not running")]
    NotRunning,

    #[error("invalid application name `{0}`")]
    InvalidName(String),

    #[error("application name `{0}` is already taken")]
    DuplicateName(String),

    #[error("description too long (max {MAX_DESCRIPTION_LEN} characters)")]
    DescriptionTooLong,

    #[error("application `{0}` not found")]
    NotFound(String),

    #[error("container runtime error: {0}")]
    Runtime(String),

    #[error("store error: {0}")]
    Store(String),
}

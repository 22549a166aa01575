use keel_common::error::CommonError;
use keel_server::transport::WireError;
use thiserror::Error;

use crate::validation::ValidationError;

pub type SchedulerResult<T> = Result<T, SchedulerError>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("the scheduler driver is not running")]
    NotRunning,
    #[error("the scheduler driver has already been started")]
    AlreadyStarted,
    #[error("error in I/O: {0}")]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    MalformedMessage(#[from] WireError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    CommonError(#[from] CommonError),
    #[error("internal error: {0}")]
    InternalError(String),
}

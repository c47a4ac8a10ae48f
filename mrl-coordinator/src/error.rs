use common::ValidationError;
use mrl_store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A record derived by the coordinator failed validation.
    #[error("derived record is invalid: {0}")]
    Validation(#[from] ValidationError),
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;

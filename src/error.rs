use crate::types::Role;

pub type Result<T> = std::result::Result<T, LimsError>;

#[derive(thiserror::Error, Debug)]
pub enum LimsError {
    #[error("role {role} may not {action}")]
    PolicyDenied { role: Role, action: String },
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("{0} is finalized and can no longer be changed")]
    AlreadyFinalized(String),
    #[error("could not acquire counter for prefix {prefix}, retry later")]
    AllocationConflict { prefix: String },
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("storage failure: {0}")]
    Storage(#[from] sled::Error),
    #[error("cbor codec failure: {0}")]
    Codec(String),
    #[error("document generation failed: {0}")]
    Generation(String),
}

impl LimsError {
    pub fn denied(role: Role, action: impl Into<String>) -> Self {
        Self::PolicyDenied {
            role,
            action: action.into(),
        }
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::PreconditionFailed(msg.into())
    }

    /// Only counter contention is safe to retry. Everything else points at a
    /// caller that lost track of the entity's state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::AllocationConflict { .. })
    }
}

impl From<minicbor::decode::Error> for LimsError {
    fn from(value: minicbor::decode::Error) -> Self {
        Self::Codec(value.to_string())
    }
}

impl<E: std::fmt::Display> From<minicbor::encode::Error<E>> for LimsError {
    fn from(value: minicbor::encode::Error<E>) -> Self {
        Self::Codec(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_allocation_conflicts_retry() {
        assert!(
            LimsError::AllocationConflict {
                prefix: "BML".into()
            }
            .is_retryable()
        );
        assert!(!LimsError::precondition("out of order").is_retryable());
        assert!(!LimsError::denied(Role::Client, "sign").is_retryable());
        assert!(!LimsError::AlreadyFinalized("sample".into()).is_retryable());
    }
}

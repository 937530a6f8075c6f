use thiserror::Error;

#[derive(Debug, Error)]
pub enum VesperError {
    #[error("definition error: {message}")]
    Definition { message: String },
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("aggregation invariant violated: {message}")]
    Aggregation { message: String },
    #[error("storage error: {message}")]
    Storage { message: String },
    #[error("not found: {message}")]
    NotFound { message: String },
    #[error("conflict: {message}")]
    Conflict { message: String },
    #[error("delivery error: {message}")]
    Delivery { message: String },
    #[error("aborted")]
    Aborted,
    #[error("{} operations failed, first: {}", .errors.len(), first_message(.errors))]
    Aggregate { errors: Vec<VesperError> },
}

fn first_message(errors: &[VesperError]) -> String {
    errors
        .first()
        .map(|err| err.to_string())
        .unwrap_or_default()
}

impl VesperError {
    pub fn definition(message: impl Into<String>) -> Self {
        Self::Definition {
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn aggregation(message: impl Into<String>) -> Self {
        Self::Aggregation {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn delivery(message: impl Into<String>) -> Self {
        Self::Delivery {
            message: message.into(),
        }
    }

    /// Collapses the failures of a settled fan-out: `Ok` when nothing failed,
    /// the lone error when one did, `Aggregate` otherwise.
    pub fn settle(mut errors: Vec<VesperError>) -> VesperResult<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Aggregate { errors }),
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}

pub type VesperResult<T> = Result<T, VesperError>;

impl From<sea_orm::DbErr> for VesperError {
    fn from(value: sea_orm::DbErr) -> Self {
        VesperError::storage(value.to_string())
    }
}

impl From<serde_json::Error> for VesperError {
    fn from(value: serde_json::Error) -> Self {
        VesperError::invalid(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::VesperError;

    #[test]
    fn helper_constructors_set_variants() {
        assert!(matches!(
            VesperError::definition("tree"),
            VesperError::Definition { .. }
        ));
        assert!(matches!(
            VesperError::aggregation("twice"),
            VesperError::Aggregation { .. }
        ));
        assert!(matches!(
            VesperError::storage("disk"),
            VesperError::Storage { .. }
        ));
        assert!(matches!(
            VesperError::delivery("task"),
            VesperError::Delivery { .. }
        ));
        assert!(VesperError::Aborted.is_aborted());
    }

    #[test]
    fn settle_keeps_every_failure() {
        assert!(VesperError::settle(Vec::new()).is_ok());
        let single = VesperError::settle(vec![VesperError::storage("a")]).unwrap_err();
        assert!(matches!(single, VesperError::Storage { .. }));
        let many = VesperError::settle(vec![
            VesperError::storage("a"),
            VesperError::conflict("b"),
        ])
        .unwrap_err();
        match many {
            VesperError::Aggregate { errors } => assert_eq!(errors.len(), 2),
            other => panic!("expected aggregate, got {other}"),
        }
    }
}

//! Outcome taxonomy and its mapping onto NSS status codes.

use crate::pack::InsufficientSpace;
use crate::traits::StoreError;

pub const ENOENT: i32 = 2;
pub const EAGAIN: i32 = 11;
pub const ERANGE: i32 = 34;

/// Every non-success outcome of a lookup or scan step.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    /// No record matches the key.
    #[error("no matching record")]
    NotFound,
    /// The scan has delivered every row.
    #[error("end of sequence")]
    EndOfSequence,
    /// The buffer is too small. A scan keeps the record for the next call.
    #[error("insufficient buffer space: {required} bytes required, {capacity} available")]
    InsufficientSpace { required: usize, capacity: usize },
    /// The backend is busy; nothing was lost, try again later.
    #[error("backend temporarily unavailable")]
    TemporarilyUnavailable,
    /// The backend failed. An open scan has been closed.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
}

impl ResolveError {
    /// NSS status reported to the host.
    #[must_use]
    pub fn status(&self) -> Status {
        match self {
            Self::NotFound | Self::EndOfSequence => Status::NotFound,
            Self::InsufficientSpace { .. } | Self::TemporarilyUnavailable => Status::TryAgain,
            Self::BackendUnavailable(_) => Status::Unavailable,
        }
    }

    /// errno value that accompanies [`ResolveError::status`].
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::InsufficientSpace { .. } => ERANGE,
            Self::TemporarilyUnavailable => EAGAIN,
            Self::NotFound | Self::EndOfSequence | Self::BackendUnavailable(_) => ENOENT,
        }
    }

    /// Whether the caller may retry the same call and expect progress.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::InsufficientSpace { .. } | Self::TemporarilyUnavailable
        )
    }
}

impl From<InsufficientSpace> for ResolveError {
    fn from(e: InsufficientSpace) -> Self {
        Self::InsufficientSpace {
            required: e.required,
            capacity: e.capacity,
        }
    }
}

impl From<StoreError> for ResolveError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Busy => Self::TemporarilyUnavailable,
            StoreError::Unavailable(msg) => Self::BackendUnavailable(msg),
            StoreError::Malformed(msg) => Self::BackendUnavailable(format!("malformed record: {msg}")),
        }
    }
}

/// `enum nss_status` as seen by the host resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Status {
    TryAgain = -2,
    Unavailable = -1,
    NotFound = 0,
    Success = 1,
}

impl<T> From<&Result<T, ResolveError>> for Status {
    fn from(result: &Result<T, ResolveError>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(e) => e.status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_space_maps_to_try_again_erange() {
        let err = ResolveError::from(InsufficientSpace {
            required: 10,
            capacity: 4,
        });
        assert_eq!(err.status(), Status::TryAgain);
        assert_eq!(err.errno(), ERANGE);
        assert!(err.is_retryable());
    }

    #[test]
    fn busy_maps_to_try_again_eagain() {
        let err = ResolveError::from(StoreError::Busy);
        assert_eq!(err, ResolveError::TemporarilyUnavailable);
        assert_eq!(err.status(), Status::TryAgain);
        assert_eq!(err.errno(), EAGAIN);
    }

    #[test]
    fn malformed_rows_surface_as_unavailable() {
        let err = ResolveError::from(StoreError::Malformed("bad uid".to_string()));
        assert!(matches!(err, ResolveError::BackendUnavailable(_)));
        assert_eq!(err.status(), Status::Unavailable);
        assert!(!err.is_retryable());
    }

    #[test]
    fn not_found_and_end_are_not_errors_to_the_host() {
        assert_eq!(ResolveError::NotFound.status(), Status::NotFound);
        assert_eq!(ResolveError::EndOfSequence.status(), Status::NotFound);
        assert_eq!(Status::NotFound as i32, 0);
        assert_eq!(Status::from(&Ok::<(), ResolveError>(())), Status::Success);
    }
}

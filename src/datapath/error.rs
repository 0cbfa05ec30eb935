use itertools::Itertools;
use rtnetlink::packet_core::ErrorMessage;
use thiserror::Error;

/// Classification the CNI layer and tests reason about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Link, route, address or rule absent.
    NotFound,
    /// Name or address already used by something else.
    Conflict,
    /// Any other netlink or syscall failure.
    KernelOperationFailure,
    /// Malformed configuration, rejected before touching the kernel.
    ValidationFailure,
}

#[derive(Debug, Error)]
pub enum DatapathError {
    #[error("{what} not found")]
    NotFound { what: String },

    #[error("{what} already in use")]
    Conflict { what: String },

    #[error("{op} failed: {source}")]
    Kernel {
        op: String,
        #[source]
        source: rtnetlink::Error,
    },

    #[error("{op} failed: {reason}")]
    Io {
        op: String,
        #[source]
        reason: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Validation(String),

    #[error("network namespace {path}: {source}")]
    Namespace {
        path: String,
        #[source]
        source: nix::Error,
    },

    #[error("{}", .0.iter().join("; "))]
    Aggregate(Vec<DatapathError>),
}

pub type Result<T> = std::result::Result<T, DatapathError>;

impl DatapathError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn conflict(what: impl Into<String>) -> Self {
        Self::Conflict { what: what.into() }
    }

    /// Classify a netlink failure of `op` on `target`.
    ///
    /// Errno values the kernel uses for "absent" become [`ErrorKind::NotFound`]
    /// and "already exists" become [`ErrorKind::Conflict`] so callers can
    /// decide per step whether they are fatal.
    pub fn from_netlink(op: impl Into<String>, target: &str, source: rtnetlink::Error) -> Self {
        match errno(&source) {
            Some(libc::ENOENT | libc::ENODEV | libc::ESRCH | libc::EADDRNOTAVAIL) => {
                Self::not_found(target)
            }
            Some(libc::EEXIST | libc::EADDRINUSE) => Self::conflict(target),
            _ => Self::Kernel {
                op: op.into(),
                source,
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Validation(_) => ErrorKind::ValidationFailure,
            Self::Kernel { .. } | Self::Io { .. } | Self::Namespace { .. } => {
                ErrorKind::KernelOperationFailure
            }
            Self::Aggregate(errors) => errors
                .first()
                .map_or(ErrorKind::KernelOperationFailure, DatapathError::kind),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

/// Positive errno carried by a netlink error reply, if any.
pub fn errno(err: &rtnetlink::Error) -> Option<i32> {
    match err {
        rtnetlink::Error::NetlinkError(ErrorMessage { code: Some(code), .. }) => {
            Some(code.get().abs())
        }
        _ => None,
    }
}

/// Treat a NotFound outcome as success.
pub(crate) fn ignore_not_found<T: Default>(res: Result<T>) -> Result<T> {
    match res {
        Err(err) if err.is_not_found() => Ok(T::default()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn netlink_error(code: i32) -> rtnetlink::Error {
        let mut msg = ErrorMessage::default();
        msg.code = std::num::NonZeroI32::new(code);
        rtnetlink::Error::NetlinkError(msg)
    }

    #[test]
    fn errno_is_positive() {
        assert_eq!(errno(&netlink_error(-libc::ENODEV)), Some(libc::ENODEV));
        assert_eq!(errno(&rtnetlink::Error::RequestFailed), None);
    }

    #[test]
    fn absent_resources_classify_as_not_found() {
        for code in [libc::ENOENT, libc::ENODEV, libc::ESRCH, libc::EADDRNOTAVAIL] {
            let err = DatapathError::from_netlink("delete", "veth1", netlink_error(-code));
            assert_eq!(err.kind(), ErrorKind::NotFound, "errno {code}");
        }
    }

    #[test]
    fn existing_resources_classify_as_conflict() {
        let err = DatapathError::from_netlink("add link", "veth1", netlink_error(-libc::EEXIST));
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(err.to_string(), "veth1 already in use");
    }

    #[test]
    fn other_errno_is_kernel_failure() {
        let err = DatapathError::from_netlink("add rule", "rule", netlink_error(-libc::EPERM));
        assert_eq!(err.kind(), ErrorKind::KernelOperationFailure);
        assert!(err.to_string().starts_with("add rule failed"));
    }

    #[test]
    fn aggregate_joins_messages() {
        let err = DatapathError::Aggregate(vec![
            DatapathError::Validation("mtu".to_string()),
            DatapathError::not_found("eth0"),
        ]);
        assert_eq!(err.kind(), ErrorKind::ValidationFailure);
        assert_eq!(err.to_string(), "invalid config: mtu; eth0 not found");
    }

    #[test]
    fn not_found_can_be_ignored() {
        let res: Result<usize> = Err(DatapathError::not_found("route"));
        assert_eq!(ignore_not_found(res).unwrap(), 0);
        let res: Result<usize> = Err(DatapathError::conflict("route"));
        assert!(ignore_not_found(res).is_err());
    }
}

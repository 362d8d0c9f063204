use procfs::ProcError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MetricsError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MetricsError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Kernel API error: {0}")]
    KernelApi(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl MetricsError {
    /// Reclassify a kernel statistics failure as an interface query failure.
    /// Permission problems keep their own kind.
    pub fn into_network(self) -> Self {
        match self {
            Self::KernelApi(msg) | Self::InvalidData(msg) | Self::Unknown(msg) => {
                Self::Network(msg)
            }
            other => other,
        }
    }
}

impl From<ProcError> for MetricsError {
    fn from(err: ProcError) -> Self {
        match err {
            ProcError::PermissionDenied(path) => Self::PermissionDenied(match path {
                Some(p) => p.display().to_string(),
                None => "procfs".to_string(),
            }),
            ProcError::NotFound(path) => Self::KernelApi(match path {
                Some(p) => format!("{} not found", p.display()),
                None => "procfs entry not found".to_string(),
            }),
            ProcError::Incomplete(path) => Self::InvalidData(match path {
                Some(p) => format!("incomplete read of {}", p.display()),
                None => "incomplete procfs read".to_string(),
            }),
            ProcError::Io(io, path) => Self::KernelApi(match path {
                Some(p) => format!("{}: {io}", p.display()),
                None => io.to_string(),
            }),
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl From<std::io::Error> for MetricsError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(err.to_string()),
            _ => Self::KernelApi(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_permission_maps_to_permission_denied() {
        let err: MetricsError =
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope").into();
        assert!(matches!(err, MetricsError::PermissionDenied(_)));
    }

    #[test]
    fn into_network_keeps_permission_kind() {
        let err = MetricsError::PermissionDenied("x".into()).into_network();
        assert_eq!(err, MetricsError::PermissionDenied("x".into()));

        let err = MetricsError::KernelApi("dev".into()).into_network();
        assert_eq!(err, MetricsError::Network("dev".into()));
    }

    #[test]
    fn display_prefixes_kind() {
        let err = MetricsError::InvalidData("total memory is zero".into());
        assert_eq!(err.to_string(), "Invalid data: total memory is zero");
    }
}

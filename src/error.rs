//! Error types for resource sessions and the scheduling loop

use std::fmt;
use std::io;

/// Result type alias for resource operations
pub type ResourceResult<T> = Result<T, ResourceError>;

/// Errors reported by a resource or its session
#[derive(Debug)]
pub enum ResourceError {
    /// The resource no longer exists (it was deleted concurrently)
    NotFound,

    /// The transport lost its peer (broken pipe, connection reset, ...)
    Disconnected(String),

    /// Opening or using the session failed
    Session(String),

    /// The probe itself failed
    Probe(String),

    /// I/O error from the transport
    Io(io::Error),
}

impl ResourceError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ResourceError::NotFound)
    }

    /// Whether this error belongs to the class a reopened session can cure
    pub fn is_stale_connection(&self) -> bool {
        match self {
            ResourceError::Disconnected(_) => true,
            ResourceError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceError::NotFound => write!(f, "resource no longer exists"),
            ResourceError::Disconnected(msg) => write!(f, "session disconnected: {}", msg),
            ResourceError::Session(msg) => write!(f, "session error: {}", msg),
            ResourceError::Probe(msg) => write!(f, "probe failed: {}", msg),
            ResourceError::Io(err) => write!(f, "I/O error: {}", err),
        }
    }
}

impl std::error::Error for ResourceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ResourceError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for ResourceError {
    fn from(err: io::Error) -> Self {
        ResourceError::Io(err)
    }
}

/// Errors surfacing from the scheduler and the partition listener
#[derive(Debug)]
pub enum MonitorError {
    /// A submit or wake queue was closed; this is the shutdown signal
    QueueClosed,

    /// Listing resources from a resource-type collaborator failed
    Scan(anyhow::Error),

    /// The pub/sub channel failed
    Bus(anyhow::Error),

    /// Partition number outside `1..=max_partition`
    InvalidPartition { partition: u32, max_partition: u32 },
}

impl fmt::Display for MonitorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorError::QueueClosed => write!(f, "queue closed"),
            MonitorError::Scan(err) => write!(f, "resource scan failed: {:#}", err),
            MonitorError::Bus(err) => write!(f, "pub/sub channel failed: {:#}", err),
            MonitorError::InvalidPartition {
                partition,
                max_partition,
            } => write!(
                f,
                "partition {} is outside the allowed range 1..={}",
                partition, max_partition
            ),
        }
    }
}

impl std::error::Error for MonitorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MonitorError::Scan(err) | MonitorError::Bus(err) => Some(&**err),
            _ => None,
        }
    }
}

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SessionError>;

/// Coarse status classes reported to callers of [`crate::Session::open`] and
/// [`crate::Session::close`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The device could not be opened, or a close had no matching open.
    IoChannelNotOpened,
    /// A forced hardware identity override was malformed.
    Config,
    /// A required collaborator failed to initialize.
    Generic,
}

#[derive(Debug, Error)]
pub enum SessionError {
    /// Shared by two distinct triggers: the device node failed to open (the
    /// OS error is attached) and a close was issued with nothing open.
    #[error("kernel I/O channel not opened")]
    IoChannelNotOpened {
        #[source]
        source: Option<io::Error>,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to read system topology: {0}")]
    Topology(#[source] io::Error),
    #[error("{subsystem} initialization failed: {message}")]
    Subsystem {
        subsystem: &'static str,
        message: String,
    },
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::IoChannelNotOpened { .. } => ErrorKind::IoChannelNotOpened,
            Self::Config(_) => ErrorKind::Config,
            Self::Topology(_) | Self::Subsystem { .. } => ErrorKind::Generic,
        }
    }

    pub(crate) fn device_open_failed(err: io::Error) -> Self {
        Self::IoChannelNotOpened { source: Some(err) }
    }

    pub(crate) fn not_opened() -> Self {
        Self::IoChannelNotOpened { source: None }
    }

    pub fn subsystem(subsystem: &'static str, message: impl Into<String>) -> Self {
        Self::Subsystem {
            subsystem,
            message: message.into(),
        }
    }
}

/// Problems with the `HSA_FORCE_ASIC_TYPE` override.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("HSA_FORCE_ASIC_TYPE {value:?} is invalid: expected 6 fields, parsed {parsed}")]
    FieldCount { value: String, parsed: usize },
    #[error("HSA_FORCE_ASIC_TYPE {value:?} is invalid: {field} {actual} exceeds {max}")]
    OutOfRange {
        value: String,
        field: &'static str,
        actual: u32,
        max: u32,
    },
    #[error("HSA_FORCE_ASIC_TYPE {value:?} is invalid: unknown family id {family_id}")]
    UnknownFamily { value: String, family_id: u32 },
    #[error("HSA_FORCE_ASIC_TYPE {value:?} is invalid: name is longer than {max} bytes")]
    NameTooLong { value: String, max: usize },
    /// The value is shown lossily converted.
    #[error("HSA_FORCE_ASIC_TYPE {value:?} is invalid: not valid Unicode")]
    NotUnicode { value: String },
}

use std::error;
use std::fmt;
use std::panic::Location;

/// Tagged failure codes distinguished by the networking core.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    System,
    State,
    ProtocolMismatch,
    OutOfRange,
    Truncated,
    UnknownType,
    ReservedType,
    AcceptFailed,
    ConnectFailed,
    BindFailed,
    ListenFailed,
    RecvFailed,
    SendFailed,
    ShutdownFailed,
    CloseFailed,
    SelectorRunning,
    SelectorEmpty,
    ServerRunning,
    ServerStopped,
    ClientRunning,
    ClientStopped,
}

/// A failure record produced at an API boundary.
///
/// Carries the operation that failed, the capture site and, when the failure
/// was observed at a deeper layer, that failure rendered as text. Records are
/// returned as the `Err` side of [`NetResult`]; they never live in global
/// state.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    op: &'static str,
    location: &'static Location<'static>,
    detail: String,
    cause: Option<String>,
}

pub type NetResult<T> = Result<T, Error>;

impl Error {
    #[track_caller]
    pub fn new(kind: ErrorKind, op: &'static str, detail: impl Into<String>) -> Error {
        Error {
            kind,
            op,
            location: Location::caller(),
            detail: detail.into(),
            cause: None,
        }
    }

    #[track_caller]
    pub fn with_cause(
        kind: ErrorKind,
        op: &'static str,
        detail: impl Into<String>,
        cause: impl fmt::Display,
    ) -> Error {
        Error {
            kind,
            op,
            location: Location::caller(),
            detail: detail.into(),
            cause: Some(cause.to_string()),
        }
    }

    /// Wraps this record as the cause of a higher layer failure.
    #[track_caller]
    pub fn chain(self, kind: ErrorKind, op: &'static str, detail: impl Into<String>) -> Error {
        Error {
            kind,
            op,
            location: Location::caller(),
            detail: detail.into(),
            cause: Some(self.to_string()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn op(&self) -> &'static str {
        self.op
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }

    pub fn cause(&self) -> Option<&str> {
        self.cause.as_deref()
    }

    pub fn file(&self) -> &'static str {
        self.location.file()
    }

    pub fn line(&self) -> u32 {
        self.location.line()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}: {} [{:?} at {}:{}]",
            self.op,
            self.detail,
            self.kind,
            self.location.file(),
            self.location.line()
        )?;

        if let Some(cause) = &self.cause {
            write!(f, "; caused by: {}", cause)?;
        }

        Ok(())
    }
}

impl error::Error for Error {}

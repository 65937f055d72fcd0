//! Status type for polydbm operations
//!
//! Every fallible call returns `Result<T>`; the error side is a `Status`
//! whose code is never `Success`.

use std::fmt;
use std::io;
use thiserror::Error;

/// Result type alias for polydbm operations
pub type Result<T> = std::result::Result<T, Status>;

/// Closed set of status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum StatusCode {
    Success = 0,
    UnknownError = 1,
    SystemError = 2,
    NotImplementedError = 3,
    PreconditionError = 4,
    InvalidArgumentError = 5,
    CanceledError = 6,
    NotFoundError = 7,
    PermissionError = 8,
    InfeasibleError = 9,
    DuplicationError = 10,
    BrokenDataError = 11,
    ApplicationError = 12,
}

impl StatusCode {
    /// Canonical upper-case name of the code
    pub fn name(self) -> &'static str {
        match self {
            StatusCode::Success => "SUCCESS",
            StatusCode::UnknownError => "UNKNOWN_ERROR",
            StatusCode::SystemError => "SYSTEM_ERROR",
            StatusCode::NotImplementedError => "NOT_IMPLEMENTED_ERROR",
            StatusCode::PreconditionError => "PRECONDITION_ERROR",
            StatusCode::InvalidArgumentError => "INVALID_ARGUMENT_ERROR",
            StatusCode::CanceledError => "CANCELED_ERROR",
            StatusCode::NotFoundError => "NOT_FOUND_ERROR",
            StatusCode::PermissionError => "PERMISSION_ERROR",
            StatusCode::InfeasibleError => "INFEASIBLE_ERROR",
            StatusCode::DuplicationError => "DUPLICATION_ERROR",
            StatusCode::BrokenDataError => "BROKEN_DATA_ERROR",
            StatusCode::ApplicationError => "APPLICATION_ERROR",
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(StatusCode::Success),
            1 => Some(StatusCode::UnknownError),
            2 => Some(StatusCode::SystemError),
            3 => Some(StatusCode::NotImplementedError),
            4 => Some(StatusCode::PreconditionError),
            5 => Some(StatusCode::InvalidArgumentError),
            6 => Some(StatusCode::CanceledError),
            7 => Some(StatusCode::NotFoundError),
            8 => Some(StatusCode::PermissionError),
            9 => Some(StatusCode::InfeasibleError),
            10 => Some(StatusCode::DuplicationError),
            11 => Some(StatusCode::BrokenDataError),
            12 => Some(StatusCode::ApplicationError),
            _ => None,
        }
    }

    /// Returns true for failures expected in normal concurrent use
    pub fn is_semantic(self) -> bool {
        matches!(
            self,
            StatusCode::NotFoundError
                | StatusCode::DuplicationError
                | StatusCode::InfeasibleError
                | StatusCode::CanceledError
        )
    }

    /// Returns true for failures caused by misuse of the API
    pub fn is_programmer_error(self) -> bool {
        matches!(
            self,
            StatusCode::PreconditionError
                | StatusCode::InvalidArgumentError
                | StatusCode::NotImplementedError
        )
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn message_suffix(message: &str) -> String {
    if message.is_empty() {
        String::new()
    } else {
        format!(": {}", message)
    }
}

/// Status of an operation: a code plus an optional message
#[derive(Error, Debug, Clone, PartialEq, Eq, Hash)]
#[error("{code}{}", message_suffix(.message))]
pub struct Status {
    code: StatusCode,
    message: String,
}

impl Status {
    /// Create a status without a message
    pub fn new(code: StatusCode) -> Self {
        Self {
            code,
            message: String::new(),
        }
    }

    /// Create a status with a message
    pub fn with_message(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn success() -> Self {
        Self::new(StatusCode::Success)
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::with_message(StatusCode::SystemError, message)
    }

    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::with_message(StatusCode::NotImplementedError, message)
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::with_message(StatusCode::PreconditionError, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::with_message(StatusCode::InvalidArgumentError, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::with_message(StatusCode::NotFoundError, message)
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::with_message(StatusCode::PermissionError, message)
    }

    pub fn infeasible(message: impl Into<String>) -> Self {
        Self::with_message(StatusCode::InfeasibleError, message)
    }

    pub fn duplication(message: impl Into<String>) -> Self {
        Self::with_message(StatusCode::DuplicationError, message)
    }

    pub fn broken_data(message: impl Into<String>) -> Self {
        Self::with_message(StatusCode::BrokenDataError, message)
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Success
    }

    /// Keep the first non-success status of the two
    pub fn join(self, other: Status) -> Status {
        if self.is_ok() {
            other
        } else {
            self
        }
    }

    /// Convert into a `Result`, `Ok` for success
    pub fn into_result(self) -> Result<()> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(self)
        }
    }

    /// Abort on failure. Meant for tests and demos.
    #[track_caller]
    pub fn or_die(&self) {
        if !self.is_ok() {
            panic!("{}", self);
        }
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::success()
    }
}

impl PartialEq<StatusCode> for Status {
    fn eq(&self, other: &StatusCode) -> bool {
        self.code == *other
    }
}

impl From<StatusCode> for Status {
    fn from(code: StatusCode) -> Self {
        Status::new(code)
    }
}

impl From<io::Error> for Status {
    fn from(err: io::Error) -> Self {
        let code = match err.kind() {
            io::ErrorKind::NotFound => StatusCode::NotFoundError,
            io::ErrorKind::PermissionDenied | io::ErrorKind::WouldBlock => {
                StatusCode::PermissionError
            }
            io::ErrorKind::AlreadyExists => StatusCode::DuplicationError,
            io::ErrorKind::InvalidInput => StatusCode::InvalidArgumentError,
            _ => StatusCode::SystemError,
        };
        Status::with_message(code, err.to_string())
    }
}

/// Status-oriented helpers on `Result`
pub trait ResultExt<T> {
    /// The status this result represents
    fn status(&self) -> Status;

    /// The code this result represents
    fn code(&self) -> StatusCode;

    /// Unwrap or panic with the status text. Meant for tests and demos.
    fn or_die(self) -> T;
}

impl<T> ResultExt<T> for Result<T> {
    fn status(&self) -> Status {
        match self {
            Ok(_) => Status::success(),
            Err(status) => status.clone(),
        }
    }

    fn code(&self) -> StatusCode {
        match self {
            Ok(_) => StatusCode::Success,
            Err(status) => status.code(),
        }
    }

    #[track_caller]
    fn or_die(self) -> T {
        match self {
            Ok(value) => value,
            Err(status) => panic!("{}", status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Status::success().to_string(), "SUCCESS");
        assert_eq!(
            Status::not_found("no such key").to_string(),
            "NOT_FOUND_ERROR: no such key"
        );
        assert_eq!(
            Status::new(StatusCode::InfeasibleError).to_string(),
            "INFEASIBLE_ERROR"
        );
    }

    #[test]
    fn test_join_keeps_first_failure() {
        let joined = Status::success()
            .join(Status::duplication("a"))
            .join(Status::not_found("b"));
        assert_eq!(joined.code(), StatusCode::DuplicationError);
        assert_eq!(joined.message(), "a");
        assert!(Status::success().join(Status::success()).is_ok());
    }

    #[test]
    fn test_io_error_mapping() {
        let status = Status::from(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert_eq!(status.code(), StatusCode::NotFoundError);
        assert_eq!(status.message(), "gone");

        let status = Status::from(io::Error::new(io::ErrorKind::WouldBlock, "locked"));
        assert_eq!(status.code(), StatusCode::PermissionError);

        let status = Status::from(io::Error::new(io::ErrorKind::Other, "boom"));
        assert_eq!(status.code(), StatusCode::SystemError);
    }

    #[test]
    fn test_code_round_trip() {
        for value in 0..=12u8 {
            let code = StatusCode::from_u8(value).unwrap();
            assert_eq!(code as u8, value);
        }
        assert!(StatusCode::from_u8(13).is_none());
        assert!(StatusCode::InfeasibleError.is_semantic());
        assert!(StatusCode::PreconditionError.is_programmer_error());
        assert!(!StatusCode::SystemError.is_semantic());
    }

    #[test]
    fn test_result_ext() {
        let ok: Result<i32> = Ok(3);
        assert!(ok.status().is_ok());
        assert_eq!(ok.or_die(), 3);

        let err: Result<i32> = Err(Status::precondition("closed"));
        assert_eq!(err.code(), StatusCode::PreconditionError);
        assert_eq!(err.status(), StatusCode::PreconditionError);
    }

    #[test]
    #[should_panic(expected = "BROKEN_DATA_ERROR")]
    fn test_or_die_panics() {
        Status::broken_data("bad crc").or_die();
    }
}

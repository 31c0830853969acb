// Consistent exit codes for the replica CLI.
//
//   0  = success
//   1  = general error
//   2  = usage/argument error
//   10 = store not reachable
//   11 = stored data corrupt

use std::process;

use replica_common::DocKeyError;
use replica_engine::StorageError;

/// Named exit codes for the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    Error = 1,
    Usage = 2,
    StoreUnavailable = 10,
    Corrupt = 11,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Map an anyhow error to an exit code by inspecting the error chain.
    pub fn from_error(err: &anyhow::Error) -> Self {
        for cause in err.chain() {
            if let Some(storage) = cause.downcast_ref::<StorageError>() {
                return match storage {
                    StorageError::Unavailable(_) => Self::StoreUnavailable,
                    StorageError::Corrupt { .. } => Self::Corrupt,
                    StorageError::Backend(_) => Self::Error,
                };
            }
            if cause.downcast_ref::<DocKeyError>().is_some() {
                return Self::Usage;
            }
            if let Some(io_err) = cause.downcast_ref::<std::io::Error>() {
                return match io_err.kind() {
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                        Self::StoreUnavailable
                    }
                    _ => Self::Error,
                };
            }
        }
        Self::Error
    }
}

impl From<ExitCode> for process::ExitCode {
    fn from(code: ExitCode) -> Self {
        process::ExitCode::from(code.code() as u8)
    }
}

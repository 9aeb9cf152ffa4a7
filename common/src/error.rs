use std::{backtrace::Backtrace, fmt::Debug};

use tracing::{error, warn};

/// Logs the error side of a result instead of propagating it
pub trait LogErrorExt {
    /// Logs at error level with a backtrace, for failures that indicate a bug
    fn log_error(self, message: &str);
    /// Logs at warn level, for expected failures such as a peer going away
    fn log_warn(self, message: &str);
}

impl<T, E: Debug> LogErrorExt for Result<T, E> {
    fn log_error(self, message: &str) {
        if let Err(err) = self {
            error!(
                "{}: {:?}, Backtrace: {}",
                message,
                err,
                Backtrace::capture()
            );
        }
    }

    fn log_warn(self, message: &str) {
        if let Err(err) = self {
            warn!("{}: {:?}", message, err);
        }
    }
}

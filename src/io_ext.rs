use std::io::{ErrorKind, Result};

/// Extension trait for `io::Result` to provide `ignore_not_found`
pub trait IoResultExt<T> {
    fn ignore_not_found(self) -> Result<T>;
}

impl<T: Default> IoResultExt<T> for Result<T> {
    /// Treat a missing file or directory as success, leaving other errors untouched
    /// Removing something that is already gone is the desired end state.
    fn ignore_not_found(self) -> Self {
        match self {
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(T::default()),
            result => result,
        }
    }
}

use std::fmt;

use thiserror::Error as ThisError;

/// Closed set of error kinds a runtime operation can fail with.
///
/// This is deliberately closed (no `Other` variant) — every failure path in
/// the runtime must be classifiable into one of these buckets so callers
/// (and tests) can match on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ThisError)]
pub enum ErrorKind {
    #[error("not_found")]
    NotFound,
    #[error("already_exists")]
    AlreadyExists,
    #[error("invalid_state")]
    InvalidState,
    #[error("invalid_config")]
    InvalidConfig,
    #[error("permission")]
    Permission,
    #[error("resource")]
    Resource,
    #[error("namespace")]
    Namespace,
    #[error("cgroup")]
    Cgroup,
    #[error("seccomp")]
    Seccomp,
    #[error("capability")]
    Capability,
    #[error("device")]
    Device,
    #[error("rootfs")]
    Rootfs,
    #[error("path_traversal")]
    PathTraversal,
    #[error("internal")]
    Internal,
}

/// A runtime error, carrying the operation that failed, the container id it
/// was acting on (if any), a kind from the closed set above, and the
/// underlying cause.
#[derive(Debug)]
pub struct Error {
    pub operation: &'static str,
    pub id: Option<String>,
    pub kind: ErrorKind,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    pub fn new(operation: &'static str, kind: ErrorKind) -> Self {
        Error {
            operation,
            id: None,
            kind,
            source: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn msg(operation: &'static str, kind: ErrorKind, message: impl fmt::Display) -> Self {
        Error::new(operation, kind).with_source(StringError(message.to_string()))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{}: container {id}: {}", self.operation, self.kind)?,
            None => write!(f, "{}: {}", self.operation, self.kind)?,
        }
        if let Some(src) = &self.source {
            write!(f, ": {src}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

#[derive(Debug)]
struct StringError(String);

impl fmt::Display for StringError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for StringError {}

pub type Result<T> = std::result::Result<T, Error>;

/// Helper trait to attach operation/id/kind context to a `nix`/`io` style
/// result without writing out `Error::new(...).with_source(...)` at every
/// call site.
pub trait Context<T> {
    fn ctx(self, operation: &'static str, kind: ErrorKind) -> Result<T>;
    fn ctx_id(self, operation: &'static str, kind: ErrorKind, id: &str) -> Result<T>;
}

impl<T, E> Context<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn ctx(self, operation: &'static str, kind: ErrorKind) -> Result<T> {
        self.map_err(|e| Error::new(operation, kind).with_source(e))
    }

    fn ctx_id(self, operation: &'static str, kind: ErrorKind, id: &str) -> Result<T> {
        self.map_err(|e| Error::new(operation, kind).with_id(id).with_source(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_operation_and_kind() {
        let err = Error::new("create", ErrorKind::AlreadyExists).with_id("abc123");
        let s = err.to_string();
        assert!(s.contains("create"));
        assert!(s.contains("abc123"));
        assert!(s.contains("already_exists"));
    }

    #[test]
    fn ctx_wraps_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let res: Result<()> = Err::<(), _>(io_err).ctx("load", ErrorKind::NotFound);
        assert_eq!(res.unwrap_err().kind, ErrorKind::NotFound);
    }
}

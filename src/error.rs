//! Error types for bundle construction.
//!
//! Every library operation returns [`BundleResult<T>`]. Installer plug-ins
//! report failures with `anyhow` and are wrapped into
//! [`BundleError::Installer`] by the installer manager.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for bundle operations.
pub type BundleResult<T> = Result<T, BundleError>;

/// All errors that can occur while producing a bundle.
#[derive(Error, Debug)]
pub enum BundleError {
    /// A marker file in the bundle directory disagrees with this invocation.
    #[error("bundle directory '{}' is incompatible: {reason}", path.display())]
    IncompatibleCache { path: PathBuf, reason: String },

    /// The metadata archive does not fit in the fixed metadata region.
    #[error("bundle metadata is {size} bytes, it must be less than {limit} bytes")]
    MetadataTooLarge { size: u64, limit: u64 },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// An external installer failed; `installer` names the dependency source.
    #[error("installer '{installer}' failed")]
    Installer {
        installer: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid bundle '{}': {reason}", path.display())]
    InvalidBundle { path: PathBuf, reason: String },

    #[error("{context}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration '{}': {reason}", path.display())]
    Config { path: PathBuf, reason: String },

    #[error("bundle directory is in use by another process (lock held on '{}')", path.display())]
    Locked { path: PathBuf },
}

impl BundleError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Wrap an installer failure, keeping the installer name.
    pub fn installer(installer: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Installer {
            installer: installer.into(),
            source: source.into(),
        }
    }

    /// Operator-facing hint for errors that the user can correct.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::IncompatibleCache { .. } => Some(
                "Remove the bundle directory, pick a different one with --bundle-base, \
                 or pass a compatible --bundle-version",
            ),
            Self::MetadataTooLarge { .. } => {
                Some("Reduce the size of the metadata files added to the bundle")
            }
            Self::Locked { .. } => {
                Some("Wait for the other bundle invocation to finish before retrying")
            }
            _ => None,
        }
    }
}

/// `with_context`-style helper for `io::Result`.
pub trait IoContext<T> {
    fn io_context<F, S>(self, f: F) -> BundleResult<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn io_context<F, S>(self, f: F) -> BundleResult<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|source| BundleError::io(f(), source))
    }
}

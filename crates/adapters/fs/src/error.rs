//! Filesystem adapter error types.

use std::path::PathBuf;

use itemhub_domain::error::HubError;

/// Errors specific to the filesystem adapter.
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    /// Reading, copying or listing a path failed.
    #[error("failed to access {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The directory watcher could not be set up.
    #[error("failed to watch directory")]
    Watch(#[source] notify::Error),

    /// A bundle loaded fine but exposed no locator.
    #[error("bundle {bundle} exposes no locator")]
    NoLocator { bundle: String },

    /// The previous version of a bundle could not be reclaimed.
    #[error("bundle {bundle} is still resident, update rejected")]
    Zombie { bundle: String },

    /// A domain-level error (validation, runtime failure, etc.).
    #[error("domain error")]
    Domain(#[source] HubError),
}

impl FsError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }

    /// Convert into a [`HubError`] for propagation across port boundaries.
    pub fn into_domain(self) -> HubError {
        match self {
            Self::Domain(err) => err,
            other => HubError::device(other),
        }
    }
}

impl From<HubError> for FsError {
    fn from(err: HubError) -> Self {
        Self::Domain(err)
    }
}

impl From<FsError> for HubError {
    fn from(err: FsError) -> Self {
        err.into_domain()
    }
}

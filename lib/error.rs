//! Error types shared across the crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or inconsistent run configuration, raised before any
    /// integration begins.
    #[error("configuration error: {0}")]
    Config(String),

    /// The process group cannot be partitioned over both parameter
    /// combinations and k-paths.
    #[error(
        "cannot use {group_size} processes for combined parameter/path \
        parallelization; valid group sizes are {candidates:?}"
    )]
    Partition { group_size: usize, candidates: Vec<usize> },

    /// Post-processing inputs disagree with each other.
    #[error("consistency error: {0}")]
    Consistency(String),

    /// Another process of the group failed; raised on the processes that
    /// did not see the original error.
    #[error("aborted: {0}")]
    Aborted(String),

    #[error("linear algebra error: {0}")]
    Linalg(#[from] ndarray_linalg::error::LinalgError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("npz write error: {0}")]
    Npz(#[from] ndarray_npy::WriteNpzError),

    #[error("parameter file error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn config<S>(msg: S) -> Self
    where S: Into<String>
    {
        Self::Config(msg.into())
    }

    pub(crate) fn consistency<S>(msg: S) -> Self
    where S: Into<String>
    {
        Self::Consistency(msg.into())
    }

    pub(crate) fn aborted<S>(msg: S) -> Self
    where S: Into<String>
    {
        Self::Aborted(msg.into())
    }
}

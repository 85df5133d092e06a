use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("socket path {path:?} is {len} chars, must be shorter than {max}")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },

    #[error("daemon binary {0:?} is not installed")]
    DaemonUnavailable(PathBuf),

    #[error(
        "privilege policy file {0:?} does not match the expected content; \
         regenerate it with `skiff net sudoers`"
    )]
    PrivilegePolicyMismatch(PathBuf),

    #[error("insecure path {path:?}: {reason}")]
    PathInsecure { path: PathBuf, reason: String },

    #[error("network {0:?} is not defined in the network config")]
    UndefinedNetwork(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CidataError {
    #[error("no usable SSH public key found; generate one with ssh-keygen")]
    NoSshKey,

    #[error("invalid template args: field {field}: {reason}")]
    InvalidTemplateArgs { field: &'static str, reason: String },

    #[error("template {file:?}: {reason}")]
    TemplateExecution { file: String, reason: String },

    #[error("unexpected file type in template bundle: {0:?}")]
    UnexpectedFileType(PathBuf),

    #[error("no ISO9660 mastering tool found (tried hdiutil, genisoimage, mkisofs, xorriso)")]
    NoImageTool,

    #[error("image tool {tool} failed: {detail}")]
    ImageTool { tool: String, detail: String },

    #[error(transparent)]
    Config(#[from] skiff_config::ConfigError),

    #[error(transparent)]
    Network(#[from] skiff_network::NetworkError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

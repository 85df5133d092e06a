use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid instance config: {0}")]
    Validation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

mod error;
mod instance;
mod validate;

pub use error::ConfigError;
pub use instance::*;
pub use validate::validate;

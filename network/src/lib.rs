pub mod addr;
pub mod config;
pub mod daemon;
mod error;
pub mod paths;
pub mod reconcile;
pub mod socket;

pub use error::NetworkError;

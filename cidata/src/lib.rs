//! Boot-data compiler.
//!
//! Builds the cloud-init data an instance consumes on first boot: template
//! args assembly and validation, template rendering, and serialization
//! into an ISO9660 image or a plain directory tree.

pub mod args;
pub mod assemble;
pub mod env;
mod error;
pub mod image;
pub mod render;
pub mod sshkeys;

pub use error::CidataError;

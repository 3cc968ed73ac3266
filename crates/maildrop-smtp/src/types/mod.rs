//! Core SMTP types.

mod extension;
mod reply;

pub use extension::{Body, Extension};
pub use reply::{EnhancedCode, EnhancedStatus, Reply, ReplyCode};

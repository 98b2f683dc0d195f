//! Core SMTP types.

mod address;
mod extension;
mod reply;

pub use address::{Address, validate_email};
pub use extension::{AuthMechanism, Extension};
pub use reply::{Reply, ReplyCode};

//! SMTP connection management.
//!
//! [`SmtpStream`] is the byte stream (plaintext or TLS, with an in-place
//! upgrade); the crate-private session module drives one dialogue over it.

pub(crate) mod session;
mod stream;
mod tls;

pub use stream::SmtpStream;
pub use tls::create_tls_connector;

use crate::types::{AuthMechanism, Extension, Reply};
use std::collections::HashSet;

/// Server capabilities from EHLO response.
#[derive(Debug, Clone, Default)]
pub struct ServerInfo {
    /// Server hostname from greeting.
    pub hostname: String,
    /// Supported extensions.
    pub extensions: HashSet<Extension>,
}

impl ServerInfo {
    /// Replaces the extension set with the one announced in an EHLO reply.
    ///
    /// The first line is the server's greeting and is skipped.
    pub fn update_from_ehlo(&mut self, reply: &Reply) {
        self.extensions = reply
            .message
            .iter()
            .skip(1)
            .map(|line| Extension::parse(line))
            .collect();
    }

    /// Checks if the server supports an extension.
    #[must_use]
    pub fn supports(&self, ext: &Extension) -> bool {
        self.extensions.contains(ext)
    }

    /// Checks if STARTTLS is supported.
    #[must_use]
    pub fn supports_starttls(&self) -> bool {
        self.supports(&Extension::StartTls)
    }

    /// Returns the maximum message size, if advertised.
    #[must_use]
    pub fn max_message_size(&self) -> Option<usize> {
        self.extensions.iter().find_map(|ext| match ext {
            Extension::Size(size) => *size,
            _ => None,
        })
    }

    /// Returns supported authentication mechanisms.
    #[must_use]
    pub fn auth_mechanisms(&self) -> Vec<AuthMechanism> {
        self.extensions
            .iter()
            .find_map(|ext| match ext {
                Extension::Auth(mechanisms) => Some(mechanisms.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names,
)]
mod tests {
    use super::*;
    use crate::types::ReplyCode;

    fn ehlo(lines: &[&str]) -> Reply {
        Reply::new(ReplyCode::OK, lines.iter().map(ToString::to_string).collect())
    }

    #[test]
    fn test_update_from_ehlo() {
        let mut info = ServerInfo::default();
        info.update_from_ehlo(&ehlo(&[
            "mx.example.com greets localhost",
            "SIZE 1024",
            "STARTTLS",
            "AUTH LOGIN PLAIN",
        ]));
        assert!(info.supports_starttls());
        assert_eq!(info.max_message_size(), Some(1024));
        assert_eq!(
            info.auth_mechanisms(),
            vec![AuthMechanism::Login, AuthMechanism::Plain]
        );
    }

    #[test]
    fn test_update_replaces_previous_capabilities() {
        let mut info = ServerInfo::default();
        info.update_from_ehlo(&ehlo(&["mx", "STARTTLS"]));
        info.update_from_ehlo(&ehlo(&["mx", "PIPELINING"]));
        assert!(!info.supports_starttls());
        assert!(info.supports(&Extension::Unknown("PIPELINING".to_string())));
    }

    #[test]
    fn test_empty_capabilities() {
        let info = ServerInfo::default();
        assert_eq!(info.max_message_size(), None);
        assert!(info.auth_mechanisms().is_empty());
    }
}

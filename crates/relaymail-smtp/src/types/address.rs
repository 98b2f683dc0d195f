//! Email address types.

use crate::error::{Error, Result};

/// Checks whether `addr` looks like an email address.
///
/// Accepts `local@domain` where neither part is empty or contains whitespace
/// or a second `@`, and the domain has a dot with at least one character on
/// each side. Never touches the network.
///
/// ```
/// use relaymail_smtp::validate_email;
///
/// assert!(validate_email("user.name+tag@domain.co.uk"));
/// assert!(!validate_email("user@"));
/// ```
#[must_use]
pub fn validate_email(addr: &str) -> bool {
    let Some((local, domain)) = addr.split_once('@') else {
        return false;
    };

    let well_formed = |part: &str| {
        !part.is_empty() && !part.chars().any(|c| c.is_whitespace() || c == '@')
    };

    if !well_formed(local) || !well_formed(domain) {
        return false;
    }

    // A dot somewhere strictly inside the domain.
    domain
        .char_indices()
        .any(|(i, c)| c == '.' && i > 0 && i + 1 < domain.len())
}

/// Email address for the SMTP envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address(String);

impl Address {
    /// Creates a new address from a string.
    ///
    /// # Errors
    ///
    /// Returns an error if the address fails [`validate_email`].
    pub fn new(addr: impl Into<String>) -> Result<Self> {
        let addr = addr.into();
        if !validate_email(&addr) {
            return Err(Error::InvalidAddress(addr));
        }
        Ok(Self(addr))
    }

    /// Returns the address as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
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
    use proptest::prelude::*;

    #[test]
    fn test_valid_addresses() {
        assert!(validate_email("user@domain.com"));
        assert!(validate_email("user.name+tag@domain.co.uk"));
        assert!(validate_email("a@b.c"));
    }

    #[test]
    fn test_invalid_addresses() {
        assert!(!validate_email("invalid"));
        assert!(!validate_email("@domain.com"));
        assert!(!validate_email("user@"));
        assert!(!validate_email(""));
    }

    #[test]
    fn test_domain_needs_inner_dot() {
        assert!(!validate_email("user@localhost"));
        assert!(!validate_email("user@.com"));
        assert!(!validate_email("user@domain."));
        assert!(validate_email("user@domain.com."));
    }

    #[test]
    fn test_whitespace_and_double_at() {
        assert!(!validate_email("us er@domain.com"));
        assert!(!validate_email("user@dom ain.com"));
        assert!(!validate_email("user@@domain.com"));
        assert!(!validate_email("a@b@domain.com"));
        assert!(!validate_email(" user@domain.com"));
    }

    #[test]
    fn test_address_new() {
        let addr = Address::new("user@example.com").unwrap();
        assert_eq!(addr.as_str(), "user@example.com");
        assert_eq!(addr.to_string(), "user@example.com");
    }

    #[test]
    fn test_address_new_rejects() {
        let err = Address::new("userexample.com").unwrap_err();
        assert_eq!(err.to_string(), "Invalid email address: userexample.com");
    }

    proptest! {
        #[test]
        fn validate_is_deterministic(s in ".*") {
            prop_assert_eq!(validate_email(&s), validate_email(&s));
        }

        #[test]
        fn no_at_sign_is_never_valid(s in "[^@]*") {
            prop_assert!(!validate_email(&s));
        }

        #[test]
        fn simple_shapes_are_valid(
            local in "[a-z0-9._+-]{1,16}",
            label in "[a-z0-9-]{1,16}",
            tld in "[a-z]{2,6}",
        ) {
            let addr = format!("{local}@{label}.{tld}");
            prop_assert!(validate_email(&addr));
        }
    }
}

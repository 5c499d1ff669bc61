use core::fmt::{self, Display, Formatter};
use std::borrow::Cow;

/// Identifies the application protocol spoken over a connection.
///
/// The wildcard token `*` addresses the default handler slot; it is also the
/// token every connection carries when no negotiation takes place.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ProtocolToken(Cow<'static, str>);

pub const WILDCARD: ProtocolToken = ProtocolToken::from_static("*");

impl ProtocolToken {
    #[must_use]
    pub fn new(token: impl Into<Cow<'static, str>>) -> Self {
        Self(token.into())
    }

    #[must_use]
    pub const fn from_static(token: &'static str) -> Self {
        Self(Cow::Borrowed(token))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        *self == WILDCARD
    }
}

impl Default for ProtocolToken {
    fn default() -> Self {
        WILDCARD
    }
}

impl Display for ProtocolToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for ProtocolToken {
    fn from(token: &'static str) -> Self {
        Self::from_static(token)
    }
}

impl From<String> for ProtocolToken {
    fn from(token: String) -> Self {
        Self(Cow::Owned(token))
    }
}

impl AsRef<str> for ProtocolToken {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_wildcard() {
        assert!(ProtocolToken::default().is_wildcard());
        assert!(ProtocolToken::from("*").is_wildcard());
        assert!(!ProtocolToken::from("chat/1.0").is_wildcard());
    }

    #[test]
    fn test_owned_and_borrowed_tokens_compare_equal() {
        assert_eq!(
            ProtocolToken::from(String::from("chat/1.0")),
            ProtocolToken::from_static("chat/1.0")
        );
    }
}

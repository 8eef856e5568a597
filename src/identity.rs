//! # Peer Identity
//!
//! Peers are identified by `name@namespace`. Both parts are plain UTF-8
//! strings, non-empty and at most 64 characters, with the separator and
//! routing sigils (`@`, `#`, `*`) and whitespace excluded from the parts
//! themselves. The full string form is the canonical representation: it is
//! what travels on the wire, keys the peer table, and defines the total
//! order used by the duplicate-session tie-break.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Maximum length of the `name` part.
pub const MAX_NAME_LEN: usize = 64;

/// Maximum length of the `namespace` part.
pub const MAX_NAMESPACE_LEN: usize = 64;

/// Reasons an identity string or its parts fail validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// Missing or misplaced `@` separator.
    MissingSeparator,
    /// The name part is empty, too long, or contains a forbidden character.
    BadName(String),
    /// The namespace part is empty, too long, or contains a forbidden character.
    BadNamespace(String),
}

impl fmt::Display for IdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityError::MissingSeparator => {
                write!(f, "identity must be name@namespace")
            }
            IdentityError::BadName(name) => {
                write!(f, "bad name {:?}: 1..=64 chars, no '@' '#' '*' or whitespace", name)
            }
            IdentityError::BadNamespace(ns) => {
                write!(f, "bad namespace {:?}: 1..=64 chars, no '@' '#' '*' or whitespace", ns)
            }
        }
    }
}

impl std::error::Error for IdentityError {}

fn valid_part(part: &str, max: usize) -> bool {
    !part.is_empty()
        && part.len() <= max
        && part
            .chars()
            .all(|c| !c.is_whitespace() && c != '@' && c != '#' && c != '*')
}

/// Validate a bare `name` part.
pub fn validate_name(name: &str) -> Result<(), IdentityError> {
    if valid_part(name, MAX_NAME_LEN) {
        Ok(())
    } else {
        Err(IdentityError::BadName(name.to_string()))
    }
}

/// Validate a bare `namespace` part.
pub fn validate_namespace(ns: &str) -> Result<(), IdentityError> {
    if valid_part(ns, MAX_NAMESPACE_LEN) {
        Ok(())
    } else {
        Err(IdentityError::BadNamespace(ns.to_string()))
    }
}

/// A validated `name@namespace` peer identity.
///
/// Stored as the canonical full string plus the split point, so `name()`
/// and `namespace()` are free and `Ord` follows the full string form.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId {
    full: String,
    at: usize,
}

impl PeerId {
    pub fn new(name: &str, namespace: &str) -> Result<Self, IdentityError> {
        validate_name(name)?;
        validate_namespace(namespace)?;
        Ok(Self {
            full: format!("{}@{}", name, namespace),
            at: name.len(),
        })
    }

    pub fn name(&self) -> &str {
        &self.full[..self.at]
    }

    pub fn namespace(&self) -> &str {
        &self.full[self.at + 1..]
    }

    pub fn as_str(&self) -> &str {
        &self.full
    }
}

impl FromStr for PeerId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, namespace) = s.split_once('@').ok_or(IdentityError::MissingSeparator)?;
        Self::new(name, namespace)
    }
}

impl TryFrom<String> for PeerId {
    type Error = IdentityError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<PeerId> for String {
    fn from(id: PeerId) -> Self {
        id.full
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.full)
    }
}

/// Where a message is going: one peer, every peer in a namespace, or
/// every reachable peer.
///
/// The wire form is a plain string: the peer identity, `#<namespace>`,
/// or `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Peer(PeerId),
    Namespace(String),
    All,
}

impl Destination {
    pub fn parse(s: &str) -> Result<Self, IdentityError> {
        if s == "*" {
            return Ok(Destination::All);
        }
        if let Some(ns) = s.strip_prefix('#') {
            validate_namespace(ns)?;
            return Ok(Destination::Namespace(ns.to_string()));
        }
        Ok(Destination::Peer(s.parse()?))
    }

    /// True when a locally delivered copy is due at `local`.
    pub fn matches(&self, local: &PeerId) -> bool {
        match self {
            Destination::Peer(id) => id == local,
            Destination::Namespace(ns) => local.namespace() == ns,
            Destination::All => true,
        }
    }

    pub fn to_wire(&self) -> String {
        match self {
            Destination::Peer(id) => id.to_string(),
            Destination::Namespace(ns) => format!("#{}", ns),
            Destination::All => "*".to_string(),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_accessors() {
        let id: PeerId = "alice@CIC".parse().unwrap();
        assert_eq!(id.name(), "alice");
        assert_eq!(id.namespace(), "CIC");
        assert_eq!(id.to_string(), "alice@CIC");
    }

    #[test]
    fn rejects_missing_separator() {
        assert_eq!(
            "alice".parse::<PeerId>().unwrap_err(),
            IdentityError::MissingSeparator
        );
    }

    #[test]
    fn rejects_empty_and_oversized_parts() {
        assert!(matches!(
            "@CIC".parse::<PeerId>(),
            Err(IdentityError::BadName(_))
        ));
        assert!(matches!(
            "alice@".parse::<PeerId>(),
            Err(IdentityError::BadNamespace(_))
        ));

        let long = "x".repeat(65);
        assert!(PeerId::new(&long, "CIC").is_err());
        assert!(PeerId::new("alice", &long).is_err());
        assert!(PeerId::new(&"x".repeat(64), &"y".repeat(64)).is_ok());
    }

    #[test]
    fn rejects_sigils_and_whitespace_in_parts() {
        for bad in ["al ice@CIC", "alice@C#C", "al*ce@CIC", "a@b@c"] {
            assert!(bad.parse::<PeerId>().is_err(), "{} should not parse", bad);
        }
    }

    #[test]
    fn ordering_follows_full_string() {
        let a: PeerId = "alice@CIC".parse().unwrap();
        let b: PeerId = "bob@CIC".parse().unwrap();
        assert!(a < b);
    }

    #[test]
    fn serde_uses_string_form() {
        let id: PeerId = "carol@UnB".parse().unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"carol@UnB\"");
        let back: PeerId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<PeerId>("\"nope\"").is_err());
    }

    #[test]
    fn destination_parsing() {
        let local: PeerId = "bob@CIC".parse().unwrap();

        let d = Destination::parse("bob@CIC").unwrap();
        assert!(d.matches(&local));

        let d = Destination::parse("#CIC").unwrap();
        assert_eq!(d, Destination::Namespace("CIC".into()));
        assert!(d.matches(&local));
        assert!(!Destination::parse("#UnB").unwrap().matches(&local));

        assert_eq!(Destination::parse("*").unwrap(), Destination::All);
        assert!(Destination::All.matches(&local));

        assert!(Destination::parse("#").is_err());
    }

    #[test]
    fn destination_wire_round_trip() {
        for s in ["alice@CIC", "#CIC", "*"] {
            assert_eq!(Destination::parse(s).unwrap().to_wire(), s);
        }
    }
}

//! Peer identifiers and the identification frame.
//!
//! A peer introduces itself with a single text frame:
//!
//! ```text
//! Identify <nid>:<link_type>:<secret>
//! ```
//!
//! - `nid` - unique peer id, `[A-Za-z0-9-]+`
//! - `link_type` - role shared by many peers, `[a-z]+`
//! - `secret` - shared hub secret, `[A-Za-z0-9-]+`

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

const IDENTIFY_PREFIX: &str = "Identify ";

/// Whether `s` has the lexical form of a nid.
pub fn is_nid(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// Whether `s` has the lexical form of a link type.
pub fn is_link_type(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_lowercase())
}

/// A peer's unique identity on the hub.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Nid(String);

impl Nid {
    /// Generate a fresh random nid (a UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// The nid as written on the wire.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Nid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Nid {
    type Err = IdentifyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if is_nid(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(IdentifyParseError::InvalidNid(s.to_string()))
        }
    }
}

impl TryFrom<String> for Nid {
    type Error = IdentifyParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        if is_nid(&s) {
            Ok(Self(s))
        } else {
            Err(IdentifyParseError::InvalidNid(s))
        }
    }
}

impl Borrow<str> for Nid {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<Nid> for String {
    fn from(nid: Nid) -> Self {
        nid.0
    }
}

/// The role a peer declares, e.g. `telegram` or `discord`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LinkType(String);

impl LinkType {
    /// The link type as written on the wire.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for LinkType {
    type Err = IdentifyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if is_link_type(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(IdentifyParseError::InvalidLinkType(s.to_string()))
        }
    }
}

impl TryFrom<String> for LinkType {
    type Error = IdentifyParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        if is_link_type(&s) {
            Ok(Self(s))
        } else {
            Err(IdentifyParseError::InvalidLinkType(s))
        }
    }
}

impl Borrow<str> for LinkType {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<LinkType> for String {
    fn from(link_type: LinkType) -> Self {
        link_type.0
    }
}

/// A parsed identification frame.
#[derive(Clone, PartialEq, Eq)]
pub struct Identification {
    pub nid: Nid,
    pub link_type: LinkType,
    pub secret: String,
}

impl Identification {
    pub fn new(nid: Nid, link_type: LinkType, secret: impl Into<String>) -> Self {
        Self {
            nid,
            link_type,
            secret: secret.into(),
        }
    }
}

// The secret stays out of logs.
impl fmt::Debug for Identification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identification")
            .field("nid", &self.nid)
            .field("link_type", &self.link_type)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Identification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{IDENTIFY_PREFIX}{}:{}:{}",
            self.nid, self.link_type, self.secret
        )
    }
}

impl FromStr for Identification {
    type Err = IdentifyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(IDENTIFY_PREFIX)
            .ok_or(IdentifyParseError::MissingPrefix)?;

        let mut parts = rest.splitn(3, ':');
        let (Some(nid), Some(link_type), Some(secret)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(IdentifyParseError::MissingField);
        };

        if !is_nid(secret) {
            return Err(IdentifyParseError::InvalidSecret);
        }

        Ok(Self {
            nid: nid.parse()?,
            link_type: link_type.parse()?,
            secret: secret.to_string(),
        })
    }
}

/// Error parsing an identifier or identification frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentifyParseError {
    #[error("identification must start with 'Identify '")]
    MissingPrefix,
    #[error("identification must have the form nid:link_type:secret")]
    MissingField,
    #[error("invalid nid: {0:?}")]
    InvalidNid(String),
    #[error("invalid link type: {0:?}")]
    InvalidLinkType(String),
    #[error("invalid secret format")]
    InvalidSecret,
}

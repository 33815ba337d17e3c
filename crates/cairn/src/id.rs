//! Content identifiers.
//!
//! A [`ContentId`] names a byte sequence. Its wire form is a single tag
//! character followed by a base64 payload:
//!
//! | Tag | Payload                                   |
//! |-----|-------------------------------------------|
//! | `Z` | none: the content is empty                |
//! | `L` | the content itself (short content only)   |
//! | `I` | the SHA-512 digest of the content         |
//!
//! Payloads use a filesystem-safe base64 alphabet where `+` and `/` are
//! replaced by `.` and `_`.

use std::{fmt, str::FromStr};

use base64::{
    Engine as _,
    alphabet::Alphabet,
    engine::{GeneralPurpose, general_purpose},
};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use thiserror::Error;

/// Length in bytes of a SHA-512 digest.
pub const DIGEST_LEN: usize = 64;

const ALPHABET: Alphabet =
    match Alphabet::new("ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789._") {
        Ok(alphabet) => alphabet,
        Err(_) => panic!("invalid content id alphabet"),
    };

/// Base64 engine for identifier payloads.
pub const SAFE_BASE64: GeneralPurpose = GeneralPurpose::new(&ALPHABET, general_purpose::PAD);

/// Failure to interpret a value as a content identifier.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("empty string is not a content id")]
    Empty,

    #[error("unknown content id tag {0:?}")]
    UnknownTag(char),

    #[error("invalid content id payload: {0}")]
    InvalidPayload(String),
}

/// Identifier derived from a byte sequence.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ContentId {
    /// Zero-length content.
    Empty,
    /// Short content, carried verbatim.
    Literal(Vec<u8>),
    /// SHA-512 digest of the content.
    Hash(Box<[u8; DIGEST_LEN]>),
}

impl ContentId {
    pub const EMPTY_TAG: char = 'Z';
    pub const LITERAL_TAG: char = 'L';
    pub const HASH_TAG: char = 'I';

    /// The single-character tag of the wire form.
    pub fn tag(&self) -> char {
        match self {
            Self::Empty => Self::EMPTY_TAG,
            Self::Literal(_) => Self::LITERAL_TAG,
            Self::Hash(_) => Self::HASH_TAG,
        }
    }

    /// The original content, if this is a literal (or empty) identifier.
    pub fn literal_content(&self) -> Option<&[u8]> {
        match self {
            Self::Empty => Some(&[]),
            Self::Literal(bytes) => Some(bytes.as_slice()),
            Self::Hash(_) => None,
        }
    }

    pub fn digest(&self) -> Option<&[u8; DIGEST_LEN]> {
        match self {
            Self::Hash(digest) => Some(&**digest),
            _ => None,
        }
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "{}", Self::EMPTY_TAG),
            Self::Literal(bytes) => write!(f, "{}{}", Self::LITERAL_TAG, SAFE_BASE64.encode(bytes)),
            Self::Hash(digest) => write!(
                f,
                "{}{}",
                Self::HASH_TAG,
                SAFE_BASE64.encode(digest.as_slice())
            ),
        }
    }
}

impl FromStr for ContentId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        let tag = chars.next().ok_or(IdError::Empty)?;
        let payload = chars.as_str();

        match tag {
            Self::EMPTY_TAG if payload.is_empty() => Ok(Self::Empty),
            Self::EMPTY_TAG => Err(IdError::InvalidPayload(
                "empty-content id carries no payload".into(),
            )),
            Self::LITERAL_TAG => {
                let bytes = decode(payload)?;
                if bytes.is_empty() {
                    return Err(IdError::InvalidPayload("literal id has no content".into()));
                }
                Ok(Self::Literal(bytes))
            }
            Self::HASH_TAG => {
                let bytes = decode(payload)?;
                let digest: [u8; DIGEST_LEN] = bytes.as_slice().try_into().map_err(|_| {
                    IdError::InvalidPayload(format!(
                        "hash id decodes to {} bytes, expected {DIGEST_LEN}",
                        bytes.len()
                    ))
                })?;
                Ok(Self::Hash(Box::new(digest)))
            }
            other => Err(IdError::UnknownTag(other)),
        }
    }
}

fn decode(payload: &str) -> Result<Vec<u8>, IdError> {
    SAFE_BASE64
        .decode(payload)
        .map_err(|err| IdError::InvalidPayload(err.to_string()))
}

impl TryFrom<&str> for ContentId {
    type Error = IdError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl TryFrom<String> for ContentId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl Serialize for ContentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ContentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

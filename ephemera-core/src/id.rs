//! Tagged world-object identifiers.
//!
//! Every runtime record is addressed as `TAG#localId`. The tag decides which
//! operations are legal on the id, so it is parsed eagerly and an unknown tag
//! is rejected instead of coerced.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors from parsing or validating an [`ObjectId`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    #[error("Illegal tag: {0}")]
    IllegalTag(String),

    #[error("Malformed object id (expected TAG#localId): {0}")]
    Malformed(String),
}

/// The kind of world object an id refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tag {
    Room,
    Feature,
    Map,
    Character,
    Variable,
    Computed,
    Knowledge,
    Bookmark,
    Message,
    Moment,
    Asset,
    Action,
}

impl Tag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tag::Room => "ROOM",
            Tag::Feature => "FEATURE",
            Tag::Map => "MAP",
            Tag::Character => "CHARACTER",
            Tag::Variable => "VARIABLE",
            Tag::Computed => "COMPUTED",
            Tag::Knowledge => "KNOWLEDGE",
            Tag::Bookmark => "BOOKMARK",
            Tag::Message => "MESSAGE",
            Tag::Moment => "MOMENT",
            Tag::Asset => "ASSET",
            Tag::Action => "ACTION",
        }
    }

    pub fn from_str_exact(s: &str) -> Option<Tag> {
        match s {
            "ROOM" => Some(Tag::Room),
            "FEATURE" => Some(Tag::Feature),
            "MAP" => Some(Tag::Map),
            "CHARACTER" => Some(Tag::Character),
            "VARIABLE" => Some(Tag::Variable),
            "COMPUTED" => Some(Tag::Computed),
            "KNOWLEDGE" => Some(Tag::Knowledge),
            "BOOKMARK" => Some(Tag::Bookmark),
            "MESSAGE" => Some(Tag::Message),
            "MOMENT" => Some(Tag::Moment),
            "ASSET" => Some(Tag::Asset),
            "ACTION" => Some(Tag::Action),
            _ => None,
        }
    }

    /// Whether ids of this kind hold a value the expression evaluator can read.
    pub fn is_state(&self) -> bool {
        matches!(self, Tag::Variable | Tag::Computed)
    }

    /// Whether ids of this kind carry per-asset appearances.
    pub fn has_appearances(&self) -> bool {
        matches!(
            self,
            Tag::Room | Tag::Feature | Tag::Map | Tag::Knowledge | Tag::Bookmark
        )
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A world-object id of the form `TAG#localId`.
///
/// The textual form is preserved exactly, so ids round-trip through the store
/// unchanged. Serializes as a plain string.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectId {
    tag: Tag,
    raw: String,
}

impl ObjectId {
    /// Build an id from a tag and a local id.
    pub fn new(tag: Tag, local: impl AsRef<str>) -> Self {
        Self {
            tag,
            raw: format!("{}#{}", tag.as_str(), local.as_ref()),
        }
    }

    /// Parse `TAG#localId`.
    pub fn parse(s: impl AsRef<str>) -> Result<Self, IdError> {
        let s = s.as_ref();
        let (tag, local) = s
            .split_once('#')
            .ok_or_else(|| IdError::Malformed(s.to_string()))?;
        let tag = Tag::from_str_exact(tag).ok_or_else(|| IdError::IllegalTag(tag.to_string()))?;
        if local.is_empty() {
            return Err(IdError::Malformed(s.to_string()));
        }
        Ok(Self {
            tag,
            raw: s.to_string(),
        })
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// The part after `#`.
    pub fn local_id(&self) -> &str {
        // The constructor guarantees a '#' after the tag.
        &self.raw[self.tag.as_str().len() + 1..]
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Fail with [`IdError::IllegalTag`] unless the tag is one of `allowed`.
    pub fn expect_tag(&self, allowed: &[Tag]) -> Result<&Self, IdError> {
        if allowed.contains(&self.tag) {
            Ok(self)
        } else {
            Err(IdError::IllegalTag(self.raw.clone()))
        }
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.raw)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for ObjectId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ObjectId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<ObjectId> for String {
    fn from(id: ObjectId) -> Self {
        id.raw
    }
}

//! Schema-versioned instance metadata.
//!
//! Metadata survives process restarts by living in the provider resource's
//! flat, immutable string→string tag mapping, set once at creation. The
//! mapping is stringly-typed on the wire, so decoding goes through a strict
//! versioned check: an unrecognized schema version is a hard error, never
//! guessed. Migration is explicitly out of scope.

use crate::constants::{
    CURRENT_SCHEMA_VERSION, TAG_AUTHOR, TAG_CHANNEL, TAG_CREATED_AT, TAG_LANGUAGE,
    TAG_SCHEMA_VERSION, TAG_SOURCE, TAG_TITLE,
};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// =============================================================================
// Language
// =============================================================================

/// Source language of a sandboxed program.
///
/// Selects the guest-side runner shim and the uploaded source filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// CPython interpreter; globals persist across invocations.
    Python,
    /// Compiled C program; static state persists across invocations.
    C,
    /// Compiled C++ program; static state persists across invocations.
    Cpp,
}

impl Language {
    /// Returns the wire name used in tags and the language-selector frame.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::C => "c",
            Self::Cpp => "cpp",
        }
    }

    /// Parses a wire name.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "python" => Some(Self::Python),
            "c" => Some(Self::C),
            "cpp" => Some(Self::Cpp),
            _ => None,
        }
    }

    /// Filename the source text is uploaded under inside the sandbox.
    pub fn source_filename(&self) -> &'static str {
        match self {
            Self::Python => "program.py",
            Self::C => "program.c",
            Self::Cpp => "program.cpp",
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Sandbox Metadata
// =============================================================================

/// Metadata describing one sandboxed program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxMetadata {
    /// Tag-schema version this record was written under.
    pub schema_version: u32,
    /// Channel that owns the program.
    pub channel_id: String,
    /// Source language.
    pub language: Language,
    /// User-declared title; resolvable as an abbreviation.
    pub title: String,
    /// The submitted source text.
    pub source_text: String,
    /// Who submitted the program.
    pub author_id: String,
    /// When the program was created.
    pub created_at: DateTime<Utc>,
}

impl SandboxMetadata {
    /// Builds a fresh record under the current schema version.
    pub fn new(
        channel_id: impl Into<String>,
        language: Language,
        title: impl Into<String>,
        source_text: impl Into<String>,
        author_id: impl Into<String>,
    ) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            channel_id: channel_id.into(),
            language,
            title: title.into(),
            source_text: source_text.into(),
            author_id: author_id.into(),
            created_at: Utc::now(),
        }
    }

    /// Serializes the record into the flat tag mapping.
    pub fn to_tags(&self) -> HashMap<String, String> {
        HashMap::from([
            (
                TAG_SCHEMA_VERSION.to_string(),
                self.schema_version.to_string(),
            ),
            (TAG_CHANNEL.to_string(), self.channel_id.clone()),
            (TAG_LANGUAGE.to_string(), self.language.as_str().to_string()),
            (TAG_TITLE.to_string(), self.title.clone()),
            (TAG_SOURCE.to_string(), self.source_text.clone()),
            (TAG_AUTHOR.to_string(), self.author_id.clone()),
            (TAG_CREATED_AT.to_string(), self.created_at.to_rfc3339()),
        ])
    }

    /// Decodes a record from a tag mapping.
    ///
    /// # Errors
    ///
    /// [`Error::SchemaVersion`] for a version other than
    /// [`CURRENT_SCHEMA_VERSION`]; [`Error::TagMissing`] /
    /// [`Error::TagMalformed`] for an incomplete or unparsable mapping.
    pub fn from_tags(tags: &HashMap<String, String>) -> Result<Self> {
        let version = require(tags, TAG_SCHEMA_VERSION)?;
        if version.parse::<u32>() != Ok(CURRENT_SCHEMA_VERSION) {
            return Err(Error::SchemaVersion {
                found: version.to_string(),
                supported: CURRENT_SCHEMA_VERSION,
            });
        }
        let language = require(tags, TAG_LANGUAGE)?;
        let language = Language::parse(language).ok_or_else(|| Error::TagMalformed {
            key: TAG_LANGUAGE,
            reason: format!("unknown language '{language}'"),
        })?;
        let created_at = require(tags, TAG_CREATED_AT)?;
        let created_at = DateTime::parse_from_rfc3339(created_at)
            .map_err(|e| Error::TagMalformed {
                key: TAG_CREATED_AT,
                reason: e.to_string(),
            })?
            .with_timezone(&Utc);
        Ok(Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            channel_id: require(tags, TAG_CHANNEL)?.to_string(),
            language,
            title: require(tags, TAG_TITLE)?.to_string(),
            source_text: require(tags, TAG_SOURCE)?.to_string(),
            author_id: require(tags, TAG_AUTHOR)?.to_string(),
            created_at,
        })
    }
}

/// Returns true if the tag mapping marks an engine-managed resource.
pub fn is_managed(tags: &HashMap<String, String>) -> bool {
    tags.contains_key(TAG_SCHEMA_VERSION)
}

fn require<'a>(tags: &'a HashMap<String, String>, key: &'static str) -> Result<&'a str> {
    tags.get(key)
        .map(String::as_str)
        .ok_or(Error::TagMissing(key))
}

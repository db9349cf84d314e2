//! Typed identifiers used across the platform.
//!
//! Every identifier is a newtype so the compiler keeps document keys,
//! principals, and job ids from being interchanged. All of them serialize
//! as plain strings (or string pairs for [`DocumentKey`]) so they appear
//! naturally in the JSON wire protocol and in storage rows.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtocolError;

/// Uniquely names a collaborative document: project id plus document name.
///
/// Displayed and stored as `project/name`. The document name may itself
/// contain `/` separators (documents live in project subdirectories); the
/// project id may not.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentKey {
    /// Owning project identifier.
    pub project: String,
    /// Document name within the project (may contain `/`).
    pub name: String,
}

impl DocumentKey {
    /// Create a document key after validating both parts.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidIdentifier`] if either part is empty
    /// or the project contains a `/`.
    pub fn new(project: impl Into<String>, name: impl Into<String>) -> Result<Self, ProtocolError> {
        let project = project.into();
        let name = name.into();
        if project.is_empty() || name.is_empty() {
            return Err(ProtocolError::InvalidIdentifier(
                "document key parts must be non-empty".to_owned(),
            ));
        }
        if project.contains('/') {
            return Err(ProtocolError::InvalidIdentifier(format!(
                "project id may not contain '/': {project}"
            )));
        }
        Ok(Self { project, name })
    }

    /// The pub/sub channel carrying this document's room traffic.
    #[must_use]
    pub fn channel(&self) -> String {
        format!("room:{self}")
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project, self.name)
    }
}

impl FromStr for DocumentKey {
    type Err = ProtocolError;

    /// Parse `project/name`; the first `/` splits the parts.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((project, name)) => Self::new(project, name),
            None => Err(ProtocolError::InvalidIdentifier(format!(
                "document key missing '/': {s}"
            ))),
        }
    }
}

/// One client connection's identity for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a fresh session id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Authenticated principal (user) identity, as issued by the auth layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrincipalId(String);

impl PrincipalId {
    /// Wrap a principal identifier string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PrincipalId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Client-chosen device/tab identifier, distinct from the principal.
///
/// A principal editing the same document from two tabs holds two client
/// ids; fan-out exclusion operates on sessions, not principals.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Wrap a client identifier string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compilation job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generate a fresh job id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a job id from its canonical string form.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidIdentifier`] if the string is not a
    /// UUID.
    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| ProtocolError::InvalidIdentifier(format!("job id {s}: {e}")))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_key_display_roundtrip() {
        let key = DocumentKey::new("proj-1", "chapters/intro.tex").unwrap();
        assert_eq!(key.to_string(), "proj-1/chapters/intro.tex");

        let parsed: DocumentKey = key.to_string().parse().unwrap();
        assert_eq!(parsed, key);
        // Name keeps its inner separators.
        assert_eq!(parsed.name, "chapters/intro.tex");
    }

    #[test]
    fn document_key_rejects_empty_parts() {
        assert!(DocumentKey::new("", "doc").is_err());
        assert!(DocumentKey::new("proj", "").is_err());
        assert!("no-separator".parse::<DocumentKey>().is_err());
    }

    #[test]
    fn document_key_rejects_slash_in_project() {
        assert!(DocumentKey::new("a/b", "doc").is_err());
    }

    #[test]
    fn channel_name_includes_full_key() {
        let key = DocumentKey::new("p", "main.tex").unwrap();
        assert_eq!(key.channel(), "room:p/main.tex");
    }

    #[test]
    fn session_ids_are_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
    }

    #[test]
    fn principal_serializes_transparent() {
        let p = PrincipalId::new("user-42");
        assert_eq!(serde_json::to_string(&p).unwrap(), "\"user-42\"");
    }

    #[test]
    fn job_id_parse_roundtrip() {
        let id = JobId::new();
        let parsed = JobId::parse(&id.to_string()).unwrap();
        assert_eq!(parsed, id);
        assert!(JobId::parse("not-a-uuid").is_err());
    }
}

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CorrError, EvidenceError, Result};

/// Stable identity of one evidence item, unique within `(source, kind)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EvidenceId(pub String);

impl std::fmt::Display for EvidenceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of a registered source platform (e.g. `"github"`, `"gitlab"`,
/// `"git"`). Kept as a string rather than a closed enum because collectors
/// register their own names at startup.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceTag(pub String);

impl std::fmt::Display for SourceTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SourceTag {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    Commit,
    MergeRequest,
    Ticket,
    Comment,
    Message,
    Document,
}

impl EvidenceKind {
    fn as_str(self) -> &'static str {
        match self {
            EvidenceKind::Commit => "commit",
            EvidenceKind::MergeRequest => "merge_request",
            EvidenceKind::Ticket => "ticket",
            EvidenceKind::Comment => "comment",
            EvidenceKind::Message => "message",
            EvidenceKind::Document => "document",
        }
    }
}

/// A bounded scalar in a source-specific attribute bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

/// A source-specific attribute: a scalar, or a bounded list of scalars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Scalar(ScalarValue),
    List(Vec<ScalarValue>),
}

/// One activity record from one source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    pub id: EvidenceId,
    pub source: SourceTag,
    pub kind: EvidenceKind,
    pub author: String,
    pub timestamp: DateTime<Utc>,
    pub title: String,
    pub body: String,
    pub url: Option<String>,
    #[serde(default)]
    pub attributes: HashMap<String, AttributeValue>,
}

impl Evidence {
    /// Construct from raw, possibly-untrusted fields, parsing the timestamp
    /// and validating required fields in the same pass.
    pub fn try_new(
        id: impl Into<String>,
        source: impl Into<String>,
        kind: EvidenceKind,
        author: impl Into<String>,
        timestamp_raw: &str,
        title: impl Into<String>,
        body: impl Into<String>,
        url: Option<String>,
    ) -> Result<Self> {
        let id = id.into();
        let source = source.into();
        let author = author.into();
        let title = title.into();
        if id.trim().is_empty() {
            return Err(CorrError::Evidence(EvidenceError::MissingField("id")));
        }
        if source.trim().is_empty() {
            return Err(CorrError::Evidence(EvidenceError::MissingField("source")));
        }
        let timestamp = canonicalize_timestamp(timestamp_raw)?;
        let evidence = Evidence {
            id: EvidenceId(id),
            source: SourceTag(source),
            kind,
            author,
            timestamp,
            title,
            body: body.into(),
            url,
            attributes: HashMap::new(),
        };
        evidence.validate()?;
        Ok(evidence)
    }

    /// Required-field validation. Timestamp parseability is checked at
    /// construction time via [`canonicalize_timestamp`]; this only re-checks
    /// invariants that can be violated after construction (e.g. by mutating
    /// a field directly).
    pub fn validate(&self) -> Result<()> {
        if self.id.0.trim().is_empty() {
            return Err(CorrError::Evidence(EvidenceError::MissingField("id")));
        }
        if self.source.0.trim().is_empty() {
            return Err(CorrError::Evidence(EvidenceError::MissingField("source")));
        }
        Ok(())
    }

    /// Truncate `body` to at most `limit` chars, respecting char boundaries.
    pub fn truncate_body_to(&mut self, limit: usize) {
        if self.body.chars().count() > limit {
            self.body = self.body.chars().take(limit).collect();
        }
    }

    /// 64-bit stable hash over `(source, kind, id)`, used as a cache and
    /// dedup key. Independent of process/run — only the identity triple
    /// feeds the hasher.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.source.0.hash(&mut hasher);
        self.kind.as_str().hash(&mut hasher);
        self.id.0.hash(&mut hasher);
        hasher.finish()
    }
}

/// Parse a raw timestamp string to UTC, accepting RFC3339 with any offset.
pub fn canonicalize_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| CorrError::Evidence(EvidenceError::UnparseableTimestamp(raw.to_string())))
}

//! Core data models for the RLM engine.
//!
//! These types represent the emails and corpora that flow through the
//! analysis pipeline. The data lifecycle is:
//!
//! ```text
//! Mail Source → EmailRecord → Corpus → primitives / workflows → results
//!                                  ↓
//!                             executor (user program)
//! ```
//!
//! # Type Relationships
//!
//! - An **[`EmailRecord`]** is a normalized message produced by a mail
//!   source. Records are immutable after corpus load.
//! - A **[`Corpus`]** is an ordered sequence of records plus
//!   [`CorpusMetadata`] describing how it was fetched. Record ids are
//!   unique within a corpus.
//! - A **[`FormatLevel`]** states how much detail the source returned
//!   (`minimal` / `metadata` / `full`).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Normalized email record consumed from a mail source.
///
/// # Fields
///
/// | Field | Description |
/// |-------|-------------|
/// | `id` | Opaque message id, unique within a corpus |
/// | `thread_id` | Conversation id; may equal `id` for single-message threads |
/// | `subject` | Subject line |
/// | `from` / `to` | Raw address fields, typically `Name <addr@host>` |
/// | `date` | Original textual timestamp, best-effort parsable |
/// | `snippet` | Short preview text |
/// | `body` | Full body (empty unless the source fetched `full` format) |
/// | `headers` | Optional header map; lookups are case-insensitive |
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmailRecord {
    pub id: String,
    #[serde(default)]
    pub thread_id: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub snippet: String,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
}

impl EmailRecord {
    /// Case-insensitive header lookup. Returns `None` when the record has
    /// no headers or the name is absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        let headers = self.headers.as_ref()?;
        let wanted = name.to_ascii_lowercase();
        headers
            .iter()
            .find(|(k, _)| k.to_ascii_lowercase() == wanted)
            .map(|(_, v)| v.as_str())
    }

    /// Subject, snippet, and body joined for text scanning.
    pub fn combined_text(&self) -> String {
        format!("{} {} {}", self.subject, self.snippet, self.body)
    }
}

/// Level of detail a mail source returned for each record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatLevel {
    /// Ids and thread ids only.
    Minimal,
    /// Ids plus subject/from/to/date/snippet.
    Metadata,
    /// Everything, including body and headers.
    Full,
}

impl FormatLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            FormatLevel::Minimal => "minimal",
            FormatLevel::Metadata => "metadata",
            FormatLevel::Full => "full",
        }
    }
}

impl std::str::FromStr for FormatLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "minimal" => Ok(FormatLevel::Minimal),
            "metadata" => Ok(FormatLevel::Metadata),
            "full" => Ok(FormatLevel::Full),
            other => Err(format!(
                "unknown format level '{}' (expected minimal, metadata, or full)",
                other
            )),
        }
    }
}

impl std::fmt::Display for FormatLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata describing how a corpus was obtained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusMetadata {
    /// Source query string, or `"loaded_from_file"` for file loads.
    pub query: String,
    /// Total record count.
    pub count: usize,
    /// Detail level of the records.
    pub format: FormatLevel,
    /// Pages fetched during a live load (0 for file loads).
    #[serde(default)]
    pub pages_fetched: usize,
    /// Path of the corpus file, when loaded from disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
}

/// An ordered, immutable sequence of email records plus load metadata.
///
/// Invariant: record ids are unique. The loader deduplicates by id, so
/// consumers may rely on this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Corpus {
    pub records: Vec<EmailRecord>,
    pub metadata: CorpusMetadata,
}

impl Corpus {
    /// Build a corpus, deduplicating records by id while preserving order.
    pub fn new(records: Vec<EmailRecord>, mut metadata: CorpusMetadata) -> Self {
        let mut seen = std::collections::HashSet::new();
        let records: Vec<EmailRecord> = records
            .into_iter()
            .filter(|r| r.id.is_empty() || seen.insert(r.id.clone()))
            .collect();
        metadata.count = records.len();
        Corpus { records, metadata }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> EmailRecord {
        EmailRecord {
            id: id.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_corpus_dedupes_by_id() {
        let meta = CorpusMetadata {
            query: "q".into(),
            count: 0,
            format: FormatLevel::Metadata,
            pages_fetched: 1,
            source_file: None,
        };
        let corpus = Corpus::new(vec![record("a"), record("b"), record("a")], meta);
        assert_eq!(corpus.len(), 2);
        assert_eq!(corpus.metadata.count, 2);
    }

    #[test]
    fn test_header_lookup_case_insensitive() {
        let mut headers = BTreeMap::new();
        headers.insert("Authentication-Results".to_string(), "spf=pass".to_string());
        let rec = EmailRecord {
            id: "x".into(),
            headers: Some(headers),
            ..Default::default()
        };
        assert_eq!(rec.header("authentication-results"), Some("spf=pass"));
        assert_eq!(rec.header("AUTHENTICATION-RESULTS"), Some("spf=pass"));
        assert_eq!(rec.header("x-missing"), None);
    }

    #[test]
    fn test_format_level_parse() {
        assert_eq!(
            "metadata".parse::<FormatLevel>().unwrap(),
            FormatLevel::Metadata
        );
        assert!("bogus".parse::<FormatLevel>().is_err());
    }
}

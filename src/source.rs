//! Mail source contract and corpus loading.
//!
//! The mail source is an external collaborator — an API client, a saved
//! file, or a scraper — specified only by the paged-fetch contract in
//! [`MailSource`]. The engine never persists or mutates mail; it loads a
//! corpus once per program execution.
//!
//! Two load paths ship here:
//!
//! - [`load_corpus_file`] reads a previously saved corpus file.
//! - [`CommandSource`] shells out to an external fetcher program (named
//!   by the `RLM_MAIL_SOURCE` environment variable) that implements the
//!   page contract on stdout, one JSON [`MailPage`] per call.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RlmError;
use crate::models::{Corpus, CorpusMetadata, EmailRecord, FormatLevel};

/// Maximum records requested per page.
const PAGE_SIZE: usize = 100;

/// One page of records plus an optional continuation token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailPage {
    pub records: Vec<EmailRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

/// Paged mail retrieval contract.
#[async_trait]
pub trait MailSource: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch one page of records matching `query`. A `None` continuation
    /// token in the returned page ends pagination.
    async fn fetch_page(
        &self,
        query: &str,
        page_size: usize,
        page_token: Option<&str>,
        format: FormatLevel,
    ) -> Result<MailPage, RlmError>;
}

/// Drive a [`MailSource`] until `max_results` records are collected or the
/// source reports no continuation.
pub async fn load_corpus(
    source: &dyn MailSource,
    query: &str,
    max_results: usize,
    format: FormatLevel,
) -> Result<Corpus, RlmError> {
    let mut records: Vec<EmailRecord> = Vec::new();
    let mut page_token: Option<String> = None;
    let mut pages_fetched = 0usize;

    while records.len() < max_results {
        let remaining = max_results - records.len();
        let page_size = remaining.min(PAGE_SIZE);
        pages_fetched += 1;
        eprintln!("[rlm] fetching page {} from {}...", pages_fetched, source.name());

        let page = source
            .fetch_page(query, page_size, page_token.as_deref(), format)
            .await?;

        if page.records.is_empty() {
            break;
        }
        records.extend(page.records);

        match page.next_page_token {
            Some(token) => page_token = Some(token),
            None => break,
        }
    }

    records.truncate(max_results);
    eprintln!("[rlm] loaded {} emails into the corpus", records.len());

    Ok(Corpus::new(
        records,
        CorpusMetadata {
            query: query.to_string(),
            count: 0,
            format,
            pages_fetched,
            source_file: None,
        },
    ))
}

// ═══════════════════════════════════════════════════════════════════════
// Saved corpus files
// ═══════════════════════════════════════════════════════════════════════

/// Saved-file shape produced by bulk exports: a `messages` list with
/// optional query/format annotations.
#[derive(Debug, Deserialize)]
struct SavedMessages {
    messages: Vec<EmailRecord>,
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    format: Option<FormatLevel>,
}

/// Load a corpus from a saved JSON file. Three shapes are accepted: a
/// serialized [`Corpus`], a `{"messages": […]}` export, or a bare array
/// of records.
pub fn load_corpus_file(path: &Path) -> Result<Corpus, RlmError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| RlmError::MailSource(format!("cannot read {}: {}", path.display(), e)))?;

    if let Ok(mut corpus) = serde_json::from_str::<Corpus>(&raw) {
        corpus.metadata.source_file = Some(path.display().to_string());
        let meta = corpus.metadata.clone();
        return Ok(Corpus::new(corpus.records, meta));
    }

    if let Ok(saved) = serde_json::from_str::<SavedMessages>(&raw) {
        return Ok(Corpus::new(
            saved.messages,
            CorpusMetadata {
                query: saved.query.unwrap_or_else(|| "loaded_from_file".to_string()),
                count: 0,
                format: saved.format.unwrap_or(FormatLevel::Metadata),
                pages_fetched: 0,
                source_file: Some(path.display().to_string()),
            },
        ));
    }

    if let Ok(records) = serde_json::from_str::<Vec<EmailRecord>>(&raw) {
        return Ok(Corpus::new(
            records,
            CorpusMetadata {
                query: "loaded_from_file".to_string(),
                count: 0,
                format: FormatLevel::Metadata,
                pages_fetched: 0,
                source_file: Some(path.display().to_string()),
            },
        ));
    }

    Err(RlmError::MailSource(format!(
        "{} is not a recognized corpus file",
        path.display()
    )))
}

// ═══════════════════════════════════════════════════════════════════════
// External fetcher command
// ═══════════════════════════════════════════════════════════════════════

/// Environment variable naming the external mail fetcher command.
pub const MAIL_SOURCE_ENV: &str = "RLM_MAIL_SOURCE";

/// Mail source that shells out to an external fetcher.
///
/// The fetcher is invoked as:
///
/// ```text
/// <command> --query <q> --page-size <n> --format <level> [--page-token <t>]
/// ```
///
/// and must print one JSON [`MailPage`] to stdout.
pub struct CommandSource {
    command: PathBuf,
    args: Vec<String>,
}

impl CommandSource {
    /// Build from the `RLM_MAIL_SOURCE` environment variable. Absence is
    /// a configuration error: a live `--query` needs a fetcher.
    pub fn from_env() -> Result<Self, RlmError> {
        let raw = std::env::var(MAIL_SOURCE_ENV).map_err(|_| {
            RlmError::Configuration(format!(
                "--query requires the {} environment variable to name a mail fetcher command",
                MAIL_SOURCE_ENV
            ))
        })?;
        let mut parts = raw.split_whitespace().map(str::to_string);
        let command = parts
            .next()
            .map(PathBuf::from)
            .ok_or_else(|| RlmError::Configuration(format!("{} is empty", MAIL_SOURCE_ENV)))?;
        Ok(CommandSource {
            command,
            args: parts.collect(),
        })
    }
}

#[async_trait]
impl MailSource for CommandSource {
    fn name(&self) -> &str {
        "command"
    }

    async fn fetch_page(
        &self,
        query: &str,
        page_size: usize,
        page_token: Option<&str>,
        format: FormatLevel,
    ) -> Result<MailPage, RlmError> {
        let mut cmd = tokio::process::Command::new(&self.command);
        cmd.args(&self.args)
            .arg("--query")
            .arg(query)
            .arg("--page-size")
            .arg(page_size.to_string())
            .arg("--format")
            .arg(format.as_str());
        if let Some(token) = page_token {
            cmd.arg("--page-token").arg(token);
        }

        let output = cmd
            .output()
            .await
            .map_err(|e| RlmError::MailSource(format!("fetcher failed to start: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RlmError::MailSource(format!(
                "fetcher exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| RlmError::MailSource(format!("fetcher produced invalid page: {}", e)))
    }
}

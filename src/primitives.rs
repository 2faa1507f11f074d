//! Pure corpus primitives: chunking, grouping, filtering, and context
//! building.
//!
//! Every function here is a deterministic function of its inputs, allocates
//! new collections, and is safe to call from any concurrency context. The
//! concatenation of any `chunk_by_*` output in natural order is a
//! permutation of the input.
//!
//! Grouping functions return `BTreeMap` so iteration order (and therefore
//! serialized output and downstream model-call order) is deterministic.
//!
//! Date handling is lenient: a fixed list of formats is tried and records
//! whose dates parse with none of them are grouped under `"unknown"`. This
//! is lossy for time-based analysis and intentional.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::EmailRecord;

/// `Name <addr@host>` address extraction.
static ANGLE_ADDR: Lazy<Regex> = Lazy::new(|| Regex::new(r"<([^>]+)>").unwrap());

/// Grouping period for [`chunk_by_date`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatePeriod {
    Day,
    Week,
    Month,
}

impl std::str::FromStr for DatePeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "day" => Ok(DatePeriod::Day),
            "week" => Ok(DatePeriod::Week),
            "month" => Ok(DatePeriod::Month),
            other => Err(format!("unknown period '{}' (day, week, or month)", other)),
        }
    }
}

/// Sort key for [`sort_emails`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Date,
    From,
    Subject,
}

/// Parse an email date with the fixed lenient format list.
///
/// Tried in order: RFC 2822 (with or without weekday), `%Y-%m-%d %H:%M:%S`,
/// `%Y-%m-%dT%H:%M:%S`, `%Y-%m-%d`. Returns `None` when nothing matches.
pub fn parse_email_date(date: &str) -> Option<NaiveDateTime> {
    let trimmed = date.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(trimmed) {
        return Some(dt.naive_local());
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Lowercased sender address, extracted from `Name <addr@host>` when angle
/// brackets are present, otherwise the whole field trimmed.
pub fn sender_address(from: &str) -> String {
    match ANGLE_ADDR.captures(from) {
        Some(caps) => caps[1].to_lowercase(),
        None => from.trim().to_lowercase(),
    }
}

/// Domain part of the sender address, or `"unknown"` when there is none.
pub fn sender_domain(from: &str) -> String {
    let addr = sender_address(from);
    match addr.split_once('@') {
        Some((_, domain)) => domain.to_string(),
        None => "unknown".to_string(),
    }
}

/// Split records into contiguous chunks of at most `chunk_size`, preserving
/// order.
pub fn chunk_by_size(records: &[EmailRecord], chunk_size: usize) -> Vec<Vec<EmailRecord>> {
    if chunk_size == 0 {
        return vec![records.to_vec()];
    }
    records.chunks(chunk_size).map(|c| c.to_vec()).collect()
}

/// Group records by sender address.
pub fn chunk_by_sender(records: &[EmailRecord]) -> BTreeMap<String, Vec<EmailRecord>> {
    let mut groups: BTreeMap<String, Vec<EmailRecord>> = BTreeMap::new();
    for rec in records {
        let key = if rec.from.is_empty() {
            "(unknown)".to_string()
        } else {
            sender_address(&rec.from)
        };
        groups.entry(key).or_default().push(rec.clone());
    }
    groups
}

/// Group records by sender domain.
pub fn chunk_by_sender_domain(records: &[EmailRecord]) -> BTreeMap<String, Vec<EmailRecord>> {
    let mut groups: BTreeMap<String, Vec<EmailRecord>> = BTreeMap::new();
    for rec in records {
        groups
            .entry(sender_domain(&rec.from))
            .or_default()
            .push(rec.clone());
    }
    groups
}

/// Group records by thread id, falling back to the record id.
pub fn chunk_by_thread(records: &[EmailRecord]) -> BTreeMap<String, Vec<EmailRecord>> {
    let mut groups: BTreeMap<String, Vec<EmailRecord>> = BTreeMap::new();
    for rec in records {
        let key = if !rec.thread_id.is_empty() {
            rec.thread_id.clone()
        } else if !rec.id.is_empty() {
            rec.id.clone()
        } else {
            "unknown".to_string()
        };
        groups.entry(key).or_default().push(rec.clone());
    }
    groups
}

/// Group records by date period. Unparsable dates group under `"unknown"`.
///
/// Keys: day `%Y-%m-%d`, week `%Y-W%W`, month `%Y-%m`.
pub fn chunk_by_date(
    records: &[EmailRecord],
    period: DatePeriod,
) -> BTreeMap<String, Vec<EmailRecord>> {
    let mut groups: BTreeMap<String, Vec<EmailRecord>> = BTreeMap::new();
    for rec in records {
        let key = match parse_email_date(&rec.date) {
            Some(dt) => match period {
                DatePeriod::Day => dt.format("%Y-%m-%d").to_string(),
                DatePeriod::Week => dt.format("%Y-W%W").to_string(),
                DatePeriod::Month => dt.format("%Y-%m").to_string(),
            },
            None => "unknown".to_string(),
        };
        groups.entry(key).or_default().push(rec.clone());
    }
    groups
}

/// Keep records for which `predicate` returns true.
pub fn filter_emails<F>(records: &[EmailRecord], predicate: F) -> Vec<EmailRecord>
where
    F: Fn(&EmailRecord) -> bool,
{
    records.iter().filter(|r| predicate(r)).cloned().collect()
}

/// Keep records containing `keyword` (case-insensitive) in subject,
/// snippet, or body.
pub fn filter_by_keyword(records: &[EmailRecord], keyword: &str) -> Vec<EmailRecord> {
    let needle = keyword.to_lowercase();
    filter_emails(records, |r| {
        r.subject.to_lowercase().contains(&needle)
            || r.snippet.to_lowercase().contains(&needle)
            || r.body.to_lowercase().contains(&needle)
    })
}

/// Keep records whose `from` field contains `pattern` (case-insensitive).
pub fn filter_by_sender(records: &[EmailRecord], pattern: &str) -> Vec<EmailRecord> {
    let needle = pattern.to_lowercase();
    filter_emails(records, |r| r.from.to_lowercase().contains(&needle))
}

/// Sort records by a field. Dates sort by parsed timestamp with
/// unparsable dates last; text fields sort case-insensitively.
pub fn sort_emails(records: &[EmailRecord], by: SortKey, reverse: bool) -> Vec<EmailRecord> {
    let mut sorted = records.to_vec();
    match by {
        SortKey::Date => {
            sorted.sort_by_key(|r| parse_email_date(&r.date));
            // None sorts first under Ord; move unparsable dates to the end.
            let split = sorted
                .iter()
                .position(|r| parse_email_date(&r.date).is_some())
                .unwrap_or(sorted.len());
            sorted.rotate_left(split);
        }
        SortKey::From => sorted.sort_by_key(|r| r.from.to_lowercase()),
        SortKey::Subject => sorted.sort_by_key(|r| r.subject.to_lowercase()),
    }
    if reverse {
        sorted.reverse();
    }
    sorted
}

/// Remove duplicate records by id, keeping first occurrences. Records with
/// empty ids are kept unconditionally.
pub fn dedupe_emails(records: &[EmailRecord]) -> Vec<EmailRecord> {
    let mut seen = std::collections::HashSet::new();
    records
        .iter()
        .filter(|r| r.id.is_empty() || seen.insert(r.id.clone()))
        .cloned()
        .collect()
}

/// Top `n` senders by message count, descending.
pub fn top_senders(records: &[EmailRecord], n: usize) -> Vec<(String, usize)> {
    let mut counts: Vec<(String, usize)> = chunk_by_sender(records)
        .into_iter()
        .map(|(sender, msgs)| (sender, msgs.len()))
        .collect();
    counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    counts.truncate(n);
    counts
}

/// One-record text summary used as model context.
pub fn email_summary(record: &EmailRecord) -> String {
    let mut parts = Vec::new();
    if !record.from.is_empty() {
        parts.push(format!("From: {}", record.from));
    }
    if !record.subject.is_empty() {
        parts.push(format!("Subject: {}", record.subject));
    }
    if !record.date.is_empty() {
        parts.push(format!("Date: {}", record.date));
    }
    if !record.snippet.is_empty() {
        parts.push(format!("Preview: {}", record.snippet));
    }
    parts.join("\n")
}

/// Combined numbered summary of many records, truncated at `max_chars`
/// with a trailing `... and N more emails` marker.
pub fn batch_summaries(records: &[EmailRecord], max_chars: usize) -> String {
    let mut summaries = Vec::new();
    let mut total = 0usize;
    for (i, rec) in records.iter().enumerate() {
        let summary = format!("[{}] {}", i + 1, email_summary(rec));
        let len = summary.len() + 2;
        if total + len > max_chars {
            summaries.push(format!("... and {} more emails", records.len() - i));
            break;
        }
        total += len;
        summaries.push(summary);
    }
    summaries.join("\n\n")
}

/// Join non-empty sub-query results with a separator.
pub fn aggregate_results(results: &[String], separator: &str) -> String {
    results
        .iter()
        .map(|r| r.trim())
        .filter(|r| !r.is_empty())
        .collect::<Vec<_>>()
        .join(separator)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn email(id: &str, from: &str, date: &str, subject: &str) -> EmailRecord {
        EmailRecord {
            id: id.to_string(),
            from: from.to_string(),
            date: date.to_string(),
            subject: subject.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_chunk_by_size_preserves_order() {
        let records: Vec<EmailRecord> = (0..7)
            .map(|i| email(&format!("m{}", i), "a@x.com", "", ""))
            .collect();
        let chunks = chunk_by_size(&records, 3);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 3);
        assert_eq!(chunks[2].len(), 1);
        let flattened: Vec<String> = chunks.into_iter().flatten().map(|r| r.id).collect();
        let original: Vec<String> = records.into_iter().map(|r| r.id).collect();
        assert_eq!(flattened, original);
    }

    #[test]
    fn test_chunk_grouping_is_permutation() {
        let records = vec![
            email("1", "Alice <alice@corp.com>", "", ""),
            email("2", "bob@other.org", "", ""),
            email("3", "Alice <alice@corp.com>", "", ""),
        ];
        let groups = chunk_by_sender(&records);
        let mut ids: Vec<String> = groups
            .values()
            .flatten()
            .map(|r| r.id.clone())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert_eq!(groups["alice@corp.com"].len(), 2);
    }

    #[test]
    fn test_sender_domain() {
        assert_eq!(sender_domain("Alice <alice@corp.com>"), "corp.com");
        assert_eq!(sender_domain("no-address-here"), "unknown");
    }

    #[test]
    fn test_parse_date_formats() {
        assert!(parse_email_date("Wed, 15 Jan 2026 10:30:00 -0800").is_some());
        assert!(parse_email_date("15 Jan 2026 10:30:00 -0800").is_some());
        assert!(parse_email_date("2026-01-15 10:30:00").is_some());
        assert!(parse_email_date("2026-01-15T10:30:00").is_some());
        assert!(parse_email_date("2026-01-15").is_some());
        assert!(parse_email_date("next tuesday").is_none());
        assert!(parse_email_date("").is_none());
    }

    #[test]
    fn test_chunk_by_date_unknown_bucket() {
        let records = vec![
            email("1", "a@x.com", "2026-01-15", ""),
            email("2", "a@x.com", "not a date", ""),
        ];
        let groups = chunk_by_date(&records, DatePeriod::Day);
        assert_eq!(groups["2026-01-15"].len(), 1);
        assert_eq!(groups["unknown"].len(), 1);
    }

    #[test]
    fn test_chunk_by_date_week_and_month_keys() {
        let records = vec![email("1", "a@x.com", "2026-01-15 10:30:00", "")];
        let weeks = chunk_by_date(&records, DatePeriod::Week);
        assert!(weeks.keys().next().unwrap().starts_with("2026-W"));
        let months = chunk_by_date(&records, DatePeriod::Month);
        assert!(months.contains_key("2026-01"));
    }

    #[test]
    fn test_filter_by_keyword_searches_all_fields() {
        let mut rec = email("1", "a@x.com", "", "Routine update");
        rec.body = "please review the URGENT deadline".to_string();
        let records = vec![rec, email("2", "b@x.com", "", "nothing")];
        assert_eq!(filter_by_keyword(&records, "urgent").len(), 1);
    }

    #[test]
    fn test_sort_by_date_unparsable_last() {
        let records = vec![
            email("new", "a@x.com", "2026-02-01", ""),
            email("bad", "a@x.com", "???", ""),
            email("old", "a@x.com", "2026-01-01", ""),
        ];
        let asc = sort_emails(&records, SortKey::Date, false);
        assert_eq!(asc[0].id, "old");
        assert_eq!(asc[1].id, "new");
        assert_eq!(asc[2].id, "bad");
        let desc = sort_emails(&records, SortKey::Date, true);
        assert_eq!(desc[0].id, "bad");
        assert_eq!(desc[1].id, "new");
    }

    #[test]
    fn test_top_senders() {
        let records = vec![
            email("1", "boss@corp.com", "", ""),
            email("2", "boss@corp.com", "", ""),
            email("3", "news@list.com", "", ""),
        ];
        let top = top_senders(&records, 2);
        assert_eq!(top[0], ("boss@corp.com".to_string(), 2));
        assert_eq!(top[1], ("news@list.com".to_string(), 1));
    }

    #[test]
    fn test_batch_summaries_truncates() {
        let records: Vec<EmailRecord> = (0..50)
            .map(|i| email(&format!("m{}", i), "sender@x.com", "2026-01-01", "A subject line"))
            .collect();
        let text = batch_summaries(&records, 300);
        assert!(text.contains("more emails"));
        assert!(text.len() < 400);
    }

    #[test]
    fn test_aggregate_results_skips_empty() {
        let results = vec!["a".to_string(), "  ".to_string(), "b".to_string()];
        assert_eq!(aggregate_results(&results, " | "), "a | b");
    }
}

//! Security alert primitives: severity normalization, IOC extraction,
//! authentication checks, MITRE pattern matching, time-window correlation,
//! and rule-based phishing heuristics.
//!
//! Everything here is pure and deterministic; the model-using security
//! pipelines live in [`crate::security_workflows`].

use std::collections::{BTreeMap, BTreeSet};

use chrono::{Duration, Timelike};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::models::EmailRecord;
use crate::primitives::{parse_email_date, sender_address};

// ═══════════════════════════════════════════════════════════════════════
// Severity
// ═══════════════════════════════════════════════════════════════════════

/// Normalized alert priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    P1,
    P2,
    P3,
    P4,
    P5,
}

impl Severity {
    pub const ALL: [Severity; 5] = [
        Severity::P1,
        Severity::P2,
        Severity::P3,
        Severity::P4,
        Severity::P5,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::P1 => "P1",
            Severity::P2 => "P2",
            Severity::P3 => "P3",
            Severity::P4 => "P4",
            Severity::P5 => "P5",
        }
    }

    /// 1 (critical) through 5 (informational), for sort keys.
    pub fn rank(&self) -> u8 {
        match self {
            Severity::P1 => 1,
            Severity::P2 => 2,
            Severity::P3 => 3,
            Severity::P4 => 4,
            Severity::P5 => 5,
        }
    }

    pub fn parse(s: &str) -> Option<Severity> {
        match s.to_ascii_uppercase().as_str() {
            "P1" => Some(Severity::P1),
            "P2" => Some(Severity::P2),
            "P3" => Some(Severity::P3),
            "P4" => Some(Severity::P4),
            "P5" => Some(Severity::P5),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity header fields emitted by known security tools. Closed table;
/// the pairs keep the tool names visible for maintenance.
const SEVERITY_HEADER_FIELDS: [(&str, &str); 8] = [
    ("crowdstrike", "severity"),
    ("splunk", "urgency"),
    ("azure_sentinel", "alertSeverity"),
    ("palo_alto", "threat_severity"),
    ("elastic", "event.severity"),
    ("microsoft_defender", "severity"),
    ("cisco_secure", "priority"),
    ("fortinet", "level"),
];

/// Normalize a raw severity field value to a priority.
fn normalize_severity_value(value: &str) -> Option<Severity> {
    match value.trim().to_lowercase().as_str() {
        "critical" | "very high" | "5" => Some(Severity::P1),
        "high" | "4" => Some(Severity::P2),
        "medium" | "moderate" | "3" => Some(Severity::P3),
        "low" | "2" => Some(Severity::P4),
        "info" | "informational" | "1" | "0" => Some(Severity::P5),
        _ => None,
    }
}

/// Extract a normalized severity from an alert record.
///
/// Known tool header fields are consulted first, then keyword patterns over
/// subject + snippet + body. Returns P3 when nothing matches; P3 therefore
/// doubles as "undetermined" (see [`crate::security_workflows::classify_alerts`],
/// which disambiguates before falling back to the model).
pub fn extract_severity(alert: &EmailRecord) -> Severity {
    for (_, field) in SEVERITY_HEADER_FIELDS {
        if let Some(value) = alert.header(field) {
            if let Some(sev) = normalize_severity_value(value) {
                return sev;
            }
        }
    }

    let text = alert.combined_text().to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| text.contains(w));

    if has(&["critical", "p1", "sev-1", "emergency"]) {
        Severity::P1
    } else if has(&["high", "p2", "sev-2", "urgent"]) {
        Severity::P2
    } else if has(&["medium", "p3", "sev-3"]) {
        Severity::P3
    } else if has(&["low", "p4", "sev-4"]) {
        Severity::P4
    } else if has(&["info", "p5", "sev-5", "informational"]) {
        Severity::P5
    } else {
        Severity::P3
    }
}

/// True when the record carries an explicit medium/P3 signal, as opposed to
/// P3 being the undetermined default.
pub fn has_explicit_p3_signal(alert: &EmailRecord) -> bool {
    let text = format!("{} {}", alert.subject, alert.snippet).to_lowercase();
    text.contains("p3") || text.contains("medium")
}

// ═══════════════════════════════════════════════════════════════════════
// IOC extraction
// ═══════════════════════════════════════════════════════════════════════

static IP_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").unwrap());
static DOMAIN_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:[a-zA-Z0-9-]+\.)+[a-zA-Z]{2,}\b").unwrap());
static MD5_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[a-fA-F0-9]{32}\b").unwrap());
static SHA1_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[a-fA-F0-9]{40}\b").unwrap());
static SHA256_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[a-fA-F0-9]{64}\b").unwrap());
static EMAIL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").unwrap());
static URL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?://[^\s<>"{}|\\^`\[\]]+"#).unwrap());

/// File hashes grouped by digest length.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileHashes {
    pub md5: Vec<String>,
    pub sha1: Vec<String>,
    pub sha256: Vec<String>,
}

/// Indicators of compromise extracted from a set of alerts. All lists are
/// sorted and deduplicated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IocSet {
    pub ips: Vec<String>,
    pub domains: Vec<String>,
    pub file_hashes: FileHashes,
    pub email_addresses: Vec<String>,
    pub urls: Vec<String>,
}

impl IocSet {
    pub fn is_empty(&self) -> bool {
        self.ips.is_empty()
            && self.domains.is_empty()
            && self.file_hashes.md5.is_empty()
            && self.file_hashes.sha1.is_empty()
            && self.file_hashes.sha256.is_empty()
            && self.email_addresses.is_empty()
            && self.urls.is_empty()
    }

    /// Flatten to `(ioc_type, value)` pairs for threat-store recording.
    pub fn flatten(&self) -> Vec<(&'static str, &str)> {
        let mut out = Vec::new();
        out.extend(self.ips.iter().map(|v| ("ip", v.as_str())));
        out.extend(self.domains.iter().map(|v| ("domain", v.as_str())));
        out.extend(self.file_hashes.md5.iter().map(|v| ("hash", v.as_str())));
        out.extend(self.file_hashes.sha1.iter().map(|v| ("hash", v.as_str())));
        out.extend(self.file_hashes.sha256.iter().map(|v| ("hash", v.as_str())));
        out.extend(self.email_addresses.iter().map(|v| ("email", v.as_str())));
        out.extend(self.urls.iter().map(|v| ("url", v.as_str())));
        out
    }
}

/// True iff every octet of a dotted quad lies in 0–255.
fn valid_ipv4(ip: &str) -> bool {
    ip.split('.')
        .filter_map(|octet| octet.parse::<u32>().ok())
        .filter(|n| *n <= 255)
        .count()
        == 4
}

/// Extract IOCs (IPs, domains, file hashes, email addresses, URLs) from
/// the subject, snippet, and body of every record.
///
/// IPv4 candidates with out-of-range octets are rejected; domains ending
/// in common image/document suffixes are treated as false positives.
pub fn extract_iocs(records: &[EmailRecord]) -> IocSet {
    let mut ips = BTreeSet::new();
    let mut domains = BTreeSet::new();
    let mut md5 = BTreeSet::new();
    let mut sha1 = BTreeSet::new();
    let mut sha256 = BTreeSet::new();
    let mut emails = BTreeSet::new();
    let mut urls = BTreeSet::new();

    for rec in records {
        let text = rec.combined_text();

        for m in IP_PATTERN.find_iter(&text) {
            if valid_ipv4(m.as_str()) {
                ips.insert(m.as_str().to_string());
            }
        }
        for m in DOMAIN_PATTERN.find_iter(&text) {
            let domain = m.as_str().to_lowercase();
            if !domain.ends_with(".jpg")
                && !domain.ends_with(".png")
                && !domain.ends_with(".gif")
                && !domain.ends_with(".pdf")
            {
                domains.insert(domain);
            }
        }
        for m in MD5_PATTERN.find_iter(&text) {
            md5.insert(m.as_str().to_string());
        }
        for m in SHA1_PATTERN.find_iter(&text) {
            sha1.insert(m.as_str().to_string());
        }
        for m in SHA256_PATTERN.find_iter(&text) {
            sha256.insert(m.as_str().to_string());
        }
        for m in EMAIL_PATTERN.find_iter(&text) {
            emails.insert(m.as_str().to_lowercase());
        }
        for m in URL_PATTERN.find_iter(&text) {
            urls.insert(m.as_str().to_string());
        }
    }

    // A SHA-1/SHA-256 digest also matches the shorter hash patterns when
    // scanned in isolation; the word-boundary anchors already prevent that,
    // so the three sets are disjoint by construction.
    IocSet {
        ips: ips.into_iter().collect(),
        domains: domains.into_iter().collect(),
        file_hashes: FileHashes {
            md5: md5.into_iter().collect(),
            sha1: sha1.into_iter().collect(),
            sha256: sha256.into_iter().collect(),
        },
        email_addresses: emails.into_iter().collect(),
        urls: urls.into_iter().collect(),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Email authentication
// ═══════════════════════════════════════════════════════════════════════

/// SPF/DKIM/DMARC outcome parsed from the authentication-results header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthStatus {
    pub spf: String,
    pub dkim: String,
    pub dmarc: String,
    /// True iff any mechanism reported `fail`.
    pub suspicious: bool,
}

fn auth_mechanism_result(header: &str, mechanism: &str) -> String {
    for outcome in ["pass", "fail", "neutral"] {
        if header.contains(&format!("{}={}", mechanism, outcome)) {
            return outcome.to_string();
        }
    }
    "none".to_string()
}

/// Parse SPF/DKIM/DMARC results by substring search over the
/// `Authentication-Results` header. Records without headers report `none`
/// for every mechanism.
pub fn validate_email_auth(record: &EmailRecord) -> AuthStatus {
    let header = record
        .header("authentication-results")
        .unwrap_or_default()
        .to_lowercase();

    let spf = auth_mechanism_result(&header, "spf");
    let dkim = auth_mechanism_result(&header, "dkim");
    let dmarc = auth_mechanism_result(&header, "dmarc");
    let suspicious = spf == "fail" || dkim == "fail" || dmarc == "fail";

    AuthStatus {
        spf,
        dkim,
        dmarc,
        suspicious,
    }
}

// ═══════════════════════════════════════════════════════════════════════
// MITRE ATT&CK mapping
// ═══════════════════════════════════════════════════════════════════════

/// Closed keyword table for common techniques.
pub const MITRE_PATTERNS: [(&str, &[&str]); 16] = [
    ("T1566", &["phishing", "malicious attachment", "credential harvesting"]),
    ("T1566.001", &["spearphishing attachment", "weaponized document"]),
    ("T1566.002", &["spearphishing link", "malicious url"]),
    ("T1059", &["command execution", "powershell", "cmd.exe", "bash"]),
    ("T1059.001", &["powershell", "ps1"]),
    ("T1059.003", &["windows command shell", "cmd.exe"]),
    ("T1071", &["application layer protocol", "http", "https", "dns"]),
    ("T1082", &["system information discovery", "reconnaissance"]),
    ("T1021", &["remote services", "rdp", "ssh", "smb"]),
    ("T1021.001", &["remote desktop", "rdp"]),
    ("T1078", &["valid accounts", "compromised credentials", "stolen password"]),
    ("T1110", &["brute force", "password spray", "credential stuffing"]),
    ("T1486", &["ransomware", "file encryption", "crypto locker"]),
    ("T1204", &["user execution", "malicious file", "macro"]),
    ("T1133", &["external remote services", "vpn", "external access"]),
    ("T1190", &["exploit public-facing application", "web exploit", "vulnerability"]),
];

static TECHNIQUE_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"T\d{4}(?:\.\d{3})?").unwrap());

/// Map an alert to MITRE technique ids via the closed keyword table.
/// Returned sorted. Callers that need better recall on sparse matches can
/// supplement with [`crate::security_workflows::map_to_mitre_with_model`].
pub fn map_to_mitre(alert: &EmailRecord) -> Vec<String> {
    let text = alert.combined_text().to_lowercase();
    let mut techniques = BTreeSet::new();
    for (id, patterns) in MITRE_PATTERNS {
        if patterns.iter().any(|p| text.contains(p)) {
            techniques.insert(id.to_string());
        }
    }
    techniques.into_iter().collect()
}

/// Extract technique ids (`Tnnnn[.nnn]`) from free-form model output.
pub fn parse_technique_ids(text: &str) -> Vec<String> {
    let mut out: Vec<String> = TECHNIQUE_ID
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect();
    out.sort();
    out.dedup();
    out
}

// ═══════════════════════════════════════════════════════════════════════
// Time-window correlation
// ═══════════════════════════════════════════════════════════════════════

/// Group records into fixed-size time windows for attack correlation.
///
/// Each record's parsed timestamp is floored to the nearest
/// `window_minutes` boundary; the window key is the ISO-8601 start time.
/// Unparsable dates group under `"unknown_time"`.
pub fn chunk_by_time(
    records: &[EmailRecord],
    window_minutes: u32,
) -> BTreeMap<String, Vec<EmailRecord>> {
    let window_minutes = window_minutes.max(1);
    let mut windows: BTreeMap<String, Vec<EmailRecord>> = BTreeMap::new();

    for rec in records {
        let key = match parse_email_date(&rec.date) {
            Some(dt) => {
                let floored = dt
                    .with_second(0)
                    .and_then(|d| d.with_nanosecond(0))
                    .unwrap_or(dt);
                let offset = floored.minute() % window_minutes;
                let start = floored - Duration::minutes(offset as i64);
                start.format("%Y-%m-%dT%H:%M:%S").to_string()
            }
            None => "unknown_time".to_string(),
        };
        windows.entry(key).or_default().push(rec.clone());
    }

    windows
}

// ═══════════════════════════════════════════════════════════════════════
// Alert deduplication
// ═══════════════════════════════════════════════════════════════════════

static DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").unwrap());

/// Word-level Jaccard similarity of two signatures.
pub fn jaccard_words(a: &str, b: &str) -> f64 {
    let wa: BTreeSet<&str> = a.split_whitespace().collect();
    let wb: BTreeSet<&str> = b.split_whitespace().collect();
    if wa.is_empty() || wb.is_empty() {
        return 0.0;
    }
    let intersection = wa.intersection(&wb).count();
    let union = wa.union(&wb).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

fn alert_signature(record: &EmailRecord) -> String {
    let subject_lower = record.subject.to_lowercase();
    let subject = DIGITS.replace_all(&subject_lower, "N");
    let snippet_lower = record.snippet.to_lowercase();
    let snippet = DIGITS.replace_all(&snippet_lower, "N");
    let prefix: String = snippet.chars().take(100).collect();
    format!("{}|{}", subject, prefix)
}

/// Collapse recurring alerts: a record is kept only when its normalized
/// `subject|snippet` signature (digits masked) stays below the similarity
/// threshold against every previously retained signature.
pub fn deduplicate_security_alerts(
    records: &[EmailRecord],
    similarity_threshold: f64,
) -> Vec<EmailRecord> {
    let mut unique = Vec::new();
    let mut signatures: Vec<String> = Vec::new();

    for rec in records {
        let sig = alert_signature(rec);
        let duplicate = signatures
            .iter()
            .any(|seen| jaccard_words(&sig, seen) >= similarity_threshold);
        if !duplicate {
            signatures.push(sig);
            unique.push(rec.clone());
        }
    }

    unique
}

// ═══════════════════════════════════════════════════════════════════════
// Suspicious senders
// ═══════════════════════════════════════════════════════════════════════

/// A sender flagged by the spoofing/squatting/auth heuristics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspiciousSender {
    pub sender: String,
    pub reason: String,
    pub confidence: f64,
    pub email_id: String,
    pub auth_failed: bool,
}

const IMPERSONATED_DOMAINS: [&str; 8] = [
    "google.com",
    "microsoft.com",
    "apple.com",
    "amazon.com",
    "facebook.com",
    "paypal.com",
    "netflix.com",
    "linkedin.com",
];

const CORPORATE_KEYWORDS: [&str; 6] = ["paypal", "apple", "microsoft", "google", "amazon", "bank"];

/// Character-bigram Jaccard similarity, used for typosquat detection.
pub fn domain_similarity(a: &str, b: &str) -> f64 {
    fn bigrams(s: &str) -> BTreeSet<String> {
        let chars: Vec<char> = s.chars().collect();
        chars.windows(2).map(|w| w.iter().collect()).collect()
    }
    let ba = bigrams(a);
    let bb = bigrams(b);
    if ba.is_empty() || bb.is_empty() {
        return 0.0;
    }
    let intersection = ba.intersection(&bb).count();
    let union = ba.union(&bb).count();
    intersection as f64 / union as f64
}

/// Flag lookalike domains, display-name spoofing, and authentication
/// failures. Rule-based only; no model calls.
pub fn detect_suspicious_senders(records: &[EmailRecord]) -> Vec<SuspiciousSender> {
    let mut suspicious = Vec::new();

    for rec in records {
        let sender = sender_address(&rec.from);
        let display_name = match rec.from.find('<') {
            Some(pos) => rec.from[..pos].trim().to_string(),
            None => String::new(),
        };

        let Some((_, domain)) = sender.split_once('@') else {
            continue;
        };

        for legit in IMPERSONATED_DOMAINS {
            if domain != legit && domain_similarity(domain, legit) > 0.7 {
                suspicious.push(SuspiciousSender {
                    sender: sender.clone(),
                    reason: format!("Possible domain squatting of {}", legit),
                    confidence: 0.9,
                    email_id: rec.id.clone(),
                    auth_failed: false,
                });
            }
        }

        if !display_name.is_empty() {
            let display_lower = display_name.to_lowercase();
            let display_hit = CORPORATE_KEYWORDS.iter().any(|k| display_lower.contains(k));
            let domain_hit = CORPORATE_KEYWORDS.iter().any(|k| domain.contains(k));
            if display_hit && !domain_hit {
                suspicious.push(SuspiciousSender {
                    sender: sender.clone(),
                    reason: "Display name spoofing (corporate name with unrelated domain)"
                        .to_string(),
                    confidence: 0.85,
                    email_id: rec.id.clone(),
                    auth_failed: false,
                });
            }
        }

        let auth = validate_email_auth(rec);
        if auth.suspicious {
            suspicious.push(SuspiciousSender {
                sender: sender.clone(),
                reason: format!(
                    "Email authentication failed (SPF: {}, DKIM: {})",
                    auth.spf, auth.dkim
                ),
                confidence: 0.75,
                email_id: rec.id.clone(),
                auth_failed: true,
            });
        }
    }

    suspicious
}

// ═══════════════════════════════════════════════════════════════════════
// Attachment & URL risk
// ═══════════════════════════════════════════════════════════════════════

/// Risk level assigned by the attachment and URL heuristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    fn escalate(self) -> RiskLevel {
        match self {
            RiskLevel::Low => RiskLevel::Medium,
            _ => RiskLevel::High,
        }
    }
}

/// An attachment mention judged risky from subject/snippet context alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskyAttachment {
    pub filename: String,
    pub mime_type: String,
    pub risk_level: RiskLevel,
    pub reason: String,
    pub email_id: String,
    pub email_subject: String,
}

const DANGEROUS_EXTENSIONS: [&str; 14] = [
    ".exe", ".bat", ".cmd", ".com", ".pif", ".scr", ".vbs", ".js", ".jar", ".ps1", ".msi", ".hta",
    ".wsf", ".dll",
];

const FINANCIAL_KEYWORDS: [&str; 5] = ["invoice", "payment", "receipt", "statement", "tax"];
const URGENT_KEYWORDS: [&str; 4] = ["urgent", "immediate", "action required", "suspended"];

/// Score attachment risk from textual clues. Metadata-only: nothing is
/// downloaded, so filenames are usually unavailable.
pub fn analyze_attachments(records: &[EmailRecord]) -> Vec<RiskyAttachment> {
    let mut risky = Vec::new();

    for rec in records {
        let combined = format!("{} {}", rec.subject, rec.snippet).to_lowercase();

        let mentions_attachment = ["attachment", "attached", "file", "document"]
            .iter()
            .any(|w| combined.contains(w));
        if !mentions_attachment {
            continue;
        }

        let mut risk = RiskLevel::Low;
        let mut reason = "Attachment mentioned".to_string();

        for ext in DANGEROUS_EXTENSIONS {
            if combined.contains(ext) {
                risk = RiskLevel::High;
                reason = format!("Executable file type detected: {}", ext);
                break;
            }
        }

        if risk == RiskLevel::Low && FINANCIAL_KEYWORDS.iter().any(|k| combined.contains(k)) {
            risk = RiskLevel::Medium;
            reason = "Attachment in financial context".to_string();
        }

        if risk != RiskLevel::High && URGENT_KEYWORDS.iter().any(|k| combined.contains(k)) {
            risk = risk.escalate();
            reason = format!("{} with urgency indicators", reason);
        }

        if risk != RiskLevel::Low {
            risky.push(RiskyAttachment {
                filename: "unknown (metadata limited)".to_string(),
                mime_type: "unknown".to_string(),
                risk_level: risk,
                reason,
                email_id: rec.id.clone(),
                email_subject: rec.subject.clone(),
            });
        }
    }

    risky
}

/// A URL flagged by the shortener/TLD/IP/subdomain heuristics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspiciousUrl {
    pub url: String,
    pub risk_level: RiskLevel,
    pub reason: String,
    pub email_id: String,
    pub email_subject: String,
}

const URL_SHORTENERS: [&str; 6] = ["bit.ly", "tinyurl.com", "goo.gl", "t.co", "ow.ly", "is.gd"];
const SUSPICIOUS_TLDS: [&str; 7] = [".xyz", ".top", ".tk", ".ml", ".ga", ".cf", ".gq"];

static URL_HOST: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://([^/]+)").unwrap());
static IP_HOST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}$").unwrap());

/// Extract URLs and flag the suspicious ones: shorteners, risky TLDs,
/// raw-IP hosts, and excessive subdomain depth.
pub fn analyze_urls(records: &[EmailRecord]) -> Vec<SuspiciousUrl> {
    let mut flagged = Vec::new();

    for rec in records {
        let text = rec.combined_text();
        for m in URL_PATTERN.find_iter(&text) {
            let url = m.as_str();
            let Some(host) = URL_HOST
                .captures(url)
                .map(|c| c[1].to_lowercase())
            else {
                continue;
            };

            let mut risk = RiskLevel::Low;
            let mut reasons = Vec::new();

            if URL_SHORTENERS.iter().any(|s| host.contains(s)) {
                risk = RiskLevel::Medium;
                reasons.push("URL shortener detected");
            }
            if SUSPICIOUS_TLDS.iter().any(|t| host.ends_with(t)) {
                risk = risk.escalate();
                reasons.push("Suspicious TLD");
            }
            if IP_HOST.is_match(&host) {
                risk = risk.escalate();
                reasons.push("IP address used instead of domain");
            }
            if host.matches('.').count() > 3 {
                risk = risk.escalate();
                reasons.push("Excessive subdomains");
            }

            if risk != RiskLevel::Low {
                flagged.push(SuspiciousUrl {
                    url: url.to_string(),
                    risk_level: risk,
                    reason: reasons.join("; "),
                    email_id: rec.id.clone(),
                    email_subject: rec.subject.clone(),
                });
            }
        }
    }

    flagged
}

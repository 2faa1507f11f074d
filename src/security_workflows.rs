//! Security alert triage workflows.
//!
//! The model-using half of the security stack, composed from the pure
//! primitives in [`crate::security`]. [`SecurityWorkflows`] carries the
//! injected handles: the invoker, the long-lived security pattern cache,
//! and the persistent threat store. Both handles are optional; every
//! pipeline works without them, just without memoization or history.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::cache::SecurityPatternCache;
use crate::error::RlmError;
use crate::invoker::{is_sentinel, Invoker};
use crate::models::EmailRecord;
use crate::primitives::{parse_email_date, sender_address};
use crate::security::{
    analyze_attachments, analyze_urls, chunk_by_time, deduplicate_security_alerts,
    detect_suspicious_senders, extract_iocs, extract_severity, has_explicit_p3_signal,
    map_to_mitre, parse_technique_ids, IocSet, RiskyAttachment, Severity, SuspiciousSender,
    SuspiciousUrl,
};
use crate::structured::parse_confidence;
use crate::threat_store::{AttackPattern, ThreatPatternStore};

static CHAIN_DETECTED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)CHAIN_DETECTED:\s*(\w+)").unwrap());
static CHAIN_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)PATTERN:\s*(.+)").unwrap());
static CHAIN_SEVERITY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)SEVERITY:\s*(P[1-5])").unwrap());
static CHAIN_TECHNIQUES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)MITRE_TECHNIQUES:\s*(.+)").unwrap());
static ATTACK_TYPE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)ATTACK_TYPE:\s*(.+)").unwrap());
static ALERT_PRIORITY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)P[1-5]").unwrap());
static SNIPPET_IP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").unwrap());

/// A kill-chain verdict for one time window.
#[derive(Debug, Clone, Serialize)]
pub struct KillChain {
    pub window: String,
    pub chain_detected: bool,
    pub pattern: String,
    pub mitre_techniques: Vec<String>,
    pub severity: Severity,
    pub alert_count: usize,
    pub alerts: Vec<EmailRecord>,
}

/// Coordinated-activity analysis for one source IP.
#[derive(Debug, Clone, Serialize)]
pub struct IpAnalysis {
    pub alert_count: usize,
    pub timespan_minutes: i64,
    pub attack_type: String,
    pub severity: Severity,
    pub first_seen: Option<String>,
    pub last_seen: Option<String>,
    pub alerts: Vec<EmailRecord>,
}

/// Headline counts for [`SecurityTriage`].
#[derive(Debug, Clone, Serialize)]
pub struct TriageSummary {
    pub total: usize,
    pub unique: usize,
    pub critical: usize,
    pub chains: usize,
}

/// The fixed result record of [`SecurityWorkflows::security_triage`].
#[derive(Debug, Clone, Serialize)]
pub struct SecurityTriage {
    pub summary: TriageSummary,
    pub classifications: BTreeMap<Severity, Vec<EmailRecord>>,
    pub iocs: IocSet,
    pub kill_chains: Vec<KillChain>,
    pub source_ip_analysis: BTreeMap<String, IpAnalysis>,
    pub suspicious_senders: Vec<SuspiciousSender>,
    pub risky_attachments: Vec<RiskyAttachment>,
    pub suspicious_urls: Vec<SuspiciousUrl>,
    pub executive_summary: String,
}

/// Options for [`SecurityWorkflows::security_triage`].
#[derive(Debug, Clone)]
pub struct TriageOptions {
    pub deduplicate: bool,
    pub include_exec_summary: bool,
}

impl Default for TriageOptions {
    fn default() -> Self {
        TriageOptions {
            deduplicate: true,
            include_exec_summary: true,
        }
    }
}

/// A synthesized multi-stage attack chain.
#[derive(Debug, Clone, Serialize)]
pub struct AttackChainReport {
    pub attack_id: String,
    pub start_time: String,
    pub end_time: String,
    pub duration_minutes: u32,
    pub pattern: String,
    pub mitre_techniques: Vec<String>,
    pub severity: Severity,
    pub confidence: f64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub confidence_reasoning: String,
    pub affected_systems: Vec<String>,
    pub alert_count: usize,
    pub alerts: Vec<EmailRecord>,
    /// Historical patterns from the threat store resembling this chain.
    pub similar_history: usize,
}

/// Phishing buckets plus a one-paragraph summary.
#[derive(Debug, Clone, Serialize)]
pub struct PhishingReport {
    pub credential_harvesting: Vec<CredentialHarvestingHit>,
    pub bec_attempts: Vec<SuspiciousSender>,
    pub brand_impersonation: Vec<SuspiciousSender>,
    pub malicious_attachments: Vec<RiskyAttachment>,
    pub malicious_links: Vec<SuspiciousUrl>,
    pub summary: String,
}

/// One credential-harvesting keyword hit.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialHarvestingHit {
    pub email_id: String,
    pub subject: String,
    pub reason: String,
}

/// Security workflow library with injected dependencies.
pub struct SecurityWorkflows {
    invoker: Arc<Invoker>,
    pattern_cache: Option<Arc<SecurityPatternCache>>,
    threat_store: Option<Arc<ThreatPatternStore>>,
}

impl SecurityWorkflows {
    pub fn new(
        invoker: Arc<Invoker>,
        pattern_cache: Option<Arc<SecurityPatternCache>>,
        threat_store: Option<Arc<ThreatPatternStore>>,
    ) -> Self {
        SecurityWorkflows {
            invoker,
            pattern_cache,
            threat_store,
        }
    }

    /// Batch classification of alerts into P1–P5.
    ///
    /// First pass is field/pattern extraction; only alerts whose P3 is the
    /// undetermined default (no explicit medium/p3 text) go to the model,
    /// in batches, with a one-line-per-alert reply grammar. Alerts whose
    /// reply line cannot be parsed fall back to P3.
    pub async fn classify_alerts(
        &self,
        emails: &[EmailRecord],
        batch_size: usize,
    ) -> Result<BTreeMap<Severity, Vec<EmailRecord>>, RlmError> {
        let mut classifications: BTreeMap<Severity, Vec<EmailRecord>> = Severity::ALL
            .iter()
            .map(|s| (*s, Vec::new()))
            .collect();

        let mut undetermined = Vec::new();
        for email in emails {
            let severity = extract_severity(email);
            if severity != Severity::P3 {
                classifications.get_mut(&severity).unwrap().push(email.clone());
            } else if has_explicit_p3_signal(email) {
                classifications.get_mut(&Severity::P3).unwrap().push(email.clone());
            } else {
                undetermined.push(email.clone());
            }
        }

        let prompt = "Classify each security alert into priority levels:\n\
                      - P1 (Critical): immediate threat, active exploitation, data breach\n\
                      - P2 (High): significant risk, needs attention within hours\n\
                      - P3 (Medium): moderate risk, needs attention within days\n\
                      - P4 (Low): minor issue, routine monitoring\n\
                      - P5 (Info): informational, no action required\n\n\
                      Respond with only the alert numbers and priorities, one per line:\n\
                      Alert 1: P1\nAlert 2: P3";

        for batch in undetermined.chunks(batch_size.max(1)) {
            let context = batch
                .iter()
                .enumerate()
                .map(|(i, email)| {
                    format!(
                        "Alert {}:\nSubject: {}\nFrom: {}\nSnippet: {}",
                        i + 1,
                        email.subject,
                        email.from,
                        email.snippet
                    )
                })
                .collect::<Vec<_>>()
                .join("\n\n");

            let reply = self.invoker.invoke(prompt, Some(&context)).await?;

            if is_sentinel(&reply) {
                classifications
                    .get_mut(&Severity::P3)
                    .unwrap()
                    .extend(batch.iter().cloned());
                continue;
            }

            let lines: Vec<&str> = reply.lines().collect();
            for (i, email) in batch.iter().enumerate() {
                let severity = lines
                    .get(i)
                    .and_then(|line| ALERT_PRIORITY.find(line))
                    .and_then(|m| Severity::parse(m.as_str()))
                    .unwrap_or(Severity::P3);
                classifications.get_mut(&severity).unwrap().push(email.clone());
            }
        }

        Ok(classifications)
    }

    /// Stable signature for memoizing per-alert MITRE mappings.
    fn alert_signature(alert: &EmailRecord) -> String {
        let mut hasher = Sha256::new();
        hasher.update(alert.subject.as_bytes());
        hasher.update(b"|");
        hasher.update(alert.snippet.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// MITRE mapping with model supplementation when the closed keyword
    /// table finds fewer than two techniques. Supplemented mappings are
    /// memoized in the security pattern cache by alert signature.
    pub async fn map_to_mitre_with_model(
        &self,
        alert: &EmailRecord,
    ) -> Result<Vec<String>, RlmError> {
        let mut techniques = map_to_mitre(alert);
        if techniques.len() >= 2 {
            return Ok(techniques);
        }

        let signature = Self::alert_signature(alert);
        if let Some(cache) = &self.pattern_cache {
            if let Some(cached) = cache.get_mitre_mapping(&signature) {
                techniques.extend(cached);
                techniques.sort();
                techniques.dedup();
                return Ok(techniques);
            }
        }

        let prompt = "Map this security alert to MITRE ATT&CK technique IDs.\n\
                      Provide ONLY the technique IDs (e.g. T1566.001, T1059.001), \
                      one per line. If no clear match, respond with \"NONE\".";
        let context = format!("Subject: {}\nSnippet: {}", alert.subject, alert.snippet);
        let reply = self.invoker.invoke(prompt, Some(&context)).await?;

        if !is_sentinel(&reply) {
            let supplemental = parse_technique_ids(&reply);
            if let Some(cache) = &self.pattern_cache {
                cache.cache_mitre_mapping(&signature, &supplemental);
            }
            techniques.extend(supplemental);
            techniques.sort();
            techniques.dedup();
        }

        Ok(techniques)
    }

    /// Inspect each time window holding at least two alerts for a
    /// kill-chain sequence. Windows under `"unknown_time"` are skipped.
    pub async fn detect_kill_chains(
        &self,
        time_windows: &BTreeMap<String, Vec<EmailRecord>>,
    ) -> Result<Vec<KillChain>, RlmError> {
        let prompt = "Analyze these security alerts for kill chain patterns.\n\n\
                      A kill chain is a sequence of attack stages like:\n\
                      - Initial Access -> Execution -> Persistence\n\
                      - Reconnaissance -> Weaponization -> Delivery -> Exploitation\n\
                      - Data Collection -> Exfiltration\n\n\
                      Respond in this format:\n\
                      CHAIN_DETECTED: yes/no\n\
                      PATTERN: [description if detected, e.g. \"Phishing -> Execution -> C2\"]\n\
                      SEVERITY: P1/P2/P3/P4/P5\n\
                      MITRE_TECHNIQUES: [comma-separated T-IDs]";

        let mut kill_chains = Vec::new();

        for (window, alerts) in time_windows {
            if window == "unknown_time" || alerts.len() < 2 {
                continue;
            }

            let context = alerts
                .iter()
                .enumerate()
                .map(|(i, alert)| {
                    format!(
                        "Alert {} ({}):\nSubject: {}\nFrom: {}\nSnippet: {}",
                        i + 1,
                        alert.date,
                        alert.subject,
                        alert.from,
                        alert.snippet
                    )
                })
                .collect::<Vec<_>>()
                .join("\n\n");

            let reply = self.invoker.invoke(prompt, Some(&context)).await?;

            if is_sentinel(&reply) {
                kill_chains.push(KillChain {
                    window: window.clone(),
                    chain_detected: false,
                    pattern: format!("Analysis failed: {}", reply),
                    mitre_techniques: Vec::new(),
                    severity: Severity::P3,
                    alert_count: alerts.len(),
                    alerts: alerts.clone(),
                });
                continue;
            }

            let chain_detected = CHAIN_DETECTED
                .captures(&reply)
                .map(|c| c[1].to_lowercase().contains("yes"))
                .unwrap_or(false);
            let pattern = CHAIN_PATTERN
                .captures(&reply)
                .map(|c| c[1].trim().to_string())
                .unwrap_or_else(|| "Unknown pattern".to_string());
            let severity = CHAIN_SEVERITY
                .captures(&reply)
                .and_then(|c| Severity::parse(&c[1]))
                .unwrap_or(Severity::P2);
            let mitre_techniques = CHAIN_TECHNIQUES
                .captures(&reply)
                .map(|c| parse_technique_ids(&c[1]))
                .unwrap_or_default();

            kill_chains.push(KillChain {
                window: window.clone(),
                chain_detected,
                pattern,
                mitre_techniques,
                severity,
                alert_count: alerts.len(),
                alerts: alerts.clone(),
            });
        }

        Ok(kill_chains)
    }

    /// Group alerts by source IP and classify coordinated activity. IPs
    /// with a single alert are skipped. Attack-type verdicts are memoized
    /// per IP in the security pattern cache.
    pub async fn correlate_by_source_ip(
        &self,
        emails: &[EmailRecord],
    ) -> Result<BTreeMap<String, IpAnalysis>, RlmError> {
        let iocs = extract_iocs(emails);
        let mut ip_to_alerts: BTreeMap<String, Vec<EmailRecord>> = BTreeMap::new();

        for email in emails {
            let text = email.combined_text();
            for ip in &iocs.ips {
                if text.contains(ip.as_str()) {
                    ip_to_alerts.entry(ip.clone()).or_default().push(email.clone());
                }
            }
        }

        let mut analysis = BTreeMap::new();

        for (ip, alerts) in ip_to_alerts {
            if alerts.len() < 2 {
                continue;
            }

            let mut dates: Vec<_> = alerts
                .iter()
                .filter_map(|a| parse_email_date(&a.date))
                .collect();
            dates.sort();
            let (first_seen, last_seen, timespan_minutes) = match (dates.first(), dates.last()) {
                (Some(first), Some(last)) => (
                    Some(first.format("%Y-%m-%dT%H:%M:%S").to_string()),
                    Some(last.format("%Y-%m-%dT%H:%M:%S").to_string()),
                    (*last - *first).num_minutes(),
                ),
                _ => (None, None, 0),
            };

            let (attack_type, severity) = self
                .classify_ip_activity(&ip, &alerts, timespan_minutes)
                .await?;

            analysis.insert(
                ip,
                IpAnalysis {
                    alert_count: alerts.len(),
                    timespan_minutes,
                    attack_type,
                    severity,
                    first_seen,
                    last_seen,
                    alerts,
                },
            );
        }

        Ok(analysis)
    }

    async fn classify_ip_activity(
        &self,
        ip: &str,
        alerts: &[EmailRecord],
        timespan_minutes: i64,
    ) -> Result<(String, Severity), RlmError> {
        if let Some(cache) = &self.pattern_cache {
            if let Some(cached) = cache.get_ioc_analysis(ip, "ip") {
                let attack_type = cached
                    .get("attack_type")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Unknown")
                    .to_string();
                let severity = cached
                    .get("severity")
                    .and_then(|v| v.as_str())
                    .and_then(Severity::parse)
                    .unwrap_or(Severity::P3);
                return Ok((attack_type, severity));
            }
        }

        let mut context = format!(
            "IP: {}\nAlert count: {}\nTimespan: {} minutes\n\n",
            ip,
            alerts.len(),
            timespan_minutes
        );
        for alert in alerts.iter().take(5) {
            context.push_str(&format!("- {}\n", alert.subject));
        }

        let prompt = "Analyze this IP's activity pattern.\n\n\
                      Identify the attack type (e.g. Brute Force, Port Scan, DDoS, \
                      Lateral Movement) and assign a severity (P1-P5).\n\n\
                      Respond in format:\nATTACK_TYPE: [type]\nSEVERITY: P1/P2/P3/P4/P5";

        let reply = self.invoker.invoke(prompt, Some(&context)).await?;

        let mut attack_type = "Unknown".to_string();
        let mut severity = Severity::P3;
        if !is_sentinel(&reply) {
            if let Some(caps) = ATTACK_TYPE.captures(&reply) {
                attack_type = caps[1].trim().to_string();
            }
            if let Some(caps) = CHAIN_SEVERITY.captures(&reply) {
                if let Some(parsed) = Severity::parse(&caps[1]) {
                    severity = parsed;
                }
            }
            if let Some(cache) = &self.pattern_cache {
                cache.cache_ioc_analysis(
                    ip,
                    "ip",
                    serde_json::json!({
                        "attack_type": attack_type,
                        "severity": severity.as_str(),
                    }),
                );
            }
        }

        Ok((attack_type, severity))
    }

    /// The canonical triage pipeline: dedupe, classify, extract IOCs,
    /// detect kill chains over 5-minute windows, correlate source IPs,
    /// flag suspicious senders, score attachments and URLs, and produce an
    /// executive summary from a densified digest of the prior steps.
    pub async fn security_triage(
        &self,
        emails: &[EmailRecord],
        options: TriageOptions,
    ) -> Result<SecurityTriage, RlmError> {
        if emails.is_empty() {
            return Ok(SecurityTriage {
                summary: TriageSummary {
                    total: 0,
                    unique: 0,
                    critical: 0,
                    chains: 0,
                },
                classifications: Severity::ALL.iter().map(|s| (*s, Vec::new())).collect(),
                iocs: IocSet::default(),
                kill_chains: Vec::new(),
                source_ip_analysis: BTreeMap::new(),
                suspicious_senders: Vec::new(),
                risky_attachments: Vec::new(),
                suspicious_urls: Vec::new(),
                executive_summary: "No alerts to triage.".to_string(),
            });
        }

        let total = emails.len();

        // Step 1: deduplicate recurring alerts.
        let working: Vec<EmailRecord> = if options.deduplicate {
            deduplicate_security_alerts(emails, 0.9)
        } else {
            emails.to_vec()
        };
        let unique = working.len();

        // Step 2: severity classification.
        let classifications = self.classify_alerts(&working, 20).await?;
        let critical = classifications[&Severity::P1].len();

        // Step 3: IOC extraction (recorded to the threat store).
        let iocs = extract_iocs(&working);
        self.record_iocs(&iocs);

        // Step 4: kill-chain detection over 5-minute windows.
        let windows = chunk_by_time(&working, 5);
        let all_chains = self.detect_kill_chains(&windows).await?;
        let kill_chains: Vec<KillChain> = all_chains
            .into_iter()
            .filter(|kc| kc.chain_detected)
            .collect();
        self.record_chains(&kill_chains);

        // Step 5: source-IP correlation.
        let source_ip_analysis = self.correlate_by_source_ip(&working).await?;

        // Steps 6-7: rule-based sender, attachment, and URL checks.
        let suspicious_senders = detect_suspicious_senders(&working);
        let risky_attachments = analyze_attachments(&working);
        let suspicious_urls = analyze_urls(&working);

        // Step 8: executive summary over a densified digest.
        let executive_summary = if options.include_exec_summary {
            let digest = format!(
                "Security Alert Triage Summary:\n\
                 - Total Alerts Processed: {} (Unique: {})\n\
                 - Critical (P1): {}\n - High (P2): {}\n - Medium (P3): {}\n\
                 - Low (P4): {}\n - Info (P5): {}\n\n\
                 Kill Chains Detected: {}\n{}\n\n\
                 Suspicious Activity:\n\
                 - {} unique source IPs with multiple alerts\n\
                 - {} suspicious sender patterns\n\
                 - {} risky attachments\n\
                 - {} suspicious URLs\n\n\
                 Top IOCs:\n - IPs: {}\n - Domains: {}\n - File Hashes: {} SHA256",
                total,
                unique,
                classifications[&Severity::P1].len(),
                classifications[&Severity::P2].len(),
                classifications[&Severity::P3].len(),
                classifications[&Severity::P4].len(),
                classifications[&Severity::P5].len(),
                kill_chains.len(),
                kill_chains
                    .iter()
                    .take(5)
                    .map(|kc| format!("- {} ({})", kc.pattern, kc.severity))
                    .collect::<Vec<_>>()
                    .join("\n"),
                source_ip_analysis.len(),
                suspicious_senders.len(),
                risky_attachments.len(),
                suspicious_urls.len(),
                iocs.ips.len(),
                iocs.domains.len(),
                iocs.file_hashes.sha256.len(),
            );

            let prompt = "Generate a concise executive summary for the CISO based on this \
                          security triage.\n\nInclude:\n\
                          1. Overall threat landscape (1-2 sentences)\n\
                          2. Critical items requiring immediate action (if any)\n\
                          3. Key trends or patterns\n\
                          4. Recommended next steps\n\n\
                          Keep it under 200 words. Be direct and actionable.";

            self.invoker.invoke(prompt, Some(&digest)).await?
        } else {
            String::new()
        };

        Ok(SecurityTriage {
            summary: TriageSummary {
                total,
                unique,
                critical,
                chains: kill_chains.len(),
            },
            classifications,
            iocs,
            kill_chains,
            source_ip_analysis,
            suspicious_senders,
            risky_attachments,
            suspicious_urls,
            executive_summary,
        })
    }

    fn record_iocs(&self, iocs: &IocSet) {
        let Some(store) = &self.threat_store else {
            return;
        };
        for (ioc_type, value) in iocs.flatten() {
            let mut context = BTreeMap::new();
            context.insert(
                "source".to_string(),
                serde_json::json!("security_triage"),
            );
            // Store writes are best-effort; triage results do not depend
            // on history being persisted.
            let _ = store.add_observed_ioc(value, ioc_type, context);
        }
    }

    fn record_chains(&self, chains: &[KillChain]) {
        let Some(store) = &self.threat_store else {
            return;
        };
        for chain in chains {
            let _ = store.add_attack_pattern(AttackPattern {
                pattern_type: "kill_chain".to_string(),
                description: chain.pattern.clone(),
                mitre_techniques: chain.mitre_techniques.clone(),
                severity: chain.severity,
                indicators: chain.alerts.iter().map(|a| a.id.clone()).collect(),
                timestamp: Utc::now(),
                similarity_score: None,
            });
        }
    }

    /// Multi-pass correlation for sophisticated attacks: time windows,
    /// per-window kill-chain detection, affected-system extraction, then a
    /// follow-up confidence invocation per chain. Chains are returned
    /// sorted by (severity rank ascending, confidence descending) with
    /// synthetic `chain_YYYYMMDD_NNN` ids.
    pub async fn detect_attack_chains(
        &self,
        emails: &[EmailRecord],
        window_minutes: u32,
        min_alerts_per_chain: usize,
    ) -> Result<Vec<AttackChainReport>, RlmError> {
        if emails.is_empty() {
            return Ok(Vec::new());
        }

        let windows = chunk_by_time(emails, window_minutes);
        let window_chains = self.detect_kill_chains(&windows).await?;

        let detected: Vec<KillChain> = window_chains
            .into_iter()
            .filter(|kc| kc.chain_detected && kc.alert_count >= min_alerts_per_chain)
            .collect();
        if detected.is_empty() {
            return Ok(Vec::new());
        }

        let date_tag = Utc::now().format("%Y%m%d");
        let mut chains = Vec::new();

        for (index, window_chain) in detected.into_iter().enumerate() {
            let mut affected: std::collections::BTreeSet<String> =
                std::collections::BTreeSet::new();
            for alert in &window_chain.alerts {
                if alert.from.contains('@') {
                    affected.insert(sender_address(&alert.from));
                }
                for ip in SNIPPET_IP.find_iter(&alert.snippet) {
                    affected.insert(ip.as_str().to_string());
                }
            }
            let affected_systems: Vec<String> = affected.into_iter().collect();

            let context = format!(
                "Attack Chain Analysis:\nPattern: {}\nMITRE Techniques: {}\n\
                 Alert Count: {}\nDuration: {} minutes\nAffected Systems: {}\n\n\
                 Sample Alerts:\n{}",
                window_chain.pattern,
                window_chain.mitre_techniques.join(", "),
                window_chain.alert_count,
                window_minutes,
                affected_systems
                    .iter()
                    .take(5)
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", "),
                window_chain
                    .alerts
                    .iter()
                    .take(3)
                    .map(|a| format!("- {}", a.subject))
                    .collect::<Vec<_>>()
                    .join("\n"),
            );

            let prompt = "Assess the confidence that this is a genuine multi-stage attack.\n\n\
                          Consider:\n\
                          - Pattern coherence (do the stages logically follow?)\n\
                          - Timing (are stages occurring in realistic sequence?)\n\
                          - Affected systems (single target or distributed?)\n\
                          - MITRE technique validity\n\n\
                          Respond with:\nCONFIDENCE: [0-100]\nREASONING: [brief explanation]";

            let reply = self.invoker.invoke(prompt, Some(&context)).await?;
            let (confidence, confidence_reasoning) = if is_sentinel(&reply) {
                (0.75, String::new())
            } else {
                let (parsed, reasoning) = parse_confidence(&reply);
                // Base confidence when the reply carried no trailer.
                (if parsed > 0.0 { parsed } else { 0.75 }, reasoning)
            };

            let probe = AttackPattern {
                pattern_type: "kill_chain".to_string(),
                description: window_chain.pattern.clone(),
                mitre_techniques: window_chain.mitre_techniques.clone(),
                severity: window_chain.severity,
                indicators: Vec::new(),
                timestamp: Utc::now(),
                similarity_score: None,
            };
            let similar_history = self
                .threat_store
                .as_ref()
                .map(|store| store.search_similar_patterns(&probe, 0.7).len())
                .unwrap_or(0);

            chains.push(AttackChainReport {
                attack_id: format!("chain_{}_{:03}", date_tag, index + 1),
                start_time: window_chain.window.clone(),
                end_time: window_chain.window.clone(),
                duration_minutes: window_minutes,
                pattern: window_chain.pattern,
                mitre_techniques: window_chain.mitre_techniques,
                severity: window_chain.severity,
                confidence,
                confidence_reasoning,
                affected_systems,
                alert_count: window_chain.alert_count,
                alerts: window_chain.alerts,
                similar_history,
            });
        }

        chains.sort_by(|a, b| {
            a.severity
                .rank()
                .cmp(&b.severity.rank())
                .then_with(|| {
                    b.confidence
                        .partial_cmp(&a.confidence)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
        });

        Ok(chains)
    }

    /// Phishing-focused bucketing: credential harvesting keywords,
    /// impersonation detection, attachment and URL analyses, then a
    /// one-paragraph summary invocation.
    pub async fn phishing_analysis(
        &self,
        emails: &[EmailRecord],
    ) -> Result<PhishingReport, RlmError> {
        if emails.is_empty() {
            return Ok(PhishingReport {
                credential_harvesting: Vec::new(),
                bec_attempts: Vec::new(),
                brand_impersonation: Vec::new(),
                malicious_attachments: Vec::new(),
                malicious_links: Vec::new(),
                summary: "No emails to analyze.".to_string(),
            });
        }

        let mut bec_attempts = Vec::new();
        let mut brand_impersonation = Vec::new();
        for detection in detect_suspicious_senders(emails) {
            if detection.reason.to_lowercase().contains("spoofing") {
                brand_impersonation.push(detection);
            } else {
                bec_attempts.push(detection);
            }
        }

        let malicious_attachments: Vec<RiskyAttachment> = analyze_attachments(emails)
            .into_iter()
            .filter(|att| {
                att.risk_level == crate::security::RiskLevel::High
                    || att.risk_level == crate::security::RiskLevel::Medium
            })
            .collect();

        let malicious_links = analyze_urls(emails);

        let mut credential_harvesting = Vec::new();
        for email in emails {
            let combined = format!("{} {}", email.subject, email.snippet).to_lowercase();
            let hit = [
                "verify account",
                "confirm password",
                "update payment",
                "suspended account",
            ]
            .iter()
            .any(|kw| combined.contains(kw));
            if hit {
                credential_harvesting.push(CredentialHarvestingHit {
                    email_id: email.id.clone(),
                    subject: email.subject.clone(),
                    reason: "Credential harvesting keywords detected".to_string(),
                });
            }
        }

        let digest = format!(
            "Phishing Analysis Results:\n\
             - Credential Harvesting Attempts: {}\n\
             - BEC Attempts: {}\n\
             - Brand Impersonation: {}\n\
             - Malicious Attachments: {}\n\
             - Malicious Links: {}",
            credential_harvesting.len(),
            bec_attempts.len(),
            brand_impersonation.len(),
            malicious_attachments.len(),
            malicious_links.len(),
        );

        let summary = self
            .invoker
            .invoke(
                "Summarize the phishing threat landscape based on this data in 2-3 sentences.",
                Some(&digest),
            )
            .await?;

        Ok(PhishingReport {
            credential_harvesting,
            bec_attempts,
            brand_impersonation,
            malicious_attachments,
            malicious_links,
            summary,
        })
    }
}

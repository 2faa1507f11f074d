//! Lua 5.4 execution environment for user analysis programs.
//!
//! The VM runs on a blocking thread (via [`tokio::task::spawn_blocking`]
//! in [`crate::executor`]); host functions that need the async invoker
//! bridge back into the runtime with [`tokio::runtime::Handle::block_on`].
//!
//! # Binding surface
//!
//! | Group | Globals |
//! |-------|---------|
//! | data | `emails`, `metadata` |
//! | model | `invoke`, `parallel_map`, `invoke_json`, `invoke_with_confidence` |
//! | chunking | `chunk_by_size`, `chunk_by_sender`, `chunk_by_sender_domain`, `chunk_by_thread`, `chunk_by_date`, `chunk_by_time` |
//! | filtering | `filter_by_keyword`, `filter_by_sender`, `sort_emails`, `dedupe_emails`, `top_senders` |
//! | context | `email_summary`, `batch_summaries`, `aggregate_results` |
//! | security | `extract_iocs`, `extract_severity`, `validate_email_auth`, `map_to_mitre`, `deduplicate_security_alerts` |
//! | workflows | `inbox_triage`, `weekly_summary`, `find_action_items`, `sender_analysis`, `security_triage`, `detect_attack_chains`, `phishing_analysis` |
//! | control | `session`, `final`, `final_named`, `errors` |
//!
//! This is the complete capability record: user programs see nothing
//! else, and the dangerous Lua standard libraries are removed.
//!
//! # Sandboxing
//!
//! `os`, `io`, `debug`, `loadfile`, and `dofile` are removed from the
//! globals. `print` is redirected to stderr so program chatter never
//! contaminates the result channel.

use std::sync::{Arc, Mutex};

use mlua::prelude::*;
use tokio::runtime::Handle;

use crate::error::RlmError;
use crate::executor::RlmEnv;
use crate::models::EmailRecord;
use crate::primitives::{self, DatePeriod, SortKey};
use crate::security;
use crate::security_workflows::TriageOptions;
use crate::structured;

// ═══════════════════════════════════════════════════════════════════════
// Sandboxing
// ═══════════════════════════════════════════════════════════════════════

/// Remove dangerous standard library entries from the Lua globals.
pub(crate) fn sandbox_globals(lua: &Lua) -> LuaResult<()> {
    let globals = lua.globals();
    globals.set("os", LuaValue::Nil)?;
    globals.set("io", LuaValue::Nil)?;
    globals.set("loadfile", LuaValue::Nil)?;
    globals.set("dofile", LuaValue::Nil)?;
    globals.set("debug", LuaValue::Nil)?;

    // Program chatter goes to stderr; stdout is the result channel.
    globals.set(
        "print",
        lua.create_function(|_lua, args: LuaMultiValue| {
            let parts: Vec<String> = args
                .iter()
                .map(|v| match v {
                    LuaValue::String(s) => s.to_string_lossy().to_string(),
                    other => format!("{:?}", other),
                })
                .collect();
            eprintln!("[program] {}", parts.join("\t"));
            Ok(())
        })?,
    )?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Value conversions: JSON ⇄ Lua
// ═══════════════════════════════════════════════════════════════════════

/// Convert a JSON value to a Lua value.
pub(crate) fn json_value_to_lua(lua: &Lua, value: &serde_json::Value) -> LuaResult<LuaValue> {
    match value {
        serde_json::Value::Null => Ok(LuaValue::Nil),
        serde_json::Value::Bool(b) => Ok(LuaValue::Boolean(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(LuaValue::Integer(i))
            } else {
                Ok(LuaValue::Number(n.as_f64().unwrap_or(0.0)))
            }
        }
        serde_json::Value::String(s) => lua.create_string(s).map(LuaValue::String),
        serde_json::Value::Array(arr) => {
            let table = lua.create_table()?;
            for (i, v) in arr.iter().enumerate() {
                table.set(i as i64 + 1, json_value_to_lua(lua, v)?)?;
            }
            Ok(LuaValue::Table(table))
        }
        serde_json::Value::Object(map) => {
            let table = lua.create_table()?;
            for (k, v) in map {
                table.set(k.as_str(), json_value_to_lua(lua, v)?)?;
            }
            Ok(LuaValue::Table(table))
        }
    }
}

/// Convert a Lua value to a JSON value.
pub(crate) fn lua_value_to_json(value: LuaValue) -> LuaResult<serde_json::Value> {
    match value {
        LuaValue::Nil => Ok(serde_json::Value::Null),
        LuaValue::Boolean(b) => Ok(serde_json::Value::Bool(b)),
        LuaValue::Integer(i) => Ok(serde_json::Value::Number(i.into())),
        LuaValue::Number(n) => Ok(serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)),
        LuaValue::String(s) => Ok(serde_json::Value::String(s.to_str()?.to_string())),
        LuaValue::Table(t) => {
            // Heuristic: raw_len > 0 means array, otherwise object.
            let len = t.raw_len();
            if len > 0 {
                let mut arr = Vec::new();
                for i in 1..=len {
                    let v: LuaValue = t.raw_get(i)?;
                    arr.push(lua_value_to_json(v)?);
                }
                Ok(serde_json::Value::Array(arr))
            } else {
                let mut map = serde_json::Map::new();
                for pair in t.pairs::<String, LuaValue>() {
                    let (k, v) = pair?;
                    map.insert(k, lua_value_to_json(v)?);
                }
                Ok(serde_json::Value::Object(map))
            }
        }
        _ => Ok(serde_json::Value::Null),
    }
}

fn emails_from_lua(value: LuaValue) -> LuaResult<Vec<EmailRecord>> {
    let json = lua_value_to_json(value)?;
    serde_json::from_value(json).map_err(|e| {
        mlua::Error::external(anyhow::anyhow!("expected a list of email records: {}", e))
    })
}

fn email_from_lua(value: LuaValue) -> LuaResult<EmailRecord> {
    let json = lua_value_to_json(value)?;
    serde_json::from_value(json)
        .map_err(|e| mlua::Error::external(anyhow::anyhow!("expected an email record: {}", e)))
}

fn to_lua<T: serde::Serialize>(lua: &Lua, value: &T) -> LuaResult<LuaValue> {
    let json = serde_json::to_value(value).map_err(mlua::Error::external)?;
    json_value_to_lua(lua, &json)
}

/// Render one fan-out chunk to context text: strings pass through,
/// anything else is JSON-encoded.
fn chunk_to_context(value: LuaValue) -> LuaResult<String> {
    match value {
        LuaValue::String(s) => Ok(s.to_str()?.to_string()),
        other => {
            let json = lua_value_to_json(other)?;
            serde_json::to_string(&json).map_err(mlua::Error::external)
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Binding registration
// ═══════════════════════════════════════════════════════════════════════

/// Shared mutable state visible to the host closures.
pub(crate) struct ExecState {
    /// First `final`/`final_named` result, if any.
    pub final_result: Mutex<Option<String>>,
    /// Classification of a fatal governor error observed by a host
    /// closure, kept even if the program swallows the raised error.
    pub aborted: Mutex<Option<String>>,
}

impl ExecState {
    pub fn new() -> Arc<Self> {
        Arc::new(ExecState {
            final_result: Mutex::new(None),
            aborted: Mutex::new(None),
        })
    }
}

fn raise(state: &Arc<ExecState>, err: RlmError) -> mlua::Error {
    if err.is_fatal() {
        let mut aborted = state.aborted.lock().unwrap();
        if aborted.is_none() {
            *aborted = Some(err.kind().to_string());
        }
    }
    mlua::Error::external(err)
}

/// Register the complete RLM capability surface on a Lua VM.
pub(crate) fn register_rlm_api(
    lua: &Lua,
    env: &RlmEnv,
    handle: &Handle,
    state: &Arc<ExecState>,
) -> LuaResult<()> {
    sandbox_globals(lua)?;
    let globals = lua.globals();

    // ── model invocations ────────────────────────────────────────────

    {
        let invoker = Arc::clone(&env.invoker);
        let handle = handle.clone();
        let state = Arc::clone(state);
        globals.set(
            "invoke",
            lua.create_function(move |lua, (prompt, context): (String, Option<String>)| {
                let result = handle
                    .block_on(invoker.invoke(&prompt, context.as_deref()))
                    .map_err(|e| raise(&state, e))?;
                lua.create_string(&result).map(LuaValue::String)
            })?,
        )?;
    }

    {
        let invoker = Arc::clone(&env.invoker);
        let handle = handle.clone();
        let state = Arc::clone(state);
        let workers = env.workers;
        let checkpoint = env.checkpoint.clone();
        let interval = env.checkpoint_interval;
        globals.set(
            "parallel_map",
            lua.create_function(
                move |lua, (prompt, chunks, max_workers): (String, LuaTable, Option<usize>)| {
                    let mut pairs = Vec::new();
                    for i in 1..=chunks.raw_len() {
                        let chunk: LuaValue = chunks.raw_get(i)?;
                        pairs.push((prompt.clone(), chunk_to_context(chunk)?));
                    }
                    let results = handle
                        .block_on(crate::checkpoint::checkpointed_llm_query(
                            &invoker,
                            pairs,
                            max_workers.unwrap_or(workers),
                            checkpoint.as_deref(),
                            interval,
                        ))
                        .map_err(|e| raise(&state, e))?;
                    to_lua(lua, &results)
                },
            )?,
        )?;
    }

    {
        let invoker = Arc::clone(&env.invoker);
        let handle = handle.clone();
        let state = Arc::clone(state);
        globals.set(
            "invoke_json",
            lua.create_function(
                move |lua,
                      (prompt, context, schema, max_retries): (
                    String,
                    Option<String>,
                    Option<LuaValue>,
                    Option<u32>,
                )| {
                    let schema_json = match schema {
                        Some(LuaValue::Nil) | None => None,
                        Some(v) => Some(lua_value_to_json(v)?),
                    };
                    let value = handle
                        .block_on(structured::invoke_json(
                            &invoker,
                            &prompt,
                            context.as_deref(),
                            schema_json.as_ref(),
                            max_retries.unwrap_or(2),
                        ))
                        .map_err(|e| raise(&state, e))?;
                    json_value_to_lua(lua, &value)
                },
            )?,
        )?;
    }

    {
        let invoker = Arc::clone(&env.invoker);
        let handle = handle.clone();
        let state = Arc::clone(state);
        globals.set(
            "invoke_with_confidence",
            lua.create_function(
                move |lua,
                      (prompt, context, min_confidence): (
                    String,
                    Option<String>,
                    Option<f64>,
                )| {
                    let reply = handle
                        .block_on(structured::invoke_with_confidence(
                            &invoker,
                            &prompt,
                            context.as_deref(),
                            min_confidence.unwrap_or(0.7),
                        ))
                        .map_err(|e| raise(&state, e))?;
                    to_lua(lua, &reply)
                },
            )?,
        )?;
    }

    // ── chunking & filtering primitives ──────────────────────────────

    globals.set(
        "chunk_by_size",
        lua.create_function(|lua, (emails, n): (LuaValue, usize)| {
            let records = emails_from_lua(emails)?;
            to_lua(lua, &primitives::chunk_by_size(&records, n))
        })?,
    )?;

    globals.set(
        "chunk_by_sender",
        lua.create_function(|lua, emails: LuaValue| {
            to_lua(lua, &primitives::chunk_by_sender(&emails_from_lua(emails)?))
        })?,
    )?;

    globals.set(
        "chunk_by_sender_domain",
        lua.create_function(|lua, emails: LuaValue| {
            to_lua(
                lua,
                &primitives::chunk_by_sender_domain(&emails_from_lua(emails)?),
            )
        })?,
    )?;

    globals.set(
        "chunk_by_thread",
        lua.create_function(|lua, emails: LuaValue| {
            to_lua(lua, &primitives::chunk_by_thread(&emails_from_lua(emails)?))
        })?,
    )?;

    globals.set(
        "chunk_by_date",
        lua.create_function(|lua, (emails, period): (LuaValue, Option<String>)| {
            let period = period
                .as_deref()
                .unwrap_or("day")
                .parse::<DatePeriod>()
                .map_err(mlua::Error::external)?;
            to_lua(
                lua,
                &primitives::chunk_by_date(&emails_from_lua(emails)?, period),
            )
        })?,
    )?;

    globals.set(
        "chunk_by_time",
        lua.create_function(|lua, (emails, window_minutes): (LuaValue, Option<u32>)| {
            to_lua(
                lua,
                &security::chunk_by_time(&emails_from_lua(emails)?, window_minutes.unwrap_or(5)),
            )
        })?,
    )?;

    globals.set(
        "filter_by_keyword",
        lua.create_function(|lua, (emails, keyword): (LuaValue, String)| {
            to_lua(
                lua,
                &primitives::filter_by_keyword(&emails_from_lua(emails)?, &keyword),
            )
        })?,
    )?;

    globals.set(
        "filter_by_sender",
        lua.create_function(|lua, (emails, pattern): (LuaValue, String)| {
            to_lua(
                lua,
                &primitives::filter_by_sender(&emails_from_lua(emails)?, &pattern),
            )
        })?,
    )?;

    globals.set(
        "sort_emails",
        lua.create_function(
            |lua, (emails, by, reverse): (LuaValue, Option<String>, Option<bool>)| {
                let key = match by.as_deref().unwrap_or("date") {
                    "from" => SortKey::From,
                    "subject" => SortKey::Subject,
                    _ => SortKey::Date,
                };
                to_lua(
                    lua,
                    &primitives::sort_emails(
                        &emails_from_lua(emails)?,
                        key,
                        reverse.unwrap_or(true),
                    ),
                )
            },
        )?,
    )?;

    globals.set(
        "dedupe_emails",
        lua.create_function(|lua, emails: LuaValue| {
            to_lua(lua, &primitives::dedupe_emails(&emails_from_lua(emails)?))
        })?,
    )?;

    globals.set(
        "top_senders",
        lua.create_function(|lua, (emails, n): (LuaValue, Option<usize>)| {
            to_lua(
                lua,
                &primitives::top_senders(&emails_from_lua(emails)?, n.unwrap_or(10)),
            )
        })?,
    )?;

    // ── context builders ─────────────────────────────────────────────

    globals.set(
        "email_summary",
        lua.create_function(|lua, email: LuaValue| {
            let record = email_from_lua(email)?;
            lua.create_string(primitives::email_summary(&record))
                .map(LuaValue::String)
        })?,
    )?;

    globals.set(
        "batch_summaries",
        lua.create_function(|lua, (emails, max_chars): (LuaValue, Option<usize>)| {
            let text =
                primitives::batch_summaries(&emails_from_lua(emails)?, max_chars.unwrap_or(4000));
            lua.create_string(text).map(LuaValue::String)
        })?,
    )?;

    globals.set(
        "aggregate_results",
        lua.create_function(|lua, (results, separator): (Vec<String>, Option<String>)| {
            let sep = separator.unwrap_or_else(|| "\n\n---\n\n".to_string());
            lua.create_string(primitives::aggregate_results(&results, &sep))
                .map(LuaValue::String)
        })?,
    )?;

    // ── security primitives ──────────────────────────────────────────

    globals.set(
        "extract_iocs",
        lua.create_function(|lua, emails: LuaValue| {
            to_lua(lua, &security::extract_iocs(&emails_from_lua(emails)?))
        })?,
    )?;

    globals.set(
        "extract_severity",
        lua.create_function(|lua, email: LuaValue| {
            let severity = security::extract_severity(&email_from_lua(email)?);
            lua.create_string(severity.as_str()).map(LuaValue::String)
        })?,
    )?;

    globals.set(
        "validate_email_auth",
        lua.create_function(|lua, email: LuaValue| {
            to_lua(lua, &security::validate_email_auth(&email_from_lua(email)?))
        })?,
    )?;

    globals.set(
        "map_to_mitre",
        lua.create_function(|lua, email: LuaValue| {
            to_lua(lua, &security::map_to_mitre(&email_from_lua(email)?))
        })?,
    )?;

    globals.set(
        "deduplicate_security_alerts",
        lua.create_function(|lua, (emails, threshold): (LuaValue, Option<f64>)| {
            to_lua(
                lua,
                &security::deduplicate_security_alerts(
                    &emails_from_lua(emails)?,
                    threshold.unwrap_or(0.9),
                ),
            )
        })?,
    )?;

    // ── workflows ────────────────────────────────────────────────────

    {
        let workflows = Arc::clone(&env.workflows);
        let handle = handle.clone();
        let state = Arc::clone(state);
        globals.set(
            "inbox_triage",
            lua.create_function(move |lua, emails: LuaValue| {
                let records = emails_from_lua(emails)?;
                let result = handle
                    .block_on(workflows.inbox_triage(&records))
                    .map_err(|e| raise(&state, e))?;
                to_lua(lua, &result)
            })?,
        )?;
    }

    {
        let workflows = Arc::clone(&env.workflows);
        let handle = handle.clone();
        let state = Arc::clone(state);
        globals.set(
            "weekly_summary",
            lua.create_function(move |lua, emails: LuaValue| {
                let records = emails_from_lua(emails)?;
                let result = handle
                    .block_on(workflows.weekly_summary(&records))
                    .map_err(|e| raise(&state, e))?;
                to_lua(lua, &result)
            })?,
        )?;
    }

    {
        let workflows = Arc::clone(&env.workflows);
        let handle = handle.clone();
        let state = Arc::clone(state);
        globals.set(
            "find_action_items",
            lua.create_function(move |lua, emails: LuaValue| {
                let records = emails_from_lua(emails)?;
                let result = handle
                    .block_on(workflows.find_action_items(&records))
                    .map_err(|e| raise(&state, e))?;
                to_lua(lua, &result)
            })?,
        )?;
    }

    {
        let workflows = Arc::clone(&env.workflows);
        let handle = handle.clone();
        let state = Arc::clone(state);
        globals.set(
            "sender_analysis",
            lua.create_function(move |lua, (emails, top_n): (LuaValue, Option<usize>)| {
                let records = emails_from_lua(emails)?;
                let result = handle
                    .block_on(workflows.sender_analysis(&records, top_n.unwrap_or(10)))
                    .map_err(|e| raise(&state, e))?;
                to_lua(lua, &result)
            })?,
        )?;
    }

    {
        let security_wf = Arc::clone(&env.security);
        let handle = handle.clone();
        let state = Arc::clone(state);
        globals.set(
            "security_triage",
            lua.create_function(move |lua, (emails, opts): (LuaValue, Option<LuaTable>)| {
                let records = emails_from_lua(emails)?;
                let mut options = TriageOptions::default();
                if let Some(opts) = opts {
                    // Option<bool> keeps absent keys from coercing to false.
                    if let Ok(Some(v)) = opts.get::<Option<bool>>("deduplicate") {
                        options.deduplicate = v;
                    }
                    if let Ok(Some(v)) = opts.get::<Option<bool>>("include_exec_summary") {
                        options.include_exec_summary = v;
                    }
                }
                let result = handle
                    .block_on(security_wf.security_triage(&records, options))
                    .map_err(|e| raise(&state, e))?;
                to_lua(lua, &result)
            })?,
        )?;
    }

    {
        let security_wf = Arc::clone(&env.security);
        let handle = handle.clone();
        let state = Arc::clone(state);
        globals.set(
            "detect_attack_chains",
            lua.create_function(
                move |lua,
                      (emails, window_minutes, min_alerts): (
                    LuaValue,
                    Option<u32>,
                    Option<usize>,
                )| {
                    let records = emails_from_lua(emails)?;
                    let result = handle
                        .block_on(security_wf.detect_attack_chains(
                            &records,
                            window_minutes.unwrap_or(5),
                            min_alerts.unwrap_or(2),
                        ))
                        .map_err(|e| raise(&state, e))?;
                    to_lua(lua, &result)
                },
            )?,
        )?;
    }

    {
        let security_wf = Arc::clone(&env.security);
        let handle = handle.clone();
        let state = Arc::clone(state);
        globals.set(
            "phishing_analysis",
            lua.create_function(move |lua, emails: LuaValue| {
                let records = emails_from_lua(emails)?;
                let result = handle
                    .block_on(security_wf.phishing_analysis(&records))
                    .map_err(|e| raise(&state, e))?;
                to_lua(lua, &result)
            })?,
        )?;
    }

    // ── session, sinks, and error classes ────────────────────────────

    {
        let invoker = Arc::clone(&env.invoker);
        globals.set(
            "session",
            lua.create_function(move |lua, ()| to_lua(lua, &invoker.session().stats()))?,
        )?;
    }

    {
        let state = Arc::clone(state);
        globals.set(
            "final",
            lua.create_function(move |_lua, value: LuaValue| {
                let mut slot = state.final_result.lock().unwrap();
                if slot.is_none() {
                    let rendered = match value {
                        LuaValue::String(s) => s.to_str()?.to_string(),
                        other => {
                            let json = lua_value_to_json(other)?;
                            serde_json::to_string_pretty(&json).map_err(mlua::Error::external)?
                        }
                    };
                    *slot = Some(rendered);
                }
                Ok(())
            })?,
        )?;
    }

    {
        let state = Arc::clone(state);
        globals.set(
            "final_named",
            lua.create_function(move |lua, name: String| {
                let mut slot = state.final_result.lock().unwrap();
                if slot.is_none() {
                    let value: LuaValue = lua.globals().get(name.as_str())?;
                    *slot = Some(match value {
                        LuaValue::Nil => format!("[Error: variable '{}' not found]", name),
                        other => {
                            let json = lua_value_to_json(other)?;
                            serde_json::to_string_pretty(&json).map_err(mlua::Error::external)?
                        }
                    });
                }
                Ok(())
            })?,
        )?;
    }

    // Error class names, matchable against pcall error strings.
    let errors = lua.create_table()?;
    errors.set("BUDGET_EXCEEDED", "BudgetExceeded")?;
    errors.set("DEPTH_EXCEEDED", "RecursionDepthExceeded")?;
    errors.set("INVALID_STRUCTURED_OUTPUT", "InvalidStructuredOutput")?;
    errors.set("LOW_CONFIDENCE", "LowConfidence")?;
    errors.set(
        "kind",
        lua.create_function(|_lua, message: String| {
            for kind in [
                "BudgetExceeded",
                "RecursionDepthExceeded",
                "InvalidStructuredOutput",
                "LowConfidence",
            ] {
                if message.contains(kind) {
                    return Ok(Some(kind.to_string()));
                }
            }
            Ok(None)
        })?,
    )?;
    globals.set("errors", errors)?;

    Ok(())
}

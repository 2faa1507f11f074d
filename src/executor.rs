//! User program executor.
//!
//! Runs an untrusted Lua analysis program against a loaded corpus inside
//! the sandboxed environment built by [`crate::lua_env`]. The Lua VM runs
//! on a blocking thread; host bindings bridge into the async invoker with
//! a captured runtime handle, keeping synchronous script execution off
//! the async workers.
//!
//! Result contract:
//!
//! - Only the first `final(value)` / `final_named(name)` call takes
//!   effect; its rendering is the program result.
//! - A program that terminates without calling either yields a fixed
//!   notice string.
//! - Any error other than Budget/Depth is caught at this boundary and
//!   returned as an `"[Execution Error: …]"` string in the result
//!   channel.
//! - `BudgetExceeded` / `RecursionDepthExceeded` also end the program,
//!   but are reported with their own classification in the session stats
//!   so the session layer can record the terminal state.

use std::path::PathBuf;
use std::sync::Arc;

use mlua::prelude::*;

use crate::error::RlmError;
use crate::invoker::Invoker;
use crate::lua_env::{self, ExecState};
use crate::models::Corpus;
use crate::security_workflows::SecurityWorkflows;
use crate::session::SessionStats;
use crate::workflows::Workflows;

/// Returned when a program never calls a `final*` sink.
pub const NO_FINAL_NOTICE: &str =
    "[Note: program completed without calling final(); use final(result) to set the output.]";

/// Capability record handed to the executor: every handle the binding
/// surface needs, created once at startup.
pub struct RlmEnv {
    pub invoker: Arc<Invoker>,
    pub workflows: Arc<Workflows>,
    pub security: Arc<SecurityWorkflows>,
    pub workers: usize,
    pub checkpoint: Option<PathBuf>,
    pub checkpoint_interval: usize,
}

/// Outcome of one program execution.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    /// The program result string (final value, notice, or error string).
    pub result: String,
    /// `Some(kind)` when a Budget/Depth error terminated the program.
    pub aborted: Option<String>,
    /// Session counters at termination.
    pub stats: SessionStats,
}

/// Walk an error chain looking for an [`RlmError`] classification.
fn classify_error(err: &mlua::Error) -> Option<String> {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        if let Some(rlm) = e.downcast_ref::<RlmError>() {
            return Some(rlm.kind().to_string());
        }
        source = e.source();
    }
    // Raised errors that crossed a Lua pcall boundary survive only as
    // message text; fall back to matching the classification prefix.
    let message = err.to_string();
    ["BudgetExceeded", "RecursionDepthExceeded"]
        .into_iter()
        .find(|kind| message.contains(kind))
        .map(str::to_string)
}

/// Execute a user program against a corpus.
///
/// The environment bindings are exactly the capability surface registered
/// by [`lua_env::register_rlm_api`] plus the `emails` and `metadata`
/// values. Mail-source and configuration errors have already been
/// resolved by the time this runs.
pub async fn run_program(
    program: String,
    corpus: Corpus,
    env: RlmEnv,
) -> Result<ExecutionReport, RlmError> {
    let handle = tokio::runtime::Handle::current();
    let session = Arc::clone(env.invoker.session());

    let outcome = tokio::task::spawn_blocking(move || -> Result<(Option<String>, Option<String>), RlmError> {
        let lua = Lua::new();
        let state = ExecState::new();

        lua_env::register_rlm_api(&lua, &env, &handle, &state)
            .map_err(|e| RlmError::Configuration(format!("environment setup failed: {}", e)))?;

        let emails_json = serde_json::to_value(&corpus.records)
            .map_err(|e| RlmError::Configuration(format!("corpus encoding failed: {}", e)))?;
        let metadata_json = serde_json::to_value(&corpus.metadata)
            .map_err(|e| RlmError::Configuration(format!("corpus encoding failed: {}", e)))?;

        let setup = (|| -> LuaResult<()> {
            let globals = lua.globals();
            globals.set("emails", lua_env::json_value_to_lua(&lua, &emails_json)?)?;
            globals.set("metadata", lua_env::json_value_to_lua(&lua, &metadata_json)?)?;
            Ok(())
        })();
        if let Err(e) = setup {
            return Err(RlmError::Configuration(format!(
                "environment setup failed: {}",
                e
            )));
        }

        let exec_result = lua.load(&program).set_name("rlm-program").exec();

        let final_result = state.final_result.lock().unwrap().clone();
        let mut aborted = state.aborted.lock().unwrap().clone();

        let result = match exec_result {
            Ok(()) => final_result,
            Err(err) => {
                if let Some(kind) = classify_error(&err) {
                    if aborted.is_none() {
                        aborted = Some(kind);
                    }
                }
                // A final value set before the failure still stands;
                // otherwise the error becomes the result string.
                Some(final_result.unwrap_or_else(|| format!("[Execution Error: {}]", err)))
            }
        };

        Ok((result, aborted))
    })
    .await
    .map_err(|e| RlmError::Configuration(format!("executor task failed: {}", e)))??;

    let (result, aborted) = outcome;
    Ok(ExecutionReport {
        result: result.unwrap_or_else(|| NO_FINAL_NOTICE.to_string()),
        aborted,
        stats: session.stats(),
    })
}

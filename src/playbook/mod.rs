//! Playbook execution engine: state machine, step dispatch, and
//! persistence-after-every-step durability.
//!
//! Ported from `playbook_engine.py`. Unlike the original's Python class
//! hierarchy dispatched via `isinstance`, steps here are a tagged `enum`
//! ([`parser::Step`]) matched in [`run_execution`] - the same "replace a
//! dynamic mapping with a typed struct" approach used throughout this
//! workspace (see `store::models`).

pub mod parser;
pub mod steps;

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde_json::Value as Json;
use thiserror::Error;

use crate::store::models::{ExecutionStatus, StepResultStatus};
use crate::store::{Store, StoreError};

pub use parser::{Approval, ParseError, ParsedPlaybook, Step};
pub use steps::{StepDeps, StepOutcome};

/// Parameters for starting a new playbook execution.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub service_id: Option<i64>,
    pub alert_id: Option<i64>,
    pub consecutive_failures: Option<i64>,
    pub trigger_id: Option<i64>,
    pub extra_context: Option<serde_json::Map<String, Json>>,
}

/// Errors from engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("playbook not found")]
    PlaybookNotFound,
    #[error("execution not found")]
    ExecutionNotFound,
    #[error("execution is already in a terminal state")]
    AlreadyTerminal,
    #[error("execution is not pending approval")]
    NotPendingApproval,
}

/// Build the initial execution context: standard bindings per spec §3 plus
/// any caller-supplied extras.
fn build_initial_context(playbook_name: &str, opts: &StartOptions) -> serde_json::Map<String, Json> {
    let mut context = serde_json::Map::new();
    context.insert("PLAYBOOK_NAME".to_owned(), Json::String(playbook_name.to_owned()));
    if let Some(service_id) = opts.service_id {
        context.insert("SERVICE_ID".to_owned(), Json::from(service_id));
    }
    if let Some(alert_id) = opts.alert_id {
        context.insert("ALERT_ID".to_owned(), Json::from(alert_id));
    }
    if let Some(consecutive_failures) = opts.consecutive_failures {
        context.insert("CONSECUTIVE_FAILURES".to_owned(), Json::from(consecutive_failures));
    }
    if let Some(trigger_id) = opts.trigger_id {
        context.insert("TRIGGER_ID".to_owned(), Json::from(trigger_id));
    }
    if let Some(extra) = &opts.extra_context {
        for (k, v) in extra {
            context.insert(k.clone(), v.clone());
        }
    }
    context
}

fn json_to_var_string(value: &Json) -> String {
    match value {
        Json::String(s) => s.clone(),
        Json::Null => String::new(),
        other => other.to_string(),
    }
}

/// Flatten the execution's JSON context into the string map step executors
/// substitute `${VAR}` references from.
fn context_to_vars(context: &Json) -> BTreeMap<String, String> {
    match context {
        Json::Object(map) => map.iter().map(|(k, v)| (k.clone(), json_to_var_string(v))).collect(),
        _ => BTreeMap::new(),
    }
}

/// Start a new execution of `playbook_id`.
///
/// The initial status is `running` if the playbook requires no approval,
/// else `pending_approval` (even for `timeout:Nmin` - auto-approval is a
/// scheduled transition evaluated by [`run_execution`], not immediate).
pub async fn start_execution(store: &Store, playbook_id: i64, opts: StartOptions, now: DateTime<Utc>) -> Result<i64, EngineError> {
    let _ = now;
    let row = store.get_playbook(playbook_id).await?.ok_or(EngineError::PlaybookNotFound)?;
    let parsed = parser::parse_yaml(&row.yaml_content)?;

    let status = match parsed.approval {
        Approval::None => ExecutionStatus::Running,
        Approval::Required | Approval::Timeout { .. } => ExecutionStatus::PendingApproval,
    };

    let mut context = build_initial_context(&parsed.name, &opts);
    let execution_id = store.insert_execution(playbook_id, opts.service_id, status, &Json::Object(context.clone())).await?;
    context.insert("EXECUTION_ID".to_owned(), Json::from(execution_id));
    store
        .update_execution(execution_id, status, 0, &Json::Object(context), None)
        .await?;
    Ok(execution_id)
}

/// Manually approve a `pending_approval` execution, moving it to `running`.
pub async fn approve(store: &Store, execution_id: i64) -> Result<(), EngineError> {
    let exec = store.get_execution(execution_id).await?.ok_or(EngineError::ExecutionNotFound)?;
    if exec.status != ExecutionStatus::PendingApproval {
        return Err(EngineError::NotPendingApproval);
    }
    store
        .update_execution(execution_id, ExecutionStatus::Running, exec.current_step, &exec.context, None)
        .await?;
    Ok(())
}

/// Cancel an execution that hasn't reached a terminal state yet.
pub async fn cancel(store: &Store, execution_id: i64) -> Result<(), EngineError> {
    let exec = store.get_execution(execution_id).await?.ok_or(EngineError::ExecutionNotFound)?;
    if exec.status.is_terminal() {
        return Err(EngineError::AlreadyTerminal);
    }
    store
        .update_execution(execution_id, ExecutionStatus::Cancelled, exec.current_step, &exec.context, None)
        .await?;
    Ok(())
}

async fn complete_running_step_result(store: &Store, execution_id: i64, step_index: i64, output: Option<&str>) -> Result<(), StoreError> {
    let results = store.step_results_for_execution(execution_id).await?;
    if let Some(r) = results.into_iter().find(|r| r.step_index == step_index && r.status == StepResultStatus::Running) {
        store.update_step_result(r.id, StepResultStatus::Completed, output, None).await?;
    }
    Ok(())
}

/// Drive an execution forward: resolve a due approval/wait transition, then
/// dispatch steps sequentially, persisting after every one, until the
/// execution reaches a terminal state or a `waiting`/`pending_approval`
/// state that isn't due yet.
pub async fn run_execution(store: &Store, deps: &StepDeps, execution_id: i64, now: DateTime<Utc>) -> Result<ExecutionStatus, EngineError> {
    loop {
        let exec = store.get_execution(execution_id).await?.ok_or(EngineError::ExecutionNotFound)?;

        match exec.status {
            ExecutionStatus::PendingApproval => {
                let playbook_row = store.get_playbook(exec.playbook_id).await?.ok_or(EngineError::PlaybookNotFound)?;
                let due = match playbook_row.approval_timeout_minutes {
                    Some(minutes) => now >= exec.created_at + chrono::Duration::minutes(minutes),
                    None => false,
                };
                if !due {
                    return Ok(exec.status);
                }
                store
                    .update_execution(execution_id, ExecutionStatus::Running, exec.current_step, &exec.context, None)
                    .await?;
            }

            ExecutionStatus::Waiting => {
                let Some(resume_at) = exec.resume_at else {
                    return Ok(exec.status);
                };
                if now < resume_at {
                    return Ok(exec.status);
                }
                complete_running_step_result(store, execution_id, exec.current_step, Some("wait elapsed")).await?;
                store
                    .update_execution(execution_id, ExecutionStatus::Running, exec.current_step + 1, &exec.context, None)
                    .await?;
            }

            ExecutionStatus::Running => {
                let playbook_row = store.get_playbook(exec.playbook_id).await?.ok_or(EngineError::PlaybookNotFound)?;
                let parsed = parser::parse_yaml(&playbook_row.yaml_content)?;

                if exec.current_step as usize >= parsed.steps.len() {
                    store
                        .update_execution(execution_id, ExecutionStatus::Completed, exec.current_step, &exec.context, None)
                        .await?;
                    return Ok(ExecutionStatus::Completed);
                }

                let step = &parsed.steps[exec.current_step as usize];
                let vars = context_to_vars(&exec.context);
                let step_result_id = store
                    .insert_step_result(execution_id, step.name(), exec.current_step, StepResultStatus::Running)
                    .await?;
                let mut secrets_cache: HashMap<String, String> = HashMap::new();

                let outcome = match step {
                    Step::Webhook(s) => steps::execute_webhook(deps, store, s, &vars, &mut secrets_cache).await,
                    Step::Script(s) => {
                        steps::execute_script(deps, store, s, &vars, &mut secrets_cache, execution_id, exec.playbook_id, exec.service_id).await
                    }
                    Step::Wait(s) => steps::execute_wait(s, now),
                    Step::Condition(s) => steps::execute_condition(store, s, exec.service_id, execution_id, now).await,
                };

                match outcome {
                    StepOutcome::Completed { output } => {
                        store
                            .update_step_result(step_result_id, StepResultStatus::Completed, output.as_deref(), None)
                            .await?;
                        store
                            .update_execution(execution_id, ExecutionStatus::Running, exec.current_step + 1, &exec.context, None)
                            .await?;
                    }
                    StepOutcome::Failed { output, error_message } => {
                        store
                            .update_step_result(step_result_id, StepResultStatus::Failed, output.as_deref(), Some(&error_message))
                            .await?;
                        store
                            .update_execution(execution_id, ExecutionStatus::Failed, exec.current_step, &exec.context, None)
                            .await?;
                        return Ok(ExecutionStatus::Failed);
                    }
                    StepOutcome::Waiting { resume_at } => {
                        // The step result stays `running` until the wait
                        // elapses (handled by the `Waiting` branch above),
                        // matching the engine's "persist after every step"
                        // rule without prematurely marking it complete.
                        store
                            .update_execution(execution_id, ExecutionStatus::Waiting, exec.current_step, &exec.context, Some(resume_at))
                            .await?;
                        return Ok(ExecutionStatus::Waiting);
                    }
                }
            }

            terminal => return Ok(terminal),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::SecretsManager;
    use crate::store::models::{RegisteredScript, Service};
    use crate::url_validator::UrlValidator;
    use std::sync::Arc;

    fn deps() -> StepDeps {
        StepDeps {
            http: reqwest::Client::new(),
            url_validator: Arc::new(UrlValidator::new()),
            secrets: Arc::new(SecretsManager::from_key_bytes(&[3u8; 32])),
            script_memory_limit_kb: 262_144,
            script_cpu_grace_secs: 5,
            env_lookup: Arc::new(|_: &str| None),
        }
    }

    async fn seed_playbook(store: &Store, yaml: &str, approval: &str, timeout_minutes: Option<i64>) -> i64 {
        store
            .insert_playbook("p", "desc", yaml, 1, approval, timeout_minutes)
            .await
            .expect("insert playbook")
    }

    #[tokio::test]
    async fn no_approval_playbook_starts_running() {
        let store = Store::open_in_memory().await.expect("open store");
        let yaml = "name: p\nsteps:\n  - name: w\n    type: wait\n    duration: 1s\n";
        let playbook_id = seed_playbook(&store, yaml, "none", None).await;

        let execution_id = start_execution(&store, playbook_id, StartOptions::default(), Utc::now()).await.expect("start");
        let exec = store.get_execution(execution_id).await.expect("get").expect("exists");
        assert_eq!(exec.status, ExecutionStatus::Running);
        assert_eq!(exec.context.get("EXECUTION_ID").and_then(Json::as_i64), Some(execution_id));
    }

    #[tokio::test]
    async fn required_approval_playbook_starts_pending() {
        let store = Store::open_in_memory().await.expect("open store");
        let yaml = "name: p\nsteps:\n  - name: w\n    type: wait\n    duration: 1s\n";
        let playbook_id = seed_playbook(&store, yaml, "required", None).await;

        let execution_id = start_execution(&store, playbook_id, StartOptions::default(), Utc::now()).await.expect("start");
        let exec = store.get_execution(execution_id).await.expect("get").expect("exists");
        assert_eq!(exec.status, ExecutionStatus::PendingApproval);
    }

    #[tokio::test]
    async fn pending_approval_auto_approves_after_timeout() {
        let store = Store::open_in_memory().await.expect("open store");
        let yaml = "name: p\nsteps:\n  - name: w\n    type: wait\n    duration: 1s\n";
        let playbook_id = seed_playbook(&store, yaml, "timeout", Some(5)).await;

        let execution_id = start_execution(&store, playbook_id, StartOptions::default(), Utc::now()).await.expect("start");
        let not_yet = run_execution(&store, &deps(), execution_id, Utc::now()).await.expect("advance");
        assert_eq!(not_yet, ExecutionStatus::PendingApproval);

        let later = Utc::now() + chrono::Duration::minutes(6);
        let status = run_execution(&store, &deps(), execution_id, later).await.expect("advance");
        assert_eq!(status, ExecutionStatus::Waiting);
    }

    #[tokio::test]
    async fn manual_approve_transitions_to_running() {
        let store = Store::open_in_memory().await.expect("open store");
        let yaml = "name: p\nsteps:\n  - name: w\n    type: wait\n    duration: 1s\n";
        let playbook_id = seed_playbook(&store, yaml, "required", None).await;
        let execution_id = start_execution(&store, playbook_id, StartOptions::default(), Utc::now()).await.expect("start");

        approve(&store, execution_id).await.expect("approve");
        let exec = store.get_execution(execution_id).await.expect("get").expect("exists");
        assert_eq!(exec.status, ExecutionStatus::Running);
    }

    #[tokio::test]
    async fn wait_step_then_resume_advances_to_completed() {
        let store = Store::open_in_memory().await.expect("open store");
        let yaml = "name: p\nsteps:\n  - name: w\n    type: wait\n    duration: 1s\n";
        let playbook_id = seed_playbook(&store, yaml, "none", None).await;
        let execution_id = start_execution(&store, playbook_id, StartOptions::default(), Utc::now()).await.expect("start");

        let now = Utc::now();
        let status = run_execution(&store, &deps(), execution_id, now).await.expect("advance");
        assert_eq!(status, ExecutionStatus::Waiting);

        let resumed = run_execution(&store, &deps(), execution_id, now + chrono::Duration::seconds(2)).await.expect("advance");
        assert_eq!(resumed, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn script_step_unknown_name_fails_execution() {
        let store = Store::open_in_memory().await.expect("open store");
        let yaml = "name: p\nsteps:\n  - name: s\n    type: script\n    script: does-not-exist\n";
        let playbook_id = seed_playbook(&store, yaml, "none", None).await;
        let execution_id = start_execution(&store, playbook_id, StartOptions::default(), Utc::now()).await.expect("start");

        let status = run_execution(&store, &deps(), execution_id, Utc::now()).await.expect("advance");
        assert_eq!(status, ExecutionStatus::Failed);

        let results = store.step_results_for_execution(execution_id).await.expect("results");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, StepResultStatus::Failed);
        assert!(results[0].error_message.as_deref().unwrap_or_default().contains("not found"));
    }

    #[tokio::test]
    async fn condition_step_without_service_fails() {
        let store = Store::open_in_memory().await.expect("open store");
        let yaml = "name: p\nsteps:\n  - name: c\n    type: condition\n    check: heartbeat_received\n    timeout: 1s\n";
        let playbook_id = seed_playbook(&store, yaml, "none", None).await;
        let execution_id = start_execution(&store, playbook_id, StartOptions::default(), Utc::now()).await.expect("start");

        let status = run_execution(&store, &deps(), execution_id, Utc::now()).await.expect("advance");
        assert_eq!(status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn cancel_blocks_further_advancement() {
        let store = Store::open_in_memory().await.expect("open store");
        let yaml = "name: p\nsteps:\n  - name: w\n    type: wait\n    duration: 1s\n";
        let playbook_id = seed_playbook(&store, yaml, "required", None).await;
        let execution_id = start_execution(&store, playbook_id, StartOptions::default(), Utc::now()).await.expect("start");

        cancel(&store, execution_id).await.expect("cancel");
        let again = cancel(&store, execution_id).await;
        assert!(matches!(again, Err(EngineError::AlreadyTerminal)));

        let status = run_execution(&store, &deps(), execution_id, Utc::now()).await.expect("advance");
        assert_eq!(status, ExecutionStatus::Cancelled);
    }
}

//! Step executors: Webhook, Script, Wait, Condition.
//!
//! Grounded in `playbook/executors/{webhook,script,wait,condition}.py` for
//! the exact substitution order (plain variables, then secrets) and output
//! message templates, and in the teacher's `flatline/src/fixer.rs` for the
//! `spawn_blocking` + `std::process::Command` subprocess pattern. Resource
//! limits use a shell wrapper (`ulimit` + `timeout --kill-after`) rather
//! than `preexec_fn`/`setrlimit`, since this workspace forbids `unsafe`
//! code (see DESIGN.md).

use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::Client;
use serde_json::Value as Json;

use crate::playbook::parser::{ConditionStep, ConditionType, OnFailure, ScriptStep, WaitStep, WebhookStep};
use crate::secrets::SecretsManager;
use crate::store::models::ExecutionStatus;
use crate::store::Store;
use crate::url_validator::UrlValidator;

const MAX_SCRIPT_OUTPUT_BYTES: usize = 8192;
const MAX_WEBHOOK_RESPONSE_BYTES: usize = 4096;
const CONDITION_POLL_SECS: u64 = 5;
const ALLOWED_SCRIPT_ENV_VARS: &[&str] = &["PATH", "HOME", "USER", "LANG", "LC_ALL", "TZ"];

/// Outcome of running a single step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Completed { output: Option<String> },
    Failed { output: Option<String>, error_message: String },
    Waiting { resume_at: DateTime<Utc> },
}

/// Collaborators every step executor needs, bundled so `mod.rs`'s dispatch
/// doesn't have to thread each one through individually.
#[derive(Clone)]
pub struct StepDeps {
    pub http: Client,
    pub url_validator: Arc<UrlValidator>,
    pub secrets: Arc<SecretsManager>,
    pub script_memory_limit_kb: u64,
    pub script_cpu_grace_secs: u64,
    pub env_lookup: Arc<dyn Fn(&str) -> Option<String> + Send + Sync>,
}

fn variable_pattern() -> &'static Regex {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex"))
}

fn truncate(s: &str, max_bytes: usize, suffix: &str) -> String {
    if s.len() <= max_bytes {
        return s.to_owned();
    }
    let mut cut = max_bytes;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{}", &s[..cut], suffix)
}

/// Recursively substitute `${VAR}` references in a JSON value's string
/// leaves from `vars`. Unknown names are left as the literal placeholder.
pub fn substitute_vars(value: &Json, vars: &BTreeMap<String, String>) -> Json {
    match value {
        Json::String(s) => {
            let replaced = variable_pattern().replace_all(s, |caps: &regex::Captures| {
                vars.get(&caps[1]).cloned().unwrap_or_else(|| caps[0].to_owned())
            });
            Json::String(replaced.into_owned())
        }
        Json::Array(items) => Json::Array(items.iter().map(|v| substitute_vars(v, vars)).collect()),
        Json::Object(map) => Json::Object(map.iter().map(|(k, v)| (k.clone(), substitute_vars(v, vars))).collect()),
        other => other.clone(),
    }
}

/// Substitute plain `${VAR}` references, then `${secrets.NAME}` references,
/// in that order, matching the original's `substitute_all`.
async fn substitute_all(
    store: &Store,
    secrets: &SecretsManager,
    value: &Json,
    vars: &BTreeMap<String, String>,
    secrets_cache: &mut HashMap<String, String>,
) -> Result<Json, crate::secrets::SecretsError> {
    let after_vars = substitute_vars(value, vars);
    secrets.interpolate_json(store, &after_vars, secrets_cache).await
}

// -- Webhook --

pub async fn execute_webhook(
    deps: &StepDeps,
    store: &Store,
    step: &WebhookStep,
    vars: &BTreeMap<String, String>,
    secrets_cache: &mut HashMap<String, String>,
) -> StepOutcome {
    let url = match substitute_all(store, &deps.secrets, &Json::String(step.url.clone()), vars, secrets_cache).await {
        Ok(Json::String(s)) => s,
        Ok(_) => step.url.clone(),
        Err(e) => {
            return StepOutcome::Failed {
                output: None,
                error_message: format!("Variable/secret substitution failed: {e}"),
            }
        }
    };

    let headers_json: Json = Json::Object(step.headers.iter().map(|(k, v)| (k.clone(), Json::String(v.clone()))).collect());
    let headers = match substitute_all(store, &deps.secrets, &headers_json, vars, secrets_cache).await {
        Ok(v) => v,
        Err(e) => {
            return StepOutcome::Failed {
                output: None,
                error_message: format!("Variable/secret substitution failed: {e}"),
            }
        }
    };

    let body = match &step.body {
        Some(b) => match substitute_all(store, &deps.secrets, b, vars, secrets_cache).await {
            Ok(v) => Some(v),
            Err(e) => {
                return StepOutcome::Failed {
                    output: None,
                    error_message: format!("Variable/secret substitution failed: {e}"),
                }
            }
        },
        None => None,
    };

    if deps.url_validator.validate(&url).await.is_err() {
        return StepOutcome::Failed {
            output: None,
            error_message: "Invalid webhook URL".to_owned(),
        };
    }

    let method = match step.method.as_str() {
        "GET" => reqwest::Method::GET,
        "PUT" => reqwest::Method::PUT,
        "PATCH" => reqwest::Method::PATCH,
        "DELETE" => reqwest::Method::DELETE,
        _ => reqwest::Method::POST,
    };

    let mut request = deps
        .http
        .request(method, &url)
        .timeout(Duration::from_secs(step.timeout_seconds))
        .header("Content-Type", "application/json");
    if let Json::Object(map) = &headers {
        for (k, v) in map {
            if let Some(v) = v.as_str() {
                request = request.header(k, v);
            }
        }
    }
    if let Some(body) = &body {
        request = request.json(body);
    }

    match request.send().await {
        Ok(response) => {
            let status = response.status().as_u16();
            let body_text = response.text().await.unwrap_or_default();
            let truncated = truncate(&body_text, MAX_WEBHOOK_RESPONSE_BYTES, "...[truncated]");
            let output = format!("HTTP {} {url}\nStatus: {status}\nResponse: {truncated}", step.method);
            if step.success_codes.contains(&status) {
                StepOutcome::Completed { output: Some(output) }
            } else {
                StepOutcome::Failed {
                    output: Some(output),
                    error_message: format!("Unexpected status code {status}. Expected one of {:?}", step.success_codes),
                }
            }
        }
        Err(e) if e.is_timeout() => StepOutcome::Failed {
            output: None,
            error_message: format!("Request timed out after {}s", step.timeout_seconds),
        },
        Err(e) => StepOutcome::Failed {
            output: None,
            error_message: format!("Request failed: {e}"),
        },
    }
}

// -- Script --

fn shell_escape(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

pub async fn execute_script(
    deps: &StepDeps,
    store: &Store,
    step: &ScriptStep,
    vars: &BTreeMap<String, String>,
    secrets_cache: &mut HashMap<String, String>,
    execution_id: i64,
    playbook_id: i64,
    service_id: Option<i64>,
) -> StepOutcome {
    let script = match store.get_registered_script(&step.script_name).await {
        Ok(Some(s)) => s,
        Ok(None) => {
            return StepOutcome::Failed {
                output: None,
                error_message: format!(
                    "Script '{}' not found in registered scripts. Only pre-registered scripts can be executed for security.",
                    step.script_name
                ),
            }
        }
        Err(e) => {
            return StepOutcome::Failed {
                output: None,
                error_message: format!("Failed to look up registered script: {e}"),
            }
        }
    };

    let mut merged_params = vars.clone();
    if let Json::Object(map) = &step.parameters {
        for (k, v) in map {
            if let Some(s) = v.as_str() {
                merged_params.insert(k.clone(), s.to_owned());
            } else {
                merged_params.insert(k.clone(), v.to_string());
            }
        }
    }

    let content = match substitute_all(
        store,
        &deps.secrets,
        &Json::String(script.content.clone()),
        &merged_params,
        secrets_cache,
    )
    .await
    {
        Ok(Json::String(s)) => s,
        Ok(_) => script.content.clone(),
        Err(e) => {
            return StepOutcome::Failed {
                output: None,
                error_message: format!("Variable/secret substitution failed: {e}"),
            }
        }
    };

    let (interpreter_bin, suffix) = match script.interpreter.as_str() {
        "python" => ("python3", ".py"),
        "bash" => ("bash", ".sh"),
        other => {
            return StepOutcome::Failed {
                output: None,
                error_message: format!("Unsupported interpreter: {other}"),
            }
        }
    };

    let timeout_secs = if step.timeout_seconds > 0 {
        step.timeout_seconds
    } else if script.default_timeout_seconds > 0 {
        script.default_timeout_seconds as u64
    } else {
        30
    };

    let tmp_path = match write_temp_script(&content, suffix) {
        Ok(p) => p,
        Err(e) => {
            return StepOutcome::Failed {
                output: None,
                error_message: format!("Script execution failed: {e}"),
            }
        }
    };

    let env_vars = script_env(&deps.env_lookup, execution_id, playbook_id, service_id);
    let memory_limit_kb = deps.script_memory_limit_kb;
    let cpu_limit_secs = timeout_secs.saturating_add(deps.script_cpu_grace_secs);
    let interpreter_cmd = match interpreter_bin {
        "python3" => format!("exec python3 -u {}", shell_escape(&tmp_path)),
        _ => format!("exec bash -e {}", shell_escape(&tmp_path)),
    };
    let inner = format!("ulimit -v {memory_limit_kb}; ulimit -t {cpu_limit_secs}; {interpreter_cmd}");
    let wrapped = format!(
        "timeout --signal=TERM --kill-after=5 {timeout_secs} bash -lc {}",
        shell_escape(&inner)
    );

    let run_path = tmp_path.clone();
    let output = tokio::task::spawn_blocking(move || {
        std::process::Command::new("bash")
            .arg("-lc")
            .arg(wrapped)
            .env_clear()
            .envs(env_vars)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
    })
    .await;

    let _ = std::fs::remove_file(&run_path);

    let output = match output {
        Ok(Ok(o)) => o,
        Ok(Err(e)) => {
            return StepOutcome::Failed {
                output: None,
                error_message: format!("Script execution failed: {e}"),
            }
        }
        Err(e) => {
            return StepOutcome::Failed {
                output: None,
                error_message: format!("Script execution failed: {e}"),
            }
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    let mut combined = stdout;
    if !stderr.is_empty() {
        combined.push_str("\n[STDERR]\n");
        combined.push_str(&stderr);
    }
    let combined = truncate(&combined, MAX_SCRIPT_OUTPUT_BYTES, "\n...[output truncated]");

    let exit_code = output.status.code();
    let output_msg = format!(
        "Script: {}\nInterpreter: {}\nExit code: {}\nOutput:\n{combined}",
        step.script_name,
        script.interpreter,
        exit_code.map(|c| c.to_string()).unwrap_or_else(|| "killed by signal".to_owned()),
    );

    // `timeout` exits 124 when it kills the child for exceeding the wall
    // clock budget.
    if exit_code == Some(124) {
        return StepOutcome::Failed {
            output: Some(output_msg),
            error_message: format!("Script execution timed out after {timeout_secs}s"),
        };
    }

    match exit_code {
        Some(0) => StepOutcome::Completed { output: Some(output_msg) },
        Some(code) => StepOutcome::Failed {
            output: Some(output_msg),
            error_message: format!("Script exited with code {code}"),
        },
        None => StepOutcome::Failed {
            output: Some(output_msg),
            error_message: "Script execution failed: terminated by signal".to_owned(),
        },
    }
}

fn write_temp_script(content: &str, suffix: &str) -> std::io::Result<String> {
    let dir = std::env::temp_dir();
    let name = format!("medic-script-{}{suffix}", uuid::Uuid::new_v4());
    let path = dir.join(name);
    std::fs::write(&path, content)?;
    Ok(path.to_string_lossy().into_owned())
}

fn script_env(
    env_lookup: &Arc<dyn Fn(&str) -> Option<String> + Send + Sync>,
    execution_id: i64,
    playbook_id: i64,
    service_id: Option<i64>,
) -> Vec<(String, String)> {
    let mut allowed: Vec<String> = ALLOWED_SCRIPT_ENV_VARS.iter().map(|s| (*s).to_owned()).collect();
    if let Some(extra) = env_lookup("MEDIC_ADDITIONAL_SCRIPT_ENV_VARS") {
        for name in extra.split(',') {
            let name = name.trim();
            if !name.is_empty() {
                allowed.push(name.to_owned());
            }
        }
    }

    let mut env: Vec<(String, String)> = allowed
        .into_iter()
        .filter_map(|name| env_lookup(&name).map(|value| (name, value)))
        .collect();
    env.push(("MEDIC_EXECUTION_ID".to_owned(), execution_id.to_string()));
    env.push(("MEDIC_PLAYBOOK_ID".to_owned(), playbook_id.to_string()));
    env.push(("MEDIC_SERVICE_ID".to_owned(), service_id.map(|s| s.to_string()).unwrap_or_default()));
    env
}

// -- Wait --

pub fn execute_wait(step: &WaitStep, now: DateTime<Utc>) -> StepOutcome {
    StepOutcome::Waiting {
        resume_at: now + chrono::Duration::seconds(step.duration_seconds as i64),
    }
}

// -- Condition --

pub async fn execute_condition(
    store: &Store,
    step: &ConditionStep,
    service_id: Option<i64>,
    execution_id: i64,
    now: DateTime<Utc>,
) -> StepOutcome {
    let Some(service_id) = service_id else {
        return StepOutcome::Failed {
            output: None,
            error_message: "No service_id available for condition check. Provide service_id in execution or step parameters.".to_owned(),
        };
    };

    let min_count = step.parameters.get("min_count").and_then(Json::as_i64).unwrap_or(1);
    let status_filter = step.parameters.get("status").and_then(Json::as_str);

    let condition_start = now;
    let mut last_count = 0i64;
    loop {
        let count = match store.heartbeat_count_since_with_status(service_id, condition_start, status_filter).await {
            Ok(c) => c,
            Err(e) => {
                return StepOutcome::Failed {
                    output: None,
                    error_message: format!("Failed to query heartbeat events: {e}"),
                }
            }
        };
        last_count = count;
        if count >= min_count {
            break;
        }

        let elapsed = (Utc::now() - condition_start).num_seconds().max(0) as u64;
        if elapsed >= step.timeout_seconds {
            break;
        }
        let remaining = step.timeout_seconds.saturating_sub(elapsed);
        tokio::time::sleep(Duration::from_secs(remaining.min(CONDITION_POLL_SECS))).await;

        // Re-check cancellation after every poll interval rather than only
        // at timeout/completion, so a cancelled execution doesn't keep a
        // condition step blocked for up to `timeout_seconds`.
        match store.get_execution(execution_id).await {
            Ok(Some(exec)) if exec.status == ExecutionStatus::Cancelled => {
                return StepOutcome::Failed {
                    output: None,
                    error_message: "Execution was cancelled while waiting on condition".to_owned(),
                };
            }
            Ok(_) => {}
            Err(e) => {
                return StepOutcome::Failed {
                    output: None,
                    error_message: format!("Failed to check execution status: {e}"),
                }
            }
        }
    }

    let elapsed_total = (Utc::now() - condition_start).num_milliseconds().max(0) as f64 / 1000.0;
    let condition_met = last_count >= min_count;
    let last_message = if condition_met {
        format!("Heartbeat received: {last_count} heartbeat(s) since {}", condition_start.to_rfc3339())
    } else {
        format!("Waiting for heartbeat: {last_count}/{min_count} received since {}", condition_start.to_rfc3339())
    };

    if condition_met {
        let output = format!("Condition '{}' met after {elapsed_total:.1}s\n{last_message}", step.condition_type.as_str());
        return StepOutcome::Completed { output: Some(output) };
    }

    let timeout_msg = format!("Condition '{}' timed out after {elapsed_total:.1}s\n{last_message}", step.condition_type.as_str());
    match step.on_failure {
        OnFailure::Continue => StepOutcome::Completed {
            output: Some(format!("{timeout_msg}\n(Continuing due to on_failure=continue)")),
        },
        OnFailure::Escalate => StepOutcome::Failed {
            output: Some(format!("{timeout_msg}\n[ESCALATE] Condition failure requires escalation")),
            error_message: format!("Condition timed out after {elapsed_total:.1}s. Escalating to on-call: {last_message}"),
        },
        OnFailure::Fail => StepOutcome::Failed {
            output: Some(timeout_msg),
            error_message: format!("Condition timed out after {elapsed_total:.1}s: {last_message}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_known_and_leaves_unknown() {
        let mut vars = BTreeMap::new();
        vars.insert("SERVICE_NAME".to_owned(), "worker-1".to_owned());
        let value = Json::String("service=${SERVICE_NAME} unknown=${MISSING}".to_owned());
        let result = substitute_vars(&value, &vars);
        assert_eq!(result, Json::String("service=worker-1 unknown=${MISSING}".to_owned()));
    }

    #[test]
    fn substitutes_recursively_through_object_and_array() {
        let mut vars = BTreeMap::new();
        vars.insert("X".to_owned(), "1".to_owned());
        let value = serde_json::json!({"a": "${X}", "b": ["${X}", "lit"]});
        let result = substitute_vars(&value, &vars);
        assert_eq!(result, serde_json::json!({"a": "1", "b": ["1", "lit"]}));
    }

    #[test]
    fn leaves_secrets_pattern_untouched() {
        let vars = BTreeMap::new();
        let value = Json::String("${secrets.API_KEY}".to_owned());
        let result = substitute_vars(&value, &vars);
        assert_eq!(result, value);
    }

    #[test]
    fn truncate_appends_suffix_only_when_over_limit() {
        assert_eq!(truncate("short", 100, "..."), "short");
        assert_eq!(truncate("0123456789", 5, "..."), "01234...");
    }

    #[tokio::test]
    async fn wait_step_computes_resume_at() {
        let step = WaitStep { name: "w".to_owned(), duration_seconds: 30 };
        let now = Utc::now();
        match execute_wait(&step, now) {
            StepOutcome::Waiting { resume_at } => {
                assert_eq!(resume_at, now + chrono::Duration::seconds(30));
            }
            other => panic!("expected Waiting, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn condition_without_service_id_fails_immediately() {
        let store = Store::open_in_memory().await.expect("open store");
        let step = ConditionStep {
            name: "c".to_owned(),
            condition_type: ConditionType::HeartbeatReceived,
            timeout_seconds: 1,
            on_failure: OnFailure::Fail,
            parameters: Json::Object(serde_json::Map::new()),
        };
        let outcome = execute_condition(&store, &step, None, 0, Utc::now()).await;
        assert!(matches!(outcome, StepOutcome::Failed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn condition_step_stops_promptly_when_execution_is_cancelled() {
        let store = Store::open_in_memory().await.expect("open store");
        let now = chrono::Utc::now();
        let service = crate::store::models::Service {
            id: 0,
            heartbeat_name: "svc".to_owned(),
            service_name: "svc".to_owned(),
            active: true,
            muted: false,
            down: false,
            alert_interval: 5,
            threshold: 1,
            grace_period_seconds: 0,
            team_id: None,
            priority: "p3".to_owned(),
            runbook: None,
            max_duration_ms: None,
            created_at: now,
            updated_at: now,
        };
        let service_id = store.insert_service(&service).await.expect("insert service");
        let playbook_id = store
            .insert_playbook("pb", "desc", "name: pb\nsteps: []\n", 1, "none", None)
            .await
            .expect("insert playbook");
        let execution_id = store
            .insert_execution(playbook_id, Some(service_id), ExecutionStatus::Running, &Json::Object(serde_json::Map::new()))
            .await
            .expect("insert execution");
        store
            .update_execution(execution_id, ExecutionStatus::Cancelled, 0, &Json::Object(serde_json::Map::new()), None)
            .await
            .expect("cancel execution");

        let step = ConditionStep {
            name: "c".to_owned(),
            condition_type: ConditionType::HeartbeatReceived,
            timeout_seconds: 3600,
            on_failure: OnFailure::Fail,
            parameters: Json::Object(serde_json::Map::new()),
        };

        let outcome = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            execute_condition(&store, &step, Some(service_id), execution_id, now),
        )
        .await
        .expect("condition step did not observe cancellation promptly");
        assert!(matches!(outcome, StepOutcome::Failed { .. }));
    }
}

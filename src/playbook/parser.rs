//! Playbook YAML parsing and validation.
//!
//! Ported from `playbook_parser.py`: a hand-rolled walk over a
//! `serde_yaml::Value` mapping rather than a derived `Deserialize`, because
//! the original's duration strings (`"30s"`, `"5m"`, `"1h"`) and approval
//! setting (`"timeout:5m"`) need custom parsing that per-field validation
//! errors can name.

use std::collections::BTreeMap;

use serde_json::Value as Json;
use serde_yaml::Value as Yaml;
use thiserror::Error;

/// How a playbook execution is admitted into the `running` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Approval {
    /// Starts `running` immediately, no human sign-off required.
    None,
    /// Starts `pending_approval` and stays there until manually approved.
    Required,
    /// Starts `pending_approval`, auto-approves after this many minutes.
    Timeout { minutes: i64 },
}

/// What a `Condition` step does when its on_failure case fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnFailure {
    /// Fail the whole execution (default).
    Fail,
    /// Mark the step completed anyway and keep going.
    Continue,
    /// Fail the execution, flagging an on-call escalation in the output.
    Escalate,
}

/// Supported `Condition` step check types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionType {
    HeartbeatReceived,
}

impl ConditionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HeartbeatReceived => "heartbeat_received",
        }
    }
}

/// An HTTP call to an external URL.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookStep {
    pub name: String,
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Json>,
    pub success_codes: Vec<u16>,
    pub timeout_seconds: u64,
}

/// A pre-registered script run by name.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptStep {
    pub name: String,
    pub script_name: String,
    pub parameters: Json,
    pub timeout_seconds: u64,
}

/// A pause in execution.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitStep {
    pub name: String,
    pub duration_seconds: u64,
}

/// A polled check that must pass (or time out) before continuing.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionStep {
    pub name: String,
    pub condition_type: ConditionType,
    pub timeout_seconds: u64,
    pub on_failure: OnFailure,
    pub parameters: Json,
}

/// A single step in a playbook, tagged by its executor.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Webhook(WebhookStep),
    Script(ScriptStep),
    Wait(WaitStep),
    Condition(ConditionStep),
}

impl Step {
    pub fn name(&self) -> &str {
        match self {
            Self::Webhook(s) => &s.name,
            Self::Script(s) => &s.name,
            Self::Wait(s) => &s.name,
            Self::Condition(s) => &s.name,
        }
    }
}

/// A fully parsed and validated playbook.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPlaybook {
    pub name: String,
    pub description: String,
    pub steps: Vec<Step>,
    pub approval: Approval,
    pub version: i64,
}

/// Errors parsing or validating a playbook YAML document.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid YAML syntax: {0}")]
    Yaml(String),
    #[error("playbook must be a YAML mapping")]
    NotAMapping,
    #[error("field '{0}': {1}")]
    Field(String, String),
    #[error("step {index}: {message}")]
    Step { index: usize, message: String },
}

fn yaml_str<'a>(map: &'a serde_yaml::Mapping, key: &str) -> Option<&'a str> {
    map.get(key).and_then(Yaml::as_str)
}

fn yaml_to_json(value: &Yaml) -> Json {
    serde_json::to_value(value).unwrap_or(Json::Null)
}

/// Parse `"30s"`, `"5m"`, `"1h"`, or a bare integer (seconds).
fn parse_duration(raw: &str, field: &str) -> Result<u64, ParseError> {
    let trimmed = raw.trim().to_lowercase();
    if trimmed.is_empty() {
        return Err(ParseError::Field(field.to_owned(), "duration cannot be empty".to_owned()));
    }
    if let Ok(n) = trimmed.parse::<u64>() {
        return Ok(n);
    }
    let (digits, unit) = trimmed.split_at(trimmed.len() - 1);
    let value: u64 = digits.parse().map_err(|_| {
        ParseError::Field(
            field.to_owned(),
            format!("invalid duration format: '{raw}'; expected a number with optional unit (s/m/h)"),
        )
    })?;
    match unit {
        "s" => Ok(value),
        "m" => Ok(value.saturating_mul(60)),
        "h" => Ok(value.saturating_mul(3600)),
        _ => Err(ParseError::Field(
            field.to_owned(),
            format!("invalid duration format: '{raw}'; expected a number with optional unit (s/m/h)"),
        )),
    }
}

fn parse_approval(raw: &str) -> Result<Approval, ParseError> {
    let value = raw.trim().to_lowercase();
    if value == "none" {
        return Ok(Approval::None);
    }
    if value == "required" {
        return Ok(Approval::Required);
    }
    if let Some(rest) = value.strip_prefix("timeout:") {
        let minutes_str = rest.strip_suffix('m').ok_or_else(|| {
            ParseError::Field(
                "approval".to_owned(),
                format!("invalid timeout format: '{raw}'; expected 'timeout:Xm'"),
            )
        })?;
        let minutes: i64 = minutes_str.parse().map_err(|_| {
            ParseError::Field(
                "approval".to_owned(),
                format!("invalid timeout format: '{raw}'; expected 'timeout:Xm'"),
            )
        })?;
        if minutes <= 0 {
            return Err(ParseError::Field(
                "approval".to_owned(),
                "timeout must be a positive number of minutes".to_owned(),
            ));
        }
        return Ok(Approval::Timeout { minutes });
    }
    Err(ParseError::Field(
        "approval".to_owned(),
        format!("invalid approval setting: '{raw}'; must be 'none', 'required', or 'timeout:Xm'"),
    ))
}

fn parse_webhook_step(map: &serde_yaml::Mapping) -> Result<WebhookStep, ParseError> {
    let name = yaml_str(map, "name")
        .ok_or_else(|| ParseError::Field("name".to_owned(), "step name is required".to_owned()))?
        .to_owned();
    let url = yaml_str(map, "url")
        .ok_or_else(|| ParseError::Field("url".to_owned(), "webhook url is required".to_owned()))?
        .to_owned();
    if !(url.starts_with("http://") || url.starts_with("https://") || url.starts_with("${")) {
        return Err(ParseError::Field(
            "url".to_owned(),
            "url must start with http://, https://, or be a variable".to_owned(),
        ));
    }

    let method = yaml_str(map, "method").unwrap_or("POST").to_uppercase();
    const VALID_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE"];
    if !VALID_METHODS.contains(&method.as_str()) {
        return Err(ParseError::Field(
            "method".to_owned(),
            format!("invalid HTTP method: {method}"),
        ));
    }

    let headers = match map.get("headers") {
        Some(Yaml::Mapping(h)) => h
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().unwrap_or_default().to_owned(),
                    v.as_str().map(str::to_owned).unwrap_or_else(|| v.as_i64().map(|n| n.to_string()).unwrap_or_default()),
                )
            })
            .collect(),
        Some(_) => return Err(ParseError::Field("headers".to_owned(), "headers must be a mapping".to_owned())),
        None => BTreeMap::new(),
    };

    let body = match map.get("body") {
        Some(Yaml::Null) | None => None,
        Some(Yaml::Mapping(_)) => Some(yaml_to_json(map.get("body").expect("present"))),
        Some(_) => return Err(ParseError::Field("body".to_owned(), "body must be a mapping".to_owned())),
    };

    let success_codes = match map.get("success_codes") {
        Some(Yaml::Sequence(seq)) => {
            let mut codes = Vec::with_capacity(seq.len());
            for v in seq {
                let n = v
                    .as_u64()
                    .and_then(|n| u16::try_from(n).ok())
                    .ok_or_else(|| ParseError::Field("success_codes".to_owned(), "success_codes must be a list of integers".to_owned()))?;
                codes.push(n);
            }
            codes
        }
        Some(_) => return Err(ParseError::Field("success_codes".to_owned(), "success_codes must be a list of integers".to_owned())),
        None => vec![200, 201, 202],
    };

    let timeout_raw = map.get("timeout").and_then(Yaml::as_str).map(str::to_owned).unwrap_or_else(|| "30s".to_owned());
    let timeout_seconds = parse_duration(&timeout_raw, "timeout")?;

    Ok(WebhookStep {
        name,
        url,
        method,
        headers,
        body,
        success_codes,
        timeout_seconds,
    })
}

fn parse_script_step(map: &serde_yaml::Mapping) -> Result<ScriptStep, ParseError> {
    let name = yaml_str(map, "name")
        .ok_or_else(|| ParseError::Field("name".to_owned(), "step name is required".to_owned()))?
        .to_owned();
    let script_name = yaml_str(map, "script")
        .or_else(|| yaml_str(map, "script_name"))
        .ok_or_else(|| ParseError::Field("script".to_owned(), "script name is required (use 'script' field)".to_owned()))?
        .to_owned();
    let parameters = match map.get("parameters") {
        Some(Yaml::Mapping(_)) => yaml_to_json(map.get("parameters").expect("present")),
        Some(Yaml::Null) | None => Json::Object(serde_json::Map::new()),
        Some(_) => return Err(ParseError::Field("parameters".to_owned(), "parameters must be a mapping".to_owned())),
    };
    let timeout_raw = map.get("timeout").and_then(Yaml::as_str).map(str::to_owned).unwrap_or_else(|| "60s".to_owned());
    let timeout_seconds = parse_duration(&timeout_raw, "timeout")?;

    Ok(ScriptStep {
        name,
        script_name,
        parameters,
        timeout_seconds,
    })
}

fn parse_wait_step(map: &serde_yaml::Mapping) -> Result<WaitStep, ParseError> {
    let name = yaml_str(map, "name")
        .ok_or_else(|| ParseError::Field("name".to_owned(), "step name is required".to_owned()))?
        .to_owned();
    let duration_raw = yaml_str(map, "duration")
        .ok_or_else(|| ParseError::Field("duration".to_owned(), "wait duration is required (e.g. '30s', '5m')".to_owned()))?;
    let duration_seconds = parse_duration(duration_raw, "duration")?;
    if duration_seconds == 0 {
        return Err(ParseError::Field("duration".to_owned(), "wait duration must be positive".to_owned()));
    }
    Ok(WaitStep { name, duration_seconds })
}

fn parse_condition_step(map: &serde_yaml::Mapping) -> Result<ConditionStep, ParseError> {
    let name = yaml_str(map, "name")
        .ok_or_else(|| ParseError::Field("name".to_owned(), "step name is required".to_owned()))?
        .to_owned();
    let check = yaml_str(map, "check")
        .ok_or_else(|| ParseError::Field("check".to_owned(), "condition check type is required (e.g. 'heartbeat_received')".to_owned()))?;
    let condition_type = match check.to_lowercase().as_str() {
        "heartbeat_received" => ConditionType::HeartbeatReceived,
        other => {
            return Err(ParseError::Field(
                "check".to_owned(),
                format!("invalid condition type: {other}"),
            ))
        }
    };
    let timeout_raw = map.get("timeout").and_then(Yaml::as_str).map(str::to_owned).unwrap_or_else(|| "5m".to_owned());
    let timeout_seconds = parse_duration(&timeout_raw, "timeout")?;
    let on_failure = match yaml_str(map, "on_failure").unwrap_or("fail").to_lowercase().as_str() {
        "fail" => OnFailure::Fail,
        "continue" => OnFailure::Continue,
        "escalate" => OnFailure::Escalate,
        other => {
            return Err(ParseError::Field(
                "on_failure".to_owned(),
                format!("invalid on_failure action: {other}"),
            ))
        }
    };
    let parameters = match map.get("parameters") {
        Some(Yaml::Mapping(_)) => yaml_to_json(map.get("parameters").expect("present")),
        Some(Yaml::Null) | None => Json::Object(serde_json::Map::new()),
        Some(_) => return Err(ParseError::Field("parameters".to_owned(), "parameters must be a mapping".to_owned())),
    };

    Ok(ConditionStep {
        name,
        condition_type,
        timeout_seconds,
        on_failure,
        parameters,
    })
}

fn parse_step(value: &Yaml) -> Result<Step, ParseError> {
    let map = value.as_mapping().ok_or_else(|| ParseError::Field(String::new(), "step must be a mapping".to_owned()))?;
    let step_type = yaml_str(map, "type")
        .ok_or_else(|| ParseError::Field("type".to_owned(), "step type is required".to_owned()))?
        .to_lowercase();
    match step_type.as_str() {
        "webhook" => parse_webhook_step(map).map(Step::Webhook),
        "script" => parse_script_step(map).map(Step::Script),
        "wait" => parse_wait_step(map).map(Step::Wait),
        "condition" => parse_condition_step(map).map(Step::Condition),
        other => Err(ParseError::Field("type".to_owned(), format!("invalid step type: {other}"))),
    }
}

/// Parse and validate a playbook YAML document.
pub fn parse_yaml(yaml_content: &str) -> Result<ParsedPlaybook, ParseError> {
    if yaml_content.trim().is_empty() {
        return Err(ParseError::Field("yaml".to_owned(), "playbook YAML content cannot be empty".to_owned()));
    }
    let doc: Yaml = serde_yaml::from_str(yaml_content).map_err(|e| ParseError::Yaml(e.to_string()))?;
    let map = doc.as_mapping().ok_or(ParseError::NotAMapping)?;

    let name = yaml_str(map, "name")
        .ok_or_else(|| ParseError::Field("name".to_owned(), "playbook name is required".to_owned()))?
        .to_owned();
    let description = yaml_str(map, "description").unwrap_or_default().to_owned();

    let steps_value = map.get("steps").and_then(Yaml::as_sequence);
    let steps_seq = match steps_value {
        Some(seq) if !seq.is_empty() => seq,
        _ => return Err(ParseError::Field("steps".to_owned(), "playbook must have at least one step".to_owned())),
    };

    let mut steps = Vec::with_capacity(steps_seq.len());
    let mut seen_names: std::collections::HashSet<String> = std::collections::HashSet::new();
    for (index, step_value) in steps_seq.iter().enumerate() {
        let step = parse_step(step_value).map_err(|e| match e {
            ParseError::Field(field, message) => ParseError::Step { index, message: format!("field '{field}': {message}") },
            other => ParseError::Step { index, message: other.to_string() },
        })?;
        if !seen_names.insert(step.name().to_owned()) {
            return Err(ParseError::Step {
                index,
                message: format!("duplicate step name: '{}'", step.name()),
            });
        }
        steps.push(step);
    }

    let approval_raw = yaml_str(map, "approval").unwrap_or("none");
    let approval = parse_approval(approval_raw)?;

    let version = map.get("version").and_then(Yaml::as_i64).unwrap_or(1);

    Ok(ParsedPlaybook {
        name,
        description,
        steps,
        approval,
        version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
name: restart-service
description: Restart a failed service
approval: required
steps:
  - name: call-restart-api
    type: webhook
    url: https://api.example.com/restart
    method: POST
    body:
      service: ${SERVICE_NAME}
  - name: wait-for-restart
    type: wait
    duration: 30s
  - name: verify-heartbeat
    type: condition
    check: heartbeat_received
    timeout: 5m
    on_failure: escalate
"#;

    #[test]
    fn parses_sample_playbook() {
        let playbook = parse_yaml(SAMPLE).expect("parse");
        assert_eq!(playbook.name, "restart-service");
        assert_eq!(playbook.approval, Approval::Required);
        assert_eq!(playbook.steps.len(), 3);
        assert_eq!(playbook.steps[0].name(), "call-restart-api");
    }

    #[test]
    fn parses_timeout_approval() {
        let yaml = SAMPLE.replace("approval: required", "approval: timeout:5m");
        let playbook = parse_yaml(&yaml).expect("parse");
        assert_eq!(playbook.approval, Approval::Timeout { minutes: 5 });
    }

    #[test]
    fn rejects_invalid_approval() {
        let yaml = SAMPLE.replace("approval: required", "approval: maybe");
        assert!(parse_yaml(&yaml).is_err());
    }

    #[test]
    fn rejects_duplicate_step_names() {
        let yaml = r#"
name: dup
steps:
  - name: a
    type: wait
    duration: 5s
  - name: a
    type: wait
    duration: 5s
"#;
        let err = parse_yaml(yaml).unwrap_err();
        assert!(matches!(err, ParseError::Step { .. }));
    }

    #[test]
    fn rejects_empty_steps() {
        let yaml = "name: empty\nsteps: []\n";
        assert!(parse_yaml(yaml).is_err());
    }

    #[test]
    fn parses_duration_units() {
        assert_eq!(parse_duration("30", "x").unwrap(), 30);
        assert_eq!(parse_duration("30s", "x").unwrap(), 30);
        assert_eq!(parse_duration("5m", "x").unwrap(), 300);
        assert_eq!(parse_duration("1h", "x").unwrap(), 3600);
        assert!(parse_duration("abc", "x").is_err());
    }

    #[test]
    fn webhook_url_must_be_http_or_variable() {
        let yaml = r#"
name: bad-url
steps:
  - name: s
    type: webhook
    url: ftp://example.com
"#;
        assert!(parse_yaml(yaml).is_err());
    }
}

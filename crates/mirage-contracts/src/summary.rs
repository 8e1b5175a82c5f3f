use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Outcome envelope for a one-shot generation run, written next to the
/// artifacts it describes. Media rows carry artifact paths or bare URIs,
/// never credential-keyed URLs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub session_id: String,
    pub prompt: String,
    pub kind: String,
    pub success: bool,
    pub started_at: String,
    pub finished_at: String,
    pub artifacts: Vec<Map<String, Value>>,
}

pub fn write_summary(
    path: &Path,
    summary: &RunSummary,
    extra: Option<&Map<String, Value>>,
) -> anyhow::Result<()> {
    let mut payload = Map::new();
    payload.insert(
        "session_id".to_string(),
        Value::String(summary.session_id.clone()),
    );
    payload.insert("prompt".to_string(), Value::String(summary.prompt.clone()));
    payload.insert("kind".to_string(), Value::String(summary.kind.clone()));
    payload.insert("success".to_string(), Value::Bool(summary.success));
    payload.insert(
        "started_at".to_string(),
        Value::String(summary.started_at.clone()),
    );
    payload.insert(
        "finished_at".to_string(),
        Value::String(summary.finished_at.clone()),
    );
    payload.insert(
        "artifacts".to_string(),
        Value::Array(
            summary
                .artifacts
                .iter()
                .cloned()
                .map(Value::Object)
                .collect(),
        ),
    );
    payload.insert("ts".to_string(), Value::String(now_utc_iso()));
    if let Some(extra) = extra {
        for (key, value) in extra {
            payload.insert(key.clone(), value.clone());
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&Value::Object(payload))?)?;
    Ok(())
}

pub fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::{write_summary, RunSummary};

    #[test]
    fn write_summary_generates_expected_payload() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("summary.json");

        let mut artifact = Map::new();
        artifact.insert("id".to_string(), json!("rec-1-img-0"));
        artifact.insert("path".to_string(), json!("artifact-1700000000000-00.png"));
        let summary = RunSummary {
            session_id: "studio-123".to_string(),
            prompt: "a red cube".to_string(),
            kind: "image".to_string(),
            success: true,
            started_at: "2026-02-19T00:00:00+00:00".to_string(),
            finished_at: "2026-02-19T00:00:09+00:00".to_string(),
            artifacts: vec![artifact],
        };
        let mut extra = Map::new();
        extra.insert("model".to_string(), Value::String("dryrun-media-1".to_string()));
        write_summary(&path, &summary, Some(&extra))?;

        let parsed: Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        assert_eq!(parsed["session_id"], json!("studio-123"));
        assert_eq!(parsed["success"], json!(true));
        assert_eq!(parsed["artifacts"][0]["id"], json!("rec-1-img-0"));
        assert_eq!(parsed["model"], json!("dryrun-media-1"));
        assert!(parsed.get("ts").and_then(Value::as_str).is_some());
        Ok(())
    }

    #[test]
    fn failure_extras_can_carry_status_and_error() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("summary.json");
        let summary = RunSummary {
            session_id: "studio-123".to_string(),
            prompt: "a slow epic".to_string(),
            kind: "video".to_string(),
            success: false,
            started_at: "2026-02-19T00:00:00+00:00".to_string(),
            finished_at: "2026-02-19T00:10:00+00:00".to_string(),
            artifacts: Vec::new(),
        };
        let mut extra = Map::new();
        extra.insert("error".to_string(), json!("Video generation timed out"));
        extra.insert("status".to_string(), json!(408));
        write_summary(&path, &summary, Some(&extra))?;

        let parsed: Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        assert_eq!(parsed["success"], json!(false));
        assert_eq!(parsed["status"], json!(408));
        assert_eq!(parsed["error"], json!("Video generation timed out"));
        Ok(())
    }
}

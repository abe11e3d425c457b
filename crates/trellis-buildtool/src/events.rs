//! Build event stream decoding
//!
//! The tool writes one JSON record per line. Each record has an `id` object
//! and at most one payload key next to it; only the payloads that matter to
//! a client watching progress are decoded, the rest are skipped.

use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BuildEvent {
    Started {
        command: Option<String>,
    },
    Progress {
        message: String,
    },
    ActionCompleted {
        label: Option<String>,
        success: bool,
        excerpt: Option<String>,
    },
    TestResult(TestOutcome),
    Finished {
        success: bool,
        exit_code: Option<i64>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestOutcome {
    pub label: String,
    pub passed: bool,
    pub status: String,
    #[serde(with = "duration_ms")]
    pub duration: Option<Duration>,
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }
}

/// Decode one record. `Ok(None)` means the record is well formed but of a
/// kind nobody listens for.
pub fn decode_event(line: &str) -> Result<Option<BuildEvent>, String> {
    let record: Value = serde_json::from_str(line).map_err(|e| e.to_string())?;
    let Some(object) = record.as_object() else {
        return Err("event record is not an object".to_string());
    };
    let id = object.get("id").ok_or("event record has no id")?;

    if let Some(started) = object.get("started") {
        let command = started.get("command").and_then(Value::as_str).map(str::to_string);
        return Ok(Some(BuildEvent::Started { command }));
    }
    if let Some(progress) = object.get("progress") {
        let message: Vec<&str> = ["stderr", "stdout"]
            .iter()
            .filter_map(|key| progress.get(*key).and_then(Value::as_str))
            .filter(|text| !text.trim().is_empty())
            .collect();
        if message.is_empty() {
            return Ok(None);
        }
        return Ok(Some(BuildEvent::Progress { message: message.join("\n") }));
    }
    if let Some(action) = object.get("action") {
        let label = action
            .get("label")
            .or_else(|| id.pointer("/actionCompleted/label"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let success = action.get("success").and_then(Value::as_bool).unwrap_or(false);
        let excerpt = action
            .pointer("/failureDetail/message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| output_excerpt(action.get("stderr")))
            .or_else(|| output_excerpt(action.get("stdout")));
        return Ok(Some(BuildEvent::ActionCompleted { label, success, excerpt }));
    }
    if let Some(completed) = object.get("completed") {
        let label = id.pointer("/targetCompleted/label").and_then(Value::as_str).map(str::to_string);
        let success = completed.get("success").and_then(Value::as_bool).unwrap_or(false);
        let excerpt = completed.pointer("/failureDetail/message").and_then(Value::as_str).map(str::to_string);
        return Ok(Some(BuildEvent::ActionCompleted { label, success, excerpt }));
    }
    if let Some(result) = object.get("testResult") {
        let label = id
            .pointer("/testResult/label")
            .and_then(Value::as_str)
            .ok_or("test result without a label")?
            .to_string();
        let status = result.get("status").and_then(Value::as_str).unwrap_or("NO_STATUS").to_string();
        let duration = test_duration(result);
        return Ok(Some(BuildEvent::TestResult(TestOutcome { label, passed: status == "PASSED", status, duration })));
    }
    if let Some(finished) = object.get("finished") {
        let exit_code = finished.get("exitCode").map(|code| code.get("code").and_then(Value::as_i64).unwrap_or(0));
        let success = finished
            .get("overallSuccess")
            .and_then(Value::as_bool)
            .unwrap_or(exit_code == Some(0));
        return Ok(Some(BuildEvent::Finished { success, exit_code }));
    }
    Ok(None)
}

/// Inline text, or the name/uri of a referenced output file.
fn output_excerpt(value: Option<&Value>) -> Option<String> {
    let value = value?;
    if let Some(text) = value.as_str() {
        return Some(text.to_string());
    }
    ["uri", "name"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

fn test_duration(result: &Value) -> Option<Duration> {
    if let Some(millis) = result.get("testAttemptDurationMillis") {
        let millis = millis.as_u64().or_else(|| millis.as_str().and_then(|s| s.parse().ok()))?;
        return Some(Duration::from_millis(millis));
    }
    let text = result.get("testAttemptDuration")?.as_str()?;
    let seconds: f64 = text.strip_suffix('s')?.parse().ok()?;
    (seconds >= 0.0).then(|| Duration::from_secs_f64(seconds))
}

/// Follows an event file while the tool appends to it. Only complete lines
/// are decoded until `finish`, which also flushes a trailing partial line.
pub struct EventTail {
    file: File,
    pending: Vec<u8>,
    pub malformed: usize,
}

impl EventTail {
    pub async fn open(path: &Path) -> std::io::Result<Self> {
        Ok(EventTail { file: File::open(path).await?, pending: Vec::new(), malformed: 0 })
    }

    /// Events from lines completed since the last poll.
    pub async fn poll(&mut self) -> std::io::Result<Vec<BuildEvent>> {
        self.file.read_to_end(&mut self.pending).await?;
        let Some(last_newline) = self.pending.iter().rposition(|b| *b == b'\n') else {
            return Ok(Vec::new());
        };
        let complete: Vec<u8> = self.pending.drain(..=last_newline).collect();
        Ok(self.decode_lines(&complete))
    }

    /// Drain everything left, including an unterminated final line.
    pub async fn finish(mut self) -> std::io::Result<(Vec<BuildEvent>, usize)> {
        let mut events = self.poll().await?;
        let rest = std::mem::take(&mut self.pending);
        events.extend(self.decode_lines(&rest));
        Ok((events, self.malformed))
    }

    fn decode_lines(&mut self, bytes: &[u8]) -> Vec<BuildEvent> {
        let text = String::from_utf8_lossy(bytes);
        let mut events = Vec::new();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match decode_event(line) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(err) => {
                    self.malformed += 1;
                    tracing::warn!("Skipping malformed build event: {} ({})", err, truncate(line, 120));
                }
            }
        }
        events
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_started_and_finished() {
        let started = r#"{"id":{"started":{}},"started":{"uuid":"u","command":"build"}}"#;
        assert_eq!(decode_event(started).unwrap(), Some(BuildEvent::Started { command: Some("build".into()) }));

        let finished = r#"{"id":{"buildFinished":{}},"finished":{"overallSuccess":true,"exitCode":{"name":"SUCCESS"}}}"#;
        assert_eq!(
            decode_event(finished).unwrap(),
            Some(BuildEvent::Finished { success: true, exit_code: Some(0) })
        );

        let failed = r#"{"id":{"buildFinished":{}},"finished":{"exitCode":{"name":"BUILD_FAILURE","code":1}}}"#;
        assert_eq!(
            decode_event(failed).unwrap(),
            Some(BuildEvent::Finished { success: false, exit_code: Some(1) })
        );
    }

    #[test]
    fn test_decode_action_with_failure_detail() {
        let line = r#"{"id":{"actionCompleted":{"label":"//a:b"}},"action":{"success":false,"failureDetail":{"message":"compile error"}}}"#;
        assert_eq!(
            decode_event(line).unwrap(),
            Some(BuildEvent::ActionCompleted {
                label: Some("//a:b".into()),
                success: false,
                excerpt: Some("compile error".into()),
            })
        );
    }

    #[test]
    fn test_decode_test_result_durations() {
        let millis = r#"{"id":{"testResult":{"label":"//a:t"}},"testResult":{"status":"PASSED","testAttemptDurationMillis":"1500"}}"#;
        let Some(BuildEvent::TestResult(outcome)) = decode_event(millis).unwrap() else {
            panic!("expected a test result");
        };
        assert!(outcome.passed);
        assert_eq!(outcome.duration, Some(Duration::from_millis(1500)));

        let seconds = r#"{"id":{"testResult":{"label":"//a:t"}},"testResult":{"status":"FAILED","testAttemptDuration":"0.250s"}}"#;
        let Some(BuildEvent::TestResult(outcome)) = decode_event(seconds).unwrap() else {
            panic!("expected a test result");
        };
        assert!(!outcome.passed);
        assert_eq!(outcome.duration, Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_ignored_and_malformed_records() {
        assert_eq!(decode_event(r#"{"id":{"workspaceStatus":{}},"workspaceStatus":{}}"#).unwrap(), None);
        assert_eq!(decode_event(r#"{"id":{"progress":{}},"progress":{}}"#).unwrap(), None);
        assert!(decode_event("{not json").is_err());
        assert!(decode_event(r#"{"started":{}}"#).is_err());
    }

    #[test]
    fn test_event_wire_shape() {
        let event = BuildEvent::TestResult(TestOutcome {
            label: "//a:t".into(),
            passed: true,
            status: "PASSED".into(),
            duration: Some(Duration::from_millis(20)),
        });
        insta::assert_json_snapshot!(event, @r###"
        {
          "type": "test_result",
          "label": "//a:t",
          "passed": true,
          "status": "PASSED",
          "duration": 20
        }
        "###);
    }
}

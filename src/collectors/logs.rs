use crate::collectors::{run_command, CollectionError, Collector, RawLogLine, RawPayload, RawSample};
use crate::model::{now_unix, Domain};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

/// Reads the systemd journal incrementally. The cursor only advances after a
/// batch was parsed in full, so a failed or abandoned poll re-reads it.
pub struct JournalCollector {
    max_lines: u32,
    cursor: Mutex<Option<String>>,
}

#[derive(Debug, Deserialize)]
struct JournalRecord {
    #[serde(rename = "__CURSOR")]
    cursor: Option<String>,
    #[serde(rename = "__REALTIME_TIMESTAMP")]
    realtime: Option<String>,
    #[serde(rename = "PRIORITY")]
    priority: Option<String>,
    #[serde(rename = "SYSLOG_IDENTIFIER")]
    identifier: Option<String>,
    #[serde(rename = "_SYSTEMD_UNIT")]
    unit: Option<String>,
    #[serde(rename = "MESSAGE")]
    message: Option<serde_json::Value>,
}

impl JournalCollector {
    pub fn new(max_lines: u32) -> Self {
        Self {
            max_lines,
            cursor: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Collector for JournalCollector {
    fn domain(&self) -> Domain {
        Domain::Logs
    }

    async fn collect(&self) -> Result<RawSample, CollectionError> {
        let mut cursor = self.cursor.lock().await;
        let lines = self.max_lines.to_string();
        let after = cursor.as_ref().map(|c| format!("--after-cursor={c}"));
        let mut args = vec!["-o", "json", "--no-pager", "-n", lines.as_str()];
        if let Some(after) = after.as_deref() {
            args.push(after);
        }

        let text = run_command(Domain::Logs, "journalctl", &args).await?;
        let (entries, last_cursor) = parse_journal(&text)
            .map_err(|detail| CollectionError::malformed(Domain::Logs, detail))?;
        if last_cursor.is_some() {
            *cursor = last_cursor;
        }
        debug!(entries = entries.len(), "read journal batch");

        Ok(RawSample {
            domain: Domain::Logs,
            captured_at: now_unix(),
            payload: RawPayload::Logs(entries),
        })
    }
}

fn parse_journal(text: &str) -> Result<(Vec<RawLogLine>, Option<String>), String> {
    let mut out = Vec::new();
    let mut last_cursor = None;
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: JournalRecord = serde_json::from_str(line)
            .map_err(|err| format!("journal line {}: {err}", idx + 1))?;
        if record.cursor.is_some() {
            last_cursor = record.cursor.clone();
        }
        let source = record
            .identifier
            .or_else(|| record.unit.map(|u| u.trim_end_matches(".service").to_string()));
        out.push(RawLogLine {
            realtime_us: record.realtime,
            priority: record.priority,
            source,
            message: record.message.and_then(message_text),
        });
    }
    Ok((out, last_cursor))
}

/// journald encodes non-UTF-8 messages as byte arrays.
fn message_text(value: serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Array(items) => {
            let bytes: Option<Vec<u8>> = items
                .iter()
                .map(|v| v.as_u64().and_then(|b| u8::try_from(b).ok()))
                .collect();
            bytes.map(|b| String::from_utf8_lossy(&b).to_string())
        }
        _ => None,
    }
}

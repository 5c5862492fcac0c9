//! Append-only JSONL trail of access decisions and client security reports.

use crate::error::DenyReason;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub struct AuditLog {
    pub path: PathBuf,
    file: File,
}

#[derive(Serialize)]
struct Event<'a> {
    ts: DateTime<Utc>,
    identity: &'a str,
    #[serde(rename = "type")]
    event_type: &'a str,
    #[serde(flatten)]
    data: serde_json::Value,
}

impl AuditLog {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn log(
        &mut self,
        ts: DateTime<Utc>,
        identity: &str,
        event_type: &str,
        data: serde_json::Value,
    ) -> Result<()> {
        let event = Event {
            ts,
            identity,
            event_type,
            data,
        };
        let line = serde_json::to_string(&event)?;
        writeln!(self.file, "{}", line)?;
        self.file.flush()?;
        Ok(())
    }

    /// Log the outcome of one evaluated request
    pub fn decision(
        &mut self,
        ts: DateTime<Utc>,
        identity: &str,
        operation: &str,
        reason: Option<DenyReason>,
        token_id: Option<&str>,
    ) -> Result<()> {
        self.log(
            ts,
            identity,
            "decision",
            serde_json::json!({
                "operation": operation,
                "outcome": if reason.is_some() { "denied" } else { "granted" },
                "reason": reason,
                "token_id": token_id,
            }),
        )
    }

    /// Log a session lifecycle event (created, destroyed, superseded)
    pub fn session_event(&mut self, ts: DateTime<Utc>, identity: &str, event: &str) -> Result<()> {
        self.log(ts, identity, "session", serde_json::json!({ "event": event }))
    }

    /// Log a client-side security report
    pub fn security_violation(
        &mut self,
        ts: DateTime<Utc>,
        identity: &str,
        severity: &str,
        violation: &str,
        user_agent: Option<&str>,
    ) -> Result<()> {
        self.log(
            ts,
            identity,
            "security_violation",
            serde_json::json!({
                "severity": severity,
                "violation": violation,
                "user_agent": user_agent,
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_appends_json_lines() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("audit").join("decisions.jsonl");
        let ts = Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap();

        let mut log = AuditLog::open(&path).unwrap();
        log.decision(ts, "203.0.113.5", "fetch", None, Some("jti-1"))
            .unwrap();
        log.decision(
            ts,
            "203.0.113.5",
            "fetch",
            Some(DenyReason::PurposeMismatch),
            None,
        )
        .unwrap();
        log.security_violation(ts, "203.0.113.5", "breach", "BREACH: devtools", None)
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["type"], "decision");
        assert_eq!(lines[0]["outcome"], "granted");
        assert_eq!(lines[0]["token_id"], "jti-1");
        assert_eq!(lines[1]["reason"], "purpose_mismatch");
        assert_eq!(lines[2]["severity"], "breach");
        assert_eq!(lines[2]["identity"], "203.0.113.5");
    }

    #[test]
    fn test_reopen_appends() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("a.jsonl");
        let ts = Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap();

        AuditLog::open(&path)
            .unwrap()
            .session_event(ts, "a", "created")
            .unwrap();
        AuditLog::open(&path)
            .unwrap()
            .session_event(ts, "a", "destroyed")
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}

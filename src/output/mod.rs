use std::io::Write;
use std::path::Path;

use chrono::NaiveDateTime;
use colored::Colorize;
use serde_json::json;

use crate::flow::{RowKind, TimelineRow};
use crate::model::TraceModel;
use crate::scenario::{ScenarioResult, StepStatus};
use crate::session::{self, ChannelSession};
use crate::validate::{Severity, ValidationIssue};
use crate::config::AnalysisConfig;

/// Renders analysis results as text or JSON for the CLI.
pub struct Formatter {
    json: bool,
}

fn fmt_time(ts: Option<NaiveDateTime>) -> String {
    match ts {
        Some(ts) => ts.format("%H:%M:%S%.3f").to_string(),
        None => String::new(),
    }
}

fn fmt_datetime(ts: Option<NaiveDateTime>) -> Option<String> {
    ts.map(|ts| ts.format("%m/%d/%Y %H:%M:%S%.3f").to_string())
}

fn fmt_duration(session: &ChannelSession) -> String {
    match session.duration() {
        Some(d) => {
            let total = d.num_milliseconds() as f64 / 1000.0;
            if total < 1.0 {
                format!("{total:.2}s")
            } else if total < 60.0 {
                format!("{total:.1}s")
            } else {
                let minutes = (total / 60.0).floor() as i64;
                format!("{minutes}m {:.1}s", total - (minutes * 60) as f64)
            }
        }
        None => "Unknown".to_string(),
    }
}

fn severity_colored(severity: Severity) -> String {
    match severity {
        Severity::Critical => severity.as_str().red().bold().to_string(),
        Severity::Warning => severity.as_str().yellow().to_string(),
        Severity::Info => severity.as_str().blue().to_string(),
    }
}

fn status_colored(status: StepStatus) -> String {
    match status {
        StepStatus::Fail => status.as_str().red().bold().to_string(),
        StepStatus::Warn => status.as_str().yellow().to_string(),
        StepStatus::Ok => status.as_str().green().to_string(),
    }
}

impl Formatter {
    pub fn new(json: bool) -> Self {
        Formatter { json }
    }

    pub fn flow(
        &self,
        file: &str,
        model: &TraceModel,
        sessions: &[ChannelSession],
        rows: &[TimelineRow],
        config: &AnalysisConfig,
    ) -> String {
        if self.json {
            let timeline: Vec<serde_json::Value> = rows
                .iter()
                .map(|row| self.row_json(row, sessions, config))
                .collect();
            let payload = json!({
                "file": file,
                "iccid": model.iccid,
                "timeline": timeline,
            });
            return format!("{:#}\n", payload);
        }

        let mut lines = Vec::new();
        lines.push(format!("File: {file}"));
        if let Some(iccid) = &model.iccid {
            lines.push(format!("ICCID: {iccid}"));
        }
        lines.push(format!("Timeline items: {}", rows.len()));
        lines.push(String::new());
        for row in rows {
            match row.kind {
                RowKind::Session => {
                    let session = row.session.and_then(|i| sessions.get(i));
                    let (server, proto, port, opened, closed, ips) = match session {
                        Some(s) => (
                            session::server_label(s, config),
                            s.transport.as_str().to_string(),
                            s.port.map(|p| format!(":{p}")).unwrap_or_default(),
                            fmt_datetime(s.opened_at).unwrap_or_else(|| "Unknown".into()),
                            fmt_datetime(s.closed_at).unwrap_or_else(|| "Not closed".into()),
                            s.ip_addresses.iter().cloned().collect::<Vec<_>>(),
                        ),
                        None => Default::default(),
                    };
                    lines.push(format!(
                        "[{}] Session {} {} {}{} {} -> {}",
                        fmt_time(row.timestamp),
                        row.type_label,
                        server,
                        proto,
                        port,
                        opened,
                        closed,
                    ));
                    if ips.is_empty() {
                        lines.push("  IPs: (DNS by ME)".to_string());
                    } else {
                        lines.push(format!("  IPs: {}", ips.join(", ")));
                    }
                }
                RowKind::Event => {
                    lines.push(format!(
                        "[{}] Event idx={} {}",
                        fmt_time(row.timestamp),
                        row.anchor,
                        row.label
                    ));
                }
            }
        }
        lines.push(String::new());
        lines.join("\n")
    }

    fn row_json(
        &self,
        row: &TimelineRow,
        sessions: &[ChannelSession],
        config: &AnalysisConfig,
    ) -> serde_json::Value {
        match row.kind {
            RowKind::Session => {
                let session = row.session.and_then(|i| sessions.get(i));
                json!({
                    "kind": "Session",
                    "type": row.type_label,
                    "label": row.label,
                    "time": fmt_datetime(row.timestamp),
                    "channel": session.and_then(|s| s.channel_id),
                    "server": session.map(|s| session::server_label(s, config)),
                    "role": session.map(|s| s.role.as_str()),
                    "protocol": session.map(|s| s.transport.as_str()),
                    "port": session.and_then(|s| s.port),
                    "ips": session.map(|s| s.ip_addresses.iter().cloned().collect::<Vec<_>>()),
                    "opened": session.and_then(|s| fmt_datetime(s.opened_at)),
                    "closed": session.and_then(|s| fmt_datetime(s.closed_at)),
                    "duration": session.map(fmt_duration),
                })
            }
            RowKind::Event => json!({
                "kind": "Event",
                "type": row.type_label,
                "label": row.label,
                "time": fmt_datetime(row.timestamp),
                "index": row.anchor,
            }),
        }
    }

    pub fn parsing_log(
        &self,
        file: &str,
        issues: &[ValidationIssue],
        severity_label: &str,
    ) -> String {
        if self.json {
            let payload = json!({
                "file": file,
                "severities": severity_label,
                "issues": issues.iter().map(|i| json!({
                    "severity": i.severity.as_str(),
                    "category": i.category,
                    "message": i.message,
                    "item_index": i.item_index,
                    "timestamp": fmt_datetime(i.timestamp),
                })).collect::<Vec<_>>(),
            });
            return format!("{:#}\n", payload);
        }

        let mut lines = Vec::new();
        lines.push(format!("File: {file}"));
        lines.push(format!("Issues ({severity_label}): {}", issues.len()));
        lines.push(String::new());
        for issue in issues {
            let idx = issue
                .item_index
                .map(|i| i.to_string())
                .unwrap_or_else(|| "-".into());
            lines.push(format!(
                "[{}] idx={} {} {}: {}",
                severity_colored(issue.severity),
                idx,
                fmt_datetime(issue.timestamp).unwrap_or_default(),
                issue.category,
                issue.message
            ));
        }
        lines.push(String::new());
        lines.join("\n")
    }

    pub fn iccid(&self, file: &str, iccid: Option<&str>) -> String {
        if self.json {
            return format!("{:#}\n", json!({ "file": file, "iccid": iccid }));
        }
        format!("{}\n", iccid.unwrap_or_default())
    }

    pub fn stats(&self, file: &str, issues: &[ValidationIssue]) -> String {
        let count = |sev| issues.iter().filter(|i| i.severity == sev).count();
        let (info, warning, critical) = (
            count(Severity::Info),
            count(Severity::Warning),
            count(Severity::Critical),
        );
        if self.json {
            return format!(
                "{:#}\n",
                json!({
                    "file": file,
                    "issue_counts": {
                        "info": info,
                        "warning": warning,
                        "critical": critical,
                        "total": issues.len(),
                    }
                })
            );
        }
        format!(
            "File: {file}\nIssues: total={} info={info} warning={warning} critical={critical}\n",
            issues.len()
        )
    }

    pub fn scenario_list(&self, names: &[String], selected: &str) -> String {
        if self.json {
            return format!(
                "{:#}\n",
                json!({ "scenarios": names, "selected": selected })
            );
        }
        let mut lines = vec!["Scenarios:".to_string()];
        for name in names {
            let marker = if name == selected { "*" } else { " " };
            lines.push(format!("{marker} {name}"));
        }
        lines.push(String::new());
        lines.join("\n")
    }

    pub fn scenario(&self, file: &str, name: &str, result: &ScenarioResult) -> String {
        if self.json {
            let payload = json!({
                "file": file,
                "scenario": name,
                "overall_status": result.overall.as_str(),
                "steps_summary": result.summary,
                "results": result.steps.iter().map(|s| json!({
                    "step": s.label,
                    "status": s.status.as_str(),
                    "matched_types": s.matched_types,
                    "item_indices": s.item_indices,
                    "reason": s.reason,
                })).collect::<Vec<_>>(),
            });
            return format!("{:#}\n", payload);
        }

        let mut lines = Vec::new();
        lines.push(format!("File: {file}"));
        lines.push(format!("Scenario: {name}"));
        lines.push(format!("Overall: {}", status_colored(result.overall)));
        lines.push(format!("Summary: {}", result.summary));
        lines.push(String::new());
        for step in &result.steps {
            lines.push(format!("{} => {}", step.label, status_colored(step.status)));
            if let Some(reason) = &step.reason {
                lines.push(format!("  {reason}"));
            }
        }
        lines.push(String::new());
        lines.join("\n")
    }
}

/// Write to a file when `--out` is given, stdout otherwise.
pub fn write_output(text: &str, out: Option<&Path>) -> std::io::Result<()> {
    match out {
        Some(path) => std::fs::write(path, text),
        None => {
            let stdout = std::io::stdout();
            let mut handle = stdout.lock();
            handle.write_all(text.as_bytes())
        }
    }
}

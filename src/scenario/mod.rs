use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::flow::TimelineRow;
use crate::validate::{Severity, ValidationIssue};

/// Per-step and overall verdict. Ordered so `max` picks the worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StepStatus {
    Ok,
    Warn,
    Fail,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Ok => "OK",
            StepStatus::Warn => "WARN",
            StepStatus::Fail => "FAIL",
        }
    }

    fn parse(text: &str) -> Option<StepStatus> {
        match text.trim().to_lowercase().as_str() {
            "ok" | "pass" | "info" => Some(StepStatus::Ok),
            "warn" | "warning" => Some(StepStatus::Warn),
            "fail" | "critical" | "error" => Some(StepStatus::Fail),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepKind {
    Type(String),
    AnyOf(Vec<String>),
}

impl StepKind {
    fn matches(&self, type_label: &str) -> bool {
        match self {
            StepKind::Type(t) => t == type_label,
            StepKind::AnyOf(ts) => ts.iter().any(|t| t == type_label),
        }
    }

    fn display(&self) -> String {
        match self {
            StepKind::Type(t) => t.clone(),
            StepKind::AnyOf(ts) => format!("AnyOf({})", ts.join("|")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Required,
    Optional,
    Forbidden,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Segment,
    Global,
}

#[derive(Debug, Clone)]
pub struct ScenarioStep {
    pub kind: StepKind,
    pub presence: Presence,
    pub min: u32,
    pub max: u32,
    pub too_few: StepStatus,
    pub too_many: StepStatus,
    pub scope: Scope,
    pub label: Option<String>,
}

impl ScenarioStep {
    /// Shorthand for a required exactly-once step.
    pub fn required(type_label: &str) -> Self {
        ScenarioStep {
            kind: StepKind::Type(type_label.to_string()),
            presence: Presence::Required,
            min: 1,
            max: 1,
            too_few: StepStatus::Fail,
            too_many: StepStatus::Fail,
            scope: Scope::Segment,
            label: None,
        }
    }

    pub fn display(&self) -> String {
        self.label.clone().unwrap_or_else(|| self.kind.display())
    }
}

/// Occurrence and timing defaults per presence: Required (1,1), Optional
/// (0,1), Forbidden (0,0).
fn presence_defaults(presence: Presence) -> (u32, u32, StepStatus, StepStatus) {
    match presence {
        Presence::Required => (1, 1, StepStatus::Fail, StepStatus::Fail),
        Presence::Optional => (0, 1, StepStatus::Ok, StepStatus::Warn),
        Presence::Forbidden => (0, 0, StepStatus::Ok, StepStatus::Fail),
    }
}

#[derive(Debug, Clone)]
pub struct Constraints {
    pub max_gap_enabled: bool,
    pub max_gap_seconds: u32,
    pub max_gap_on_unknown: StepStatus,
    pub max_gap_on_violation: StepStatus,
}

impl Default for Constraints {
    fn default() -> Self {
        Constraints {
            max_gap_enabled: false,
            max_gap_seconds: 30,
            max_gap_on_unknown: StepStatus::Warn,
            max_gap_on_violation: StepStatus::Fail,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Scenario {
    pub name: String,
    pub steps: Vec<ScenarioStep>,
    pub constraints: Constraints,
}

impl Scenario {
    /// Built-in scenario used when no config file is available.
    pub fn default_scenario() -> Scenario {
        Scenario {
            name: "Default".to_string(),
            steps: ["DNSbyME", "DNS", "DP+", "TAC"]
                .iter()
                .map(|t| ScenarioStep::required(t))
                .collect(),
            constraints: Constraints::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StepResult {
    pub label: String,
    pub status: StepStatus,
    pub matched_types: Vec<String>,
    /// Anchors of the matched timeline rows.
    pub item_indices: Vec<usize>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ScenarioResult {
    pub overall: StepStatus,
    pub steps: Vec<StepResult>,
    /// Compact one-line summary like `DNSbyME(1) -> DNS(1) -> TAC(0)x`.
    pub summary: String,
}

fn next_required_kind(steps: &[ScenarioStep], after: usize) -> Option<&StepKind> {
    steps[after + 1..]
        .iter()
        .find(|s| s.presence == Presence::Required)
        .map(|s| &s.kind)
}

/// Evaluate a scenario over the flow timeline.
///
/// Deterministic single pass with a cursor: each non-global step sees the
/// segment from the cursor up to the first match of the next Required step;
/// consumed matches advance the cursor. Forbidden steps never consume and
/// Global steps never advance.
pub fn run(
    timeline: &[TimelineRow],
    issues: &[ValidationIssue],
    scenario: &Scenario,
) -> ScenarioResult {
    let constraints = &scenario.constraints;
    let mut results = Vec::new();
    let mut cursor = 0usize;
    // Some(ts) once a step has consumed; the inner Option is the timestamp of
    // the last consumed match.
    let mut prev_consumed: Option<Option<chrono::NaiveDateTime>> = None;

    for (i, step) in scenario.steps.iter().enumerate() {
        let (seg_start, seg_end) = if step.scope == Scope::Global {
            (0, timeline.len())
        } else {
            let end = next_required_kind(&scenario.steps, i)
                .and_then(|kind| {
                    (cursor..timeline.len()).find(|&r| kind.matches(&timeline[r].type_label))
                })
                .unwrap_or(timeline.len());
            (cursor, end)
        };

        let matches: Vec<usize> = (seg_start..seg_end)
            .filter(|&r| step.kind.matches(&timeline[r].type_label))
            .collect();
        let count = matches.len() as u32;

        let mut status = StepStatus::Ok;
        let mut reason: Option<String> = None;
        if count < step.min {
            status = step.too_few;
            reason = Some(match step.presence {
                Presence::Optional => format!("optional step not found: {}", step.display()),
                _ => format!("missing step: {}", step.display()),
            });
        } else if count > step.max {
            status = step.too_many;
            reason = Some(match step.presence {
                Presence::Forbidden => {
                    format!("forbidden step present: {} (count={count})", step.display())
                }
                _ => format!(
                    "too many occurrences of {}: count={count}, max={}",
                    step.display(),
                    step.max
                ),
            });
        }

        let consumes = step.presence != Presence::Forbidden
            && step.scope != Scope::Global
            && count > 0
            && status != StepStatus::Fail;

        // Max-gap between consecutive consumed steps.
        if constraints.max_gap_enabled
            && consumes
            && let Some(prev_ts) = prev_consumed
        {
            let cur_ts = timeline[matches[0]].timestamp;
            match (prev_ts, cur_ts) {
                (Some(prev), Some(cur)) => {
                    let gap = cur.signed_duration_since(prev).num_seconds();
                    if gap > constraints.max_gap_seconds as i64 {
                        status = status.max(constraints.max_gap_on_violation);
                        reason = Some(format!(
                            "gap of {gap}s exceeds max of {}s",
                            constraints.max_gap_seconds
                        ));
                    }
                }
                _ => {
                    status = status.max(constraints.max_gap_on_unknown);
                    reason
                        .get_or_insert_with(|| "timestamps missing for max-gap check".to_string());
                }
            }
        }

        // A Critical issue inside the covered trace range raises to ≥ Warn.
        if count > 0 {
            let lo = matches.iter().map(|&r| timeline[r].span.0).min().unwrap_or(0);
            let hi = matches.iter().map(|&r| timeline[r].span.1).max().unwrap_or(0);
            let critical = issues.iter().any(|iss| {
                iss.severity == Severity::Critical
                    && iss.item_index.is_some_and(|idx| idx >= lo && idx <= hi)
            });
            if critical {
                status = status.max(StepStatus::Warn);
                reason.get_or_insert_with(|| "critical issues within matched range".to_string());
            }
        }

        let mut matched_types: Vec<String> = matches
            .iter()
            .map(|&r| timeline[r].type_label.clone())
            .collect();
        matched_types.dedup();

        results.push(StepResult {
            label: step.display(),
            status,
            matched_types,
            item_indices: matches.iter().map(|&r| timeline[r].anchor).collect(),
            reason,
        });

        if consumes {
            cursor = matches.last().map(|&r| r + 1).unwrap_or(cursor);
            prev_consumed = Some(matches.last().and_then(|&r| timeline[r].timestamp));
        }
    }

    let overall = results
        .iter()
        .map(|r| r.status)
        .max()
        .unwrap_or(StepStatus::Ok);

    let summary = results
        .iter()
        .map(|r| {
            let suffix = match r.status {
                StepStatus::Ok => "",
                StepStatus::Warn => "!",
                StepStatus::Fail => "x",
            };
            format!("{}({}){}", r.label, r.item_indices.len(), suffix)
        })
        .collect::<Vec<_>>()
        .join(" -> ");

    ScenarioResult {
        overall,
        steps: results,
        summary,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invalid scenario file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unknown scenario: {0}")]
    Unknown(String),
    #[error("scenario {0} has no valid steps")]
    Empty(String),
}

#[derive(Debug, Deserialize)]
struct ScenarioFile {
    #[serde(default)]
    scenarios: BTreeMap<String, ScenarioDef>,
    #[serde(default)]
    selected_scenario: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ScenarioDef {
    #[serde(default)]
    sequence: Vec<StepDef>,
    #[serde(default)]
    constraints: ConstraintsDef,
}

/// A step is either a bare type string or a full object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StepDef {
    Name(String),
    Object(StepObject),
}

#[derive(Debug, Default, Deserialize)]
struct StepObject {
    #[serde(rename = "type", alias = "step_type", default)]
    kind: Option<String>,
    #[serde(default, alias = "either", alias = "one_of")]
    any_of: Option<Vec<String>>,
    #[serde(default)]
    presence: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default, alias = "min_count")]
    min: Option<u32>,
    #[serde(default, alias = "max_count")]
    max: Option<u32>,
    #[serde(default, alias = "on_too_few")]
    too_few: Option<String>,
    #[serde(default, alias = "on_too_many")]
    too_many: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ConstraintsDef {
    #[serde(default)]
    max_gap_enabled: bool,
    #[serde(default)]
    max_gap_seconds: Option<u32>,
    #[serde(default)]
    max_gap_on_unknown: Option<String>,
    #[serde(default)]
    max_gap_on_violation: Option<String>,
}

fn step_from_def(def: StepDef) -> Option<ScenarioStep> {
    let object = match def {
        StepDef::Name(name) => {
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            return Some(ScenarioStep::required(name));
        }
        StepDef::Object(o) => o,
    };

    let kind = match (&object.kind, &object.any_of) {
        (_, Some(list)) if !list.is_empty() => {
            StepKind::AnyOf(list.iter().map(|s| s.trim().to_string()).collect())
        }
        (Some(t), _) if !t.trim().is_empty() => StepKind::Type(t.trim().to_string()),
        _ => return None,
    };

    let presence = match object.presence.as_deref().map(str::to_lowercase).as_deref() {
        Some("optional") => Presence::Optional,
        Some("forbidden") => Presence::Forbidden,
        _ => Presence::Required,
    };
    let scope = match object.scope.as_deref().map(str::to_lowercase).as_deref() {
        Some("global") => Scope::Global,
        _ => Scope::Segment,
    };
    let (default_min, default_max, default_too_few, default_too_many) = presence_defaults(presence);

    Some(ScenarioStep {
        kind,
        presence,
        min: object.min.unwrap_or(default_min),
        max: object.max.unwrap_or(default_max),
        too_few: object
            .too_few
            .as_deref()
            .and_then(StepStatus::parse)
            .unwrap_or(default_too_few),
        too_many: object
            .too_many
            .as_deref()
            .and_then(StepStatus::parse)
            .unwrap_or(default_too_many),
        scope,
        label: object.label.filter(|l| !l.trim().is_empty()),
    })
}

fn scenario_from_def(name: &str, def: ScenarioDef) -> Result<Scenario, ScenarioError> {
    let steps: Vec<ScenarioStep> = def.sequence.into_iter().filter_map(step_from_def).collect();
    if steps.is_empty() {
        return Err(ScenarioError::Empty(name.to_string()));
    }
    let constraints = Constraints {
        max_gap_enabled: def.constraints.max_gap_enabled,
        max_gap_seconds: def.constraints.max_gap_seconds.unwrap_or(30),
        max_gap_on_unknown: def
            .constraints
            .max_gap_on_unknown
            .as_deref()
            .and_then(StepStatus::parse)
            .unwrap_or(StepStatus::Warn),
        max_gap_on_violation: def
            .constraints
            .max_gap_on_violation
            .as_deref()
            .and_then(StepStatus::parse)
            .unwrap_or(StepStatus::Fail),
    };
    Ok(Scenario {
        name: name.to_string(),
        steps,
        constraints,
    })
}

/// Load all scenarios from a JSON config file, plus the selected name.
pub fn load_scenarios(path: &Path) -> Result<(BTreeMap<String, Scenario>, String), ScenarioError> {
    let text = std::fs::read_to_string(path)?;
    let file: ScenarioFile = serde_json::from_str(&text)?;
    let mut scenarios = BTreeMap::new();
    for (name, def) in file.scenarios {
        match scenario_from_def(&name, def) {
            Ok(s) => {
                scenarios.insert(name, s);
            }
            Err(ScenarioError::Empty(_)) => continue,
            Err(e) => return Err(e),
        }
    }
    if scenarios.is_empty() {
        let default = Scenario::default_scenario();
        scenarios.insert(default.name.clone(), default);
    }
    let selected = file
        .selected_scenario
        .filter(|s| scenarios.contains_key(s))
        .unwrap_or_else(|| scenarios.keys().next().cloned().unwrap_or_default());
    Ok((scenarios, selected))
}

/// Case-insensitive scenario lookup.
pub fn find_scenario<'a>(
    scenarios: &'a BTreeMap<String, Scenario>,
    name: &str,
) -> Result<&'a Scenario, ScenarioError> {
    if let Some(s) = scenarios.get(name) {
        return Ok(s);
    }
    scenarios
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, s)| s)
        .ok_or_else(|| ScenarioError::Unknown(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::RowKind;
    use chrono::NaiveDate;

    fn row(type_label: &str, anchor: usize, second: Option<u32>) -> TimelineRow {
        TimelineRow {
            kind: RowKind::Session,
            type_label: type_label.to_string(),
            label: type_label.to_string(),
            timestamp: second.and_then(|s| {
                NaiveDate::from_ymd_opt(2025, 5, 5)
                    .unwrap()
                    .and_hms_opt(8, s / 60, s % 60)
            }),
            anchor,
            span: (anchor, anchor),
            session: None,
        }
    }

    fn required_scenario(types: &[&str]) -> Scenario {
        Scenario {
            name: "test".into(),
            steps: types.iter().map(|t| ScenarioStep::required(t)).collect(),
            constraints: Constraints::default(),
        }
    }

    #[test]
    fn happy_path_all_ok() {
        let timeline = vec![
            row("DNSbyME", 0, Some(0)),
            row("DNS", 1, Some(10)),
            row("DP+", 2, Some(20)),
            row("TAC", 3, Some(30)),
        ];
        let mut scenario = required_scenario(&["DNSbyME", "DNS", "DP+", "TAC"]);
        scenario.constraints.max_gap_enabled = true;
        scenario.constraints.max_gap_seconds = 30;
        let result = run(&timeline, &[], &scenario);
        assert_eq!(result.overall, StepStatus::Ok);
        assert!(result.steps.iter().all(|s| s.status == StepStatus::Ok));
    }

    #[test]
    fn exactly_once_required_semantics() {
        // In order: OK
        let timeline = vec![row("A", 0, None), row("B", 1, None)];
        let result = run(&timeline, &[], &required_scenario(&["A", "B"]));
        assert_eq!(result.overall, StepStatus::Ok);

        // Out of order: FAIL
        let timeline = vec![row("B", 0, None), row("A", 1, None)];
        let result = run(&timeline, &[], &required_scenario(&["A", "B"]));
        assert_eq!(result.overall, StepStatus::Fail);

        // Missing: FAIL
        let timeline = vec![row("A", 0, None)];
        let result = run(&timeline, &[], &required_scenario(&["A", "B"]));
        assert_eq!(result.overall, StepStatus::Fail);
    }

    #[test]
    fn optional_absent_leaves_cursor() {
        let timeline = vec![row("A", 0, None), row("C", 1, None)];
        let mut opt = ScenarioStep::required("B");
        opt.presence = Presence::Optional;
        let (min, max, too_few, too_many) = super::presence_defaults(Presence::Optional);
        opt.min = min;
        opt.max = max;
        opt.too_few = too_few;
        opt.too_many = too_many;

        let scenario = Scenario {
            name: "t".into(),
            steps: vec![
                ScenarioStep::required("A"),
                opt,
                ScenarioStep::required("C"),
            ],
            constraints: Constraints::default(),
        };
        let result = run(&timeline, &[], &scenario);
        assert_eq!(result.overall, StepStatus::Ok);
        assert_eq!(result.steps[1].status, StepStatus::Ok);
        assert_eq!(result.steps[2].status, StepStatus::Ok);
    }

    #[test]
    fn forbidden_global_never_consumes() {
        let timeline = vec![row("A", 0, None), row("X", 1, None), row("B", 2, None)];
        let mut forbidden = ScenarioStep::required("X");
        forbidden.presence = Presence::Forbidden;
        forbidden.scope = Scope::Global;
        let (min, max, too_few, too_many) = super::presence_defaults(Presence::Forbidden);
        forbidden.min = min;
        forbidden.max = max;
        forbidden.too_few = too_few;
        forbidden.too_many = too_many;

        let scenario = Scenario {
            name: "t".into(),
            steps: vec![
                ScenarioStep::required("A"),
                forbidden,
                ScenarioStep::required("B"),
            ],
            constraints: Constraints::default(),
        };
        let result = run(&timeline, &[], &scenario);
        // Forbidden present → Fail, but B is still found (cursor unchanged).
        assert_eq!(result.steps[1].status, StepStatus::Fail);
        assert_eq!(result.steps[2].status, StepStatus::Ok);
        assert_eq!(result.overall, StepStatus::Fail);
    }

    #[test]
    fn forbidden_absent_is_ok() {
        let timeline = vec![row("A", 0, None)];
        let mut forbidden = ScenarioStep::required("X");
        forbidden.presence = Presence::Forbidden;
        forbidden.scope = Scope::Global;
        forbidden.min = 0;
        forbidden.max = 0;
        forbidden.too_few = StepStatus::Ok;

        let scenario = Scenario {
            name: "t".into(),
            steps: vec![ScenarioStep::required("A"), forbidden],
            constraints: Constraints::default(),
        };
        assert_eq!(run(&timeline, &[], &scenario).overall, StepStatus::Ok);
    }

    #[test]
    fn any_of_matches_either_type() {
        let timeline = vec![row("DNS", 0, None), row("TAC", 1, None)];
        let step = ScenarioStep {
            kind: StepKind::AnyOf(vec!["DNS".into(), "DNSbyME".into()]),
            ..ScenarioStep::required("DNS")
        };
        let scenario = Scenario {
            name: "t".into(),
            steps: vec![step, ScenarioStep::required("TAC")],
            constraints: Constraints::default(),
        };
        let result = run(&timeline, &[], &scenario);
        assert_eq!(result.overall, StepStatus::Ok);
        assert_eq!(result.steps[0].matched_types, vec!["DNS".to_string()]);
    }

    #[test]
    fn max_gap_violation_fails_later_step() {
        let timeline = vec![row("A", 0, Some(0)), row("B", 1, Some(120))];
        let mut scenario = required_scenario(&["A", "B"]);
        scenario.constraints.max_gap_enabled = true;
        scenario.constraints.max_gap_seconds = 30;
        let result = run(&timeline, &[], &scenario);
        assert_eq!(result.steps[0].status, StepStatus::Ok);
        assert_eq!(result.steps[1].status, StepStatus::Fail);
        assert!(result.steps[1].reason.as_deref().unwrap().contains("gap"));
    }

    #[test]
    fn max_gap_unknown_timestamp_warns() {
        let timeline = vec![row("A", 0, Some(0)), row("B", 1, None)];
        let mut scenario = required_scenario(&["A", "B"]);
        scenario.constraints.max_gap_enabled = true;
        let result = run(&timeline, &[], &scenario);
        assert_eq!(result.steps[1].status, StepStatus::Warn);
    }

    #[test]
    fn critical_issue_upgrades_to_warn() {
        let timeline = vec![row("A", 4, None)];
        let issues = vec![ValidationIssue {
            severity: Severity::Critical,
            category: "Resource Leak".into(),
            message: "leak".into(),
            item_index: Some(4),
            timestamp: None,
        }];
        let result = run(&timeline, &issues, &required_scenario(&["A"]));
        assert_eq!(result.steps[0].status, StepStatus::Warn);
        assert_eq!(result.overall, StepStatus::Warn);
    }

    #[test]
    fn too_many_required_fails_by_default() {
        let timeline = vec![row("A", 0, None), row("A", 1, None)];
        let result = run(&timeline, &[], &required_scenario(&["A"]));
        assert_eq!(result.overall, StepStatus::Fail);
        assert!(result.summary.contains("A(2)x"));
    }

    #[test]
    fn step_defaults_from_json() {
        let json = r#"{
            "scenarios": {
                "Nominal": {
                    "sequence": [
                        "DNSbyME",
                        {"type": "DNS", "presence": "optional"},
                        {"any_of": ["TAC", "DP+"], "min": 1, "max": 3, "too_many": "warn"},
                        {"type": "Refresh", "presence": "forbidden", "scope": "global"}
                    ],
                    "constraints": {"max_gap_enabled": true, "max_gap_seconds": 45}
                }
            },
            "selected_scenario": "Nominal"
        }"#;
        let file: ScenarioFile = serde_json::from_str(json).unwrap();
        let def = file.scenarios.into_iter().next().unwrap();
        let scenario = scenario_from_def(&def.0, def.1).unwrap();
        assert_eq!(scenario.steps.len(), 4);

        let s0 = &scenario.steps[0];
        assert_eq!(s0.presence, Presence::Required);
        assert_eq!((s0.min, s0.max), (1, 1));

        let s1 = &scenario.steps[1];
        assert_eq!(s1.presence, Presence::Optional);
        assert_eq!((s1.min, s1.max), (0, 1));
        assert_eq!(s1.too_many, StepStatus::Warn);

        let s2 = &scenario.steps[2];
        assert!(matches!(s2.kind, StepKind::AnyOf(_)));
        assert_eq!((s2.min, s2.max), (1, 3));
        assert_eq!(s2.too_many, StepStatus::Warn);

        let s3 = &scenario.steps[3];
        assert_eq!(s3.presence, Presence::Forbidden);
        assert_eq!(s3.scope, Scope::Global);
        assert_eq!(s3.max, 0);

        assert!(scenario.constraints.max_gap_enabled);
        assert_eq!(scenario.constraints.max_gap_seconds, 45);
    }

    #[test]
    fn find_scenario_is_case_insensitive() {
        let mut scenarios = BTreeMap::new();
        scenarios.insert("Nominal".to_string(), Scenario::default_scenario());
        assert!(find_scenario(&scenarios, "nominal").is_ok());
        assert!(matches!(
            find_scenario(&scenarios, "other"),
            Err(ScenarioError::Unknown(_))
        ));
    }
}

//! Analytical pipeline for Universal Tracer SIM/eUICC traces.
//!
//! The crate turns a flat XML trace of APDU exchanges into a higher-order
//! view: paired FETCH / TERMINAL RESPONSE exchanges, reconstructed BIP
//! channel sessions with inferred endpoint roles, reassembled payload
//! streams with protocol classification (TLS, DNS, JSON, HTTP, BER), a
//! validation log of anomalies, a chronological flow timeline, and a
//! declarative scenario engine over that timeline.
//!
//! Ingestion produces an immutable [`model::TraceModel`]; every later stage
//! reads it and builds its own read-only output, so independent traces can
//! be processed in parallel and analyses never interfere.

pub mod apdu;
pub mod config;
pub mod flow;
pub mod ingest;
pub mod model;
pub mod output;
pub mod pairing;
pub mod protocol;
pub mod reassembly;
pub mod scenario;
pub mod session;
pub mod validate;

use std::path::Path;

pub use config::AnalysisConfig;
pub use ingest::{CancelToken, IngestError};
pub use model::TraceModel;

use protocol::tls::{self, TlsMessage};
use reassembly::Direction;

/// Load a trace file into the immutable model.
pub fn load(path: &Path) -> Result<TraceModel, IngestError> {
    ingest::load(path)
}

/// Everything derived from one trace, computed in a single pass.
#[derive(Debug)]
pub struct Analysis {
    pub pairing: pairing::Pairing,
    pub sessions: Vec<session::ChannelSession>,
    pub issues: Vec<validate::ValidationIssue>,
    pub timeline: Vec<flow::TimelineRow>,
}

impl Analysis {
    pub fn run(model: &TraceModel, config: &AnalysisConfig) -> Analysis {
        let (sessions, session_issues) = session::reconstruct_with_roles(model, config);
        let issues = validate::finish(model, &sessions, session_issues, config);
        let timeline = flow::build(model, &sessions, config);
        Analysis {
            pairing: pairing::pair(model),
            sessions,
            issues,
            timeline,
        }
    }

    /// Like [`Analysis::run`], checking the token between stages. Returns
    /// `None` on cancellation; partial outputs are discarded.
    pub fn run_with_cancel(
        model: &TraceModel,
        config: &AnalysisConfig,
        token: &CancelToken,
    ) -> Option<Analysis> {
        let (sessions, session_issues) = session::reconstruct_with_roles(model, config);
        if token.is_cancelled() {
            return None;
        }
        let issues = validate::finish(model, &sessions, session_issues, config);
        if token.is_cancelled() {
            return None;
        }
        let timeline = flow::build(model, &sessions, config);
        if token.is_cancelled() {
            return None;
        }
        Some(Analysis {
            pairing: pairing::pair(model),
            sessions,
            issues,
            timeline,
        })
    }
}

/// FETCH ↔ TERMINAL RESPONSE pairing with navigation indices.
pub fn pairs(model: &TraceModel) -> pairing::Pairing {
    pairing::pair(model)
}

/// Reconstructed channel sessions with roles resolved.
pub fn sessions(model: &TraceModel, config: &AnalysisConfig) -> Vec<session::ChannelSession> {
    session::reconstruct_with_roles(model, config).0
}

/// All validation issues, sorted chronologically.
pub fn validate(model: &TraceModel, config: &AnalysisConfig) -> Vec<validate::ValidationIssue> {
    validate::validate(model, config)
}

/// Chronological flow timeline of sessions and key events.
pub fn flow(model: &TraceModel, config: &AnalysisConfig) -> Vec<flow::TimelineRow> {
    let (sessions, _) = session::reconstruct_with_roles(model, config);
    flow::build(model, &sessions, config)
}

/// Evaluate a scenario against the flow timeline.
pub fn run_scenario(
    model: &TraceModel,
    scenario: &scenario::Scenario,
    config: &AnalysisConfig,
) -> scenario::ScenarioResult {
    let analysis = Analysis::run(model, config);
    scenario::run(&analysis.timeline, &analysis.issues, scenario)
}

/// One entry of a session's reconstructed TLS flow.
#[derive(Debug, Clone)]
pub struct TlsFlowEntry {
    pub direction: Direction,
    /// Source trace item of the first record carrying this message.
    pub item_index: Option<usize>,
    pub label: String,
    pub message: TlsMessage,
}

/// Best-effort TLS flow of one session, both directions merged in trace
/// order.
pub fn tls_flow(
    model: &TraceModel,
    session: &session::ChannelSession,
    config: &AnalysisConfig,
) -> Vec<TlsFlowEntry> {
    let streams = reassembly::reassemble(model, session, config);
    let mut entries = Vec::new();

    for (direction, stream) in [
        (Direction::MeToSim, &streams.outbound),
        (Direction::SimToMe, &streams.inbound),
    ] {
        let analysis = tls::analyze_stream(&stream.data);
        for positioned in analysis.messages {
            let item_index = analysis
                .records
                .get(positioned.record_index)
                .and_then(|r| stream.item_at(r.body_offset.saturating_sub(5)));
            entries.push(TlsFlowEntry {
                direction,
                item_index,
                label: positioned.message.label(),
                message: positioned.message,
            });
        }
    }

    entries.sort_by_key(|e| e.item_index.unwrap_or(usize::MAX));
    entries
}

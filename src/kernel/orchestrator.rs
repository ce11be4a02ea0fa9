//! Pipeline orchestration (C7) — the declarative agent-graph state machine.
//!
//! The Orchestrator drives a pipeline forward one step at a time: given an
//! agent's result it decides the next stage, tracks edge traversals, detects
//! loop-backs, and enforces bounds. It exposes the decision as an explicit
//! `Instruction`; it never executes an agent itself.
//!
//! Metrics recording is split deliberately: the Orchestrator updates the
//! envelope's own bounds counters (needed for routing and bounds checks) but
//! does not reach into ResourceTracker directly — Kernel, which holds both,
//! forwards the same metrics to ResourceTracker so the per-pid ledger there
//! stays canonical. This keeps subsystems arena-owned with no cross-subsystem
//! pointers.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::envelope::{Envelope, FlowInterrupt, ProcessingRecord, TerminalReason, ToolAccess};
use crate::types::{Error, ProcessId, Result};

/// Stage names that never appear in `stage_order` and aren't looked up as
/// agents: `end` terminates the session, `clarification`/`confirmation` are
/// reserved for interrupt-driven flows.
const RESERVED_STAGES: [&str; 3] = ["end", "clarification", "confirmation"];

// =============================================================================
// Instruction types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstructionKind {
    RunAgent,
    Terminate,
    WaitInterrupt,
}

/// What the external worker must do next. Exactly one variant's fields are
/// meaningful, discriminated by `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instruction {
    pub kind: InstructionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_config: Option<AgentConfig>,
    pub envelope: Envelope,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal_reason: Option<TerminalReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination_message: Option<String>,
    pub interrupt_pending: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interrupt: Option<FlowInterrupt>,
}

/// Metrics an external worker reports after running an agent. `agent_hops`
/// is not a field here: the algorithm always attributes exactly one hop per
/// `ProcessAgentResult` call when metrics are present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentExecutionMetrics {
    pub llm_calls: i32,
    pub tool_calls: i32,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub duration_ms: i64,
}

// =============================================================================
// Routing
// =============================================================================

/// Free-form routing comparison value. Deserializes from any JSON scalar or
/// structure; equality is defined per-variant with no cross-variant
/// matches — `"1" != 1` and `true != "true"` (§9 design note).
#[derive(Debug, Clone, PartialEq)]
pub enum RoutingValue {
    String(String),
    Bool(bool),
    Number(f64),
    Json(Value),
}

impl From<Value> for RoutingValue {
    fn from(value: Value) -> Self {
        match value {
            Value::String(s) => RoutingValue::String(s),
            Value::Bool(b) => RoutingValue::Bool(b),
            Value::Number(n) => RoutingValue::Number(n.as_f64().unwrap_or(0.0)),
            other => RoutingValue::Json(other),
        }
    }
}

impl RoutingValue {
    /// Does this rule value match an agent output field's actual value?
    fn matches(&self, actual: &Value) -> bool {
        let actual = RoutingValue::from(actual.clone());
        match (self, &actual) {
            (RoutingValue::String(a), RoutingValue::String(b)) => a == b,
            (RoutingValue::Bool(a), RoutingValue::Bool(b)) => a == b,
            (RoutingValue::Number(a), RoutingValue::Number(b)) => a == b,
            (RoutingValue::Json(a), RoutingValue::Json(b)) => a == b,
            _ => false,
        }
    }
}

impl Serialize for RoutingValue {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            RoutingValue::String(v) => v.serialize(s),
            RoutingValue::Bool(v) => v.serialize(s),
            RoutingValue::Number(v) => v.serialize(s),
            RoutingValue::Json(v) => v.serialize(s),
        }
    }
}

impl<'de> Deserialize<'de> for RoutingValue {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        Ok(RoutingValue::from(Value::deserialize(d)?))
    }
}

/// One routing decision: if `output[condition] == value`, go to `target`.
/// Rules are evaluated in declaration order; the first match wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    pub condition: String,
    pub value: RoutingValue,
    pub target: String,
}

// =============================================================================
// Pipeline config
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    #[serde(default)]
    pub stage_order: i32,
    #[serde(default)]
    pub has_llm: bool,
    #[serde(default)]
    pub has_tools: bool,
    #[serde(default)]
    pub output_key: String,
    #[serde(default)]
    pub prompt_key: String,
    #[serde(default)]
    pub required_output_fields: Vec<String>,
    #[serde(default)]
    pub routing_rules: Vec<RoutingRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_next: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_next: Option<String>,
    #[serde(default)]
    pub tool_access: ToolAccess,
    #[serde(default)]
    pub allowed_tools: HashMap<String, bool>,
    #[serde(default)]
    pub model_role: String,
    #[serde(default)]
    pub temperature: f64,
    #[serde(default)]
    pub max_tokens: i64,
}

/// `{from, to, max_count}`. A transition may traverse an edge up to
/// `max_count` times; the `max_count + 1`th traversal terminates the
/// session. Zero or missing = unlimited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeLimit {
    pub from: String,
    pub to: String,
    pub max_count: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    pub agents: Vec<AgentConfig>,
    #[serde(default)]
    pub max_iterations: i32,
    #[serde(default)]
    pub max_llm_calls: i32,
    #[serde(default)]
    pub max_agent_hops: i32,
    #[serde(default)]
    pub edge_limits: Vec<EdgeLimit>,
}

impl PipelineConfig {
    pub fn get_stage_order(&self) -> Vec<String> {
        self.agents.iter().map(|a| a.name.clone()).collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::validation("pipeline name is required"));
        }
        if self.agents.is_empty() {
            return Err(Error::validation("pipeline must have at least one stage"));
        }
        Ok(())
    }

    fn agent(&self, stage_name: &str) -> Option<&AgentConfig> {
        self.agents.iter().find(|a| a.name == stage_name)
    }

    fn edge_limit(&self, from: &str, to: &str) -> Option<i32> {
        self.edge_limits
            .iter()
            .find(|e| e.from == from && e.to == to)
            .map(|e| e.max_count)
    }
}

// =============================================================================
// Session
// =============================================================================

/// One active pipeline execution, keyed by pid. Mutated only under the
/// Orchestrator's lock.
#[derive(Debug, Clone)]
pub struct OrchestrationSession {
    pub process_id: ProcessId,
    pub pipeline_config: PipelineConfig,
    pub envelope: Envelope,
    pub edge_traversals: HashMap<String, i32>,
    pub terminated: bool,
    pub terminal_reason: Option<TerminalReason>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub process_id: String,
    pub current_stage: String,
    pub stage_order: Vec<String>,
    pub envelope: Envelope,
    pub edge_traversals: HashMap<String, i32>,
    pub terminated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal_reason: Option<TerminalReason>,
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Owns the sessions map exclusively (§3). A single lock (held by the
/// caller in Kernel) guards the whole map; `get_next_instruction` and
/// `process_agent_result` need the write side because building an
/// instruction can record agent-start as a side effect.
#[derive(Debug, Default)]
pub struct Orchestrator {
    sessions: HashMap<String, OrchestrationSession>,
}

impl Orchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate `pipeline_config`; reject a duplicate pid unless
    /// `force=true` (create-or-replace). Seeds the envelope's bounds and
    /// `stage_order` from the config, and resets `current_stage` if it's
    /// empty or unknown (and not a reserved stage name).
    pub fn initialize_session(
        &mut self,
        process_id: ProcessId,
        pipeline_config: PipelineConfig,
        mut envelope: Envelope,
        force: bool,
    ) -> Result<SessionState> {
        if self.sessions.contains_key(process_id.as_str()) && !force {
            return Err(Error::already_exists(format!(
                "session already exists for process {process_id} (use force=true to replace)"
            )));
        }

        pipeline_config.validate()?;

        envelope.pipeline.max_iterations = pipeline_config.max_iterations;
        envelope.bounds.max_llm_calls = pipeline_config.max_llm_calls;
        envelope.bounds.max_agent_hops = pipeline_config.max_agent_hops;
        envelope.pipeline.stage_order = pipeline_config.get_stage_order();

        let known = envelope
            .pipeline
            .stage_order
            .contains(&envelope.pipeline.current_stage);
        let reserved = RESERVED_STAGES.contains(&envelope.pipeline.current_stage.as_str());
        if (envelope.pipeline.current_stage.is_empty() || !known)
            && !reserved
            && !envelope.pipeline.stage_order.is_empty()
        {
            envelope.pipeline.current_stage = envelope.pipeline.stage_order[0].clone();
        }

        let now = Utc::now();
        let session = OrchestrationSession {
            process_id: process_id.clone(),
            pipeline_config,
            envelope,
            edge_traversals: HashMap::new(),
            terminated: false,
            terminal_reason: None,
            created_at: now,
            last_activity_at: now,
        };

        let state = build_session_state(&session);
        self.sessions.insert(process_id.to_string(), session);
        Ok(state)
    }

    /// Compute the instruction for a session's current state.
    pub fn get_next_instruction(&mut self, process_id: &ProcessId) -> Result<Instruction> {
        let session = self
            .sessions
            .get_mut(process_id.as_str())
            .ok_or_else(|| Error::not_found(format!("unknown process: {process_id}")))?;
        session.last_activity_at = Utc::now();
        Ok(build_instruction(session))
    }

    /// The main step function (§4.5). Records the agent's output and
    /// metrics, then routes to the next stage or terminates.
    pub fn process_agent_result(
        &mut self,
        process_id: &ProcessId,
        agent_name: &str,
        output: HashMap<String, Value>,
        metrics: Option<AgentExecutionMetrics>,
        success: bool,
        error_msg: Option<String>,
    ) -> Result<Instruction> {
        let session = self
            .sessions
            .get_mut(process_id.as_str())
            .ok_or_else(|| Error::not_found(format!("unknown process: {process_id}")))?;

        if session.terminated {
            return Ok(build_instruction(session));
        }

        session.envelope.outputs.insert(agent_name.to_string(), output.clone());

        if let Some(m) = &metrics {
            session.envelope.bounds.llm_call_count += m.llm_calls;
            session.envelope.bounds.tool_call_count += m.tool_calls;
            session.envelope.bounds.tokens_in += m.tokens_in;
            session.envelope.bounds.tokens_out += m.tokens_out;
            session.envelope.bounds.agent_hop_count += 1;
        }

        let from_stage = session.envelope.pipeline.current_stage.clone();
        session.envelope.complete_stage(&from_stage);
        session.envelope.add_processing_record(ProcessingRecord {
            agent: agent_name.to_string(),
            stage_order: session
                .envelope
                .pipeline
                .stage_order
                .iter()
                .position(|s| s == &from_stage)
                .map(|i| i as i32)
                .unwrap_or(-1),
            started_at: session.last_activity_at,
            completed_at: Some(Utc::now()),
            duration_ms: metrics.as_ref().map(|m| m.duration_ms as i32).unwrap_or(0),
            status: if success { "success".to_string() } else { "error".to_string() },
            error: error_msg.clone(),
            llm_calls: metrics.as_ref().map(|m| m.llm_calls).unwrap_or(0),
        });
        session.last_activity_at = Utc::now();

        if !success {
            match session.pipeline_config.agent(&from_stage).and_then(|a| a.error_next.clone()) {
                Some(to_stage) => advance_stage(session, &from_stage, &to_stage),
                None => terminate_session(
                    session,
                    TerminalReason::ToolFailedFatally,
                    error_msg.unwrap_or_else(|| "agent reported failure".to_string()),
                ),
            }
            return Ok(build_instruction(session));
        }

        let to_stage = match session.pipeline_config.agent(&from_stage) {
            Some(cfg) => evaluate_routing(cfg, &output)
                .or_else(|| cfg.default_next.clone())
                .unwrap_or_else(|| "end".to_string()),
            None => "end".to_string(),
        };
        advance_stage(session, &from_stage, &to_stage);

        Ok(build_instruction(session))
    }

    pub fn get_session_state(&self, process_id: &ProcessId) -> Result<SessionState> {
        let session = self
            .sessions
            .get(process_id.as_str())
            .ok_or_else(|| Error::not_found(format!("unknown process: {process_id}")))?;
        Ok(build_session_state(session))
    }

    pub fn cleanup_session(&mut self, process_id: &ProcessId) -> bool {
        self.sessions.remove(process_id.as_str()).is_some()
    }

    pub fn get_session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Remove sessions that are terminated OR idle past `max_age_seconds`.
    pub fn cleanup_stale_sessions(&mut self, max_age_seconds: i64) -> usize {
        let cutoff = Utc::now() - chrono::Duration::seconds(max_age_seconds);
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.terminated || s.last_activity_at < cutoff)
            .map(|(pid, _)| pid.clone())
            .collect();
        let count = stale.len();
        for pid in stale {
            self.sessions.remove(&pid);
        }
        count
    }

    pub fn get_envelope_for_process(&self, process_id: &ProcessId) -> Option<&Envelope> {
        self.sessions.get(process_id.as_str()).map(|s| &s.envelope)
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn evaluate_routing(cfg: &AgentConfig, output: &HashMap<String, Value>) -> Option<String> {
    cfg.routing_rules.iter().find_map(|rule| {
        let actual = output.get(&rule.condition)?;
        rule.value.matches(actual).then(|| rule.target.clone())
    })
}

/// Apply edge-traversal bookkeeping, loop-back detection, and the edge-limit
/// check, then set `current_stage`. May terminate the session in place.
fn advance_stage(session: &mut OrchestrationSession, from_stage: &str, to_stage: &str) {
    if from_stage != to_stage && to_stage != "end" {
        let key = format!("{from_stage}->{to_stage}");
        let count = {
            let entry = session.edge_traversals.entry(key.clone()).or_insert(0);
            *entry += 1;
            *entry
        };

        let stage_order = &session.envelope.pipeline.stage_order;
        let from_idx = stage_order.iter().position(|s| s == from_stage);
        let to_idx = stage_order.iter().position(|s| s == to_stage);
        if let (Some(from_idx), Some(to_idx)) = (from_idx, to_idx) {
            if to_idx < from_idx {
                session.envelope.pipeline.iteration += 1;
            }
        }

        if let Some(max_count) = session.pipeline_config.edge_limit(from_stage, to_stage) {
            if max_count > 0 && count > max_count {
                terminate_session(
                    session,
                    TerminalReason::MaxLoopExceeded,
                    format!("edge {key} exceeded limit {max_count}"),
                );
            }
        }
    }

    session.envelope.pipeline.current_stage = to_stage.to_string();
}

fn terminate_session(session: &mut OrchestrationSession, reason: TerminalReason, message: String) {
    session.terminated = true;
    session.terminal_reason = Some(reason);
    session.envelope.terminate(message);
    session.envelope.bounds.terminal_reason = Some(reason);
}

/// Bounds check (§4.5), ordered: iteration, then llm_calls, then agent_hops.
/// Comparison is `>=`, not `>` — a zero limit terminates immediately.
fn check_bounds(envelope: &Envelope) -> Option<TerminalReason> {
    if envelope.pipeline.iteration >= envelope.pipeline.max_iterations {
        return Some(TerminalReason::MaxIterationsExceeded);
    }
    if envelope.bounds.llm_call_count >= envelope.bounds.max_llm_calls {
        return Some(TerminalReason::MaxLlmCallsExceeded);
    }
    if envelope.bounds.agent_hop_count >= envelope.bounds.max_agent_hops {
        return Some(TerminalReason::MaxAgentHopsExceeded);
    }
    None
}

/// Build the instruction for a session's current state, per the precedence
/// table in §4.5. May mutate the session (terminate it, or record agent
/// start) as a side effect — callers must hold the write lock.
fn build_instruction(session: &mut OrchestrationSession) -> Instruction {
    if session.terminated {
        return Instruction {
            kind: InstructionKind::Terminate,
            agent_name: None,
            agent_config: None,
            envelope: session.envelope.clone(),
            terminal_reason: session.terminal_reason,
            termination_message: session.envelope.bounds.termination_reason.clone(),
            interrupt_pending: false,
            interrupt: None,
        };
    }

    if session.envelope.pipeline.current_stage == "end" {
        terminate_session(session, TerminalReason::Completed, "pipeline completed".to_string());
        return Instruction {
            kind: InstructionKind::Terminate,
            agent_name: None,
            agent_config: None,
            envelope: session.envelope.clone(),
            terminal_reason: session.terminal_reason,
            termination_message: session.envelope.bounds.termination_reason.clone(),
            interrupt_pending: false,
            interrupt: None,
        };
    }

    if session.envelope.interrupts.interrupt_pending {
        return Instruction {
            kind: InstructionKind::WaitInterrupt,
            agent_name: None,
            agent_config: None,
            envelope: session.envelope.clone(),
            terminal_reason: None,
            termination_message: None,
            interrupt_pending: true,
            interrupt: session.envelope.interrupts.interrupt.clone(),
        };
    }

    if let Some(reason) = check_bounds(&session.envelope) {
        terminate_session(session, reason, format!("bounds exceeded: {reason:?}"));
        return Instruction {
            kind: InstructionKind::Terminate,
            agent_name: None,
            agent_config: None,
            envelope: session.envelope.clone(),
            terminal_reason: Some(reason),
            termination_message: session.envelope.bounds.termination_reason.clone(),
            interrupt_pending: false,
            interrupt: None,
        };
    }

    let current_stage = session.envelope.pipeline.current_stage.clone();
    let agent_config = session.pipeline_config.agent(&current_stage).cloned();
    let Some(agent_config) = agent_config else {
        terminate_session(
            session,
            TerminalReason::ToolFailedFatally,
            format!("unknown stage: {current_stage}"),
        );
        return Instruction {
            kind: InstructionKind::Terminate,
            agent_name: None,
            agent_config: None,
            envelope: session.envelope.clone(),
            terminal_reason: session.terminal_reason,
            termination_message: session.envelope.bounds.termination_reason.clone(),
            interrupt_pending: false,
            interrupt: None,
        };
    };

    session.envelope.start_stage(&current_stage);
    Instruction {
        kind: InstructionKind::RunAgent,
        agent_name: Some(agent_config.name.clone()),
        agent_config: Some(agent_config),
        envelope: session.envelope.clone(),
        terminal_reason: None,
        termination_message: None,
        interrupt_pending: false,
        interrupt: None,
    }
}

fn build_session_state(session: &OrchestrationSession) -> SessionState {
    SessionState {
        process_id: session.process_id.to_string(),
        current_stage: session.envelope.pipeline.current_stage.clone(),
        stage_order: session.envelope.pipeline.stage_order.clone(),
        envelope: session.envelope.clone(),
        edge_traversals: session.edge_traversals.clone(),
        terminated: session.terminated,
        terminal_reason: session.terminal_reason,
    }
}

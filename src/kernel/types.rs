//! Kernel types: ProcessState, ProcessControlBlock, resource quota/usage (C1).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::envelope::InterruptKind;
use crate::types::{DefaultLimits, ProcessId, RequestId, SessionId, UserId};

/// Process lifecycle state (Unix-like).
///
/// State transitions:
/// ```text
/// NEW → READY → RUNNING → {WAITING | BLOCKED | TERMINATED}
///                    ↓         ↓
///                  READY     ZOMBIE
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProcessState {
    New,
    Ready,
    Running,
    Waiting,
    Blocked,
    Terminated,
    Zombie,
}

impl ProcessState {
    /// Check if this is a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessState::Terminated | ProcessState::Zombie)
    }

    /// Check if process can be scheduled.
    pub fn can_schedule(self) -> bool {
        matches!(self, ProcessState::New | ProcessState::Ready)
    }

    /// Check if process is runnable.
    pub fn is_runnable(self) -> bool {
        self == ProcessState::Ready
    }

    /// Check if transition is valid, per the §4.1 state grammar.
    pub fn can_transition_to(self, to: ProcessState) -> bool {
        matches!(
            (self, to),
            (ProcessState::New, ProcessState::Ready)
                | (ProcessState::New, ProcessState::Terminated)
                | (ProcessState::Ready, ProcessState::Running)
                | (ProcessState::Ready, ProcessState::Terminated)
                | (ProcessState::Running, ProcessState::Ready)
                | (ProcessState::Running, ProcessState::Waiting)
                | (ProcessState::Running, ProcessState::Blocked)
                | (ProcessState::Running, ProcessState::Terminated)
                | (ProcessState::Waiting, ProcessState::Ready)
                | (ProcessState::Waiting, ProcessState::Terminated)
                | (ProcessState::Blocked, ProcessState::Ready)
                | (ProcessState::Blocked, ProcessState::Terminated)
                | (ProcessState::Terminated, ProcessState::Zombie)
        )
    }
}

/// Scheduling priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum SchedulingPriority {
    Realtime,
    High,
    Normal,
    Low,
    Idle,
}

impl SchedulingPriority {
    /// Heap priority value (lower = higher priority, REALTIME=0 .. IDLE=4).
    pub fn to_heap_value(self) -> i32 {
        match self {
            SchedulingPriority::Realtime => 0,
            SchedulingPriority::High => 1,
            SchedulingPriority::Normal => 2,
            SchedulingPriority::Low => 3,
            SchedulingPriority::Idle => 4,
        }
    }
}

impl Default for SchedulingPriority {
    fn default() -> Self {
        SchedulingPriority::Normal
    }
}

/// Resource quota (cgroup-style static limits, §3). Immutable except via
/// explicit `AdjustQuota`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceQuota {
    pub max_llm_calls: i32,
    pub max_tool_calls: i32,
    pub max_agent_hops: i32,
    pub max_iterations: i32,
    pub max_input_tokens: i64,
    pub max_output_tokens: i64,
    pub max_context_tokens: i64,
    pub timeout_seconds: i64,
    pub soft_timeout_seconds: i64,
    pub rate_limit_rpm: i32,
    pub rate_limit_rph: i32,
    pub rate_limit_burst: i32,
    pub max_inference_requests: i32,
    pub max_inference_input_chars: i64,
}

impl ResourceQuota {
    pub fn default_quota() -> Self {
        DefaultLimits::default().into()
    }
}

impl Default for ResourceQuota {
    fn default() -> Self {
        Self::default_quota()
    }
}

impl From<DefaultLimits> for ResourceQuota {
    fn from(limits: DefaultLimits) -> Self {
        Self {
            max_llm_calls: limits.max_llm_calls as i32,
            max_tool_calls: limits.max_tool_calls as i32,
            max_agent_hops: limits.max_agent_hops as i32,
            max_iterations: limits.max_iterations as i32,
            max_input_tokens: limits.max_input_tokens as i64,
            max_output_tokens: limits.max_output_tokens as i64,
            max_context_tokens: limits.max_context_tokens as i64,
            timeout_seconds: limits.timeout.as_secs() as i64,
            soft_timeout_seconds: limits.soft_timeout.as_secs() as i64,
            rate_limit_rpm: limits.rate_limit_rpm as i32,
            rate_limit_rph: limits.rate_limit_rph as i32,
            rate_limit_burst: limits.rate_limit_burst as i32,
            max_inference_requests: limits.max_inference_requests as i32,
            max_inference_input_chars: limits.max_inference_input_chars as i64,
        }
    }
}

/// Cumulative per-process resource usage (§3). Mutated only under
/// ResourceTracker's lock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ResourceUsage {
    pub llm_calls: i32,
    pub tool_calls: i32,
    pub agent_hops: i32,
    pub iterations: i32,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub elapsed_seconds: f64,
    pub inference_requests: i32,
    pub inference_input_chars: i64,
}

impl ResourceUsage {
    /// First-exceeded-reason check in the declared order (I5): llm_calls →
    /// tool_calls → agent_hops → iterations → elapsed. Token/inference
    /// limits are checked separately via `CheckInferenceQuota`.
    pub fn exceeds_quota(&self, quota: &ResourceQuota) -> Option<&'static str> {
        if self.llm_calls > quota.max_llm_calls {
            return Some("max_llm_calls_exceeded");
        }
        if self.tool_calls > quota.max_tool_calls {
            return Some("max_tool_calls_exceeded");
        }
        if self.agent_hops > quota.max_agent_hops {
            return Some("max_agent_hops_exceeded");
        }
        if self.iterations > quota.max_iterations {
            return Some("max_iterations_exceeded");
        }
        if self.elapsed_seconds > quota.timeout_seconds as f64 {
            return Some("timeout_exceeded");
        }
        None
    }
}

/// Process Control Block — the scheduler's per-request metadata (§3),
/// distinct from the envelope which carries domain state.
///
/// `quota`/`usage` mirror ResourceTracker's canonical per-PID record (it is
/// the sole mutator, per §3's ownership rule); Kernel refreshes the mirror
/// after every ResourceTracker call so queries against the PCB stay current
/// without ResourceTracker reaching across subsystems.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessControlBlock {
    pub pid: ProcessId,
    pub request_id: RequestId,
    pub user_id: UserId,
    pub session_id: SessionId,

    pub state: ProcessState,
    pub priority: SchedulingPriority,

    pub quota: ResourceQuota,
    pub usage: ResourceUsage,

    pub created_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_scheduled_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_service: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_interrupt: Option<InterruptKind>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub interrupt_data: Option<HashMap<String, serde_json::Value>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_pid: Option<ProcessId>,

    pub child_pids: Vec<ProcessId>,
}

impl ProcessControlBlock {
    pub fn new(pid: ProcessId, request_id: RequestId, user_id: UserId, session_id: SessionId) -> Self {
        Self::with_quota(pid, request_id, user_id, session_id, ResourceQuota::default())
    }

    pub fn with_quota(
        pid: ProcessId,
        request_id: RequestId,
        user_id: UserId,
        session_id: SessionId,
        quota: ResourceQuota,
    ) -> Self {
        Self {
            pid,
            request_id,
            user_id,
            session_id,
            state: ProcessState::New,
            priority: SchedulingPriority::default(),
            quota,
            usage: ResourceUsage::default(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            last_scheduled_at: None,
            current_stage: None,
            current_service: None,
            pending_interrupt: None,
            interrupt_data: None,
            parent_pid: None,
            child_pids: Vec::new(),
        }
    }

    /// Transition to RUNNING state. `started_at` is stamped only the first
    /// time (§3 invariant: "started_at is set at most once").
    pub fn start(&mut self) {
        let now = Utc::now();
        self.state = ProcessState::Running;
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.last_scheduled_at = Some(now);
    }

    /// Transition to TERMINATED state.
    pub fn complete(&mut self) {
        let now = Utc::now();
        self.state = ProcessState::Terminated;
        self.completed_at = Some(now);
        if let Some(started) = self.started_at {
            self.usage.elapsed_seconds = (now - started).num_milliseconds() as f64 / 1000.0;
        }
    }

    /// Transition to BLOCKED state.
    pub fn block(&mut self, reason: String) {
        self.state = ProcessState::Blocked;
        self.interrupt_data
            .get_or_insert_with(HashMap::new)
            .insert("block_reason".to_string(), serde_json::Value::String(reason));
    }

    /// Transition to WAITING state.
    pub fn wait(&mut self, interrupt_kind: InterruptKind) {
        self.state = ProcessState::Waiting;
        self.pending_interrupt = Some(interrupt_kind);
    }

    /// Resume from WAITING/BLOCKED to READY.
    pub fn resume(&mut self) {
        if matches!(self.state, ProcessState::Waiting | ProcessState::Blocked) {
            self.state = ProcessState::Ready;
            self.pending_interrupt = None;
        }
    }

    pub fn check_quota(&self) -> Option<&'static str> {
        self.usage.exceeds_quota(&self.quota)
    }

    pub fn can_schedule(&self) -> bool {
        self.state.can_schedule()
    }

    pub fn is_runnable(&self) -> bool {
        self.state.is_runnable()
    }

    pub fn is_terminated(&self) -> bool {
        self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_grammar_matches_table() {
        assert!(ProcessState::New.can_transition_to(ProcessState::Ready));
        assert!(ProcessState::New.can_transition_to(ProcessState::Terminated));
        assert!(!ProcessState::New.can_transition_to(ProcessState::Running));
        assert!(ProcessState::Running.can_transition_to(ProcessState::Blocked));
        assert!(ProcessState::Terminated.can_transition_to(ProcessState::Zombie));
        assert!(!ProcessState::Zombie.can_transition_to(ProcessState::Ready));
        assert!(!ProcessState::Zombie.can_transition_to(ProcessState::Terminated));
    }

    #[test]
    fn started_at_set_once() {
        let mut pcb = ProcessControlBlock::new(
            ProcessId::must("p1"),
            RequestId::new(),
            UserId::must("u1"),
            SessionId::new(),
        );
        pcb.start();
        let first = pcb.started_at;
        pcb.state = ProcessState::Ready;
        pcb.start();
        assert_eq!(pcb.started_at, first);
    }

    #[test]
    fn check_quota_order_matches_i5() {
        let quota = ResourceQuota {
            max_llm_calls: 1,
            max_tool_calls: 1,
            max_agent_hops: 1,
            max_iterations: 1,
            timeout_seconds: 1,
            ..ResourceQuota::default()
        };
        let usage = ResourceUsage {
            llm_calls: 2,
            tool_calls: 2,
            agent_hops: 2,
            iterations: 2,
            elapsed_seconds: 2.0,
            ..Default::default()
        };
        assert_eq!(usage.exceeds_quota(&quota), Some("max_llm_calls_exceeded"));
    }

    #[test]
    fn check_quota_within_limits_is_none() {
        let quota = ResourceQuota::default();
        let usage = ResourceUsage::default();
        assert_eq!(usage.exceeds_quota(&quota), None);
    }
}

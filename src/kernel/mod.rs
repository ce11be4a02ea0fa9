//! Kernel (C6) - the facade that composes the subsystems.
//!
//! Each subsystem owns its own lock (§5); Kernel holds no aggregate lock of
//! its own. Methods take `&self` and acquire only the locks a given
//! operation actually needs, in a fixed order (lifecycle, then resources,
//! then orchestrator) to avoid lock-ordering deadlocks across calls that
//! touch more than one subsystem.
//!
//! The envelope is a value type (§3): handed in and out by clone at every
//! call boundary, never exposed by mutable reference.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

// Core types
pub mod types;

// Subsystem modules
pub mod cleanup;
pub mod events;
pub mod interrupts;
pub mod lifecycle;
pub mod orchestrator;
pub mod rate_limiter;
pub mod recovery;
pub mod resources;
pub mod services;

// Re-export key types
pub use cleanup::{CleanupConfig, CleanupService, CleanupStats};
pub use events::{EventHandler, KernelEvent, KernelEventType};
pub use interrupts::{CreateInterruptParams, InterruptOptions, InterruptService, InterruptStatus};
pub use lifecycle::LifecycleManager;
pub use rate_limiter::{RateLimitConfig, RateLimitResult, RateLimiter};
pub use recovery::with_recovery;
pub use resources::{QuotaAdjustment, ResourceTracker, UsageDelta};
pub use services::{RegistryStats, ServiceInfo, ServiceRegistry, ServiceStats, ServiceStatus};
pub use types::{ProcessControlBlock, ProcessState, ResourceQuota, ResourceUsage, SchedulingPriority};

use crate::envelope::{Envelope, FlowInterrupt, InterruptKind, InterruptResponse};
use crate::types::{Error, ProcessId, RequestId, Result, SessionId, UserId};

/// System placeholders used for events not tied to a single request (service
/// registration, background cleanup).
const SYSTEM_REQUEST: &str = "system";
const SYSTEM_USER: &str = "system";
const SYSTEM_SESSION: &str = "system";

/// Kernel - composes the subsystems behind one facade.
///
/// NOT a single-owner actor: every subsystem is reachable concurrently
/// through its own lock, so two unrelated processes can be scheduled,
/// metered, and interrupted at the same time without contending on each
/// other.
#[derive(Debug)]
pub struct Kernel {
    lifecycle: RwLock<LifecycleManager>,
    resources: RwLock<ResourceTracker>,
    rate_limiter: RateLimiter,
    interrupts: RwLock<InterruptService>,
    services: RwLock<ServiceRegistry>,
    orchestrator: RwLock<orchestrator::Orchestrator>,
    commbus: crate::commbus::CommBus,
    events: events::EventBus,
    process_envelopes: RwLock<HashMap<String, Envelope>>,
}

impl Kernel {
    pub fn new() -> Self {
        Self::with_config(None, None)
    }

    pub fn with_config(
        default_quota: Option<ResourceQuota>,
        rate_limit_config: Option<RateLimitConfig>,
    ) -> Self {
        let quota = default_quota.unwrap_or_default();
        Self {
            lifecycle: RwLock::new(LifecycleManager::new(Some(quota.clone()))),
            resources: RwLock::new(ResourceTracker::new(quota)),
            rate_limiter: RateLimiter::new(rate_limit_config.unwrap_or_default()),
            interrupts: RwLock::new(InterruptService::new()),
            services: RwLock::new(ServiceRegistry::new()),
            orchestrator: RwLock::new(orchestrator::Orchestrator::new()),
            commbus: crate::commbus::CommBus::new(),
            events: events::EventBus::new(),
            process_envelopes: RwLock::new(HashMap::new()),
        }
    }

    fn emit(
        &self,
        event_type: KernelEventType,
        request_id: &RequestId,
        user_id: &UserId,
        session_id: &SessionId,
        pid: Option<ProcessId>,
        data: Value,
    ) {
        self.events.emit(&KernelEvent {
            event_type,
            timestamp: Utc::now(),
            request_id: request_id.clone(),
            user_id: user_id.clone(),
            session_id: session_id.clone(),
            pid,
            data,
        });
    }

    pub fn register_event_handler(&self, handler: EventHandler) {
        self.events.register(handler);
    }

    pub fn commbus(&self) -> &crate::commbus::CommBus {
        &self.commbus
    }

    /// Refresh a PCB's `quota`/`usage` read-mirror from ResourceTracker's
    /// canonical record (§3). Returns the refreshed PCB, if the pid is
    /// known to both subsystems.
    fn sync_pcb_mirror(&self, pid: &ProcessId) -> Option<ProcessControlBlock> {
        let (usage, quota) = {
            let resources = self.resources.read().expect("resources lock poisoned");
            (resources.get_usage(pid)?, resources.get_quota(pid)?)
        };
        let mut lifecycle = self.lifecycle.write().expect("lifecycle lock poisoned");
        let pcb = lifecycle.get_mut(pid)?;
        pcb.usage = usage;
        pcb.quota = quota;
        Some(pcb.clone())
    }

    // =========================================================================
    // Process lifecycle (C2)
    // =========================================================================

    /// Submit + allocate + schedule a process in one call (§4.6: atomic from
    /// the caller's point of view). Rejected by the rate limiter before any
    /// subsystem state is touched.
    pub fn create_process(
        &self,
        pid: ProcessId,
        request_id: RequestId,
        user_id: UserId,
        session_id: SessionId,
        priority: SchedulingPriority,
        quota: Option<ResourceQuota>,
    ) -> Result<ProcessControlBlock> {
        let rl = self
            .rate_limiter
            .check_rate_limit(user_id.as_str(), "create_process", true);
        if !rl.allowed {
            return Err(Error::quota_exceeded(format!(
                "rate limit exceeded for user {user_id}: {} ({}/{})",
                rl.limit_type, rl.current, rl.limit
            )));
        }

        {
            let mut lifecycle = self.lifecycle.write().expect("lifecycle lock poisoned");
            lifecycle.submit(
                pid.clone(),
                request_id.clone(),
                user_id.clone(),
                session_id.clone(),
                priority,
                quota.clone(),
            )?;
        }
        {
            let mut resources = self.resources.write().expect("resources lock poisoned");
            resources.allocate(pid.clone(), quota);
        }
        {
            let mut lifecycle = self.lifecycle.write().expect("lifecycle lock poisoned");
            lifecycle.schedule(&pid)?;
        }

        let pcb = self
            .sync_pcb_mirror(&pid)
            .ok_or_else(|| Error::internal(format!("pid {pid} vanished during create_process")))?;

        self.emit(
            KernelEventType::ProcessCreated,
            &request_id,
            &user_id,
            &session_id,
            Some(pid),
            json!({ "priority": format!("{:?}", priority) }),
        );

        Ok(pcb)
    }

    pub fn get_process(&self, pid: &ProcessId) -> Option<ProcessControlBlock> {
        self.lifecycle
            .read()
            .expect("lifecycle lock poisoned")
            .get(pid)
            .cloned()
    }

    pub fn get_next_runnable(&self) -> Option<ProcessControlBlock> {
        self.lifecycle
            .write()
            .expect("lifecycle lock poisoned")
            .get_next_runnable()
    }

    pub fn schedule_process(&self, pid: &ProcessId) -> Result<()> {
        self.lifecycle
            .write()
            .expect("lifecycle lock poisoned")
            .schedule(pid)
    }

    pub fn start_process(&self, pid: &ProcessId) -> Result<()> {
        self.lifecycle
            .write()
            .expect("lifecycle lock poisoned")
            .start(pid)
    }

    pub fn block_process(&self, pid: &ProcessId, reason: String) -> Result<()> {
        self.lifecycle
            .write()
            .expect("lifecycle lock poisoned")
            .block(pid, reason)
    }

    /// Wait a process on an interrupt, stamping the interrupt onto its
    /// envelope if one is tracked.
    pub fn wait_process(&self, pid: &ProcessId, interrupt: FlowInterrupt) -> Result<()> {
        self.lifecycle
            .write()
            .expect("lifecycle lock poisoned")
            .wait(pid, interrupt.kind)?;
        if let Some(env) = self
            .process_envelopes
            .write()
            .expect("envelope lock poisoned")
            .get_mut(pid.as_str())
        {
            env.set_interrupt(interrupt);
        }
        Ok(())
    }

    pub fn resume_process(&self, pid: &ProcessId) -> Result<()> {
        self.lifecycle
            .write()
            .expect("lifecycle lock poisoned")
            .resume(pid)?;
        if let Some(env) = self
            .process_envelopes
            .write()
            .expect("envelope lock poisoned")
            .get_mut(pid.as_str())
        {
            env.clear_interrupt();
        }
        Ok(())
    }

    /// Terminate a process (§4.1). RUNNING processes require `force`;
    /// every other state terminates unconditionally.
    pub fn terminate_process(
        &self,
        pid: &ProcessId,
        reason: impl Into<String>,
        force: bool,
    ) -> Result<()> {
        let reason = reason.into();
        let (request_id, user_id, session_id) = {
            let lifecycle = self.lifecycle.read().expect("lifecycle lock poisoned");
            let pcb = lifecycle
                .get(pid)
                .ok_or_else(|| Error::not_found(format!("unknown pid: {pid}")))?;
            if pcb.state == ProcessState::Running && !force {
                return Err(Error::state_transition(format!(
                    "pid {pid} is RUNNING; force is required to terminate"
                )));
            }
            (pcb.request_id.clone(), pcb.user_id.clone(), pcb.session_id.clone())
        };

        {
            let mut lifecycle = self.lifecycle.write().expect("lifecycle lock poisoned");
            lifecycle.terminate(pid)?;
        }
        if let Some(env) = self
            .process_envelopes
            .write()
            .expect("envelope lock poisoned")
            .get_mut(pid.as_str())
        {
            env.terminate(&reason);
        }

        self.emit(
            KernelEventType::ProcessStateChanged,
            &request_id,
            &user_id,
            &session_id,
            Some(pid.clone()),
            json!({ "new_state": "TERMINATED", "reason": reason }),
        );
        Ok(())
    }

    /// Cleanup: ZOMBIE transition, then full removal from every subsystem
    /// that holds per-pid state.
    pub fn cleanup_process(&self, pid: &ProcessId) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.write().expect("lifecycle lock poisoned");
            lifecycle.cleanup(pid)?;
            lifecycle.remove(pid)?;
        }
        self.resources
            .write()
            .expect("resources lock poisoned")
            .release(pid);
        self.process_envelopes
            .write()
            .expect("envelope lock poisoned")
            .remove(pid.as_str());
        self.orchestrator
            .write()
            .expect("orchestrator lock poisoned")
            .cleanup_session(pid);
        Ok(())
    }

    pub fn list_processes(&self) -> Vec<ProcessControlBlock> {
        self.lifecycle.read().expect("lifecycle lock poisoned").list()
    }

    pub fn process_count(&self) -> usize {
        self.lifecycle.read().expect("lifecycle lock poisoned").count()
    }

    pub fn process_count_by_state(&self, state: ProcessState) -> usize {
        self.lifecycle
            .read()
            .expect("lifecycle lock poisoned")
            .count_by_state(state)
    }

    pub fn get_default_quota(&self) -> ResourceQuota {
        self.lifecycle
            .read()
            .expect("lifecycle lock poisoned")
            .get_default_quota()
            .clone()
    }

    pub fn set_default_quota(&self, overrides: &ResourceQuota) {
        self.lifecycle
            .write()
            .expect("lifecycle lock poisoned")
            .set_default_quota(overrides);
    }

    // =========================================================================
    // Envelope storage (value type, §3)
    // =========================================================================

    pub fn store_envelope(&self, pid: &ProcessId, envelope: Envelope) {
        self.process_envelopes
            .write()
            .expect("envelope lock poisoned")
            .insert(pid.to_string(), envelope);
    }

    pub fn get_envelope(&self, pid: &ProcessId) -> Option<Envelope> {
        self.process_envelopes
            .read()
            .expect("envelope lock poisoned")
            .get(pid.as_str())
            .cloned()
    }

    pub fn remove_envelope(&self, pid: &ProcessId) -> Option<Envelope> {
        self.process_envelopes
            .write()
            .expect("envelope lock poisoned")
            .remove(pid.as_str())
    }

    // =========================================================================
    // Resource tracking (C3)
    // =========================================================================

    pub fn check_quota(&self, pid: &ProcessId) -> Result<String> {
        self.resources.read().expect("resources lock poisoned").check_quota(pid)
    }

    /// Record a usage delta, refresh the PCB mirror, and emit
    /// `resource.exhausted` if the process is now over quota.
    pub fn record_usage(&self, pid: &ProcessId, delta: UsageDelta) -> Result<ResourceUsage> {
        let usage = {
            let mut resources = self.resources.write().expect("resources lock poisoned");
            resources.record_usage(pid, delta)
        };
        self.sync_pcb_mirror(pid);

        let reason = self
            .resources
            .read()
            .expect("resources lock poisoned")
            .check_quota(pid)
            .unwrap_or_default();
        if !reason.is_empty() {
            if let Some(pcb) = self.get_process(pid) {
                self.emit(
                    KernelEventType::ResourceExhausted,
                    &pcb.request_id,
                    &pcb.user_id,
                    &pcb.session_id,
                    Some(pid.clone()),
                    json!({ "reason": reason }),
                );
            }
        }
        Ok(usage)
    }

    pub fn record_tool_call(&self, pid: &ProcessId) -> Result<ResourceUsage> {
        self.record_usage(
            pid,
            UsageDelta {
                tool_calls: 1,
                ..Default::default()
            },
        )
    }

    pub fn record_agent_hop(&self, pid: &ProcessId) -> Result<ResourceUsage> {
        self.record_usage(
            pid,
            UsageDelta {
                agent_hops: 1,
                ..Default::default()
            },
        )
    }

    pub fn get_remaining_budget(&self, pid: &ProcessId) -> Option<RemainingBudget> {
        let remaining = self
            .resources
            .read()
            .expect("resources lock poisoned")
            .get_remaining_budget(pid)?;
        Some(RemainingBudget {
            llm_calls_remaining: remaining.llm_calls,
            iterations_remaining: remaining.iterations,
            agent_hops_remaining: remaining.agent_hops,
            tokens_in_remaining: remaining.tokens_in,
            tokens_out_remaining: remaining.tokens_out,
            time_remaining_seconds: remaining.elapsed_seconds,
        })
    }

    pub fn adjust_quota(&self, pid: &ProcessId, adjustment: QuotaAdjustment) -> Result<ResourceQuota> {
        let quota = self
            .resources
            .write()
            .expect("resources lock poisoned")
            .adjust_quota(pid, adjustment)?;
        self.sync_pcb_mirror(pid);
        Ok(quota)
    }

    // =========================================================================
    // Rate limiting (C4)
    // =========================================================================

    pub fn check_rate_limit(&self, user_id: &str, endpoint: &str, record: bool) -> rate_limiter::RateLimitResult {
        self.rate_limiter.check_rate_limit(user_id, endpoint, record)
    }

    // =========================================================================
    // Interrupts (C5)
    // =========================================================================

    pub fn create_interrupt(&self, params: CreateInterruptParams) -> FlowInterrupt {
        let request_id = RequestId::must(params.request_id.clone());
        let user_id = UserId::must(params.user_id.clone());
        let session_id = SessionId::must(params.session_id.clone());
        let kind = params.kind;

        let interrupt = self
            .interrupts
            .write()
            .expect("interrupt lock poisoned")
            .create_interrupt(params);

        self.emit(
            KernelEventType::InterruptRaised,
            &request_id,
            &user_id,
            &session_id,
            None,
            json!({ "interrupt_id": interrupt.id, "kind": kind }),
        );
        interrupt
    }

    pub fn resolve_interrupt(
        &self,
        interrupt_id: &str,
        response: InterruptResponse,
        user_id: Option<&str>,
    ) -> bool {
        self.interrupts
            .write()
            .expect("interrupt lock poisoned")
            .resolve(interrupt_id, response, user_id)
    }

    pub fn cancel_interrupt(&self, interrupt_id: &str, reason: String) -> bool {
        self.interrupts
            .write()
            .expect("interrupt lock poisoned")
            .cancel(interrupt_id, reason)
    }

    pub fn get_interrupt(&self, interrupt_id: &str) -> Option<FlowInterrupt> {
        self.interrupts
            .read()
            .expect("interrupt lock poisoned")
            .get_interrupt(interrupt_id)
            .cloned()
    }

    pub fn get_pending_interrupt(&self, request_id: &str) -> Option<FlowInterrupt> {
        self.interrupts
            .read()
            .expect("interrupt lock poisoned")
            .get_pending_for_request(request_id)
            .cloned()
    }

    pub fn get_pending_interrupts_for_session(
        &self,
        session_id: &str,
        kinds: Option<&[InterruptKind]>,
    ) -> Vec<FlowInterrupt> {
        self.interrupts
            .read()
            .expect("interrupt lock poisoned")
            .get_pending_for_session(session_id, kinds)
    }

    // =========================================================================
    // Service registry
    // =========================================================================

    pub fn register_service(&self, info: ServiceInfo) -> bool {
        let name = info.name.clone();
        let ok = self
            .services
            .write()
            .expect("service lock poisoned")
            .register_service(info);
        if ok {
            self.emit_system_event(KernelEventType::ServiceRegistered, json!({ "name": name }));
        }
        ok
    }

    pub fn unregister_service(&self, service_name: &str) -> bool {
        let ok = self
            .services
            .write()
            .expect("service lock poisoned")
            .unregister_service(service_name);
        if ok {
            self.emit_system_event(
                KernelEventType::ServiceUnregistered,
                json!({ "name": service_name }),
            );
        }
        ok
    }

    fn emit_system_event(&self, event_type: KernelEventType, data: Value) {
        self.emit(
            event_type,
            &RequestId::must(SYSTEM_REQUEST),
            &UserId::must(SYSTEM_USER),
            &SessionId::must(SYSTEM_SESSION),
            None,
            data,
        );
    }

    pub fn get_service(&self, service_name: &str) -> Option<ServiceInfo> {
        self.services.read().expect("service lock poisoned").get_service(service_name)
    }

    pub fn list_services(&self, service_type: Option<&str>, healthy_only: bool) -> Vec<ServiceInfo> {
        self.services
            .read()
            .expect("service lock poisoned")
            .list_services(service_type, healthy_only)
    }

    pub fn has_service(&self, service_name: &str) -> bool {
        self.services.read().expect("service lock poisoned").has_service(service_name)
    }

    pub fn increment_service_load(&self, service_name: &str) -> bool {
        self.services
            .write()
            .expect("service lock poisoned")
            .increment_load(service_name)
    }

    pub fn decrement_service_load(&self, service_name: &str) -> bool {
        self.services
            .write()
            .expect("service lock poisoned")
            .decrement_load(service_name)
    }

    pub fn update_service_health(&self, service_name: &str, status: ServiceStatus) -> bool {
        self.services
            .write()
            .expect("service lock poisoned")
            .update_health(service_name, status)
    }

    // =========================================================================
    // Orchestrator (C7)
    // =========================================================================

    pub fn initialize_orchestration(
        &self,
        process_id: ProcessId,
        pipeline_config: orchestrator::PipelineConfig,
        envelope: Envelope,
        force: bool,
    ) -> Result<orchestrator::SessionState> {
        self.orchestrator
            .write()
            .expect("orchestrator lock poisoned")
            .initialize_session(process_id, pipeline_config, envelope, force)
    }

    pub fn get_next_instruction(&self, process_id: &ProcessId) -> Result<orchestrator::Instruction> {
        self.orchestrator
            .write()
            .expect("orchestrator lock poisoned")
            .get_next_instruction(process_id)
    }

    /// Report an agent's result to the orchestrator, then forward the same
    /// metrics to ResourceTracker so the per-pid ledger stays canonical
    /// (the orchestrator only updates its own envelope's bounds counters -
    /// see `orchestrator::process_agent_result`).
    #[allow(clippy::too_many_arguments)]
    pub fn report_agent_result(
        &self,
        process_id: &ProcessId,
        agent_name: &str,
        output: HashMap<String, Value>,
        metrics: Option<orchestrator::AgentExecutionMetrics>,
        success: bool,
        error_msg: Option<String>,
    ) -> Result<orchestrator::Instruction> {
        let instruction = {
            let mut orchestrator = self.orchestrator.write().expect("orchestrator lock poisoned");
            orchestrator.process_agent_result(
                process_id,
                agent_name,
                output,
                metrics.clone(),
                success,
                error_msg,
            )?
        };

        if let Some(m) = metrics {
            self.record_usage(
                process_id,
                UsageDelta {
                    llm_calls: m.llm_calls,
                    tool_calls: m.tool_calls,
                    agent_hops: 1,
                    tokens_in: m.tokens_in,
                    tokens_out: m.tokens_out,
                },
            )?;
        }

        self.store_envelope(process_id, instruction.envelope.clone());
        Ok(instruction)
    }

    pub fn get_orchestration_state(&self, process_id: &ProcessId) -> Result<orchestrator::SessionState> {
        self.orchestrator
            .read()
            .expect("orchestrator lock poisoned")
            .get_session_state(process_id)
    }

    // =========================================================================
    // System status
    // =========================================================================

    pub fn get_system_status(&self) -> SystemStatus {
        let lifecycle = self.lifecycle.read().expect("lifecycle lock poisoned");
        let total = lifecycle.count();
        let mut by_state = HashMap::new();
        for state in &[
            ProcessState::New,
            ProcessState::Ready,
            ProcessState::Running,
            ProcessState::Waiting,
            ProcessState::Blocked,
            ProcessState::Terminated,
            ProcessState::Zombie,
        ] {
            by_state.insert(*state, lifecycle.count_by_state(*state));
        }
        drop(lifecycle);

        let service_stats = self.services.read().expect("service lock poisoned").get_stats();
        let orchestrator_sessions = self
            .orchestrator
            .read()
            .expect("orchestrator lock poisoned")
            .get_session_count();

        SystemStatus {
            processes_total: total,
            processes_by_state: by_state,
            services_healthy: service_stats.healthy_services,
            services_degraded: service_stats.degraded_services,
            services_unhealthy: service_stats.unhealthy_services,
            active_orchestration_sessions: orchestrator_sessions,
        }
    }

    // =========================================================================
    // Background cleanup (§4.6)
    // =========================================================================

    /// Run one cleanup pass: zombie collection, stale orchestration
    /// sessions, resolved interrupts, expired rate-limit windows.
    pub fn run_cleanup_cycle(&self, config: &CleanupConfig) -> CleanupStats {
        let mut stats = CleanupStats::default();

        let stale_zombies: Vec<ProcessId> = {
            let cutoff = Utc::now() - Duration::seconds(config.process_retention_seconds);
            let mut lifecycle = self.lifecycle.write().expect("lifecycle lock poisoned");
            let stale: Vec<ProcessId> = lifecycle
                .list_by_state(ProcessState::Zombie)
                .into_iter()
                .filter(|pcb| pcb.completed_at.map(|t| t < cutoff).unwrap_or(false))
                .map(|pcb| pcb.pid)
                .collect();
            for pid in &stale {
                if let Err(e) = lifecycle.remove(pid) {
                    tracing::warn!(pid = %pid, error = %e, "cleanup_zombie_remove_failed");
                }
            }
            stale
        };
        stats.zombies_removed = stale_zombies.len();
        if !stale_zombies.is_empty() {
            let mut resources = self.resources.write().expect("resources lock poisoned");
            let mut envelopes = self.process_envelopes.write().expect("envelope lock poisoned");
            for pid in &stale_zombies {
                resources.release(pid);
                envelopes.remove(pid.as_str());
            }
        }

        stats.sessions_removed = self
            .orchestrator
            .write()
            .expect("orchestrator lock poisoned")
            .cleanup_stale_sessions(config.session_retention_seconds);

        stats.interrupts_removed = self
            .interrupts
            .write()
            .expect("interrupt lock poisoned")
            .cleanup_resolved(Duration::seconds(config.interrupt_retention_seconds));

        self.rate_limiter.cleanup_expired();

        stats.completed_at = Some(Utc::now());
        stats
    }

    /// Force-terminate every non-terminal process, aggregating failures
    /// into a single composite error. Checked for cancellation between
    /// each process so a shutdown deadline can cut it short.
    pub fn shutdown(&self, cancel: &CancellationToken) -> Result<()> {
        let pids: Vec<ProcessId> = self
            .list_processes()
            .into_iter()
            .filter(|pcb| !pcb.state.is_terminal())
            .map(|pcb| pcb.pid)
            .collect();

        let mut errors = Vec::new();
        for pid in pids {
            if cancel.is_cancelled() {
                break;
            }
            if let Err(e) = self.terminate_process(&pid, "kernel shutdown", true) {
                errors.push(format!("{pid}: {e}"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::internal(format!(
                "shutdown encountered {} error(s): {}",
                errors.len(),
                errors.join("; ")
            )))
        }
    }
}

/// Remaining resource budget for a process (quota minus usage, floored at 0).
#[derive(Debug, Clone)]
pub struct RemainingBudget {
    pub llm_calls_remaining: i32,
    pub iterations_remaining: i32,
    pub agent_hops_remaining: i32,
    pub tokens_in_remaining: i64,
    pub tokens_out_remaining: i64,
    pub time_remaining_seconds: f64,
}

/// Full system status snapshot returned by `Kernel::get_system_status()`.
#[derive(Debug, Clone)]
pub struct SystemStatus {
    pub processes_total: usize,
    pub processes_by_state: HashMap<ProcessState, usize>,
    pub services_healthy: usize,
    pub services_degraded: usize,
    pub services_unhealthy: usize,
    pub active_orchestration_sessions: usize,
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ProcessId, RequestId, SessionId, UserId};

    fn pid(s: &str) -> ProcessId {
        ProcessId::must(s)
    }

    #[test]
    fn create_process_allocates_lifecycle_and_resources() {
        let kernel = Kernel::new();
        let pcb = kernel
            .create_process(
                pid("p1"),
                RequestId::must("r1"),
                UserId::must("u1"),
                SessionId::must("s1"),
                SchedulingPriority::Normal,
                None,
            )
            .unwrap();
        assert_eq!(pcb.state, ProcessState::Ready);
        assert!(kernel.check_quota(&pcb.pid).is_ok());
    }

    #[test]
    fn terminate_running_without_force_fails() {
        let kernel = Kernel::new();
        let pcb = kernel
            .create_process(
                pid("p1"),
                RequestId::must("r1"),
                UserId::must("u1"),
                SessionId::must("s1"),
                SchedulingPriority::Normal,
                None,
            )
            .unwrap();
        kernel.start_process(&pcb.pid).unwrap();
        assert!(kernel.terminate_process(&pcb.pid, "x", false).is_err());
        assert!(kernel.terminate_process(&pcb.pid, "x", true).is_ok());
    }

    #[test]
    fn record_usage_refreshes_pcb_mirror() {
        let kernel = Kernel::new();
        let pcb = kernel
            .create_process(
                pid("p1"),
                RequestId::must("r1"),
                UserId::must("u1"),
                SessionId::must("s1"),
                SchedulingPriority::Normal,
                None,
            )
            .unwrap();
        kernel
            .record_usage(
                &pcb.pid,
                UsageDelta {
                    llm_calls: 2,
                    ..Default::default()
                },
            )
            .unwrap();
        let refreshed = kernel.get_process(&pcb.pid).unwrap();
        assert_eq!(refreshed.usage.llm_calls, 2);
    }

    #[test]
    fn cleanup_process_releases_every_subsystem() {
        let kernel = Kernel::new();
        let pcb = kernel
            .create_process(
                pid("p1"),
                RequestId::must("r1"),
                UserId::must("u1"),
                SessionId::must("s1"),
                SchedulingPriority::Normal,
                None,
            )
            .unwrap();
        kernel.terminate_process(&pcb.pid, "done", false).unwrap();
        kernel.cleanup_process(&pcb.pid).unwrap();
        assert!(kernel.get_process(&pcb.pid).is_none());
        assert!(kernel.check_quota(&pcb.pid).is_err());
    }

    #[test]
    fn create_interrupt_emits_event() {
        let kernel = Kernel::new();
        let seen = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen2 = seen.clone();
        kernel.register_event_handler(std::sync::Arc::new(move |e: &KernelEvent| {
            if e.event_type == KernelEventType::InterruptRaised {
                seen2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        }));
        kernel.create_interrupt(CreateInterruptParams {
            kind: InterruptKind::Clarification,
            request_id: "r1".to_string(),
            user_id: "u1".to_string(),
            session_id: "s1".to_string(),
            envelope_id: "e1".to_string(),
            question: None,
            message: None,
            data: None,
            trace_id: None,
            span_id: None,
        });
        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn get_system_status_counts_by_state() {
        let kernel = Kernel::new();
        kernel
            .create_process(
                pid("p1"),
                RequestId::must("r1"),
                UserId::must("u1"),
                SessionId::must("s1"),
                SchedulingPriority::Normal,
                None,
            )
            .unwrap();
        let status = kernel.get_system_status();
        assert_eq!(status.processes_total, 1);
        assert_eq!(*status.processes_by_state.get(&ProcessState::Ready).unwrap(), 1);
    }

    #[test]
    fn shutdown_force_terminates_non_terminal_processes() {
        let kernel = Kernel::new();
        let pcb = kernel
            .create_process(
                pid("p1"),
                RequestId::must("r1"),
                UserId::must("u1"),
                SessionId::must("s1"),
                SchedulingPriority::Normal,
                None,
            )
            .unwrap();
        kernel.start_process(&pcb.pid).unwrap();
        let cancel = CancellationToken::new();
        kernel.shutdown(&cancel).unwrap();
        assert_eq!(
            kernel.get_process(&pcb.pid).unwrap().state,
            ProcessState::Terminated
        );
    }

    #[test]
    fn run_cleanup_cycle_removes_aged_zombies() {
        let kernel = Kernel::new();
        let pcb = kernel
            .create_process(
                pid("p1"),
                RequestId::must("r1"),
                UserId::must("u1"),
                SessionId::must("s1"),
                SchedulingPriority::Normal,
                None,
            )
            .unwrap();
        kernel.terminate_process(&pcb.pid, "done", false).unwrap();
        {
            let mut lifecycle = kernel.lifecycle.write().unwrap();
            lifecycle.cleanup(&pcb.pid).unwrap();
            let zombie = lifecycle.get_mut(&pcb.pid).unwrap();
            zombie.completed_at = Some(Utc::now() - Duration::hours(25));
        }
        let config = CleanupConfig::default();
        let stats = kernel.run_cleanup_cycle(&config);
        assert_eq!(stats.zombies_removed, 1);
        assert!(kernel.get_process(&pcb.pid).is_none());
    }
}

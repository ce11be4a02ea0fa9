//! Resource tracking and quota enforcement (C3).
//!
//! Exclusively owns per-PID usage/quota records (§3 ownership rule) — the
//! PCB's `quota`/`usage` fields are a read mirror the Kernel refreshes after
//! every call here, not a second source of truth.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use super::types::{ResourceQuota, ResourceUsage};
use crate::types::{Error, ProcessId, Result};

#[derive(Debug, Clone)]
struct Tracked {
    quota: ResourceQuota,
    usage: ResourceUsage,
    allocated_at: DateTime<Utc>,
}

/// Field-level override set for `AdjustQuota`. `None` leaves the field
/// untouched.
#[derive(Debug, Clone, Default)]
pub struct QuotaAdjustment {
    pub max_llm_calls: Option<i32>,
    pub max_tool_calls: Option<i32>,
    pub max_agent_hops: Option<i32>,
    pub max_iterations: Option<i32>,
    pub max_input_tokens: Option<i64>,
    pub max_output_tokens: Option<i64>,
    pub max_context_tokens: Option<i64>,
    pub timeout_seconds: Option<i64>,
    pub soft_timeout_seconds: Option<i64>,
    pub rate_limit_rpm: Option<i32>,
    pub rate_limit_rph: Option<i32>,
    pub rate_limit_burst: Option<i32>,
    pub max_inference_requests: Option<i32>,
    pub max_inference_input_chars: Option<i64>,
}

/// Metrics recorded by `RecordUsage` / `Orchestrator.ProcessAgentResult` step 4.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageDelta {
    pub llm_calls: i32,
    pub tool_calls: i32,
    pub agent_hops: i32,
    pub tokens_in: i64,
    pub tokens_out: i64,
}

/// Resource tracker - owned by Kernel, called via &mut self (no separate actor).
#[derive(Debug, Default)]
pub struct ResourceTracker {
    records: HashMap<ProcessId, Tracked>,
    default_quota: ResourceQuota,
}

impl ResourceTracker {
    pub fn new(default_quota: ResourceQuota) -> Self {
        Self {
            records: HashMap::new(),
            default_quota,
        }
    }

    /// Allocate tracking for `pid`. Returns `false` on duplicate.
    pub fn allocate(&mut self, pid: ProcessId, quota: Option<ResourceQuota>) -> bool {
        if self.records.contains_key(&pid) {
            return false;
        }
        self.records.insert(
            pid,
            Tracked {
                quota: quota.unwrap_or_else(|| self.default_quota.clone()),
                usage: ResourceUsage::default(),
                allocated_at: Utc::now(),
            },
        );
        true
    }

    /// Remove tracking for `pid`. Returns `false` if unknown.
    pub fn release(&mut self, pid: &ProcessId) -> bool {
        self.records.remove(pid).is_some()
    }

    /// Record usage, auto-creating tracking with the default quota if `pid`
    /// is unknown (§4.2: "matches observed semantics").
    pub fn record_usage(&mut self, pid: &ProcessId, delta: UsageDelta) -> ResourceUsage {
        let default_quota = self.default_quota.clone();
        let tracked = self.records.entry(pid.clone()).or_insert_with(|| Tracked {
            quota: default_quota,
            usage: ResourceUsage::default(),
            allocated_at: Utc::now(),
        });

        tracked.usage.llm_calls += delta.llm_calls;
        tracked.usage.tool_calls += delta.tool_calls;
        tracked.usage.agent_hops += delta.agent_hops;
        tracked.usage.tokens_in += delta.tokens_in;
        tracked.usage.tokens_out += delta.tokens_out;
        tracked.usage.elapsed_seconds =
            (Utc::now() - tracked.allocated_at).num_milliseconds() as f64 / 1000.0;

        self.warn_if_near_limits(pid);
        self.records.get(pid).map(|t| t.usage.clone()).unwrap_or_default()
    }

    pub fn record_llm_call(&mut self, pid: &ProcessId) -> ResourceUsage {
        self.record_usage(
            pid,
            UsageDelta {
                llm_calls: 1,
                ..Default::default()
            },
        )
    }

    pub fn record_tool_call(&mut self, pid: &ProcessId) -> ResourceUsage {
        self.record_usage(
            pid,
            UsageDelta {
                tool_calls: 1,
                ..Default::default()
            },
        )
    }

    pub fn record_agent_hop(&mut self, pid: &ProcessId) -> ResourceUsage {
        self.record_usage(
            pid,
            UsageDelta {
                agent_hops: 1,
                ..Default::default()
            },
        )
    }

    pub fn record_inference_call(&mut self, pid: &ProcessId, input_chars: i64) -> ResourceUsage {
        if let Some(tracked) = self.records.get_mut(pid) {
            tracked.usage.inference_requests += 1;
            tracked.usage.inference_input_chars += input_chars;
            tracked.usage.elapsed_seconds =
                (Utc::now() - tracked.allocated_at).num_milliseconds() as f64 / 1000.0;
            tracked.usage.clone()
        } else {
            let mut usage = ResourceUsage::default();
            usage.inference_requests = 1;
            usage.inference_input_chars = input_chars;
            self.records.insert(
                pid.clone(),
                Tracked {
                    quota: self.default_quota.clone(),
                    usage: usage.clone(),
                    allocated_at: Utc::now(),
                },
            );
            usage
        }
    }

    /// First exceeded kind in order (§4.2), empty string if within quota.
    pub fn check_quota(&self, pid: &ProcessId) -> Result<String> {
        let tracked = self.records.get(pid).ok_or_else(|| Error::not_found(format!("unknown pid: {}", pid)))?;
        Ok(tracked.usage.exceeds_quota(&tracked.quota).unwrap_or("").to_string())
    }

    /// Pre-flight: would current + proposed exceed inference quotas?
    pub fn check_inference_quota(&self, pid: &ProcessId, requests: i32, input_chars: i64) -> Result<String> {
        let tracked = self.records.get(pid).ok_or_else(|| Error::not_found(format!("unknown pid: {}", pid)))?;
        if tracked.usage.inference_requests + requests > tracked.quota.max_inference_requests {
            return Ok("max_inference_requests_exceeded".to_string());
        }
        if tracked.usage.inference_input_chars + input_chars > tracked.quota.max_inference_input_chars {
            return Ok("max_inference_input_chars_exceeded".to_string());
        }
        Ok(String::new())
    }

    pub fn get_usage(&self, pid: &ProcessId) -> Option<ResourceUsage> {
        self.records.get(pid).map(|t| t.usage.clone())
    }

    pub fn get_quota(&self, pid: &ProcessId) -> Option<ResourceQuota> {
        self.records.get(pid).map(|t| t.quota.clone())
    }

    pub fn get_system_usage(&self) -> ResourceUsage {
        let mut total = ResourceUsage::default();
        for tracked in self.records.values() {
            total.llm_calls += tracked.usage.llm_calls;
            total.tool_calls += tracked.usage.tool_calls;
            total.agent_hops += tracked.usage.agent_hops;
            total.iterations += tracked.usage.iterations;
            total.tokens_in += tracked.usage.tokens_in;
            total.tokens_out += tracked.usage.tokens_out;
            total.inference_requests += tracked.usage.inference_requests;
            total.inference_input_chars += tracked.usage.inference_input_chars;
        }
        total
    }

    /// Remaining budget (quota - usage, floored at 0) per counter.
    pub fn get_remaining_budget(&self, pid: &ProcessId) -> Option<ResourceUsage> {
        self.records.get(pid).map(|t| ResourceUsage {
            llm_calls: (t.quota.max_llm_calls - t.usage.llm_calls).max(0),
            tool_calls: (t.quota.max_tool_calls - t.usage.tool_calls).max(0),
            agent_hops: (t.quota.max_agent_hops - t.usage.agent_hops).max(0),
            iterations: (t.quota.max_iterations - t.usage.iterations).max(0),
            tokens_in: (t.quota.max_input_tokens - t.usage.tokens_in).max(0),
            tokens_out: (t.quota.max_output_tokens - t.usage.tokens_out).max(0),
            elapsed_seconds: (t.quota.timeout_seconds as f64 - t.usage.elapsed_seconds).max(0.0),
            inference_requests: (t.quota.max_inference_requests - t.usage.inference_requests).max(0),
            inference_input_chars: (t.quota.max_inference_input_chars - t.usage.inference_input_chars).max(0),
        })
    }

    pub fn adjust_quota(&mut self, pid: &ProcessId, adjustment: QuotaAdjustment) -> Result<ResourceQuota> {
        let tracked = self
            .records
            .get_mut(pid)
            .ok_or_else(|| Error::not_found(format!("unknown pid: {}", pid)))?;
        macro_rules! apply {
            ($field:ident) => {
                if let Some(v) = adjustment.$field {
                    tracked.quota.$field = v;
                }
            };
        }
        apply!(max_llm_calls);
        apply!(max_tool_calls);
        apply!(max_agent_hops);
        apply!(max_iterations);
        apply!(max_input_tokens);
        apply!(max_output_tokens);
        apply!(max_context_tokens);
        apply!(timeout_seconds);
        apply!(soft_timeout_seconds);
        apply!(rate_limit_rpm);
        apply!(rate_limit_rph);
        apply!(rate_limit_burst);
        apply!(max_inference_requests);
        apply!(max_inference_input_chars);
        Ok(tracked.quota.clone())
    }

    fn warn_if_near_limits(&self, pid: &ProcessId) {
        if let Some(tracked) = self.records.get(pid) {
            if tracked.quota.max_llm_calls > 0
                && tracked.usage.llm_calls as f64 >= 0.8 * tracked.quota.max_llm_calls as f64
            {
                tracing::warn!(pid = %pid, llm_calls = tracked.usage.llm_calls, limit = tracked.quota.max_llm_calls, "llm_calls_near_quota");
            }
            if tracked.usage.elapsed_seconds >= tracked.quota.soft_timeout_seconds as f64 {
                tracing::warn!(pid = %pid, elapsed_seconds = tracked.usage.elapsed_seconds, "soft_timeout_exceeded");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_rejects_duplicate() {
        let mut rt = ResourceTracker::new(ResourceQuota::default());
        let pid = ProcessId::must("p1");
        assert!(rt.allocate(pid.clone(), None));
        assert!(!rt.allocate(pid, None));
    }

    #[test]
    fn record_usage_auto_creates_tracking() {
        let mut rt = ResourceTracker::new(ResourceQuota::default());
        let pid = ProcessId::must("p1");
        let usage = rt.record_usage(
            &pid,
            UsageDelta {
                llm_calls: 3,
                ..Default::default()
            },
        );
        assert_eq!(usage.llm_calls, 3);
        assert!(rt.get_quota(&pid).is_some());
    }

    #[test]
    fn check_quota_reports_first_exceeded_reason() {
        let mut rt = ResourceTracker::new(ResourceQuota {
            max_llm_calls: 1,
            ..ResourceQuota::default()
        });
        let pid = ProcessId::must("p1");
        rt.allocate(pid.clone(), None);
        rt.record_usage(
            &pid,
            UsageDelta {
                llm_calls: 2,
                ..Default::default()
            },
        );
        assert_eq!(rt.check_quota(&pid).unwrap(), "max_llm_calls_exceeded");
    }

    #[test]
    fn check_quota_unknown_pid_errors() {
        let rt = ResourceTracker::new(ResourceQuota::default());
        assert!(rt.check_quota(&ProcessId::must("nope")).is_err());
    }

    #[test]
    fn check_inference_quota_preflight() {
        let mut rt = ResourceTracker::new(ResourceQuota {
            max_inference_requests: 2,
            max_inference_input_chars: 100,
            ..ResourceQuota::default()
        });
        let pid = ProcessId::must("p1");
        rt.allocate(pid.clone(), None);
        rt.record_inference_call(&pid, 50);
        assert_eq!(rt.check_inference_quota(&pid, 1, 10).unwrap(), "");
        assert_eq!(
            rt.check_inference_quota(&pid, 1, 60).unwrap(),
            "max_inference_input_chars_exceeded"
        );
    }

    #[test]
    fn release_removes_tracking() {
        let mut rt = ResourceTracker::new(ResourceQuota::default());
        let pid = ProcessId::must("p1");
        rt.allocate(pid.clone(), None);
        assert!(rt.release(&pid));
        assert!(rt.get_usage(&pid).is_none());
        assert!(!rt.release(&pid));
    }

    #[test]
    fn get_remaining_budget_floors_at_zero() {
        let mut rt = ResourceTracker::new(ResourceQuota {
            max_llm_calls: 1,
            ..ResourceQuota::default()
        });
        let pid = ProcessId::must("p1");
        rt.allocate(pid.clone(), None);
        rt.record_usage(
            &pid,
            UsageDelta {
                llm_calls: 5,
                ..Default::default()
            },
        );
        let remaining = rt.get_remaining_budget(&pid).unwrap();
        assert_eq!(remaining.llm_calls, 0);
    }

    #[test]
    fn adjust_quota_updates_single_field() {
        let mut rt = ResourceTracker::new(ResourceQuota::default());
        let pid = ProcessId::must("p1");
        rt.allocate(pid.clone(), None);
        let updated = rt
            .adjust_quota(
                &pid,
                QuotaAdjustment {
                    max_llm_calls: Some(5),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.max_llm_calls, 5);
        assert_eq!(updated.max_tool_calls, ResourceQuota::default().max_tool_calls);
    }

    #[test]
    fn get_system_usage_aggregates_all_pids() {
        let mut rt = ResourceTracker::new(ResourceQuota::default());
        let p1 = ProcessId::must("p1");
        let p2 = ProcessId::must("p2");
        rt.allocate(p1.clone(), None);
        rt.allocate(p2.clone(), None);
        rt.record_llm_call(&p1);
        rt.record_llm_call(&p2);
        assert_eq!(rt.get_system_usage().llm_calls, 2);
    }
}

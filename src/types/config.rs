//! Configuration structures.
//!
//! Configuration is loaded from environment variables and config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Global kernel configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Default resource limits, also the default `ResourceQuota` (§3).
    #[serde(default)]
    pub defaults: DefaultLimits,

    /// IPC transport configuration.
    #[serde(default)]
    pub ipc: IpcConfig,

    /// Background cleanup loop configuration (§4.6).
    #[serde(default)]
    pub cleanup: CleanupConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// IPC server bind address (TCP).
    pub listen_addr: String,

    /// Metrics endpoint bind address.
    pub metrics_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:50051".to_string(),
            metrics_addr: "127.0.0.1:9090".to_string(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,

    /// OTLP exporter endpoint (optional).
    pub otlp_endpoint: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            otlp_endpoint: None,
        }
    }
}

/// Default resource limits — doubles as the default per-process
/// `ResourceQuota` (§3): every field here matches a `ResourceQuota` field
/// one-for-one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultLimits {
    pub max_llm_calls: u32,
    pub max_tool_calls: u32,
    pub max_agent_hops: u32,
    pub max_iterations: u32,
    pub max_input_tokens: u32,
    pub max_output_tokens: u32,
    pub max_context_tokens: u32,

    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub soft_timeout: Duration,

    pub rate_limit_rpm: u32,
    pub rate_limit_rph: u32,
    pub rate_limit_burst: u32,

    pub max_inference_requests: u32,
    pub max_inference_input_chars: u32,
}

impl Default for DefaultLimits {
    fn default() -> Self {
        Self {
            max_llm_calls: 100,
            max_tool_calls: 200,
            max_agent_hops: 200,
            max_iterations: 50,
            max_input_tokens: 100_000,
            max_output_tokens: 50_000,
            max_context_tokens: 150_000,
            timeout: Duration::from_secs(300),
            soft_timeout: Duration::from_secs(240),
            rate_limit_rpm: 60,
            rate_limit_rph: 1_000,
            rate_limit_burst: 10,
            max_inference_requests: 50,
            max_inference_input_chars: 500_000,
        }
    }
}

/// IPC transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcConfig {
    /// Maximum frame payload size in bytes.
    pub max_frame_bytes: u32,

    /// Maximum CommBus query timeout in milliseconds (caps client-requested timeouts).
    pub max_query_timeout_ms: u64,

    /// Default CommBus query timeout in milliseconds (when client omits timeout_ms).
    pub default_query_timeout_ms: u64,

    /// Bounded channel capacity for streaming responses on the wire
    /// (Subscribe, ExecutePipeline). Independent of CommBus's internal
    /// per-subscriber buffer (§4.7).
    pub stream_channel_capacity: usize,

    /// Maximum concurrent TCP connections. New connections beyond this limit
    /// are rejected (backpressure via semaphore).
    pub max_connections: usize,

    /// Read timeout in seconds per frame. Connections idle beyond this
    /// duration are dropped (prevents slowloris-style resource exhaustion).
    pub read_timeout_secs: u64,

    /// Write timeout in seconds per frame. Slow consumers that cannot
    /// accept a response within this window are dropped.
    pub write_timeout_secs: u64,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 5 * 1024 * 1024,
            max_query_timeout_ms: 30_000,
            default_query_timeout_ms: 5_000,
            stream_channel_capacity: 64,
            max_connections: 1000,
            read_timeout_secs: 30,
            write_timeout_secs: 10,
        }
    }
}

/// Background cleanup loop configuration (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Interval between cleanup cycles.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// How long a terminal PCB is retained before `CleanupTerminated`.
    #[serde(with = "humantime_serde")]
    pub process_retention: Duration,

    /// `Orchestrator.CleanupStaleSessions` staleness threshold.
    #[serde(with = "humantime_serde")]
    pub session_retention: Duration,

    /// `InterruptService.CleanupResolved` retention.
    #[serde(with = "humantime_serde")]
    pub interrupt_retention: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            process_retention: Duration::from_secs(86_400),
            session_retention: Duration::from_secs(3_600),
            interrupt_retention: Duration::from_secs(3_600),
        }
    }
}

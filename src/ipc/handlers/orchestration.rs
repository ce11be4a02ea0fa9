//! Orchestration service handler — session management, instruction pipeline.

use crate::envelope::Envelope;
use crate::ipc::router::{str_field, DispatchResponse};
use crate::kernel::orchestrator::{AgentExecutionMetrics, PipelineConfig};
use crate::kernel::Kernel;
use crate::types::{Error, ProcessId, Result};
use serde_json::Value;
use std::collections::HashMap;

pub async fn handle(kernel: &Kernel, method: &str, body: Value) -> Result<DispatchResponse> {
    match method {
        "InitializeSession" => {
            let process_id_str = str_field(&body, "process_id")?;
            let process_id = ProcessId::from_string(process_id_str)
                .map_err(|e| Error::validation(e.to_string()))?;

            let pipeline_config_val = body
                .get("pipeline_config")
                .ok_or_else(|| Error::validation("Missing required field: pipeline_config"))?;
            let pipeline_config: PipelineConfig = serde_json::from_value(pipeline_config_val.clone())
                .map_err(|e| Error::validation(format!("Invalid pipeline_config: {}", e)))?;

            let envelope_val = body
                .get("envelope")
                .ok_or_else(|| Error::validation("Missing required field: envelope"))?;
            let envelope: Envelope = serde_json::from_value(envelope_val.clone())
                .map_err(|e| Error::validation(format!("Invalid envelope: {}", e)))?;

            let force = body.get("force").and_then(|v| v.as_bool()).unwrap_or(false);

            let session_state =
                kernel.initialize_orchestration(process_id.clone(), pipeline_config, envelope.clone(), force)?;
            kernel.store_envelope(&process_id, envelope);

            Ok(DispatchResponse::Single(session_state_to_value(&session_state)))
        }

        "GetNextInstruction" => {
            let process_id_str = str_field(&body, "process_id")?;
            let process_id = ProcessId::from_string(process_id_str)
                .map_err(|e| Error::validation(e.to_string()))?;

            let instruction = kernel.get_next_instruction(&process_id)?;
            Ok(DispatchResponse::Single(instruction_to_value(&instruction)))
        }

        "ReportAgentResult" => {
            let process_id_str = str_field(&body, "process_id")?;
            let process_id = ProcessId::from_string(process_id_str)
                .map_err(|e| Error::validation(e.to_string()))?;

            let agent_name = str_field(&body, "agent_name")?;
            let success = body.get("success").and_then(|v| v.as_bool()).unwrap_or(true);
            let error_msg = body
                .get("error_msg")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());

            let output_val = body
                .get("output")
                .cloned()
                .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
            let output: HashMap<String, Value> = match output_val {
                Value::Object(map) => map.into_iter().collect(),
                _ => HashMap::new(),
            };

            let metrics = body.get("metrics").map(|m| AgentExecutionMetrics {
                llm_calls: m.get("llm_calls").and_then(|v| v.as_i64()).unwrap_or(0) as i32,
                tool_calls: m.get("tool_calls").and_then(|v| v.as_i64()).unwrap_or(0) as i32,
                tokens_in: m.get("tokens_in").and_then(|v| v.as_i64()).unwrap_or(0),
                tokens_out: m.get("tokens_out").and_then(|v| v.as_i64()).unwrap_or(0),
                duration_ms: m.get("duration_ms").and_then(|v| v.as_i64()).unwrap_or(0),
            });

            let instruction = kernel.report_agent_result(
                &process_id,
                &agent_name,
                output,
                metrics,
                success,
                error_msg,
            )?;

            Ok(DispatchResponse::Single(instruction_to_value(&instruction)))
        }

        "GetSessionState" => {
            let process_id_str = str_field(&body, "process_id")?;
            let process_id = ProcessId::from_string(process_id_str)
                .map_err(|e| Error::validation(e.to_string()))?;

            let session_state = kernel.get_orchestration_state(&process_id)?;
            Ok(DispatchResponse::Single(session_state_to_value(&session_state)))
        }

        _ => Err(Error::not_found(format!("Unknown orchestration method: {}", method))),
    }
}

// =============================================================================
// Conversion helpers
// =============================================================================

pub fn instruction_to_value(instr: &crate::kernel::orchestrator::Instruction) -> Value {
    let kind_str = serde_json::to_value(&instr.kind)
        .ok()
        .and_then(|v| v.as_str().map(|s| s.to_string()))
        .unwrap_or_else(|| "UNKNOWN".to_string());

    let terminal_reason_str = instr.terminal_reason.as_ref()
        .and_then(|r| serde_json::to_value(r).ok())
        .and_then(|v| v.as_str().map(|s| s.to_string()))
        .unwrap_or_default();

    serde_json::json!({
        "kind": kind_str,
        "agent_name": instr.agent_name.as_deref().unwrap_or(""),
        "agent_config": instr.agent_config.as_ref().and_then(|c| serde_json::to_value(c).ok()),
        "envelope": serde_json::to_value(&instr.envelope).ok(),
        "terminal_reason": terminal_reason_str,
        "termination_message": instr.termination_message.as_deref().unwrap_or(""),
        "interrupt_pending": instr.interrupt_pending,
        "interrupt": instr.interrupt.as_ref().and_then(|i| serde_json::to_value(i).ok()),
    })
}

pub fn session_state_to_value(state: &crate::kernel::orchestrator::SessionState) -> Value {
    let terminal_reason_str = state.terminal_reason.as_ref()
        .and_then(|r| serde_json::to_value(r).ok())
        .and_then(|v| v.as_str().map(|s| s.to_string()))
        .unwrap_or_default();

    serde_json::json!({
        "process_id": state.process_id,
        "current_stage": state.current_stage,
        "stage_order": state.stage_order,
        "envelope": serde_json::to_value(&state.envelope).ok(),
        "edge_traversals": state.edge_traversals,
        "terminated": state.terminated,
        "terminal_reason": terminal_reason_str,
    })
}

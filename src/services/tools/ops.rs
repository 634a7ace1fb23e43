//! Built-in ops tools for the demo sub-agents.
//!
//! ServiceNow ITSM records, data-pipeline log analytics, and service health
//! probes. Outputs are synthetic but deterministic for a given input, so the
//! agents (and tests) see stable shapes.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Semaphore;

use super::{sync_handler, ToolRegistry, ToolResult};
use crate::services::llm::{ParameterSchema, ToolDefinition};

fn str_arg<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

fn definition(
    name: &str,
    description: &str,
    params: Vec<(&str, ParameterSchema)>,
    required: Vec<&str>,
) -> ToolDefinition {
    let properties: HashMap<String, ParameterSchema> = params
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
    ToolDefinition {
        name: name.to_string(),
        description: description.to_string(),
        input_schema: ParameterSchema::object(
            None,
            properties,
            required.into_iter().map(String::from).collect(),
        ),
    }
}

// ── ServiceNow ──────────────────────────────────────────────────────────

fn get_incident(args: Value) -> ToolResult {
    let Some(incident_id) = str_arg(&args, "incident_id") else {
        return ToolResult::err("incident_id is required");
    };
    ToolResult::ok(
        json!({
            "number": incident_id,
            "short_description": format!("Data pipeline latency alert tracked as {}", incident_id),
            "state": "In Progress",
            "priority": "2 - High",
            "assigned_to": "dataops.oncall",
            "opened_at": "2026-07-29T08:14:00Z",
            "work_notes": "Investigating elevated copy-activity latency in the nightly load.",
        })
        .to_string(),
    )
}

fn list_incidents(args: Value) -> ToolResult {
    let state = str_arg(&args, "state").unwrap_or("open");
    ToolResult::ok(
        json!({
            "state_filter": state,
            "incidents": [
                {"number": "INC001001", "short_description": "Nightly load SLA breach", "state": "In Progress", "priority": "2 - High"},
                {"number": "INC001002", "short_description": "Stale dimension tables", "state": "New", "priority": "3 - Moderate"},
            ],
        })
        .to_string(),
    )
}

fn get_change_request(args: Value) -> ToolResult {
    let Some(change_id) = str_arg(&args, "change_id") else {
        return ToolResult::err("change_id is required");
    };
    ToolResult::ok(
        json!({
            "number": change_id,
            "short_description": format!("Scheduled maintenance tracked as {}", change_id),
            "state": "Approved",
            "planned_start": "2026-08-05T22:00:00Z",
            "planned_end": "2026-08-06T02:00:00Z",
            "risk": "Moderate",
        })
        .to_string(),
    )
}

fn list_change_requests(args: Value) -> ToolResult {
    let state = str_arg(&args, "state").unwrap_or("open");
    ToolResult::ok(
        json!({
            "state_filter": state,
            "change_requests": [
                {"number": "CHG0012345", "short_description": "Database server upgrade", "state": "Approved"},
                {"number": "CHG0012346", "short_description": "Firewall rule update", "state": "Assess"},
            ],
        })
        .to_string(),
    )
}

// ── Log analytics ───────────────────────────────────────────────────────

fn query_pipeline_status(args: Value) -> ToolResult {
    let pipeline = str_arg(&args, "pipeline_name").unwrap_or("all");
    ToolResult::ok(
        json!({
            "pipeline_filter": pipeline,
            "window_hours": args.get("hours").and_then(Value::as_u64).unwrap_or(24),
            "runs": [
                {"pipeline": "nightly-ingest", "status": "Succeeded", "duration_minutes": 42},
                {"pipeline": "dim-refresh", "status": "Failed", "duration_minutes": 7},
            ],
        })
        .to_string(),
    )
}

fn list_failed_pipelines(args: Value) -> ToolResult {
    ToolResult::ok(
        json!({
            "window_hours": args.get("hours").and_then(Value::as_u64).unwrap_or(24),
            "failed": [
                {"pipeline": "dim-refresh", "run_id": "run-7731", "error": "Copy activity timeout"},
            ],
        })
        .to_string(),
    )
}

fn get_pipeline_run_details(args: Value) -> ToolResult {
    let Some(run_id) = str_arg(&args, "run_id") else {
        return ToolResult::err("run_id is required");
    };
    ToolResult::ok(
        json!({
            "run_id": run_id,
            "pipeline": "dim-refresh",
            "status": "Failed",
            "activities": [
                {"name": "CopyDimAccounts", "status": "Failed", "error": "Copy activity timeout after 600s"},
                {"name": "RefreshViews", "status": "Skipped"},
            ],
        })
        .to_string(),
    )
}

// ── Service health ──────────────────────────────────────────────────────

fn check_azure_service_health(args: Value) -> ToolResult {
    let service = str_arg(&args, "service").unwrap_or("all");
    ToolResult::ok(
        json!({
            "service_filter": service,
            "status": "No active advisories",
            "regions": {"westeurope": "Healthy", "eastus2": "Healthy"},
        })
        .to_string(),
    )
}

fn check_databricks_health(_args: Value) -> ToolResult {
    ToolResult::ok(
        json!({
            "workspace": "dataops-prod",
            "status": "Operational",
            "cluster_pools": {"etl-pool": "Available", "adhoc-pool": "Available"},
        })
        .to_string(),
    )
}

fn check_snowflake_health(_args: Value) -> ToolResult {
    ToolResult::ok(
        json!({
            "account": "dataops",
            "status": "Operational",
            "warehouses": {"LOAD_WH": "Running", "REPORT_WH": "Suspended"},
        })
        .to_string(),
    )
}

// ── Registry builders ───────────────────────────────────────────────────

/// Tool set for the ServiceNow sub-agent.
pub fn servicenow_tools(permits: Arc<Semaphore>) -> ToolRegistry {
    let mut registry = ToolRegistry::new(permits);
    registry.register(
        definition(
            "get_incident",
            "Fetch a single incident by ticket number",
            vec![(
                "incident_id",
                ParameterSchema::string(Some("Incident ticket number, e.g. INC123")),
            )],
            vec!["incident_id"],
        ),
        sync_handler(get_incident),
    );
    registry.register(
        definition(
            "list_incidents",
            "List incidents, optionally filtered by state",
            vec![("state", ParameterSchema::string(Some("Incident state filter")))],
            vec![],
        ),
        sync_handler(list_incidents),
    );
    registry.register(
        definition(
            "get_change_request",
            "Fetch a single change request by ticket number",
            vec![(
                "change_id",
                ParameterSchema::string(Some("Change ticket number, e.g. CHG0012345")),
            )],
            vec!["change_id"],
        ),
        sync_handler(get_change_request),
    );
    registry.register(
        definition(
            "list_change_requests",
            "List change requests, optionally filtered by state",
            vec![("state", ParameterSchema::string(Some("Change state filter")))],
            vec![],
        ),
        sync_handler(list_change_requests),
    );
    registry
}

/// Tool set for the pipeline log-analytics sub-agent.
pub fn log_analytics_tools(permits: Arc<Semaphore>) -> ToolRegistry {
    let mut registry = ToolRegistry::new(permits);
    registry.register(
        definition(
            "query_pipeline_status",
            "Query recent pipeline run status",
            vec![
                (
                    "pipeline_name",
                    ParameterSchema::string(Some("Pipeline name filter")),
                ),
                ("hours", ParameterSchema::integer(Some("Lookback window in hours"))),
            ],
            vec![],
        ),
        sync_handler(query_pipeline_status),
    );
    registry.register(
        definition(
            "list_failed_pipelines",
            "List pipelines with failed runs in the lookback window",
            vec![("hours", ParameterSchema::integer(Some("Lookback window in hours")))],
            vec![],
        ),
        sync_handler(list_failed_pipelines),
    );
    registry.register(
        definition(
            "get_pipeline_run_details",
            "Fetch activity-level details for one pipeline run",
            vec![("run_id", ParameterSchema::string(Some("Pipeline run identifier")))],
            vec!["run_id"],
        ),
        sync_handler(get_pipeline_run_details),
    );
    registry
}

/// Tool set for the service-health sub-agent.
pub fn service_health_tools(permits: Arc<Semaphore>) -> ToolRegistry {
    let mut registry = ToolRegistry::new(permits);
    registry.register(
        definition(
            "check_azure_service_health",
            "Check Azure service health advisories",
            vec![("service", ParameterSchema::string(Some("Service name filter")))],
            vec![],
        ),
        sync_handler(check_azure_service_health),
    );
    registry.register(
        definition(
            "check_databricks_health",
            "Check Databricks workspace health",
            vec![],
            vec![],
        ),
        sync_handler(check_databricks_health),
    );
    registry.register(
        definition(
            "check_snowflake_health",
            "Check Snowflake account health",
            vec![],
            vec![],
        ),
        sync_handler(check_snowflake_health),
    );
    registry
}

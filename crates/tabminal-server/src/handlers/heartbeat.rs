//! Heartbeat endpoint
//!
//! Session summaries plus an opaque system snapshot, polled by the UI.

use crate::AppState;
use axum::{extract::State, Json};
use serde::Serialize;
use sysinfo::{CpuExt, System, SystemExt};
use tabminal_types::SessionSummary;

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    sessions: Vec<SessionSummary>,
    system: SystemSnapshot,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemSnapshot {
    cpu_count: usize,
    cpu_usage_percent: f32,
    total_memory: u64,
    used_memory: u64,
    load_average: [f64; 3],
    uptime_secs: u64,
}

pub async fn heartbeat(State(state): State<AppState>) -> Json<HeartbeatResponse> {
    let sessions = state.registry.list().await;

    let mut sys = System::new();
    sys.refresh_cpu();
    sys.refresh_memory();
    let load = sys.load_average();

    Json(HeartbeatResponse {
        sessions,
        system: SystemSnapshot {
            cpu_count: sys.cpus().len(),
            cpu_usage_percent: sys.global_cpu_info().cpu_usage(),
            total_memory: sys.total_memory(),
            used_memory: sys.used_memory(),
            load_average: [load.one, load.five, load.fifteen],
            uptime_secs: sys.uptime(),
        },
    })
}

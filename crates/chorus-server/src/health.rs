//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

use crate::hub::HubStats;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Connections attached to this process.
    pub connections: usize,
    /// Rooms known to this process.
    pub rooms: usize,
}

/// Build a health response from the hub's counters.
pub fn health_check(start_time: Instant, stats: HubStats) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections: stats.connections,
        rooms: stats.rooms,
    }
}

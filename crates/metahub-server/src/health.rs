//! `/health` endpoint.

use std::time::Instant;

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` while the server is accepting connections.
    pub status: &'static str,
    pub uptime_secs: u64,
    /// Registered clients.
    pub connections: usize,
    pub envs: usize,
    pub agents: usize,
    pub humans: usize,
}

pub fn health_check(
    start_time: Instant,
    connections: usize,
    envs: usize,
    agents: usize,
    humans: usize,
) -> HealthResponse {
    HealthResponse {
        status: "ok",
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        envs,
        agents,
        humans,
    }
}

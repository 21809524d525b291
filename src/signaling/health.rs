//! Liveness endpoint reporting connection and room counts

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

use super::registry::RoomRegistry;
use super::server::ServerStats;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub connections: usize,
    pub rooms: usize,
}

#[derive(Clone)]
struct HealthState {
    stats: ServerStats,
    registry: RoomRegistry,
}

pub fn report(stats: &ServerStats, registry: &RoomRegistry) -> HealthReport {
    HealthReport {
        status: "ok".to_string(),
        connections: stats.connection_count(),
        rooms: registry.room_count(),
    }
}

pub fn router(stats: ServerStats, registry: RoomRegistry) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(HealthState { stats, registry })
}

async fn health(State(state): State<HealthState>) -> Json<HealthReport> {
    Json(report(&state.stats, &state.registry))
}

pub async fn serve(addr: &str, stats: ServerStats, registry: RoomRegistry) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Health endpoint listening on {}", listener.local_addr()?);
    axum::serve(listener, router(stats, registry)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;

    #[test]
    fn report_reflects_counts() {
        let registry = RoomRegistry::new(RegistryConfig::default());
        let report = report(&ServerStats::default(), &registry);
        assert_eq!(
            report,
            HealthReport {
                status: "ok".to_string(),
                connections: 0,
                rooms: 0,
            }
        );
        let json = serde_json::to_string(&report).unwrap();
        assert_eq!(json, r#"{"status":"ok","connections":0,"rooms":0}"#);
    }
}

//! # Health & Metrics Endpoints
//!
//! `GET /health` answers liveness probes and summarizes the voice session;
//! `GET /api/v1/metrics` adds per-endpoint request statistics and the full
//! session counters.

use crate::state::{AppMetrics, AppState};
use crate::voice::{SessionInfo, SessionStatus, StatsSnapshot};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let session = state.voice.info();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": overall_error_rate(&metrics)
        },
        "memory": get_memory_info(),
        "session": {
            "status": session.status,
            "session_id": session.session_id,
            "started_at": session.started_at,
            "agent_url": session.url,
            "transcript_entries": state.voice.transcript().len()
        },
        "planning": {
            "base_url": state.planning().base_url()
        },
        "voice_link": voice_link_status(&session)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();
    endpoint_stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": overall_error_rate(&metrics),
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoint_stats,
        "memory": get_memory_info(),
        "session": state.voice.info()
    }))
}

fn overall_error_rate(metrics: &AppMetrics) -> f64 {
    if metrics.request_count > 0 {
        metrics.error_count as f64 / metrics.request_count as f64
    } else {
        0.0
    }
}

/// Condense the session counters into a status an operator can act on.
///
/// ## Rules:
/// - not streaming → "idle"
/// - outbound chunks dropped or inbound frames rejected → "degraded", with warnings
/// - otherwise → "streaming"
fn voice_link_status(session: &SessionInfo) -> serde_json::Value {
    let stats: &StatsSnapshot = &session.stats;
    let mut warnings = Vec::new();

    if stats.chunks_dropped > 0 {
        warnings.push(format!(
            "{} audio chunks dropped, the agent link is slower than capture",
            stats.chunks_dropped
        ));
    }
    if stats.protocol_errors > 0 {
        warnings.push(format!("{} malformed frames from the agent", stats.protocol_errors));
    }
    if stats.decode_errors > 0 {
        warnings.push(format!("{} agent audio clips could not be decoded", stats.decode_errors));
    }

    let status = match session.status {
        SessionStatus::Streaming if !warnings.is_empty() => "degraded",
        SessionStatus::Streaming => "streaming",
        SessionStatus::Connecting | SessionStatus::Closing => "transitioning",
        SessionStatus::Disconnected => "idle",
    };

    json!({
        "status": status,
        "warnings": warnings
    })
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let field_bytes = |name: &str| {
                status
                    .lines()
                    .find(|line| line.starts_with(name))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .map(|kb| kb * 1024)
                    .unwrap_or(0)
            };

            return json!({
                "resident_memory_bytes": field_bytes("VmRSS:"),
                "virtual_memory_bytes": field_bytes("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": "Memory info not available on this platform"
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::state::tests::test_state;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_health_reports_idle_session() {
        let (state, _) = test_state(AppConfig::default());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let body: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/health").to_request()).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["session"]["status"], "disconnected");
        assert_eq!(body["voice_link"]["status"], "idle");
        assert_eq!(body["service"]["name"], "logiplan-voice");
        assert_eq!(body["planning"]["base_url"], AppConfig::default().planning.base_url);
    }

    #[actix_web::test]
    async fn test_voice_link_degraded_on_drops() {
        let session = SessionInfo {
            status: SessionStatus::Streaming,
            session_id: None,
            started_at: None,
            url: "ws://127.0.0.1:8000/voice-stream".to_string(),
            stats: StatsSnapshot {
                chunks_dropped: 3,
                ..StatsSnapshot::default()
            },
        };
        let status = voice_link_status(&session);
        assert_eq!(status["status"], "degraded");
        assert_eq!(status["warnings"].as_array().unwrap().len(), 1);
    }

    #[actix_web::test]
    async fn test_metrics_lists_endpoints() {
        let (state, _) = test_state(AppConfig::default());
        state.record_endpoint_request("GET /health", 4, false);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/api/v1/metrics", web::get().to(detailed_metrics)),
        )
        .await;

        let body: serde_json::Value = test::call_and_read_body_json(
            &app,
            test::TestRequest::get().uri("/api/v1/metrics").to_request(),
        )
        .await;
        assert_eq!(body["endpoints"][0]["endpoint"], "GET /health");
        assert_eq!(body["session"]["stats"]["chunks_sent"], 0);
    }
}

//! # Application State Management
//!
//! Shared state handed to every HTTP handler through `web::Data`.
//!
//! ## What lives here:
//! - **config**: runtime-updatable [`AppConfig`]
//! - **metrics**: per-endpoint request counters fed by the metrics middleware
//! - **voice**: the process's single [`VoiceSession`]
//! - **planning**: client for the detection / planning / chat collaborators,
//!   rebuilt whenever its configuration changes
//! - **placements**: boxes of the most recent load plan, sent as chat context
//!
//! ## Arc<RwLock<T>> Pattern
//! Many handlers read config and metrics at once; only config updates and the
//! metrics middleware write. Locks are held only long enough to copy data out,
//! never across an await.

use crate::config::AppConfig;
use crate::planning::models::GridBox;
use crate::planning::PlanningClient;
use crate::voice::{SessionSettings, VoiceSession};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Request metrics, updated by middleware on every request
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,

    pub voice: VoiceSession,

    planning: Arc<RwLock<Arc<PlanningClient>>>,

    placements: Arc<RwLock<Vec<GridBox>>>,
}

/// Request metrics collected across all HTTP requests.
#[derive(Debug, Default)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,

    /// Key: route pattern (e.g., "GET /api/v1/session")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Metrics for one endpoint.
///
/// ## Derived values:
/// - **Average response time**: total_duration_ms / request_count
/// - **Error rate**: error_count / request_count
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

impl AppState {
    /// Build the state. The voice session must have been created from the same
    /// configuration.
    pub fn new(config: AppConfig, voice: VoiceSession) -> anyhow::Result<Self> {
        let planning = PlanningClient::new(&config.planning)?;
        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
            voice,
            planning: Arc::new(RwLock::new(Arc::new(planning))),
            placements: Arc::new(RwLock::new(Vec::new())),
        })
    }

    /// Copy of the current configuration.
    pub fn get_config(&self) -> AppConfig {
        read(&self.config).clone()
    }

    /// Validate and install a new configuration.
    ///
    /// ## Side effects:
    /// - The voice session picks up the new settings on its next connect
    /// - The planning client is rebuilt if its section changed
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;

        let planning_changed = read(&self.config).planning != new_config.planning;
        if planning_changed {
            let client = PlanningClient::new(&new_config.planning).map_err(|e| e.to_string())?;
            *write(&self.planning) = Arc::new(client);
            tracing::info!(base_url = %new_config.planning.base_url, "Planning client reconfigured");
        }

        self.voice.update_settings(SessionSettings::from_config(&new_config));
        *write(&self.config) = new_config;
        Ok(())
    }

    pub fn planning(&self) -> Arc<PlanningClient> {
        read(&self.planning).clone()
    }

    /// Remember the placements of the latest load plan.
    pub fn set_placements(&self, placements: Vec<GridBox>) {
        tracing::debug!(count = placements.len(), "Current placements updated");
        *write(&self.placements) = placements;
    }

    pub fn placements(&self) -> Vec<GridBox> {
        read(&self.placements).clone()
    }

    pub fn increment_request_count(&self) {
        write(&self.metrics).request_count += 1;
    }

    pub fn increment_error_count(&self) {
        write(&self.metrics).error_count += 1;
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = write(&self.metrics);
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Consistent copy of the metrics, so no lock is held while serializing.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = read(&self.metrics);
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of failed requests, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::audio::device::{AudioContext, AudioDevice};
    use crate::testing::ScriptedDevice;
    use crate::voice::TranscriptAggregator;

    /// State backed by a scripted audio device.
    pub(crate) fn test_state(config: AppConfig) -> (AppState, Arc<ScriptedDevice>) {
        let device = ScriptedDevice::new();
        let audio: Arc<dyn AudioDevice> = device.clone();
        let voice = VoiceSession::new(
            tokio::runtime::Handle::current(),
            Arc::new(AudioContext::new(audio)),
            SessionSettings::from_config(&config),
            Arc::new(TranscriptAggregator::new()),
        );
        (AppState::new(config, voice).unwrap(), device)
    }

    #[tokio::test]
    async fn test_update_config_reaches_voice_and_planning() {
        let (state, _) = test_state(AppConfig::default());
        let before = state.planning();

        let mut config = state.get_config();
        config.voice.url = "ws://agent.example:9000/voice-stream".to_string();
        config.planning.base_url = "http://planner.example:9000".to_string();
        state.update_config(config).unwrap();

        assert_eq!(state.voice.url(), "ws://agent.example:9000/voice-stream");
        assert_eq!(state.planning().base_url(), "http://planner.example:9000");
        assert!(!Arc::ptr_eq(&before, &state.planning()));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let (state, _) = test_state(AppConfig::default());
        let mut config = state.get_config();
        config.server.port = 0;
        assert!(state.update_config(config).is_err());
        assert_eq!(state.get_config().server.port, 8080);
    }

    #[tokio::test]
    async fn test_endpoint_metrics() {
        let (state, _) = test_state(AppConfig::default());
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let snapshot = state.get_metrics_snapshot();
        let metric = &snapshot.endpoint_metrics["GET /health"];
        assert_eq!(metric.average_duration_ms(), 20.0);
        assert_eq!(metric.error_rate(), 0.5);
    }
}

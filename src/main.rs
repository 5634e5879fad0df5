//! # LogiPlan Voice - Main Application Entry Point
//!
//! Duplex voice client for the loading-planner agent, driven through a local
//! control API.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, `config.toml`, environment)
//! - **state**: shared application state and request metrics
//! - **health**: health and metrics endpoints
//! - **middleware**: request logging and per-endpoint metrics
//! - **handlers**: session control, transcript, config and planning endpoints
//! - **websocket**: live transcript feed for operator UIs
//! - **audio**: microphone capture, PCM encoding, clip decoding, device backends
//! - **voice**: the agent link (transport, keep-alive, playback, session state machine)
//! - **planning**: client for the detection / load-plan / chat collaborators
//!
//! ## Command Line:
//! - `--print-config`: print the effective configuration as TOML and exit

mod audio;
mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod planning;
mod state;
mod voice;
mod websocket;

#[cfg(test)]
mod testing;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Result;
use audio::{AudioContext, AudioDevice};
use config::AppConfig;
use state::AppState;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use voice::{SessionSettings, TranscriptAggregator, VoiceSession};

/// Load configuration, wire the voice session and serve the control API until a
/// shutdown signal arrives. A live voice session is closed before exit.
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;

    if std::env::args().any(|arg| arg == "--print-config") {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    info!("Starting logiplan-voice v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    info!(agent = %config.voice.url, planning = %config.planning.base_url, "Collaborators");

    let device = audio_device();
    info!(device = device.name(), "Audio backend selected");

    let voice = VoiceSession::new(
        tokio::runtime::Handle::current(),
        Arc::new(AudioContext::new(device)),
        SessionSettings::from_config(&config),
        Arc::new(TranscriptAggregator::new()),
    );
    let app_state = AppState::new(config.clone(), voice.clone())?;
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(Logger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/session", web::get().to(handlers::get_session))
                    .route("/session/connect", web::post().to(handlers::connect_session))
                    .route("/session/disconnect", web::post().to(handlers::disconnect_session))
                    .route("/transcript", web::get().to(handlers::get_transcript))
                    .route("/detect", web::post().to(handlers::detect))
                    .route("/plan", web::post().to(handlers::plan))
                    .route("/load-plan", web::post().to(handlers::load_plan))
                    .route("/chat", web::post().to(handlers::chat)),
            )
            .route("/ws/transcript", web::get().to(websocket::transcript_websocket))
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .disable_signals()
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    if voice.disconnect().await {
        info!("Voice session closed");
    }
    let transcript = voice.transcript();
    if !transcript.is_empty() {
        info!(entries = transcript.len(), "Transcript discarded at shutdown");
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Structured logging to the console.
///
/// `RUST_LOG` overrides the default `logiplan_voice=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "logiplan_voice=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

#[cfg(feature = "cpal")]
fn audio_device() -> Arc<dyn AudioDevice> {
    Arc::new(audio::cpal_backend::CpalAudioDevice::new())
}

#[cfg(not(feature = "cpal"))]
fn audio_device() -> Arc<dyn AudioDevice> {
    warn!("Built without the cpal feature: microphone unavailable, agent audio is discarded");
    Arc::new(audio::NullAudioDevice)
}

/// Resolve on SIGINT or SIGTERM (Ctrl+C only on non-Unix platforms).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = sigint.recv() => info!("Received SIGINT"),
                }
                return;
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!("Failed to install signal handlers, falling back to Ctrl+C: {}", e);
            }
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received Ctrl+C");
}

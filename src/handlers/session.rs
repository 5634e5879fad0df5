//! Voice session control: the operator's connect / disconnect buttons.

use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn get_session(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.voice.info())
}

/// Start streaming to the agent. Calling it while a session is live changes
/// nothing and reports `already_active`.
pub async fn connect_session(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let outcome = state.voice.connect().await?;

    Ok(HttpResponse::Ok().json(json!({
        "outcome": outcome,
        "session": state.voice.info()
    })))
}

pub async fn disconnect_session(state: web::Data<AppState>) -> HttpResponse {
    let was_active = state.voice.disconnect().await;

    HttpResponse::Ok().json(json!({
        "was_active": was_active,
        "session": state.voice.info()
    }))
}

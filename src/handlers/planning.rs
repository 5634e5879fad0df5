//! # Planning Proxy Handlers
//!
//! Forward operator requests to the detection, load-plan and chat collaborators.
//!
//! ## Endpoints:
//! - `POST /api/v1/detect`: multipart upload with an image in field `file`
//! - `POST /api/v1/plan`: same upload, then grid mapping and a load plan
//! - `POST /api/v1/load-plan`: JSON pass-through
//! - `POST /api/v1/chat`: one text turn; both sides land in the transcript
//!
//! Plans returned by `/plan` and `/load-plan` become the current placements. Chat
//! turns carry their box count and, unless the caller supplies its own context,
//! `{boxes, route, vehicle}` built from them.

use crate::error::{AppError, AppResult};
use crate::planning::models::{ChatMessage, ChatRequest, LoadPlanRequest};
use crate::planning::ImageUpload;
use crate::state::AppState;
use crate::voice::Speaker;
use actix_multipart::Multipart;
use actix_web::http::header::{self, ContentDisposition};
use actix_web::{web, HttpResponse};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;

const IMAGE_FIELD: &str = "file";
const MAX_IMAGE_BYTES: usize = 20 * 1024 * 1024;
const DEFAULT_VEHICLE: &str = "van";

#[derive(Debug, Deserialize)]
pub struct ChatTurn {
    pub message: String,
    /// Replaces the context built from the current placements.
    #[serde(default)]
    pub context: Option<serde_json::Value>,
    /// Overrides the number of boxes in the current placements.
    #[serde(default)]
    pub box_count: Option<usize>,
    #[serde(default)]
    pub route: Option<String>,
    #[serde(default)]
    pub vehicle: Option<String>,
}

/// Pull the image out of a multipart body. Other fields are drained and ignored.
async fn read_image(mut payload: Multipart) -> AppResult<ImageUpload> {
    while let Some(field) = payload.next().await {
        let mut field = field?;

        let disposition = field
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .and_then(|value| ContentDisposition::from_raw(value).ok());
        let is_image = disposition
            .as_ref()
            .and_then(|d| d.get_name())
            .map_or(false, |name| name == IMAGE_FIELD);

        if !is_image {
            while let Some(chunk) = field.next().await {
                chunk?;
            }
            continue;
        }

        let file_name = disposition
            .as_ref()
            .and_then(|d| d.get_filename())
            .unwrap_or("upload")
            .to_string();
        let content_type = field
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let mut bytes = Vec::new();
        while let Some(chunk) = field.next().await {
            let chunk = chunk?;
            if bytes.len() + chunk.len() > MAX_IMAGE_BYTES {
                return Err(AppError::BadRequest(format!(
                    "Image exceeds {} bytes",
                    MAX_IMAGE_BYTES
                )));
            }
            bytes.extend_from_slice(&chunk);
        }

        if bytes.is_empty() {
            return Err(AppError::BadRequest("Image file is empty".to_string()));
        }

        tracing::debug!(file_name = %file_name, bytes = bytes.len(), "Image upload received");
        return Ok(ImageUpload {
            bytes,
            file_name,
            content_type,
        });
    }

    Err(AppError::BadRequest(format!(
        "Multipart body has no '{}' field",
        IMAGE_FIELD
    )))
}

pub async fn detect(state: web::Data<AppState>, payload: Multipart) -> AppResult<HttpResponse> {
    let image = read_image(payload).await?;
    let detection = state.planning().detect(image).await?;
    Ok(HttpResponse::Ok().json(detection))
}

pub async fn plan(state: web::Data<AppState>, payload: Multipart) -> AppResult<HttpResponse> {
    let image = read_image(payload).await?;
    let result = state.planning().plan_from_image(image).await?;
    state.set_placements(result.plan.placements.clone());
    Ok(HttpResponse::Ok().json(result))
}

pub async fn load_plan(
    state: web::Data<AppState>,
    body: web::Json<LoadPlanRequest>,
) -> AppResult<HttpResponse> {
    let request = body.into_inner();
    if request.grid_width == 0 || request.grid_height == 0 {
        return Err(AppError::ValidationError(
            "Grid dimensions must be greater than 0".to_string(),
        ));
    }
    let plan = state.planning().load_plan(&request).await?;
    state.set_placements(plan.placements.clone());
    Ok(HttpResponse::Ok().json(plan))
}

/// Send one text turn to the chat collaborator.
///
/// The operator's text is recorded as a User entry before the call, so it stays
/// in the transcript even when the collaborator fails. The reply is recorded as
/// an Agent entry. The collaborator also receives a second user message with
/// the current box count.
pub async fn chat(state: web::Data<AppState>, body: web::Json<ChatTurn>) -> AppResult<HttpResponse> {
    let turn = body.into_inner();
    let message = turn.message.trim().to_string();
    if message.is_empty() {
        return Err(AppError::ValidationError("Chat message cannot be empty".to_string()));
    }

    let transcript = state.voice.transcript();
    transcript.record(Speaker::User, message.clone());

    let boxes = state.placements();
    let box_count = turn.box_count.unwrap_or(boxes.len());
    let context = turn.context.unwrap_or_else(|| {
        json!({
            "boxes": boxes,
            "route": turn.route.unwrap_or_default(),
            "vehicle": turn.vehicle.unwrap_or_else(|| DEFAULT_VEHICLE.to_string())
        })
    });

    let request = ChatRequest {
        messages: vec![
            ChatMessage::user(message),
            ChatMessage::user(format!("Current box count: {}", box_count)),
        ],
        context: Some(context),
    };
    let response = state.planning().chat(&request).await?;
    let entry = transcript.record(Speaker::Agent, response.reply.clone());

    Ok(HttpResponse::Ok().json(json!({
        "reply": response.reply,
        "audio_url": response.audio_url,
        "context": response.context,
        "ordinal": entry.ordinal
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::state::tests::test_state;
    use crate::testing::CannedHttp;
    use actix_web::{http::StatusCode, test, App};
    use serde_json::Value;

    const BOUNDARY: &str = "----logiplanboundary";

    fn multipart_body(field: &str) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        body.extend_from_slice(b"Content-Disposition: form-data; name=\"note\"\r\n\r\nfront bay\r\n");
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{}\"; filename=\"bay.png\"\r\nContent-Type: image/png\r\n\r\n",
                field
            )
            .as_bytes(),
        );
        body.extend_from_slice(b"\x89PNG not really\r\n");
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    fn upload_request(uri: &str, field: &str) -> test::TestRequest {
        test::TestRequest::post()
            .uri(uri)
            .insert_header((
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            ))
            .set_payload(multipart_body(field))
    }

    fn config_for(server: &CannedHttp) -> AppConfig {
        let mut config = AppConfig::default();
        config.planning.base_url = server.url();
        config.planning.timeout_secs = 5;
        config
    }

    #[actix_web::test]
    async fn test_detect_forwards_image() {
        let server = CannedHttp::start(vec![(
            200,
            json!({"boxes": [{"x": 1, "y": 2, "w": 3, "h": 4}], "image_width": 100, "image_height": 50}),
        )])
        .await;
        let (state, _) = test_state(config_for(&server));
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/detect", web::post().to(detect)),
        )
        .await;

        let body: Value = test::call_and_read_body_json(&app, upload_request("/detect", "file").to_request()).await;
        assert_eq!(body["image_width"], 100);

        let requests = server.requests().await;
        assert!(requests[0].contains("filename=\"bay.png\""));
        assert!(!requests[0].contains("front bay"));
    }

    #[actix_web::test]
    async fn test_missing_file_field_is_bad_request() {
        let (state, _) = test_state(AppConfig::default());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/plan", web::post().to(plan)),
        )
        .await;

        let response = test::call_service(&app, upload_request("/plan", "photo").to_request()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_chat_records_both_turns() {
        let server = CannedHttp::start(vec![(200, json!({"reply": "Load the pallets first."}))]).await;
        let (state, _) = test_state(config_for(&server));
        let transcript = state.voice.transcript().clone();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/chat", web::post().to(chat)),
        )
        .await;

        let request = test::TestRequest::post()
            .uri("/chat")
            .set_json(json!({"message": "  what goes in first? "}))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, request).await;
        assert_eq!(body["reply"], "Load the pallets first.");
        assert_eq!(body["ordinal"], 2);

        let entries = transcript.entries();
        assert_eq!(entries[0].speaker, Speaker::User);
        assert_eq!(entries[0].text, "what goes in first?");
        assert_eq!(entries[1].speaker, Speaker::Agent);

        let sent = server.requests().await;
        let payload: Value = serde_json::from_str(sent[0].split("\r\n\r\n").nth(1).unwrap()).unwrap();
        assert_eq!(payload["messages"][0]["role"], "user");
        assert_eq!(payload["messages"][1]["content"], "Current box count: 0");
        assert_eq!(payload["context"], json!({"boxes": [], "route": "", "vehicle": "van"}));
    }

    #[actix_web::test]
    async fn test_chat_context_follows_latest_plan() {
        let placement = json!({"id": "box-1", "x": 0, "y": 0, "w": 4, "h": 3, "label": "crate", "confidence": 0.9});
        let server = CannedHttp::start(vec![
            (200, json!({"placements": [placement.clone()], "warnings": [], "sequence": ["box-1"]})),
            (200, json!({"reply": "One crate, load it at the front."})),
        ])
        .await;
        let (state, _) = test_state(config_for(&server));
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/load-plan", web::post().to(load_plan))
                .route("/chat", web::post().to(chat)),
        )
        .await;

        let request = test::TestRequest::post()
            .uri("/load-plan")
            .set_json(json!({"grid_width": 20, "grid_height": 15, "boxes": [placement.clone()]}))
            .to_request();
        assert!(test::call_service(&app, request).await.status().is_success());

        let request = test::TestRequest::post()
            .uri("/chat")
            .set_json(json!({"message": "how many boxes?", "route": "north loop", "vehicle": "truck"}))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, request).await;
        assert_eq!(body["reply"], "One crate, load it at the front.");

        let sent = server.requests().await;
        let payload: Value = serde_json::from_str(sent[1].split("\r\n\r\n").nth(1).unwrap()).unwrap();
        assert_eq!(payload["messages"][0]["content"], "how many boxes?");
        assert_eq!(payload["messages"][1]["content"], "Current box count: 1");
        assert_eq!(payload["context"]["boxes"][0]["id"], "box-1");
        assert_eq!(payload["context"]["route"], "north loop");
        assert_eq!(payload["context"]["vehicle"], "truck");
    }

    #[actix_web::test]
    async fn test_collaborator_failure_is_bad_gateway() {
        let server = CannedHttp::start(vec![(503, json!({"detail": "planner offline"}))]).await;
        let (state, _) = test_state(config_for(&server));
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/load-plan", web::post().to(load_plan)),
        )
        .await;

        let request = test::TestRequest::post()
            .uri("/load-plan")
            .set_json(json!({"grid_width": 20, "grid_height": 15, "boxes": []}))
            .to_request();
        let response = test::call_service(&app, request).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}

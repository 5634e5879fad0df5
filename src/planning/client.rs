//! # Planning Client
//!
//! Typed HTTP client for the collaborators behind `planning.base_url`:
//!
//! - `POST /detect`: multipart image upload, field `file`
//! - `POST /load-plan`: JSON grid plan request
//! - `POST /chat`: JSON text conversation turn
//!
//! Non-2xx responses become [`PlanningError::Status`] carrying the body text, so the
//! operator sees what the collaborator complained about.

use crate::config::PlanningConfig;
use crate::planning::grid::{map_detections_to_grid, GridSize};
use crate::planning::models::{
    ChatRequest, ChatResponse, DetectResponse, LoadPlanRequest, LoadPlanResponse, PlanResult,
};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlanningError {
    #[error("planning request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{endpoint} returned HTTP {status}: {body}")]
    Status {
        endpoint: &'static str,
        status: u16,
        body: String,
    },

    #[error("invalid detection result: {0}")]
    InvalidDetection(String),
}

pub type PlanningResult<T> = Result<T, PlanningError>;

/// An uploaded image as received from the operator.
#[derive(Debug, Clone)]
pub struct ImageUpload {
    pub bytes: Vec<u8>,
    pub file_name: String,
    pub content_type: Option<String>,
}

#[derive(Debug)]
pub struct PlanningClient {
    client: Client,
    base_url: String,
    grid: GridSize,
}

impl PlanningClient {
    pub fn new(config: &PlanningConfig) -> PlanningResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            grid: GridSize {
                width: config.grid_width,
                height: config.grid_height,
            },
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn parse<T: DeserializeOwned>(endpoint: &'static str, response: Response) -> PlanningResult<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(endpoint, status = status.as_u16(), "Planning collaborator returned an error");
            return Err(PlanningError::Status {
                endpoint,
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<T>().await?)
    }

    /// Run box detection on an image.
    pub async fn detect(&self, image: ImageUpload) -> PlanningResult<DetectResponse> {
        let size = image.bytes.len();
        let mut part = Part::bytes(image.bytes).file_name(image.file_name);
        if let Some(content_type) = image.content_type.as_deref() {
            part = part.mime_str(content_type)?;
        }
        let form = Form::new().part("file", part);

        tracing::debug!(bytes = size, "Sending image for detection");
        let response = self.client.post(self.url("/detect")).multipart(form).send().await?;
        let detection: DetectResponse = Self::parse("/detect", response).await?;
        tracing::info!(
            boxes = detection.boxes.len(),
            width = detection.image_width,
            height = detection.image_height,
            "Detection complete"
        );
        Ok(detection)
    }

    pub async fn load_plan(&self, request: &LoadPlanRequest) -> PlanningResult<LoadPlanResponse> {
        let response = self.client.post(self.url("/load-plan")).json(request).send().await?;
        let plan: LoadPlanResponse = Self::parse("/load-plan", response).await?;
        tracing::info!(
            placements = plan.placements.len(),
            warnings = plan.warnings.len(),
            "Load plan received"
        );
        Ok(plan)
    }

    pub async fn chat(&self, request: &ChatRequest) -> PlanningResult<ChatResponse> {
        let response = self.client.post(self.url("/chat")).json(request).send().await?;
        Self::parse("/chat", response).await
    }

    /// Detect boxes, map them onto the planning grid, and request a load plan.
    pub async fn plan_from_image(&self, image: ImageUpload) -> PlanningResult<PlanResult> {
        let detection = self.detect(image).await?;
        let grid_boxes = map_detections_to_grid(&detection, self.grid)?;

        let request = LoadPlanRequest {
            grid_width: self.grid.width,
            grid_height: self.grid.height,
            boxes: grid_boxes.clone(),
            vehicle: None,
        };
        let plan = self.load_plan(&request).await?;

        Ok(PlanResult {
            detection,
            grid_boxes,
            plan,
        })
    }
}

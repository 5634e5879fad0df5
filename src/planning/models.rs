//! Wire types of the planning collaborators (`/detect`, `/load-plan`, `/chat`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A box found in an uploaded image, in pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedBox {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectResponse {
    #[serde(default)]
    pub boxes: Vec<DetectedBox>,
    pub image_width: u32,
    pub image_height: u32,
}

fn default_label() -> String {
    "box".to_string()
}

fn default_confidence() -> f64 {
    1.0
}

/// A box in grid cells, as the load planner consumes and returns them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridBox {
    pub id: String,
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    #[serde(default = "default_label")]
    pub label: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadPlanRequest {
    pub grid_width: u32,
    pub grid_height: u32,
    pub boxes: Vec<GridBox>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadPlanResponse {
    pub placements: Vec<GridBox>,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub sequence: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub reply: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

/// Image → detection → grid boxes → load plan, in one result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanResult {
    pub detection: DetectResponse,
    pub grid_boxes: Vec<GridBox>,
    pub plan: LoadPlanResponse,
}

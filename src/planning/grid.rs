//! # Pixel → Grid Mapping
//!
//! Detection reports boxes in image pixels; the load planner works on a coarse
//! cell grid (20 × 15 by default). Each axis is scaled by `grid / image`:
//!
//! - `x`, `y`: floor, clamped to `[0, grid - 1]`
//! - `w`, `h`: ceil, clamped to `[1, grid]`
//!
//! Boxes without an id are named `box-{n}` by 1-based position.

use crate::planning::client::PlanningError;
use crate::planning::models::{DetectResponse, GridBox};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridSize {
    pub width: u32,
    pub height: u32,
}

impl Default for GridSize {
    fn default() -> Self {
        Self {
            width: 20,
            height: 15,
        }
    }
}

fn cell_origin(px: f64, scale: f64, cells: u32) -> u32 {
    let cell = (px * scale).floor();
    cell.clamp(0.0, (cells - 1) as f64) as u32
}

fn cell_extent(px: f64, scale: f64, cells: u32) -> u32 {
    let extent = (px * scale).ceil();
    extent.clamp(1.0, cells as f64) as u32
}

pub fn map_detections_to_grid(
    detection: &DetectResponse,
    grid: GridSize,
) -> Result<Vec<GridBox>, PlanningError> {
    if detection.image_width == 0 || detection.image_height == 0 {
        return Err(PlanningError::InvalidDetection(format!(
            "image size {}x{} cannot be scaled",
            detection.image_width, detection.image_height
        )));
    }
    if grid.width == 0 || grid.height == 0 {
        return Err(PlanningError::InvalidDetection("grid has no cells".to_string()));
    }

    let scale_x = grid.width as f64 / detection.image_width as f64;
    let scale_y = grid.height as f64 / detection.image_height as f64;

    let boxes = detection
        .boxes
        .iter()
        .enumerate()
        .map(|(i, b)| GridBox {
            id: b
                .id
                .clone()
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| format!("box-{}", i + 1)),
            x: cell_origin(b.x, scale_x, grid.width),
            y: cell_origin(b.y, scale_y, grid.height),
            w: cell_extent(b.w, scale_x, grid.width),
            h: cell_extent(b.h, scale_y, grid.height),
            label: b.label.clone().unwrap_or_else(|| "box".to_string()),
            confidence: b.confidence.unwrap_or(1.0),
        })
        .collect();

    Ok(boxes)
}

//! # Planning Collaborators
//!
//! Box detection, grid load planning and text chat live in external services; this
//! module is the typed boundary to them plus the pixel-to-grid mapping that sits
//! between detection and planning.

pub mod client;
pub mod grid;
pub mod models;

pub use client::{ImageUpload, PlanningClient, PlanningError};

//! Request middleware: structured request logging with request ids, and
//! per-route metrics feeding `GET /api/v1/metrics`.

pub mod logging;
pub mod metrics;

pub use logging::RequestLogging;
pub use metrics::MetricsMiddleware;

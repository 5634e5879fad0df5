//! # Request Logging Middleware
//!
//! Wraps every request in a tracing span carrying a generated request id, and
//! logs start and completion with method, path, peer and duration. The id is
//! echoed back in the `x-request-id` response header so an operator can match a
//! client-side failure to the server log.

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::header::{HeaderName, HeaderValue},
    Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

const REQUEST_ID_HEADER: &str = "x-request-id";

pub struct RequestLogging;

impl<S, B> Transform<S, ServiceRequest> for RequestLogging
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = RequestLoggingMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequestLoggingMiddleware { service }))
    }
}

pub struct RequestLoggingMiddleware<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for RequestLoggingMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let start_time = Instant::now();
        let request_id = req
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let peer = req
            .connection_info()
            .realip_remote_addr()
            .unwrap_or("unknown")
            .to_string();

        let span = tracing::info_span!(
            "http_request",
            request_id = %request_id,
            method = %req.method(),
            path = %req.path()
        );
        span.in_scope(|| info!(peer = %peer, "Request started"));

        let fut = span.in_scope(|| self.service.call(req));

        Box::pin(
            async move {
                let mut result = fut.await;
                let duration_ms = start_time.elapsed().as_millis() as u64;

                match &mut result {
                    Ok(response) => {
                        let status = response.status();
                        if let Ok(value) = HeaderValue::from_str(&request_id) {
                            response
                                .headers_mut()
                                .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
                        }
                        if status.is_server_error() {
                            warn!(status = status.as_u16(), duration_ms, "Request completed with server error");
                        } else {
                            info!(status = status.as_u16(), duration_ms, "Request completed");
                        }
                    }
                    Err(err) => {
                        error!(duration_ms, error = %err, "Request failed");
                    }
                }

                result
            }
            .instrument(span),
        )
    }
}

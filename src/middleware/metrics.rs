//! Per-endpoint request counting. Endpoints are keyed by the matched route pattern
//! (`GET /api/v1/transcript`), not the raw path, so query strings and unknown paths
//! do not grow the table without bound.

use crate::state::AppState;
use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    web, Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};

const UNMATCHED: &str = "<unmatched>";

pub struct MetricsMiddleware;

impl<S, B> Transform<S, ServiceRequest> for MetricsMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = MetricsMiddlewareService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(MetricsMiddlewareService { service }))
    }
}

pub struct MetricsMiddlewareService<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for MetricsMiddlewareService<S>
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
        let pattern = req.match_pattern().unwrap_or_else(|| UNMATCHED.to_string());
        let endpoint = format!("{} {}", req.method(), pattern);
        let state = req.app_data::<web::Data<AppState>>().cloned();

        if let Some(state) = &state {
            state.increment_request_count();
        }

        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;
            let duration_ms = start_time.elapsed().as_millis() as u64;

            let is_error = match &result {
                Ok(response) => response.status().is_client_error() || response.status().is_server_error(),
                Err(_) => true,
            };

            if let Some(state) = state {
                state.record_endpoint_request(&endpoint, duration_ms, is_error);
                if is_error {
                    state.increment_error_count();
                }
            }

            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::state::tests::test_state;
    use actix_web::{test, App, HttpResponse};

    #[actix_web::test]
    async fn test_endpoints_keyed_by_pattern() {
        let (state, _) = test_state(AppConfig::default());
        let data = web::Data::new(state);
        let app = test::init_service(
            App::new()
                .app_data(data.clone())
                .wrap(MetricsMiddleware)
                .route("/items/{id}", web::get().to(|| async { HttpResponse::Ok().finish() })),
        )
        .await;

        for uri in ["/items/1", "/items/2?verbose=true", "/missing"] {
            test::call_service(&app, test::TestRequest::get().uri(uri).to_request()).await;
        }

        let metrics = data.get_metrics_snapshot();
        assert_eq!(metrics.request_count, 3);
        assert_eq!(metrics.error_count, 1);
        assert_eq!(metrics.endpoint_metrics["GET /items/{id}"].request_count, 2);
        assert_eq!(metrics.endpoint_metrics["GET <unmatched>"].error_count, 1);
    }
}

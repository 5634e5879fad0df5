use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
pub struct TranscriptQuery {
    /// Only return entries with an ordinal greater than this.
    #[serde(default)]
    pub since: u64,
}

pub async fn get_transcript(state: web::Data<AppState>, query: web::Query<TranscriptQuery>) -> HttpResponse {
    let transcript = state.voice.transcript();
    let entries = transcript.since(query.since);

    HttpResponse::Ok().json(json!({
        "status": state.voice.status(),
        "total": transcript.len(),
        "entries": entries
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::state::tests::test_state;
    use crate::voice::Speaker;
    use actix_web::{test, App};
    use serde_json::Value;

    #[actix_web::test]
    async fn test_since_filters_entries() {
        let (state, _) = test_state(AppConfig::default());
        let transcript = state.voice.transcript().clone();
        transcript.record(Speaker::User, "hi");
        transcript.record(Speaker::Agent, "hello");
        transcript.record(Speaker::Agent, "oops");

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/transcript", web::get().to(get_transcript)),
        )
        .await;

        let body: Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/transcript").to_request()).await;
        assert_eq!(body["total"], 3);
        assert_eq!(body["entries"][0]["speaker"], "user");

        let body: Value = test::call_and_read_body_json(
            &app,
            test::TestRequest::get().uri("/transcript?since=2").to_request(),
        )
        .await;
        let entries = body["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["text"], "oops");
    }
}

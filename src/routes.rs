use std::sync::Arc;

use axum::extract::multipart::MultipartRejection;
use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::bail_service;
use crate::completion::{prompts, CompletionClient};
use crate::config::Config;
use crate::error::{ServiceError, ServiceResult};
use crate::extractors::{model_or_default, TextInput};
use crate::model_manager::ModelManager;
use crate::transcription::{self, AudioUpload};

/// Multipart field holding the uploaded recording
const AUDIO_FIELD: &str = "audio";

#[derive(Clone)]
pub struct AppState {
    pub models: Arc<ModelManager>,
    pub completions: CompletionClient,
}

pub fn router(state: AppState, config: &Config) -> Router {
    let audio_router = Router::new()
        .route("/transcribe", post(handle_transcribe))
        .route("/process-audio", post(handle_process_audio))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes));

    Router::new()
        .route("/health", get(handle_health))
        .route("/summary", post(handle_summary))
        .route("/structure", post(handle_structure))
        .merge(audio_router)
        .layer(cors_layer(&config.allowed_origins()))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Credentialed CORS for the listed origins, methods and headers mirror the preflight
fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) if origin != "*" => Some(value),
            _ => {
                warn!(origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    info!(?origins, "CORS origins");

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

#[derive(Deserialize, Debug, Default)]
struct AudioQuery {
    language: Option<String>,
    model: Option<String>,
}

impl AudioQuery {
    fn language(&self) -> Option<String> {
        self.language
            .as_deref()
            .map(str::trim)
            .filter(|language| !language.is_empty())
            .map(String::from)
    }
}

#[derive(Serialize, Debug)]
struct HealthResponse {
    status: &'static str,
    model_loaded: bool,
}

#[derive(Serialize, Debug)]
struct TranscribeResponse {
    transcript: String,
}

#[derive(Serialize, Debug)]
struct SummaryResponse {
    summary: String,
}

#[derive(Serialize, Debug)]
struct StructureResponse {
    structured_content: String,
}

#[derive(Serialize, Debug)]
struct ProcessAudioResponse {
    transcript: String,
    summary: String,
    structured_content: String,
}

#[axum_macros::debug_handler]
async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        model_loaded: state.models.is_ready(),
    })
}

#[axum_macros::debug_handler]
async fn handle_transcribe(
    State(state): State<AppState>,
    Query(query): Query<AudioQuery>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ServiceResult<Json<TranscribeResponse>> {
    let model = state.models.get().ok_or_else(ServiceError::model_not_ready)?;
    let upload = read_audio(multipart?).await?;

    let transcript = transcription::transcribe(model, upload, query.language()).await?;
    Ok(Json(TranscribeResponse { transcript }))
}

#[axum_macros::debug_handler]
async fn handle_summary(
    State(state): State<AppState>,
    TextInput(params): TextInput,
) -> ServiceResult<Json<SummaryResponse>> {
    let request = prompts::summary_request(params.transcript()?, params.model());
    let summary = state.completions.complete(&request).await?;
    Ok(Json(SummaryResponse { summary }))
}

#[axum_macros::debug_handler]
async fn handle_structure(
    State(state): State<AppState>,
    TextInput(params): TextInput,
) -> ServiceResult<Json<StructureResponse>> {
    let request =
        prompts::structure_request(params.transcript()?, params.summary(), params.model());
    let structured_content = state.completions.complete(&request).await?;
    Ok(Json(StructureResponse { structured_content }))
}

/// Transcribes the upload, then summarizes and structures the transcript.
///
/// Steps run in order and the first failure aborts the request.
#[axum_macros::debug_handler]
async fn handle_process_audio(
    State(state): State<AppState>,
    Query(query): Query<AudioQuery>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ServiceResult<Json<ProcessAudioResponse>> {
    let model = state.models.get().ok_or_else(ServiceError::model_not_ready)?;
    let upload = read_audio(multipart?).await?;
    let llm_model = model_or_default(query.model.as_deref());

    let transcript = transcription::transcribe(model, upload, query.language()).await?;

    let summary = state
        .completions
        .complete(&prompts::summary_request(&transcript, llm_model))
        .await?;

    let structured_content = state
        .completions
        .complete(&prompts::structure_request(
            &transcript,
            Some(&summary),
            llm_model,
        ))
        .await?;

    Ok(Json(ProcessAudioResponse {
        transcript,
        summary,
        structured_content,
    }))
}

/// Reads the `audio` field, other fields are skipped
async fn read_audio(mut multipart: Multipart) -> ServiceResult<AudioUpload> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(AUDIO_FIELD) {
            continue;
        }
        let content_type = field.content_type().map(String::from);
        let filename = field.file_name().map(String::from);
        let bytes = field.bytes().await?;
        return Ok(AudioUpload {
            bytes,
            content_type,
            filename,
        });
    }

    bail_service!(
        StatusCode::UNPROCESSABLE_ENTITY,
        "Missing field {} in multipart form",
        AUDIO_FIELD
    );
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{header, Method, Request, Response};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::completion::DEFAULT_MODEL;
    use crate::test_support::{MockLlm, ScriptedSpeechModel};

    const BOUNDARY: &str = "voice-notes-boundary";

    struct TestApp {
        state: AppState,
        config: Config,
    }

    impl TestApp {
        fn new(llm: &MockLlm, api_key: Option<&str>) -> Self {
            let config = Config::default();
            let completions =
                CompletionClient::new(&llm.base_url(), api_key.map(String::from), config.referer())
                    .unwrap();
            Self {
                state: AppState {
                    models: Arc::new(ModelManager::default()),
                    completions,
                },
                config,
            }
        }

        fn with_model(self, model: Arc<ScriptedSpeechModel>) -> Self {
            self.state.models.publish(model);
            self
        }

        async fn send(&self, request: Request<Body>) -> Response<Body> {
            router(self.state.clone(), &self.config)
                .oneshot(request)
                .await
                .unwrap()
        }
    }

    async fn json_body(response: Response<Body>) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn multipart_request(uri: &str, field: &str, content_type: &str, filename: Option<&str>) -> Request<Body> {
        let disposition = match filename {
            Some(filename) => format!("form-data; name=\"{field}\"; filename=\"{filename}\""),
            None => format!("form-data; name=\"{field}\""),
        };
        let body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: {disposition}\r\nContent-Type: {content_type}\r\n\r\nRIFF-fake-audio\r\n--{BOUNDARY}--\r\n"
        );
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn json_request(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn health_request() -> Request<Body> {
        Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_model_state() {
        let llm = MockLlm::start().await;
        let app = TestApp::new(&llm, Some("test-key"));

        let response = app.send(health_request()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await,
            json!({ "status": "ok", "model_loaded": false })
        );

        let app = app.with_model(ScriptedSpeechModel::returning("hi"));
        let response = app.send(health_request()).await;
        assert_eq!(
            json_body(response).await,
            json!({ "status": "ok", "model_loaded": true })
        );
    }

    #[tokio::test]
    async fn transcribe_unavailable_until_model_loaded() {
        let llm = MockLlm::start().await;
        let app = TestApp::new(&llm, Some("test-key"));

        let response = app
            .send(multipart_request("/transcribe", "audio", "audio/wav", Some("a.wav")))
            .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            json_body(response).await["error"],
            "Whisper model not loaded. Please wait for startup."
        );
    }

    #[tokio::test]
    async fn transcribe_rejects_non_audio_upload() {
        let llm = MockLlm::start().await;
        let model = ScriptedSpeechModel::returning("never");
        let app = TestApp::new(&llm, Some("test-key")).with_model(model.clone());

        let response = app
            .send(multipart_request("/transcribe", "audio", "text/plain", Some("notes.txt")))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "File must be an audio file");
        assert!(model.calls().is_empty());
    }

    #[tokio::test]
    async fn transcribe_requires_audio_field() {
        let llm = MockLlm::start().await;
        let app = TestApp::new(&llm, Some("test-key"))
            .with_model(ScriptedSpeechModel::returning("hi"));

        let response = app
            .send(multipart_request("/transcribe", "file", "audio/wav", Some("a.wav")))
            .await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn transcribe_returns_trimmed_text() {
        let llm = MockLlm::start().await;
        let model = ScriptedSpeechModel::returning("  remember the milk \n");
        let app = TestApp::new(&llm, Some("test-key")).with_model(model.clone());

        let response = app
            .send(multipart_request("/transcribe?language=de", "audio", "audio/wav", None))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await,
            json!({ "transcript": "remember the milk" })
        );

        let call = &model.calls()[0];
        assert_eq!(call.path.extension().unwrap(), "wav");
        assert_eq!(call.audio, b"RIFF-fake-audio");
        assert_eq!(call.language.as_deref(), Some("de"));
        assert!(!call.path.exists());
        assert!(llm.requests().is_empty());
    }

    #[tokio::test]
    async fn transcribe_failure_is_server_error() {
        let llm = MockLlm::start().await;
        let app = TestApp::new(&llm, Some("test-key"))
            .with_model(ScriptedSpeechModel::returning("   "));

        let response = app
            .send(multipart_request("/transcribe", "audio", "audio/mpeg", Some("memo.mp3")))
            .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            json_body(response).await["error"],
            "Whisper returned empty transcript"
        );
    }

    #[tokio::test]
    async fn summary_from_query_parameters() {
        let llm = MockLlm::start().await;
        llm.reply(StatusCode::OK, MockLlm::content_body("  A short summary. "));
        let app = TestApp::new(&llm, Some("test-key"));

        let request = Request::builder()
            .method(Method::POST)
            .uri("/summary?transcript=we%20met%20today")
            .body(Body::empty())
            .unwrap();
        let response = app.send(request).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await,
            json!({ "summary": "A short summary." })
        );

        let requests = llm.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].body["model"], DEFAULT_MODEL);
        assert_eq!(requests[0].body["max_tokens"], 150);
        assert!(requests[0].prompt().ends_with("we met today"));
    }

    #[tokio::test]
    async fn summary_from_json_body_with_model() {
        let llm = MockLlm::start().await;
        let app = TestApp::new(&llm, Some("test-key"));

        let response = app
            .send(json_request(
                "/summary",
                json!({ "transcript": "budget review", "model": "anthropic/claude-3-haiku" }),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["summary"], "mock completion");
        assert_eq!(
            llm.requests()[0].body["model"],
            "anthropic/claude-3-haiku"
        );
    }

    #[tokio::test]
    async fn summary_without_transcript_is_unprocessable() {
        let llm = MockLlm::start().await;
        let app = TestApp::new(&llm, Some("test-key"));

        let response = app.send(json_request("/summary", json!({}))).await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(llm.requests().is_empty());
    }

    #[tokio::test]
    async fn summary_without_api_key_makes_no_call() {
        let llm = MockLlm::start().await;
        let app = TestApp::new(&llm, None);

        let response = app
            .send(json_request("/summary", json!({ "transcript": "hello" })))
            .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            json_body(response).await["error"],
            "OPENROUTER_API_KEY is not configured in backend environment"
        );
        assert!(llm.requests().is_empty());
    }

    #[tokio::test]
    async fn summary_propagates_upstream_status() {
        let llm = MockLlm::start().await;
        llm.reply(StatusCode::TOO_MANY_REQUESTS, "rate limited".into());
        let app = TestApp::new(&llm, Some("test-key"));

        let response = app
            .send(json_request("/summary", json!({ "transcript": "hello" })))
            .await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            json_body(response).await["error"],
            "OpenRouter API error: rate limited"
        );
    }

    #[tokio::test]
    async fn structure_includes_summary_only_when_given() {
        let llm = MockLlm::start().await;
        llm.reply(StatusCode::OK, MockLlm::content_body("## Notes"));
        let app = TestApp::new(&llm, Some("test-key"));

        let response = app
            .send(json_request(
                "/structure",
                json!({ "transcript": "first item then second", "summary": "Two items." }),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await,
            json!({ "structured_content": "## Notes" })
        );

        let response = app
            .send(json_request("/structure", json!({ "transcript": "first item" })))
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let requests = llm.requests();
        assert!(requests[0].prompt().contains("Summary context: Two items."));
        assert!(!requests[1].prompt().contains("Summary context"));
        assert_eq!(requests[1].body["max_tokens"], 2000);
    }

    #[tokio::test]
    async fn process_audio_chains_all_steps() {
        let llm = MockLlm::start().await;
        llm.reply(StatusCode::OK, MockLlm::content_body("Call the plumber."));
        llm.reply(StatusCode::OK, MockLlm::content_body("## Tasks\n- plumber"));
        let model = ScriptedSpeechModel::returning("I need to call the plumber");
        let app = TestApp::new(&llm, Some("test-key")).with_model(model.clone());

        let response = app
            .send(multipart_request(
                "/process-audio?model=meta-llama%2Fllama-3-8b&language=",
                "audio",
                "audio/webm",
                Some("note.webm"),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await,
            json!({
                "transcript": "I need to call the plumber",
                "summary": "Call the plumber.",
                "structured_content": "## Tasks\n- plumber",
            })
        );

        assert!(model.calls()[0].language.is_none());
        let requests = llm.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests.iter().all(|r| r.body["model"] == "meta-llama/llama-3-8b"));
        assert!(requests[1]
            .prompt()
            .contains("Summary context: Call the plumber."));
    }

    #[tokio::test]
    async fn process_audio_stops_at_first_failure() {
        let llm = MockLlm::start().await;
        llm.reply(StatusCode::BAD_GATEWAY, "upstream down".into());
        let app = TestApp::new(&llm, Some("test-key"))
            .with_model(ScriptedSpeechModel::returning("hello"));

        let response = app
            .send(multipart_request("/process-audio", "audio", "audio/ogg", None))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = json_body(response).await;
        assert!(body.get("transcript").is_none());
        assert_eq!(llm.requests().len(), 1);
    }

    #[tokio::test]
    async fn process_audio_unavailable_until_model_loaded() {
        let llm = MockLlm::start().await;
        let app = TestApp::new(&llm, Some("test-key"));

        let response = app
            .send(multipart_request("/process-audio", "audio", "audio/wav", Some("a.wav")))
            .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(llm.requests().is_empty());
    }

    #[tokio::test]
    async fn process_audio_rejects_non_audio_upload() {
        let llm = MockLlm::start().await;
        let model = ScriptedSpeechModel::returning("never");
        let app = TestApp::new(&llm, Some("test-key")).with_model(model.clone());

        let response = app
            .send(multipart_request("/process-audio", "audio", "application/pdf", Some("a.pdf")))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "File must be an audio file");
        assert!(model.calls().is_empty());
        assert!(llm.requests().is_empty());
    }

    #[tokio::test]
    async fn process_audio_without_api_key_makes_no_call() {
        let llm = MockLlm::start().await;
        let model = ScriptedSpeechModel::returning("hello");
        let app = TestApp::new(&llm, None).with_model(model.clone());

        let response = app
            .send(multipart_request("/process-audio", "audio", "audio/wav", None))
            .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert_eq!(
            body["error"],
            "OPENROUTER_API_KEY is not configured in backend environment"
        );
        assert!(body.get("transcript").is_none());
        assert_eq!(model.calls().len(), 1);
        assert!(llm.requests().is_empty());
    }

    #[tokio::test]
    async fn structure_without_api_key_makes_no_call() {
        let llm = MockLlm::start().await;
        let app = TestApp::new(&llm, None);

        let response = app
            .send(json_request(
                "/structure",
                json!({ "transcript": "hello", "summary": "hi" }),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            json_body(response).await["error"],
            "OPENROUTER_API_KEY is not configured in backend environment"
        );
        assert!(llm.requests().is_empty());
    }

    #[tokio::test]
    async fn process_audio_fails_when_structuring_fails() {
        let llm = MockLlm::start().await;
        llm.reply(StatusCode::OK, MockLlm::content_body("A summary."));
        llm.reply(StatusCode::SERVICE_UNAVAILABLE, "struct down".into());
        let app = TestApp::new(&llm, Some("test-key"))
            .with_model(ScriptedSpeechModel::returning("hello"));

        let response = app
            .send(multipart_request("/process-audio", "audio", "audio/wav", None))
            .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = json_body(response).await;
        assert_eq!(body["error"], "OpenRouter API error: struct down");
        assert!(body.get("transcript").is_none());
        assert!(body.get("summary").is_none());
        assert_eq!(llm.requests().len(), 2);
    }

    #[tokio::test]
    async fn preflight_allows_configured_origin() {
        let llm = MockLlm::start().await;
        let app = TestApp::new(&llm, Some("test-key"));

        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/summary")
            .header(header::ORIGIN, "http://localhost:3000")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "content-type")
            .body(Body::empty())
            .unwrap();
        let response = app.send(request).await;
        let headers = response.headers();
        assert_eq!(
            headers[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "http://localhost:3000"
        );
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");

        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/summary")
            .header(header::ORIGIN, "https://evil.example")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .body(Body::empty())
            .unwrap();
        let response = app.send(request).await;
        assert!(response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .is_none());
    }
}

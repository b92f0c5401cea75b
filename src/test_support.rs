//! In-process doubles for the speech model and the chat completion API.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::oneshot;

use crate::inference::task::transcribe::{SpeechModel, TranscribeOptions};

/// Mock chat completions server that records every request it receives
pub struct MockLlm {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    state: Arc<MockLlmState>,
}

#[derive(Default)]
struct MockLlmState {
    replies: Mutex<VecDeque<(StatusCode, String)>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub headers: HeaderMap,
    pub body: Value,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(String::from)
    }

    /// Content of the user message
    pub fn prompt(&self) -> String {
        self.body["messages"][1]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string()
    }
}

impl MockLlm {
    pub async fn start() -> Self {
        let state = Arc::new(MockLlmState::default());
        let app = Router::new()
            .route("/v1/chat/completions", post(handle_chat_completions))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    rx.await.ok();
                })
                .await
                .ok();
        });

        Self {
            addr,
            shutdown: Some(tx),
            state,
        }
    }

    /// Includes `/v1` as the client appends `/chat/completions`
    pub fn base_url(&self) -> String {
        format!("http://{}/v1", self.addr)
    }

    /// Queues a reply; once the queue is drained every call gets a canned completion
    pub fn reply(&self, status: StatusCode, body: String) {
        self.state.replies.lock().unwrap().push_back((status, body));
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn content_body(content: &str) -> String {
        json!({
            "id": "gen-1",
            "choices": [{ "index": 0, "message": { "role": "assistant", "content": content } }]
        })
        .to_string()
    }
}

impl Drop for MockLlm {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            tx.send(()).ok();
        }
    }
}

async fn handle_chat_completions(
    State(state): State<Arc<MockLlmState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    state
        .requests
        .lock()
        .unwrap()
        .push(RecordedRequest { headers, body });

    let (status, body) = state
        .replies
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| (StatusCode::OK, MockLlm::content_body("mock completion")));
    (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
}

/// What the speech model saw when it was invoked
#[derive(Debug, Clone)]
pub struct SpeechCall {
    pub path: PathBuf,
    pub audio: Vec<u8>,
    pub language: Option<String>,
    pub fp16: bool,
}

/// Speech model returning a scripted outcome
pub struct ScriptedSpeechModel {
    outcome: Result<String, String>,
    calls: Mutex<Vec<SpeechCall>>,
}

impl ScriptedSpeechModel {
    pub fn returning(text: &str) -> Arc<Self> {
        Arc::new(Self {
            outcome: Ok(text.to_string()),
            calls: Mutex::new(vec![]),
        })
    }

    pub fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            outcome: Err(message.to_string()),
            calls: Mutex::new(vec![]),
        })
    }

    pub fn calls(&self) -> Vec<SpeechCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl SpeechModel for ScriptedSpeechModel {
    fn transcribe(&self, path: &Path, options: &TranscribeOptions) -> Result<String> {
        self.calls.lock().unwrap().push(SpeechCall {
            path: path.to_path_buf(),
            audio: std::fs::read(path)?,
            language: options.language.clone(),
            fp16: options.fp16,
        });
        self.outcome.clone().map_err(|message| anyhow!(message))
    }
}

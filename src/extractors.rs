use axum::async_trait;
use axum::body::Bytes;
use axum::extract::{FromRequest, Query, Request};
use axum::http::StatusCode;
use serde::Deserialize;

use crate::completion::DEFAULT_MODEL;
use crate::error::ServiceError;

/// Fields accepted by the text endpoints
#[derive(Deserialize, Debug, Default)]
pub(crate) struct TextParams {
    pub(crate) transcript: Option<String>,
    pub(crate) summary: Option<String>,
    pub(crate) model: Option<String>,
}

impl TextParams {
    /// Query parameters take precedence over body fields
    fn or(self, other: TextParams) -> TextParams {
        TextParams {
            transcript: self.transcript.or(other.transcript),
            summary: self.summary.or(other.summary),
            model: self.model.or(other.model),
        }
    }

    pub(crate) fn transcript(&self) -> Result<&str, ServiceError> {
        match self.transcript.as_deref() {
            Some(transcript) if !transcript.trim().is_empty() => Ok(transcript),
            Some(_) => Err(ServiceError::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "Parameter transcript must not be empty",
            )),
            None => Err(ServiceError::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "Missing required parameter transcript",
            )),
        }
    }

    pub(crate) fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    pub(crate) fn model(&self) -> &str {
        model_or_default(self.model.as_deref())
    }
}

pub(crate) fn model_or_default(model: Option<&str>) -> &str {
    model
        .map(str::trim)
        .filter(|model| !model.is_empty())
        .unwrap_or(DEFAULT_MODEL)
}

/// Text endpoint input taken from the query string and, when present, a JSON body
pub(crate) struct TextInput(pub(crate) TextParams);

#[async_trait]
impl<S> FromRequest<S> for TextInput
where
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Query(query) = Query::<TextParams>::try_from_uri(req.uri())
            .map_err(|e| ServiceError::new(e.status(), e.body_text()))?;

        let body = Bytes::from_request(req, state)
            .await
            .map_err(|e| ServiceError::new(e.status(), e.body_text()))?;
        let body = if body.iter().all(u8::is_ascii_whitespace) {
            TextParams::default()
        } else {
            serde_json::from_slice::<TextParams>(&body).map_err(|e| {
                ServiceError::new(
                    StatusCode::BAD_REQUEST,
                    format!("Invalid JSON request body: {e}"),
                )
            })?
        };

        Ok(TextInput(query.or(body)))
    }
}

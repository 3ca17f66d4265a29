use axum::async_trait;
use axum::body::Bytes;
use axum::extract::{FromRequest, Request};
use axum::http::StatusCode;
use serde::de::DeserializeOwned;

use crate::error::RunnerError;

/// JSON body extractor that ignores the content type and rejects any body
/// that fails to decode with a 400 carrying the decoder's message.
pub(crate) struct JsonBody<T>(pub(crate) T);

#[async_trait]
impl<T, S> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = RunnerError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|rejection| RunnerError::new(rejection.status(), rejection.body_text()))?;
        let value = serde_json::from_slice(&bytes)
            .map_err(|err| RunnerError::new(StatusCode::BAD_REQUEST, err.to_string()))?;

        Ok(JsonBody(value))
    }
}

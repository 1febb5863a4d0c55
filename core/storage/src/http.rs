//! Shared HTTP plumbing for the REST clients.

use futures::StreamExt;
use reqwest::{Client, Response, StatusCode};

use skyferry_common::{Error, Result};

use crate::provider::ByteStream;

const USER_AGENT: &str = concat!("SkyFerry/", env!("CARGO_PKG_VERSION"));

/// Build the HTTP client shared by one API client.
pub(crate) fn build_client() -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))
}

/// Handle API response with error checking and decode the JSON body.
pub(crate) async fn decode<T: serde::de::DeserializeOwned>(response: Response) -> Result<T> {
    let response = check(response).await?;
    response
        .json()
        .await
        .map_err(|e| Error::Network(format!("Failed to parse response: {}", e)))
}

/// Pass a successful response through; map anything else to an error.
pub(crate) async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, &body))
}

/// Map an HTTP status to the error taxonomy.
pub(crate) fn status_error(status: StatusCode, body: &str) -> Error {
    match status {
        StatusCode::NOT_FOUND => Error::NotFound("Resource not found".to_string()),
        StatusCode::UNAUTHORIZED => {
            Error::AuthenticationRejected("Invalid or expired token".to_string())
        }
        StatusCode::FORBIDDEN => Error::PermissionDenied(format!("Access denied: {}", body)),
        _ => Error::Network(format!("API error: {} - {}", status, body)),
    }
}

/// Turn a response body into a [`ByteStream`].
pub(crate) fn body_stream(response: Response) -> ByteStream {
    let stream = response
        .bytes_stream()
        .map(|result| result.map_err(|e| Error::Network(format!("Stream read error: {}", e))));
    Box::pin(stream)
}

/// `Authorization` header value for a bearer token.
pub(crate) fn bearer(token: &str) -> String {
    format!("Bearer {}", token)
}

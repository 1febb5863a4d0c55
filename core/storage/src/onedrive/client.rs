//! Microsoft Graph client for the signed-in user's OneDrive.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::{header, Body, Client, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use skyferry_common::{Error, RemotePath, Result};

use crate::auth::CredentialManager;
use crate::http;
use crate::provider::{
    ByteStream, ChunkOutcome, ChunkRange, ConflictBehavior, DestinationProvider, UploadSession,
    UploadedItem,
};

/// Graph endpoint for the signed-in user's drive.
const GRAPH_DRIVE_BASE: &str = "https://graph.microsoft.com/v1.0/me/drive";

/// Graph addresses the drive root by this alias.
const ROOT_ALIAS: &str = "root";

#[derive(Debug, Deserialize)]
struct DriveItem {
    id: String,
    #[serde(default)]
    folder: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChildName {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ChildrenPage {
    #[serde(default)]
    value: Vec<ChildName>,
    #[serde(rename = "@odata.nextLink", default)]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadSessionResponse {
    upload_url: String,
    #[serde(default)]
    expiration_date_time: Option<DateTime<Utc>>,
}

/// Everything except RFC 3986 unreserved characters.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

fn encode_segment(segment: &str) -> String {
    utf8_percent_encode(segment, SEGMENT).to_string()
}

/// Encoded `folder/name` path below the drive root.
///
/// `name` goes through the same checks as any path component, so a
/// separator or dot segment cannot address something outside `folder`.
fn item_path(folder: &RemotePath, name: &str) -> Result<String> {
    Ok(folder
        .join(name)?
        .components()
        .iter()
        .map(|c| encode_segment(c))
        .collect::<Vec<_>>()
        .join("/"))
}

/// Microsoft Graph OneDrive client.
pub struct GraphClient {
    http: Client,
    credentials: Arc<CredentialManager>,
    api_base: String,
}

impl GraphClient {
    /// Create a new Graph client.
    pub fn new(credentials: Arc<CredentialManager>) -> Result<Self> {
        Ok(Self {
            http: http::build_client()?,
            credentials,
            api_base: GRAPH_DRIVE_BASE.to_string(),
        })
    }

    /// Point the client at a different drive endpoint.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    async fn auth_header(&self) -> Result<String> {
        let token = self.credentials.access_token().await?;
        Ok(http::bearer(&token))
    }
}

#[async_trait]
impl DestinationProvider for GraphClient {
    fn root_id(&self) -> &str {
        ROOT_ALIAS
    }

    async fn child_folder(&self, parent_id: &str, name: &str) -> Result<String> {
        let url = format!(
            "{}/items/{}:/{}",
            self.api_base,
            parent_id,
            encode_segment(name)
        );
        let auth = self.auth_header().await?;

        let response = self
            .http
            .get(&url)
            .header(header::AUTHORIZATION, auth)
            .query(&[("$select", "id,name,folder")])
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to look up folder: {}", e)))?;

        let item: DriveItem = http::decode(response).await?;
        if item.folder.is_none() {
            return Err(Error::NotFound(format!("{} is not a folder", name)));
        }
        Ok(item.id)
    }

    async fn list_children(&self, folder_id: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut next = Some(format!(
            "{}/items/{}/children?$select=name",
            self.api_base, folder_id
        ));

        while let Some(url) = next {
            let auth = self.auth_header().await?;
            let response = self
                .http
                .get(&url)
                .header(header::AUTHORIZATION, auth)
                .send()
                .await
                .map_err(|e| Error::Network(format!("Failed to list folder: {}", e)))?;

            let page: ChildrenPage = http::decode(response).await?;
            names.extend(page.value.into_iter().map(|c| c.name));
            next = page.next_link;
        }

        debug!("Folder {} has {} children", folder_id, names.len());
        Ok(names)
    }

    async fn upload_simple(
        &self,
        folder: &RemotePath,
        name: &str,
        body: ByteStream,
        size_hint: Option<u64>,
    ) -> Result<UploadedItem> {
        let url = format!(
            "{}/root:/{}:/content",
            self.api_base,
            item_path(folder, name)?
        );
        let auth = self.auth_header().await?;

        let mut request = self
            .http
            .put(&url)
            .header(header::AUTHORIZATION, auth)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .query(&[(
                "@microsoft.graph.conflictBehavior",
                ConflictBehavior::Replace.as_str(),
            )]);

        if let Some(size) = size_hint {
            request = request.header(header::CONTENT_LENGTH, size.to_string());
        }

        let response = request
            .body(Body::wrap_stream(body))
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to upload file: {}", e)))?;

        http::decode(response).await
    }

    async fn create_upload_session(
        &self,
        folder: &RemotePath,
        name: &str,
        conflict: ConflictBehavior,
    ) -> Result<UploadSession> {
        let url = format!(
            "{}/root:/{}:/createUploadSession",
            self.api_base,
            item_path(folder, name)?
        );
        let auth = self.auth_header().await?;

        let payload = serde_json::json!({
            "item": { "@microsoft.graph.conflictBehavior": conflict.as_str() }
        });

        let response = self
            .http
            .post(&url)
            .header(header::AUTHORIZATION, auth)
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to create upload session: {}", e)))?;

        let session: UploadSessionResponse = http::decode(response).await?;
        Ok(UploadSession {
            upload_url: session.upload_url,
            expires_at: session.expiration_date_time,
        })
    }

    async fn upload_chunk(
        &self,
        session: &UploadSession,
        range: ChunkRange,
        data: Bytes,
    ) -> Result<ChunkOutcome> {
        // The upload URL is pre-authenticated; Graph rejects a bearer header here
        let response = self
            .http
            .put(&session.upload_url)
            .header(header::CONTENT_LENGTH, data.len().to_string())
            .header(header::CONTENT_RANGE, range.header_value())
            .body(data)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to upload chunk: {}", e)))?;

        let status = response.status();
        if status == StatusCode::ACCEPTED {
            Ok(ChunkOutcome::Continue)
        } else if status == StatusCode::OK || status == StatusCode::CREATED {
            let item: UploadedItem = response
                .json()
                .await
                .map_err(|e| Error::Network(format!("Failed to parse upload response: {}", e)))?;
            Ok(ChunkOutcome::Complete(item))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(http::status_error(status, &body))
        }
    }
}

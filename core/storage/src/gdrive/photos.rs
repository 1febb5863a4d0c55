//! Google Photos Library API client.

use async_trait::async_trait;
use reqwest::{header, Client};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use skyferry_common::{Error, Origin, Result, SourceFile};

use crate::auth::CredentialManager;
use crate::http;
use crate::provider::{ByteStream, SourcePage, SourceProvider};

/// Photos Library API base URL.
const PHOTOS_API_BASE: &str = "https://photoslibrary.googleapis.com/v1";

/// A media item from the library.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaItem {
    /// Media item ID.
    pub id: String,
    /// Original file name.
    pub filename: String,
    /// Base URL; needs a suffix to address the original bytes.
    pub base_url: String,
    /// MIME type.
    #[serde(default)]
    pub mime_type: Option<String>,
    /// Photo or video specific metadata.
    #[serde(default)]
    pub media_metadata: MediaMetadata,
}

/// Only the presence of the `photo`/`video` objects matters here.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MediaMetadata {
    #[serde(default)]
    photo: Option<serde_json::Value>,
    #[serde(default)]
    video: Option<serde_json::Value>,
}

impl MediaItem {
    /// Whether the item is a video.
    pub fn is_video(&self) -> bool {
        self.media_metadata.video.is_some() && self.media_metadata.photo.is_none()
    }

    /// URL of the original bytes: `=d` downloads a photo, `=dv` a video.
    pub fn download_url(&self) -> String {
        let suffix = if self.is_video() { "=dv" } else { "=d" };
        format!("{}{}", self.base_url, suffix)
    }

    fn into_source_file(self) -> SourceFile {
        SourceFile {
            content_url: self.download_url(),
            id: self.id,
            name: self.filename,
            parent_ids: Vec::new(),
            size: None,
            permissions: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaItemList {
    #[serde(default)]
    media_items: Vec<MediaItem>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// Google Photos API client.
///
/// Photos has no folder hierarchy and no way to delete items through the API.
pub struct PhotosClient {
    http: Client,
    credentials: Arc<CredentialManager>,
    api_base: String,
}

impl PhotosClient {
    /// Create a new Photos client.
    pub fn new(credentials: Arc<CredentialManager>) -> Result<Self> {
        Ok(Self {
            http: http::build_client()?,
            credentials,
            api_base: PHOTOS_API_BASE.to_string(),
        })
    }

    /// Point the client at a different API base URL.
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
impl SourceProvider for PhotosClient {
    fn origin(&self) -> Origin {
        Origin::GooglePhotos
    }

    async fn list_page(&self, page_token: Option<&str>, page_size: u32) -> Result<SourcePage> {
        let url = format!("{}/mediaItems", self.api_base);
        let auth = self.auth_header().await?;
        let page_size = page_size.to_string();

        let mut request = self
            .http
            .get(&url)
            .header(header::AUTHORIZATION, auth)
            .query(&[("pageSize", page_size.as_str())]);

        if let Some(token) = page_token {
            request = request.query(&[("pageToken", token)]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to list media items: {}", e)))?;

        let list: MediaItemList = http::decode(response).await?;
        debug!("Photos listing returned {} items", list.media_items.len());

        Ok(SourcePage {
            files: list
                .media_items
                .into_iter()
                .map(MediaItem::into_source_file)
                .collect(),
            next_page_token: list.next_page_token,
        })
    }

    async fn get_file(&self, file_id: &str) -> Result<SourceFile> {
        let url = format!("{}/mediaItems/{}", self.api_base, file_id);
        let auth = self.auth_header().await?;

        let response = self
            .http
            .get(&url)
            .header(header::AUTHORIZATION, auth)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to get media item: {}", e)))?;

        let item: MediaItem = http::decode(response).await?;
        Ok(item.into_source_file())
    }

    /// The listing never reports sizes; a HEAD on the download URL does.
    async fn content_length(&self, file: &SourceFile) -> Result<Option<u64>> {
        if file.size.is_some() {
            return Ok(file.size);
        }

        let auth = self.auth_header().await?;
        let response = self
            .http
            .head(&file.content_url)
            .header(header::AUTHORIZATION, auth)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to get file size: {}", e)))?;

        let response = http::check(response).await?;
        let length = response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        Ok(length)
    }

    async fn download_stream(&self, file: &SourceFile) -> Result<ByteStream> {
        let auth = self.auth_header().await?;

        let response = self
            .http
            .get(&file.content_url)
            .header(header::AUTHORIZATION, auth)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to start download: {}", e)))?;

        let response = http::check(response).await?;
        Ok(http::body_stream(response))
    }

    async fn delete(&self, _file_id: &str) -> Result<()> {
        Err(Error::PermissionDenied(
            "The photo library does not allow deleting media items".to_string(),
        ))
    }
}

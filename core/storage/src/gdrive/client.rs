//! Google Drive API client.

use async_trait::async_trait;
use reqwest::{header, Client};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use skyferry_common::{Error, Origin, Permission, Result, SourceFile};

use crate::auth::CredentialManager;
use crate::http;
use crate::provider::{ByteStream, FolderNode, HierarchyLookup, SourcePage, SourceProvider};

/// Google Drive API base URL.
const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
/// Google user info endpoint, used to learn the account email.
const USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v2/userinfo";

/// Binary files only: trashed items and Google-native documents cannot be
/// downloaded as-is.
const LISTING_QUERY: &str = "trashed=false and not mimeType contains 'application/vnd.google-apps'";

const FILE_FIELDS: &str = "id,name,mimeType,size,parents,permissions(role,emailAddress)";
const FOLDER_FIELDS: &str = "id,name,parents";

/// Google Drive file metadata from API.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    /// File ID.
    pub id: String,
    /// File name.
    pub name: String,
    /// MIME type.
    #[serde(default)]
    pub mime_type: Option<String>,
    /// File size in bytes (only for binary files).
    #[serde(default)]
    pub size: Option<String>,
    /// Parent folder IDs.
    #[serde(default)]
    pub parents: Vec<String>,
    /// Sharing permissions visible to the caller.
    #[serde(default)]
    pub permissions: Vec<Permission>,
}

impl DriveFile {
    /// Get size as u64.
    pub fn size_bytes(&self) -> Option<u64> {
        self.size.as_ref().and_then(|s| s.parse().ok())
    }

    fn into_source_file(self, api_base: &str) -> SourceFile {
        let size = self.size_bytes();
        SourceFile {
            content_url: content_url(api_base, &self.id),
            id: self.id,
            name: self.name,
            parent_ids: self.parents,
            size,
            permissions: self.permissions,
        }
    }
}

/// Response from listing files.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileListResponse {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    email: String,
}

fn content_url(api_base: &str, file_id: &str) -> String {
    format!(
        "{}/files/{}?alt=media&supportsAllDrives=true",
        api_base, file_id
    )
}

/// Google Drive API client.
pub struct DriveClient {
    http: Client,
    credentials: Arc<CredentialManager>,
    api_base: String,
}

impl DriveClient {
    /// Create a new Drive client.
    pub fn new(credentials: Arc<CredentialManager>) -> Result<Self> {
        Ok(Self {
            http: http::build_client()?,
            credentials,
            api_base: DRIVE_API_BASE.to_string(),
        })
    }

    /// Point the client at a different API base URL.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    /// Get authorization header.
    async fn auth_header(&self) -> Result<String> {
        let token = self.credentials.access_token().await?;
        Ok(http::bearer(&token))
    }

    /// Email address of the signed-in account.
    pub async fn user_email(&self) -> Result<String> {
        let auth = self.auth_header().await?;
        let response = self
            .http
            .get(USERINFO_URL)
            .header(header::AUTHORIZATION, auth)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to get user info: {}", e)))?;

        let info: UserInfo = http::decode(response).await?;
        Ok(info.email)
    }

    async fn fetch_metadata<T: serde::de::DeserializeOwned>(
        &self,
        file_id: &str,
        fields: &str,
    ) -> Result<T> {
        let url = format!("{}/files/{}", self.api_base, file_id);
        let auth = self.auth_header().await?;

        let response = self
            .http
            .get(&url)
            .header(header::AUTHORIZATION, auth)
            .query(&[("fields", fields), ("supportsAllDrives", "true")])
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to get file: {}", e)))?;

        http::decode(response).await
    }
}

#[async_trait]
impl SourceProvider for DriveClient {
    fn origin(&self) -> Origin {
        Origin::GoogleDrive
    }

    async fn list_page(&self, page_token: Option<&str>, page_size: u32) -> Result<SourcePage> {
        let url = format!("{}/files", self.api_base);
        let auth = self.auth_header().await?;
        let page_size = page_size.to_string();
        let fields = format!("nextPageToken,files({})", FILE_FIELDS);

        let mut request = self
            .http
            .get(&url)
            .header(header::AUTHORIZATION, auth)
            .query(&[
                ("q", LISTING_QUERY),
                ("fields", fields.as_str()),
                ("pageSize", page_size.as_str()),
                ("supportsAllDrives", "true"),
                ("includeItemsFromAllDrives", "true"),
            ]);

        if let Some(token) = page_token {
            request = request.query(&[("pageToken", token)]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to list files: {}", e)))?;

        let list: FileListResponse = http::decode(response).await?;
        debug!(
            "Drive listing returned {} files (more: {})",
            list.files.len(),
            list.next_page_token.is_some()
        );

        Ok(SourcePage {
            files: list
                .files
                .into_iter()
                .map(|f| f.into_source_file(&self.api_base))
                .collect(),
            next_page_token: list.next_page_token,
        })
    }

    async fn get_file(&self, file_id: &str) -> Result<SourceFile> {
        let file: DriveFile = self.fetch_metadata(file_id, FILE_FIELDS).await?;
        Ok(file.into_source_file(&self.api_base))
    }

    async fn content_length(&self, file: &SourceFile) -> Result<Option<u64>> {
        if file.size.is_some() {
            return Ok(file.size);
        }
        let fresh: DriveFile = self.fetch_metadata(&file.id, "id,name,size").await?;
        Ok(fresh.size_bytes())
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

    async fn delete(&self, file_id: &str) -> Result<()> {
        let url = format!("{}/files/{}", self.api_base, file_id);
        let auth = self.auth_header().await?;

        let response = self
            .http
            .delete(&url)
            .header(header::AUTHORIZATION, auth)
            .query(&[("supportsAllDrives", "true")])
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to delete file: {}", e)))?;

        http::check(response).await?;
        debug!("Deleted Drive file {}", file_id);
        Ok(())
    }
}

#[async_trait]
impl HierarchyLookup for DriveClient {
    async fn folder_node(&self, folder_id: &str) -> Result<FolderNode> {
        let folder: DriveFile = self.fetch_metadata(folder_id, FOLDER_FIELDS).await?;
        Ok(FolderNode {
            parent_id: folder.parents.into_iter().next(),
            id: folder.id,
            name: folder.name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drive_file_size_bytes() {
        let file: DriveFile =
            serde_json::from_str(r#"{"id":"1","name":"file.txt","size":"12345"}"#).unwrap();
        assert_eq!(file.size_bytes(), Some(12345));

        let folder: DriveFile = serde_json::from_str(
            r#"{"id":"2","name":"folder","mimeType":"application/vnd.google-apps.folder"}"#,
        )
        .unwrap();
        assert_eq!(folder.size_bytes(), None);
    }

    #[test]
    fn test_listing_response_to_source_files() {
        let json = r#"{
            "nextPageToken": "next",
            "files": [{
                "id": "abc",
                "name": "report.pdf",
                "size": "2048",
                "parents": ["p1", "p2"],
                "permissions": [{"role": "owner", "emailAddress": "me@example.com"}]
            }]
        }"#;
        let list: FileListResponse = serde_json::from_str(json).unwrap();
        assert_eq!(list.next_page_token.as_deref(), Some("next"));

        let file = list
            .files
            .into_iter()
            .next()
            .unwrap()
            .into_source_file("https://api.test/drive/v3");
        assert_eq!(file.primary_parent(), Some("p1"));
        assert_eq!(file.size, Some(2048));
        assert!(file.is_owned_by("ME@example.com"));
        assert_eq!(
            file.content_url,
            "https://api.test/drive/v3/files/abc?alt=media&supportsAllDrives=true"
        );
    }

    #[test]
    fn test_last_page_has_no_token() {
        let list: FileListResponse = serde_json::from_str(r#"{"files": []}"#).unwrap();
        assert!(list.files.is_empty());
        assert!(list.next_page_token.is_none());
    }
}

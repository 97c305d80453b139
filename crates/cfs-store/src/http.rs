//! Drive-style REST backend for [`crate::cloud::CloudStore`].
//!
//! Speaks the v3 JSON surface: paginated `files` listing, the `changes`
//! stream with start-page tokens, ranged `alt=media` downloads and a
//! metadata-then-media upload. Authentication is a bearer token read from a
//! token file; obtaining that token is out of scope here.

use std::path::Path;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::io::AsyncReadExt;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::warn;

use crate::cloud::{ChangeItem, ChangePage, CloudApi, ListPage};
use crate::{ByteStream, RemoteObject, StoreError, StoreResult};

const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const DEFAULT_API_BASE: &str = "https://www.googleapis.com/drive/v3";
const DEFAULT_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";
const PAGE_SIZE: usize = 1000;

pub struct DriveApi {
    http: reqwest::Client,
    token: String,
    base: String,
    upload_base: String,
}

#[derive(Deserialize)]
struct TokenFile {
    access_token: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct FileMeta {
    id: String,
    name: String,
    #[serde(deserialize_with = "de_size")]
    size: i64,
    modified_time: String,
    mime_type: String,
    trashed: bool,
    parents: Vec<String>,
}

impl FileMeta {
    fn into_object(self) -> RemoteObject {
        let mtime = parse_rfc3339(&self.modified_time);
        RemoteObject {
            id: self.id,
            name: self.name,
            size: self.size,
            mtime,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileListResponse {
    next_page_token: Option<String>,
    #[serde(default)]
    files: Vec<FileMeta>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangeEntry {
    file: Option<FileMeta>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangeListResponse {
    next_page_token: Option<String>,
    new_start_page_token: Option<String>,
    #[serde(default)]
    changes: Vec<ChangeEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartPageTokenResponse {
    start_page_token: String,
}

#[derive(Deserialize)]
struct AboutResponse {
    user: AboutUser,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AboutUser {
    permission_id: String,
}

impl DriveApi {
    pub fn new(access_token: impl Into<String>, api_base: Option<&str>) -> Self {
        let base = api_base
            .map(|b| b.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        // A custom base serves uploads from the same host.
        let upload_base = if api_base.is_some() {
            base.clone()
        } else {
            DEFAULT_UPLOAD_BASE.to_string()
        };
        DriveApi {
            http: reqwest::Client::new(),
            token: access_token.into(),
            base,
            upload_base,
        }
    }

    /// Read the bearer token from an OAuth token file (`access_token` field).
    pub fn from_token_file(path: &Path, api_base: Option<&str>) -> StoreResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let token: TokenFile = serde_json::from_str(&raw)
            .map_err(|e| StoreError::Api(format!("bad token file {}: {e}", path.display())))?;
        Ok(Self::new(token.access_token, api_base))
    }

    async fn check(resp: reqwest::Response) -> StoreResult<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        let snippet: String = body.chars().take(300).collect();
        if status == reqwest::StatusCode::FORBIDDEN && body.contains("insufficientPermissions") {
            return Err(StoreError::Api(
                "wrong permissions: create a token with write access for uploads".into(),
            ));
        }
        Err(StoreError::Api(format!("{status}: {snippet}")))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> StoreResult<T> {
        let resp = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .query(query)
            .send()
            .await
            .map_err(|e| StoreError::Api(e.to_string()))?;
        Self::check(resp)
            .await?
            .json()
            .await
            .map_err(|e| StoreError::Api(format!("bad response body: {e}")))
    }
}

#[async_trait]
impl CloudApi for DriveApi {
    async fn resolve_folder(&self, folder_id: &str) -> StoreResult<String> {
        // `root` is an alias, not a real id; change diffs need the real one.
        if folder_id != "root" && !folder_id.is_empty() {
            return Ok(folder_id.to_string());
        }
        let meta: FileMeta = self
            .get_json(&format!("{}/files/root", self.base), &[("fields", "id")])
            .await?;
        Ok(meta.id)
    }

    async fn start_page_token(&self) -> StoreResult<String> {
        let resp: StartPageTokenResponse = self
            .get_json(&format!("{}/changes/startPageToken", self.base), &[])
            .await?;
        Ok(resp.start_page_token)
    }

    async fn list_page(&self, folder_id: &str, page_token: Option<&str>) -> StoreResult<ListPage> {
        let q = format!(
            "trashed = false and mimeType != '{FOLDER_MIME}' and '{folder_id}' in parents"
        );
        let page_size = PAGE_SIZE.to_string();
        let mut query = vec![
            ("q", q.as_str()),
            ("fields", "nextPageToken, files(id, name, size, modifiedTime)"),
            ("spaces", "drive"),
            ("corpora", "user"),
            ("pageSize", page_size.as_str()),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken", token));
        }

        let resp: FileListResponse = self
            .get_json(&format!("{}/files", self.base), &query)
            .await?;

        Ok(ListPage {
            objects: resp.files.into_iter().map(FileMeta::into_object).collect(),
            next_page_token: resp.next_page_token,
        })
    }

    async fn changes_page(&self, page_token: &str) -> StoreResult<ChangePage> {
        let page_size = PAGE_SIZE.to_string();
        let query = [
            ("pageToken", page_token),
            (
                "fields",
                "nextPageToken, newStartPageToken, \
                 changes(file(id, name, size, trashed, mimeType, parents, modifiedTime))",
            ),
            ("spaces", "drive"),
            ("pageSize", page_size.as_str()),
        ];

        let resp: ChangeListResponse = self
            .get_json(&format!("{}/changes", self.base), &query)
            .await?;

        let changes = resp
            .changes
            .into_iter()
            .filter_map(|entry| entry.file)
            .map(|meta| ChangeItem {
                trashed: meta.trashed,
                is_folder: meta.mime_type == FOLDER_MIME,
                parents: meta.parents.clone(),
                object: meta.into_object(),
            })
            .collect();

        Ok(ChangePage {
            changes,
            next_page_token: resp.next_page_token,
            new_start_page_token: resp.new_start_page_token,
        })
    }

    async fn read_range(&self, id: &str, offset: u64, upper: u64) -> StoreResult<ByteStream> {
        let resp = self
            .http
            .get(format!("{}/files/{}", self.base, id))
            .bearer_auth(&self.token)
            .query(&[("alt", "media")])
            .header(reqwest::header::RANGE, format!("bytes={offset}-{upper}"))
            .send()
            .await
            .map_err(|e| StoreError::Api(e.to_string()))?;

        let resp = Self::check(resp).await?;
        let stream = resp
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        Ok(Box::new(StreamReader::new(stream)))
    }

    async fn upload(
        &self,
        folder_id: &str,
        name: &str,
        reader: ByteStream,
        max_bytes: u64,
    ) -> StoreResult<String> {
        let parent = if folder_id.is_empty() {
            "root"
        } else {
            folder_id
        };

        // Two steps: create the metadata shell, then stream the media into
        // it. Interrupted uploads leave a zero-byte object that the size
        // check in the diff logic ignores.
        let created = self
            .http
            .post(format!("{}/files", self.base))
            .bearer_auth(&self.token)
            .json(&json!({
                "name": name,
                "parents": [parent],
                "mimeType": "application/octet-stream",
            }))
            .send()
            .await
            .map_err(|e| StoreError::Api(e.to_string()))?;
        let created: FileMeta = Self::check(created)
            .await?
            .json()
            .await
            .map_err(|e| StoreError::Api(format!("bad create response: {e}")))?;

        let body = if max_bytes > 0 {
            reqwest::Body::wrap_stream(ReaderStream::new(reader.take(max_bytes)))
        } else {
            reqwest::Body::wrap_stream(ReaderStream::new(reader))
        };

        let uploaded = self
            .http
            .patch(format!("{}/files/{}", self.upload_base, created.id))
            .bearer_auth(&self.token)
            .query(&[("uploadType", "media")])
            .body(body)
            .send()
            .await
            .map_err(|e| StoreError::Api(e.to_string()))?;
        Self::check(uploaded).await?;

        Ok(created.id)
    }

    async fn trash(&self, id: &str) -> StoreResult<()> {
        let resp = self
            .http
            .patch(format!("{}/files/{}", self.base, id))
            .bearer_auth(&self.token)
            .json(&json!({ "trashed": true }))
            .send()
            .await
            .map_err(|e| StoreError::Api(e.to_string()))?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn account_id(&self) -> StoreResult<String> {
        let resp: AboutResponse = self
            .get_json(
                &format!("{}/about", self.base),
                &[("fields", "user(permissionId)")],
            )
            .await?;
        Ok(resp.user.permission_id)
    }
}

/// Drive serialises `size` as a JSON string; accept both spellings.
fn de_size<'de, D: serde::Deserializer<'de>>(de: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(i64),
        Str(String),
    }

    match Option::<Raw>::deserialize(de)? {
        None => Ok(0),
        Some(Raw::Num(n)) => Ok(n),
        Some(Raw::Str(s)) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// RFC 3339 (`2018-08-03T12:03:30.407Z`) → unix seconds; unparsable input
/// is logged and treated as older than everything.
fn parse_rfc3339(raw: &str) -> i64 {
    match chrono::DateTime::parse_from_rfc3339(raw) {
        Ok(t) => t.timestamp(),
        Err(e) => {
            warn!("can't parse time {raw:?}: {e}");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_meta_accepts_string_sizes() {
        let meta: FileMeta = serde_json::from_str(
            r#"{"id":"x1","name":"a.chunk","size":"1234","modifiedTime":"2018-08-03T12:03:30.407Z"}"#,
        )
        .unwrap();
        assert_eq!(meta.size, 1234);

        let obj = meta.into_object();
        assert_eq!(obj.mtime, 1533297810);
    }

    #[test]
    fn file_meta_tolerates_missing_fields() {
        let meta: FileMeta = serde_json::from_str(r#"{"id":"f1"}"#).unwrap();
        assert_eq!(meta.size, 0);
        assert!(!meta.trashed);
        assert!(meta.parents.is_empty());
        // Missing mtime parses to "older than everything".
        assert_eq!(meta.into_object().mtime, 0);
    }

    #[test]
    fn change_list_response_shape() {
        let resp: ChangeListResponse = serde_json::from_str(
            r#"{
                "newStartPageToken": "8846",
                "changes": [
                    {"file": {"id": "a", "name": "x", "size": "7", "trashed": true,
                              "mimeType": "application/octet-stream", "parents": ["p"],
                              "modifiedTime": "2018-08-03T12:03:30Z"}},
                    {}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(resp.new_start_page_token.as_deref(), Some("8846"));
        assert_eq!(resp.changes.len(), 2);
        assert!(resp.changes[1].file.is_none());
    }
}

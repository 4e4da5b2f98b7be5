//! GitHub REST v3 backend
//!
//! One repository per site under a single organisation. File operations go
//! through the contents API; multi-file commits through the git data API.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue};
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::StoreConfig;
use crate::content::{decode_content, encode_content};
use crate::error::{Result, StoreError};
use crate::host::{FileContent, GitHost, RepoScope, TreeListing, TreeWrite};
use crate::object::{ObjectId, ObjectKind, RepoState, Tree, TreeEntry, parse_mode};

const GITHUB_MEDIA_TYPE: &str = "application/vnd.github+json";
const GITHUB_API_VERSION: &str = "2022-11-28";

/// Map a non-success response to the engine's error kinds
pub fn error_for_status(status: StatusCode, what: &str, body: &str) -> StoreError {
    let detail = if body.is_empty() {
        format!("{} ({})", what, status)
    } else {
        format!("{} ({}): {}", what, status, body)
    };
    match status {
        StatusCode::NOT_FOUND => StoreError::NotFound(detail),
        StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => StoreError::Conflict(detail),
        _ => StoreError::RemoteUnavailable(detail),
    }
}

#[derive(Deserialize)]
struct ContentsResponse {
    #[serde(rename = "type")]
    kind: String,
    sha: ObjectId,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    encoding: Option<String>,
}

#[derive(Deserialize)]
struct BlobResponse {
    content: String,
    encoding: String,
}

#[derive(Deserialize)]
struct ShaResponse {
    sha: ObjectId,
}

#[derive(Deserialize)]
struct WriteFileResponse {
    content: ShaResponse,
}

#[derive(Deserialize)]
struct RefResponse {
    object: ShaResponse,
}

#[derive(Deserialize)]
struct GitCommitResponse {
    sha: ObjectId,
    tree: ShaResponse,
}

#[derive(Deserialize)]
struct TreeResponse {
    sha: ObjectId,
    tree: Vec<TreeItem>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Deserialize)]
struct TreeItem {
    path: String,
    mode: String,
    #[serde(rename = "type")]
    kind: ObjectKind,
    sha: ObjectId,
}

#[derive(Serialize)]
struct WriteFileRequest<'a> {
    message: &'a str,
    content: String,
    branch: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<ObjectId>,
}

#[derive(Serialize)]
struct DeleteFileRequest<'a> {
    message: &'a str,
    branch: &'a str,
    sha: ObjectId,
}

#[derive(Serialize)]
struct CreateBlobRequest {
    content: String,
    encoding: &'static str,
}

#[derive(Serialize)]
struct CreateTreeRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    base_tree: Option<ObjectId>,
    tree: &'a [TreeWrite],
}

#[derive(Serialize)]
struct CreateCommitRequest<'a> {
    message: &'a str,
    tree: ObjectId,
    parents: &'a [ObjectId],
}

#[derive(Serialize)]
struct UpdateRefRequest {
    sha: ObjectId,
    force: bool,
}

/// [`GitHost`] backed by the GitHub REST API
#[derive(Clone)]
pub struct GitHubClient {
    base_url: Url,
    org: String,
    http: Client,
}

impl GitHubClient {
    pub fn new(
        base_url: &str,
        org: &str,
        token: &str,
        timeout: Duration,
        user_agent: &str,
    ) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| StoreError::Config(format!("invalid api_base_url {:?}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(StoreError::Config(format!("api_base_url {} cannot be a base", base_url)));
        }

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(GITHUB_MEDIA_TYPE));
        headers.insert("X-GitHub-Api-Version", HeaderValue::from_static(GITHUB_API_VERSION));
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| StoreError::Config("access token is not a valid header value".to_string()))?;
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);

        let http = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .default_headers(headers)
            .build()
            .map_err(|e| StoreError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url,
            org: org.to_string(),
            http,
        })
    }

    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        Self::new(
            &config.api_base_url,
            &config.org,
            config.token.as_deref().unwrap_or_default(),
            config.request_timeout(),
            &config.user_agent,
        )
    }

    /// `{base}/repos/{org}/{site}/{segments...}`. Segments containing `/`
    /// are split so each path component is escaped on its own.
    pub fn repo_url(&self, site: &str, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| StoreError::Config(format!("api_base_url {} cannot be a base", self.base_url)))?;
            path.pop_if_empty().extend(["repos", self.org.as_str(), site]);
            for segment in segments {
                path.extend(segment.split('/').filter(|s| !s.is_empty()));
            }
        }
        Ok(url)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder, what: &str) -> Result<T> {
        let response = request.send().await?;
        let status = response.status();
        tracing::debug!("{} -> {}", what, status);
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(error_for_status(status, what, &body));
        }
        let body = response.bytes().await?;
        serde_json::from_slice(&body)
            .map_err(|e| StoreError::Decode(format!("unexpected response to {}: {}", what, e)))
    }

    async fn read_blob(&self, site: &str, sha: ObjectId) -> Result<Bytes> {
        let url = self.repo_url(site, &["git", "blobs", sha.to_hex().as_str()])?;
        let blob: BlobResponse = self
            .send(self.http.get(url), &format!("GET blob {}", sha.short()))
            .await?;
        match blob.encoding.as_str() {
            "base64" => Ok(decode_content(&blob.content)?.into()),
            "utf-8" => Ok(Bytes::from(blob.content)),
            other => Err(StoreError::Decode(format!("unsupported blob encoding {}", other))),
        }
    }
}

#[async_trait]
impl GitHost for GitHubClient {
    async fn read_file(&self, scope: &RepoScope, path: &str) -> Result<FileContent> {
        let mut url = self.repo_url(&scope.site, &["contents", path])?;
        url.query_pairs_mut().append_pair("ref", &scope.branch);
        let what = format!("GET {}:{}", scope, path);
        // Directories come back as a JSON array.
        let value: serde_json::Value = self.send(self.http.get(url), &what).await?;
        if value.is_array() {
            return Err(StoreError::NotFound(format!("{} is a directory", path)));
        }
        let file: ContentsResponse = serde_json::from_value(value)
            .map_err(|e| StoreError::Decode(format!("unexpected response to {}: {}", what, e)))?;
        if file.kind != "file" {
            return Err(StoreError::NotFound(format!("{} is a {}", path, file.kind)));
        }
        // Files above the contents API size limit arrive without content.
        let content = match (file.encoding.as_deref(), file.content.as_deref()) {
            (Some("base64"), Some(encoded)) if !encoded.is_empty() => decode_content(encoded)?.into(),
            _ => self.read_blob(&scope.site, file.sha).await?,
        };
        Ok(FileContent {
            content,
            sha: file.sha,
        })
    }

    async fn create_file(
        &self,
        scope: &RepoScope,
        path: &str,
        content: &[u8],
        message: &str,
    ) -> Result<ObjectId> {
        let url = self.repo_url(&scope.site, &["contents", path])?;
        let body = WriteFileRequest {
            message,
            content: encode_content(content),
            branch: &scope.branch,
            sha: None,
        };
        let resp: WriteFileResponse = self
            .send(self.http.put(url).json(&body), &format!("PUT {}:{}", scope, path))
            .await?;
        Ok(resp.content.sha)
    }

    async fn update_file(
        &self,
        scope: &RepoScope,
        path: &str,
        content: &[u8],
        sha: ObjectId,
        message: &str,
    ) -> Result<ObjectId> {
        let url = self.repo_url(&scope.site, &["contents", path])?;
        let body = WriteFileRequest {
            message,
            content: encode_content(content),
            branch: &scope.branch,
            sha: Some(sha),
        };
        let resp: WriteFileResponse = self
            .send(self.http.put(url).json(&body), &format!("PUT {}:{}", scope, path))
            .await?;
        Ok(resp.content.sha)
    }

    async fn delete_file(
        &self,
        scope: &RepoScope,
        path: &str,
        sha: ObjectId,
        message: &str,
    ) -> Result<()> {
        let url = self.repo_url(&scope.site, &["contents", path])?;
        let body = DeleteFileRequest {
            message,
            branch: &scope.branch,
            sha,
        };
        let _: serde_json::Value = self
            .send(self.http.delete(url).json(&body), &format!("DELETE {}:{}", scope, path))
            .await?;
        Ok(())
    }

    async fn get_repo_state(&self, scope: &RepoScope) -> Result<RepoState> {
        // Resolve through the ref so a hex-looking branch name is never read
        // as a commit prefix.
        let url = self.repo_url(&scope.site, &["git", "ref", "heads", scope.branch.as_str()])?;
        let head: RefResponse = self
            .send(self.http.get(url), &format!("GET ref of {}", scope))
            .await?;
        let url = self.repo_url(&scope.site, &["git", "commits", head.object.sha.to_hex().as_str()])?;
        let commit: GitCommitResponse = self
            .send(self.http.get(url), &format!("GET commit {} of {}", head.object.sha.short(), scope))
            .await?;
        Ok(RepoState {
            commit: commit.sha,
            tree: commit.tree.sha,
        })
    }

    async fn get_tree(&self, site: &str, tree: ObjectId, recursive: bool) -> Result<TreeListing> {
        let mut url = self.repo_url(site, &["git", "trees", tree.to_hex().as_str()])?;
        if recursive {
            url.query_pairs_mut().append_pair("recursive", "1");
        }
        let resp: TreeResponse = self
            .send(self.http.get(url), &format!("GET tree {} of {}", tree.short(), site))
            .await?;
        let mut entries = Vec::with_capacity(resp.tree.len());
        for item in resp.tree {
            let mode = parse_mode(&item.mode)
                .ok_or_else(|| StoreError::Decode(format!("bad mode {:?} for {}", item.mode, item.path)))?;
            entries.push(TreeEntry::new(item.path, item.sha, item.kind, mode));
        }
        Ok(TreeListing {
            sha: resp.sha,
            tree: Tree::from_entries(entries),
            truncated: resp.truncated,
        })
    }

    async fn create_blob(&self, site: &str, content: &[u8]) -> Result<ObjectId> {
        let url = self.repo_url(site, &["git", "blobs"])?;
        let body = CreateBlobRequest {
            content: encode_content(content),
            encoding: "base64",
        };
        let resp: ShaResponse = self
            .send(self.http.post(url).json(&body), &format!("POST blob to {}", site))
            .await?;
        Ok(resp.sha)
    }

    async fn create_tree(
        &self,
        site: &str,
        base_tree: Option<ObjectId>,
        writes: &[TreeWrite],
    ) -> Result<ObjectId> {
        let url = self.repo_url(site, &["git", "trees"])?;
        let body = CreateTreeRequest {
            base_tree,
            tree: writes,
        };
        let resp: ShaResponse = self
            .send(self.http.post(url).json(&body), &format!("POST tree to {}", site))
            .await?;
        Ok(resp.sha)
    }

    async fn create_commit(
        &self,
        site: &str,
        message: &str,
        tree: ObjectId,
        parents: &[ObjectId],
    ) -> Result<ObjectId> {
        let url = self.repo_url(site, &["git", "commits"])?;
        let body = CreateCommitRequest {
            message,
            tree,
            parents,
        };
        let resp: ShaResponse = self
            .send(self.http.post(url).json(&body), &format!("POST commit to {}", site))
            .await?;
        Ok(resp.sha)
    }

    async fn update_ref(&self, scope: &RepoScope, commit: ObjectId, force: bool) -> Result<()> {
        let url = self.repo_url(&scope.site, &["git", "refs", "heads", scope.branch.as_str()])?;
        let body = UpdateRefRequest { sha: commit, force };
        let _: serde_json::Value = self
            .send(
                self.http.patch(url).json(&body),
                &format!("PATCH {} -> {}", scope, commit.short()),
            )
            .await?;
        tracing::debug!("Moved {} to {}", scope, commit.short());
        Ok(())
    }
}

//! GitHub REST client for commit statuses, comments, heads and file contents.

use async_trait::async_trait;
use gantry_core::githost::{CommitStatus, GitHost};
use reqwest::StatusCode;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;

/// GitHub API errors.
#[derive(Debug, thiserror::Error)]
pub enum GitHubError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("API error: {status}: {message}")]
    Api { status: StatusCode, message: String },

    #[error("Parse error: {0}")]
    Parse(String),
}

impl From<GitHubError> for gantry_core::Error {
    fn from(err: GitHubError) -> Self {
        match err {
            GitHubError::Api {
                status: StatusCode::NOT_FOUND,
                message,
            } => gantry_core::Error::NotFound(message),
            err => gantry_core::Error::ExternalService(err.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PullRequest {
    head: GitRef,
}

#[derive(Debug, Deserialize)]
struct GitRef {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct RepositoryInfo {
    default_branch: String,
}

#[derive(Debug, Deserialize)]
struct Branch {
    commit: GitRef,
}

/// GitHub API client authenticated with a static token.
pub struct GitHubClient {
    client: reqwest::Client,
    api_url: String,
    token: Option<String>,
}

impl GitHubClient {
    pub fn new(api_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.request_as(method, path, "application/vnd.github+json")
    }

    fn request_as(
        &self,
        method: reqwest::Method,
        path: &str,
        accept: &str,
    ) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.api_url, path))
            .header("User-Agent", "gantry")
            .header("Accept", accept);
        if let Some(token) = &self.token {
            builder = builder.header("Authorization", format!("Bearer {}", token));
        }
        builder
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, GitHubError> {
        let response = builder
            .send()
            .await
            .map_err(|e| GitHubError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(GitHubError::Api { status, message });
        }
        Ok(response)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, GitHubError> {
        self.send(self.request(reqwest::Method::GET, path))
            .await?
            .json()
            .await
            .map_err(|e| GitHubError::Parse(e.to_string()))
    }

    /// Raw file body, or `None` on 404.
    async fn get_raw(&self, path: &str) -> Result<Option<String>, GitHubError> {
        let builder =
            self.request_as(reqwest::Method::GET, path, "application/vnd.github.raw+json");
        match self.send(builder).await {
            Ok(response) => response
                .text()
                .await
                .map(Some)
                .map_err(|e| GitHubError::Parse(e.to_string())),
            Err(GitHubError::Api {
                status: StatusCode::NOT_FOUND,
                ..
            }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<(), GitHubError> {
        self.send(self.request(reqwest::Method::POST, path).json(&body))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl GitHost for GitHubClient {
    async fn create_status(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
        status: &CommitStatus,
    ) -> gantry_core::Result<()> {
        let body = serde_json::to_value(status)
            .map_err(|e| gantry_core::Error::Internal(e.to_string()))?;
        self.post(&format!("/repos/{}/{}/statuses/{}", owner, repo, sha), body)
            .await?;
        Ok(())
    }

    async fn create_comment(
        &self,
        owner: &str,
        repo: &str,
        number: i32,
        body: &str,
    ) -> gantry_core::Result<()> {
        self.post(
            &format!("/repos/{}/{}/issues/{}/comments", owner, repo, number),
            json!({ "body": body }),
        )
        .await?;
        Ok(())
    }

    async fn pull_request_head(
        &self,
        owner: &str,
        repo: &str,
        number: i32,
    ) -> gantry_core::Result<String> {
        let pr: PullRequest = self
            .get(&format!("/repos/{}/{}/pulls/{}", owner, repo, number))
            .await?;
        Ok(pr.head.sha)
    }

    async fn default_branch_head(&self, owner: &str, repo: &str) -> gantry_core::Result<String> {
        let info: RepositoryInfo = self.get(&format!("/repos/{}/{}", owner, repo)).await?;
        let branch: Branch = self
            .get(&format!(
                "/repos/{}/{}/branches/{}",
                owner,
                repo,
                urlencoding::encode(&info.default_branch)
            ))
            .await?;
        Ok(branch.commit.sha)
    }

    async fn file_content(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        reference: &str,
    ) -> gantry_core::Result<Option<String>> {
        let mut url = format!("/repos/{}/{}/contents/{}", owner, repo, path);
        if !reference.is_empty() {
            url.push_str(&format!("?ref={}", urlencoding::encode(reference)));
        }
        Ok(self.get_raw(&url).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use axum::extract::{Path, State};
    use axum::http::HeaderMap;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use gantry_core::githost::StatusState;
    use serde_json::Value;

    type Captured = Arc<Mutex<Vec<(String, Option<String>, Value)>>>;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        format!("http://{}", addr)
    }

    async fn capture(
        State(captured): State<Captured>,
        Path((owner, repo, rest)): Path<(String, String, String)>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        captured
            .lock()
            .unwrap()
            .push((format!("{}/{}/{}", owner, repo, rest), auth, body));
        Json(json!({}))
    }

    #[tokio::test]
    async fn test_create_status_and_comment() {
        let captured: Captured = Arc::default();
        let router = Router::new()
            .route("/repos/{owner}/{repo}/statuses/{rest}", post(capture))
            .route("/repos/{owner}/{repo}/issues/{rest}/comments", post(capture))
            .with_state(captured.clone());
        let client = GitHubClient::new(serve(router).await, Some("t0ken".to_string()));

        let status = CommitStatus {
            state: StatusState::Success,
            context: "test //app:test".to_string(),
            description: "Success".to_string(),
            target_url: Some("http://localhost/logs/ops-1".to_string()),
        };
        client.create_status("f110", "ops", "c0ffee", &status).await.unwrap();
        client.create_comment("f110", "ops", 28, "hello").await.unwrap();

        let captured = captured.lock().unwrap();
        assert_eq!(captured.len(), 2);
        assert_eq!(captured[0].0, "f110/ops/c0ffee");
        assert_eq!(captured[0].1.as_deref(), Some("Bearer t0ken"));
        assert_eq!(captured[0].2["state"], "success");
        assert_eq!(captured[0].2["context"], "test //app:test");
        assert_eq!(captured[1].0, "f110/ops/28");
        assert_eq!(captured[1].2["body"], "hello");
    }

    #[tokio::test]
    async fn test_heads() {
        let router = Router::new()
            .route(
                "/repos/f110/ops",
                get(|| async { Json(json!({"default_branch": "main"})) }),
            )
            .route(
                "/repos/f110/ops/branches/main",
                get(|| async { Json(json!({"commit": {"sha": "abc123"}})) }),
            )
            .route(
                "/repos/f110/ops/pulls/28",
                get(|| async { Json(json!({"head": {"sha": "feed"}})) }),
            );
        let client = GitHubClient::new(serve(router).await, None);

        assert_eq!(client.default_branch_head("f110", "ops").await.unwrap(), "abc123");
        assert_eq!(client.pull_request_head("f110", "ops", 28).await.unwrap(), "feed");

        let missing = client.pull_request_head("f110", "ops", 29).await;
        assert!(matches!(missing, Err(gantry_core::Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_file_content() {
        use axum::extract::Query;
        use std::collections::HashMap;

        let router = Router::new().route(
            "/repos/f110/ops/contents/.bazelversion",
            get(
                |headers: HeaderMap, Query(query): Query<HashMap<String, String>>| async move {
                    let accept = headers
                        .get("accept")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    format!("{}|{}\n", accept, query.get("ref").cloned().unwrap_or_default())
                },
            ),
        );
        let client = GitHubClient::new(serve(router).await, None);

        let at_revision = client
            .file_content("f110", "ops", ".bazelversion", "c0ffee")
            .await
            .unwrap();
        assert_eq!(
            at_revision.as_deref(),
            Some("application/vnd.github.raw+json|c0ffee\n")
        );
        let on_default = client
            .file_content("f110", "ops", ".bazelversion", "")
            .await
            .unwrap();
        assert_eq!(on_default.as_deref(), Some("application/vnd.github.raw+json|\n"));

        let missing = client
            .file_content("f110", "ops", "WORKSPACE", "c0ffee")
            .await
            .unwrap();
        assert!(missing.is_none());
    }
}

//! Version-control adapter.
//!
//! Thin client over a VCS automation service: clone, branch, commit, push,
//! open a pull request. The core only ever persists the PR URL.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{AdapterError, Result};

/// One file change in a commit tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChange {
    /// Repository-relative path.
    pub path: String,
    /// Full new file content.
    pub content: String,
}

/// A commit to apply on a branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitSpec {
    /// Commit message.
    pub message: String,
    /// The tree of changed files.
    pub files: Vec<FileChange>,
}

/// A pull request to open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrRequest {
    /// PR title.
    pub title: String,
    /// PR body.
    pub body: String,
    /// Head branch.
    pub head: String,
    /// Base branch.
    pub base: String,
}

/// Trait for version-control operations.
#[async_trait]
pub trait VcsClient: Send + Sync {
    /// Ensure the repository is cloned and ready server-side.
    ///
    /// # Errors
    ///
    /// Returns an error if the VCS service rejects or cannot be reached.
    async fn clone_repo(&self, repo_url: &str) -> Result<()>;

    /// Create a branch off `base`.
    ///
    /// # Errors
    ///
    /// Returns an error if the VCS service rejects or cannot be reached.
    async fn create_branch(&self, repo_url: &str, branch: &str, base: &str) -> Result<()>;

    /// Apply a commit tree on a branch; returns the commit id.
    ///
    /// # Errors
    ///
    /// Returns an error if the VCS service rejects or cannot be reached.
    async fn commit(&self, repo_url: &str, branch: &str, commit: &CommitSpec) -> Result<String>;

    /// Push a branch.
    ///
    /// # Errors
    ///
    /// Returns an error if the VCS service rejects or cannot be reached.
    async fn push(&self, repo_url: &str, branch: &str) -> Result<()>;

    /// Open a pull request; returns its URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the VCS service rejects or cannot be reached.
    async fn open_pr(&self, repo_url: &str, request: &PrRequest) -> Result<String>;
}

/// HTTP client for a VCS automation service.
#[derive(Debug, Clone)]
pub struct HttpVcsClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpVcsClient {
    /// Create a client for the given service.
    ///
    /// # Panics
    ///
    /// Panics if the underlying HTTP client cannot be constructed.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            base_url: base_url.into(),
        }
    }

    async fn post_json<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R> {
        let url = format!("{}{path}", self.base_url);
        let response = self.client.post(&url).json(body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AdapterError::from_status(status.as_u16(), detail));
        }

        response
            .json()
            .await
            .map_err(|e| AdapterError::Malformed(e.to_string()))
    }
}

#[derive(Serialize)]
struct RepoRequest<'a> {
    repo_url: &'a str,
}

#[derive(Serialize)]
struct BranchRequest<'a> {
    repo_url: &'a str,
    branch: &'a str,
    base: &'a str,
}

#[derive(Serialize)]
struct CommitRequest<'a> {
    repo_url: &'a str,
    branch: &'a str,
    #[serde(flatten)]
    commit: &'a CommitSpec,
}

#[derive(Serialize)]
struct PushRequest<'a> {
    repo_url: &'a str,
    branch: &'a str,
}

#[derive(Serialize)]
struct OpenPrRequest<'a> {
    repo_url: &'a str,
    #[serde(flatten)]
    pr: &'a PrRequest,
}

#[derive(Deserialize)]
struct Ack {}

#[derive(Deserialize)]
struct CommitResponse {
    commit_id: String,
}

#[derive(Deserialize)]
struct PrResponse {
    url: String,
}

#[async_trait]
impl VcsClient for HttpVcsClient {
    async fn clone_repo(&self, repo_url: &str) -> Result<()> {
        let _: Ack = self
            .post_json("/v1/repos/clone", &RepoRequest { repo_url })
            .await?;
        Ok(())
    }

    async fn create_branch(&self, repo_url: &str, branch: &str, base: &str) -> Result<()> {
        let _: Ack = self
            .post_json(
                "/v1/repos/branch",
                &BranchRequest {
                    repo_url,
                    branch,
                    base,
                },
            )
            .await?;
        Ok(())
    }

    async fn commit(&self, repo_url: &str, branch: &str, commit: &CommitSpec) -> Result<String> {
        let response: CommitResponse = self
            .post_json(
                "/v1/repos/commit",
                &CommitRequest {
                    repo_url,
                    branch,
                    commit,
                },
            )
            .await?;
        Ok(response.commit_id)
    }

    async fn push(&self, repo_url: &str, branch: &str) -> Result<()> {
        let _: Ack = self
            .post_json("/v1/repos/push", &PushRequest { repo_url, branch })
            .await?;
        Ok(())
    }

    async fn open_pr(&self, repo_url: &str, request: &PrRequest) -> Result<String> {
        let response: PrResponse = self
            .post_json("/v1/repos/pr", &OpenPrRequest { repo_url, pr: request })
            .await?;

        tracing::info!(url = %response.url, head = %request.head, "Opened pull request");
        Ok(response.url)
    }
}

/// A recording VCS client for tests.
#[derive(Default)]
pub struct RecordingVcs {
    operations: Mutex<Vec<String>>,
    prs_opened: Mutex<u32>,
    fail_pr_opens: Mutex<u32>,
}

impl RecordingVcs {
    /// Create a new recording client.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` PR opens fail as unavailable.
    pub fn fail_next_pr_opens(&self, count: u32) {
        *self.fail_pr_opens.lock() = count;
    }

    /// Operations observed so far, e.g. `branch:swarm/t-1`.
    #[must_use]
    pub fn operations(&self) -> Vec<String> {
        self.operations.lock().clone()
    }
}

#[async_trait]
impl VcsClient for RecordingVcs {
    async fn clone_repo(&self, repo_url: &str) -> Result<()> {
        self.operations.lock().push(format!("clone:{repo_url}"));
        Ok(())
    }

    async fn create_branch(&self, _repo_url: &str, branch: &str, base: &str) -> Result<()> {
        self.operations
            .lock()
            .push(format!("branch:{branch}@{base}"));
        Ok(())
    }

    async fn commit(&self, _repo_url: &str, branch: &str, commit: &CommitSpec) -> Result<String> {
        self.operations
            .lock()
            .push(format!("commit:{branch}:{}", commit.files.len()));
        Ok("deadbeef".to_string())
    }

    async fn push(&self, _repo_url: &str, branch: &str) -> Result<()> {
        self.operations.lock().push(format!("push:{branch}"));
        Ok(())
    }

    async fn open_pr(&self, _repo_url: &str, request: &PrRequest) -> Result<String> {
        {
            let mut failures = self.fail_pr_opens.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(AdapterError::Unavailable("vcs rate limit".into()));
            }
        }
        let mut count = self.prs_opened.lock();
        *count += 1;
        self.operations.lock().push(format!("pr:{}", request.head));
        Ok(format!("https://git.example/pr/{count}"))
    }
}

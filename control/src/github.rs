//! Repository source backed by the GitHub REST API.

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::DeployError;
use crate::types::{Credential, RepositoryCoordinates, RepositoryRef};

/// Dockerfile locations checked on the requested branch, in order.
const DOCKERFILE_CANDIDATES: [&str; 3] = ["Dockerfile", "dockerfile", ".docker/Dockerfile"];

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("GitHub rejected the token: {0}")]
    Auth(String),

    #[error("{0}")]
    NotFound(String),

    #[error("GitHub unavailable: {0}")]
    Unavailable(String),

    #[error("unexpected GitHub response: {0}")]
    Unexpected(String),
}

impl From<SourceError> for DeployError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::Auth(msg) => {
                DeployError::GitHubAuth(format!("GitHub rejected the token: {}", msg))
            }
            SourceError::NotFound(msg) => DeployError::NotFound(msg),
            other => DeployError::Internal(anyhow::Error::new(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    pub id: i64,
    pub name: String,
    pub full_name: String,
    pub owner: String,
    pub private: bool,
    pub html_url: Option<String>,
    pub description: Option<String>,
    pub clone_url: Option<String>,
    pub language: Option<String>,
    pub default_branch: String,
    pub star_count: u32,
    pub fork_count: u32,
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Branch {
    pub name: String,
    pub protected: bool,
    pub commit_sha: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryPage {
    pub repositories: Vec<Repository>,
    pub page: u32,
    pub per_page: u32,
    pub has_more: bool,
}

/// Output of [`RepositorySource::resolve`].
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRepository {
    pub repository: RepositoryRef,
    /// First Dockerfile found on the branch, if any.
    pub dockerfile: Option<String>,
}

#[async_trait]
pub trait RepositorySource: Send + Sync {
    /// Check that the repository and branch exist and the credential can read
    /// them. An empty branch resolves to the repository's default branch.
    async fn resolve(
        &self,
        coords: &RepositoryCoordinates,
        credential: &Credential,
    ) -> Result<ResolvedRepository, SourceError>;

    async fn list_repositories(
        &self,
        credential: &Credential,
        page: u32,
        per_page: u32,
    ) -> Result<RepositoryPage, SourceError>;

    async fn repository(
        &self,
        credential: &Credential,
        owner: &str,
        name: &str,
    ) -> Result<Repository, SourceError>;

    async fn branches(
        &self,
        credential: &Credential,
        owner: &str,
        name: &str,
    ) -> Result<Vec<Branch>, SourceError>;

    async fn search(
        &self,
        credential: &Credential,
        query: &str,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<Repository>, SourceError>;
}

// Wire shapes of the GitHub API.

#[derive(Deserialize)]
struct ApiOwner {
    login: String,
}

#[derive(Deserialize)]
struct ApiRepository {
    id: i64,
    name: String,
    full_name: String,
    owner: ApiOwner,
    #[serde(default)]
    private: bool,
    html_url: Option<String>,
    description: Option<String>,
    clone_url: Option<String>,
    language: Option<String>,
    #[serde(default)]
    default_branch: String,
    #[serde(default)]
    stargazers_count: u32,
    #[serde(default)]
    forks_count: u32,
    updated_at: Option<String>,
}

impl From<ApiRepository> for Repository {
    fn from(r: ApiRepository) -> Self {
        Repository {
            id: r.id,
            name: r.name,
            full_name: r.full_name,
            owner: r.owner.login,
            private: r.private,
            html_url: r.html_url,
            description: r.description,
            clone_url: r.clone_url,
            language: r.language,
            default_branch: r.default_branch,
            star_count: r.stargazers_count,
            fork_count: r.forks_count,
            updated_at: r.updated_at,
        }
    }
}

#[derive(Deserialize)]
struct ApiCommitRef {
    sha: String,
}

#[derive(Deserialize)]
struct ApiBranch {
    name: String,
    #[serde(default)]
    protected: bool,
    commit: ApiCommitRef,
}

impl From<ApiBranch> for Branch {
    fn from(b: ApiBranch) -> Self {
        Branch {
            name: b.name,
            protected: b.protected,
            commit_sha: b.commit.sha,
        }
    }
}

#[derive(Deserialize)]
struct ApiSearch {
    items: Vec<ApiRepository>,
}

pub struct GitHubClient {
    base_url: Url,
    client: reqwest::Client,
}

impl GitHubClient {
    pub fn new(api_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        // Relative joins need the trailing slash on prefixed bases (GitHub Enterprise)
        let base_url = if api_url.ends_with('/') {
            Url::parse(api_url)
        } else {
            Url::parse(&format!("{}/", api_url))
        }
        .context("Invalid GitHub API URL")?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("node-deployer/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build GitHub HTTP client")?;
        Ok(Self { base_url, client })
    }

    fn classify(status: StatusCode, what: &str) -> SourceError {
        match status {
            StatusCode::UNAUTHORIZED => SourceError::Auth("invalid or expired token".to_string()),
            StatusCode::FORBIDDEN => SourceError::Auth(format!("token cannot read {}", what)),
            StatusCode::NOT_FOUND => SourceError::NotFound(format!("{} not found", what)),
            s if s == StatusCode::TOO_MANY_REQUESTS || s.is_server_error() => {
                SourceError::Unavailable(format!("{} returned {}", what, s))
            }
            s => SourceError::Unexpected(format!("{} returned {}", what, s)),
        }
    }

    async fn get_raw(
        &self,
        credential: &Credential,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<reqwest::Response, SourceError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| SourceError::Unexpected(format!("invalid path {}: {}", path, e)))?;
        debug!("GitHub GET {}", path);
        self.client
            .get(url)
            .query(query)
            .bearer_auth(credential.expose())
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| SourceError::Unavailable(e.to_string()))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        credential: &Credential,
        path: &str,
        query: &[(&str, String)],
        what: &str,
    ) -> Result<T, SourceError> {
        let resp = self.get_raw(credential, path, query).await?;
        if !resp.status().is_success() {
            return Err(Self::classify(resp.status(), what));
        }
        resp.json()
            .await
            .map_err(|e| SourceError::Unexpected(format!("{}: {}", what, e)))
    }

    async fn detect_dockerfile(
        &self,
        credential: &Credential,
        full_name: &str,
        branch: &str,
    ) -> Result<Option<String>, SourceError> {
        for candidate in DOCKERFILE_CANDIDATES {
            let path = format!("repos/{}/contents/{}", full_name, candidate);
            let resp = self
                .get_raw(credential, &path, &[("ref", branch.to_string())])
                .await?;
            match resp.status() {
                s if s.is_success() => return Ok(Some(candidate.to_string())),
                StatusCode::NOT_FOUND => continue,
                s => return Err(Self::classify(s, "repository contents")),
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl RepositorySource for GitHubClient {
    async fn resolve(
        &self,
        coords: &RepositoryCoordinates,
        credential: &Credential,
    ) -> Result<ResolvedRepository, SourceError> {
        let repo = self.repository(credential, &coords.owner, &coords.name).await?;
        let branch_name = if coords.branch.is_empty() {
            repo.default_branch.clone()
        } else {
            coords.branch.clone()
        };

        let branch: ApiBranch = self
            .get_json(
                credential,
                &format!("repos/{}/branches/{}", repo.full_name, branch_name),
                &[],
                &format!("branch {} of {}", branch_name, repo.full_name),
            )
            .await?;

        let dockerfile = self
            .detect_dockerfile(credential, &repo.full_name, &branch_name)
            .await?;

        Ok(ResolvedRepository {
            repository: RepositoryRef {
                owner: repo.owner,
                name: repo.name,
                full_name: repo.full_name,
                branch: branch.name,
                commit_sha: Some(branch.commit.sha),
                clone_url: repo.clone_url,
                private: repo.private,
            },
            dockerfile,
        })
    }

    async fn list_repositories(
        &self,
        credential: &Credential,
        page: u32,
        per_page: u32,
    ) -> Result<RepositoryPage, SourceError> {
        let page = page.max(1);
        let per_page = per_page.clamp(1, 100);
        let repos: Vec<ApiRepository> = self
            .get_json(
                credential,
                "user/repos",
                &[
                    ("sort", "updated".to_string()),
                    ("direction", "desc".to_string()),
                    ("page", page.to_string()),
                    ("per_page", per_page.to_string()),
                ],
                "repository list",
            )
            .await?;

        let has_more = repos.len() as u32 == per_page;
        Ok(RepositoryPage {
            repositories: repos.into_iter().map(Repository::from).collect(),
            page,
            per_page,
            has_more,
        })
    }

    async fn repository(
        &self,
        credential: &Credential,
        owner: &str,
        name: &str,
    ) -> Result<Repository, SourceError> {
        let repo: ApiRepository = self
            .get_json(
                credential,
                &format!("repos/{}/{}", owner, name),
                &[],
                &format!("repository {}/{}", owner, name),
            )
            .await?;
        Ok(repo.into())
    }

    async fn branches(
        &self,
        credential: &Credential,
        owner: &str,
        name: &str,
    ) -> Result<Vec<Branch>, SourceError> {
        let branches: Vec<ApiBranch> = self
            .get_json(
                credential,
                &format!("repos/{}/{}/branches", owner, name),
                &[("per_page", "100".to_string())],
                &format!("repository {}/{}", owner, name),
            )
            .await?;
        Ok(branches.into_iter().map(Branch::from).collect())
    }

    async fn search(
        &self,
        credential: &Credential,
        query: &str,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<Repository>, SourceError> {
        let result: ApiSearch = self
            .get_json(
                credential,
                "search/repositories",
                &[
                    ("q", query.to_string()),
                    ("page", page.max(1).to_string()),
                    ("per_page", per_page.clamp(1, 100).to_string()),
                ],
                "repository search",
            )
            .await?;
        Ok(result.items.into_iter().map(Repository::from).collect())
    }
}

/// Per-user GitHub tokens, held in memory only.
#[derive(Default)]
pub struct CredentialCache {
    tokens: RwLock<HashMap<String, Credential>>,
}

impl CredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn store(&self, user_id: &str, credential: Credential) {
        self.tokens
            .write()
            .await
            .insert(user_id.to_string(), credential);
    }

    pub async fn get(&self, user_id: &str) -> Option<Credential> {
        self.tokens.read().await.get(user_id).cloned()
    }

    pub async fn forget(&self, user_id: &str) {
        self.tokens.write().await.remove(user_id);
    }
}

/// Canned repository source for tests that do not exercise GitHub itself.
#[cfg(test)]
pub(crate) mod fake {
    use super::*;

    #[derive(Default)]
    pub(crate) struct StaticSource {
        /// Tokens `resolve` rejects.
        pub rejected_tokens: Vec<String>,
    }

    #[async_trait]
    impl RepositorySource for StaticSource {
        async fn resolve(
            &self,
            coords: &RepositoryCoordinates,
            credential: &Credential,
        ) -> Result<ResolvedRepository, SourceError> {
            if self.rejected_tokens.iter().any(|t| t == credential.expose()) {
                return Err(SourceError::Auth("invalid or expired token".to_string()));
            }
            if coords.name == "missing" {
                return Err(SourceError::NotFound(format!(
                    "repository {}/{} not found",
                    coords.owner, coords.name
                )));
            }
            let branch = if coords.branch.is_empty() {
                "main".to_string()
            } else {
                coords.branch.clone()
            };
            Ok(ResolvedRepository {
                repository: RepositoryRef {
                    owner: coords.owner.clone(),
                    name: coords.name.clone(),
                    full_name: format!("{}/{}", coords.owner, coords.name),
                    branch,
                    commit_sha: Some("0123abcd".to_string()),
                    clone_url: Some(format!(
                        "https://github.com/{}/{}.git",
                        coords.owner, coords.name
                    )),
                    private: false,
                },
                dockerfile: Some("Dockerfile".to_string()),
            })
        }

        async fn list_repositories(
            &self,
            _credential: &Credential,
            page: u32,
            per_page: u32,
        ) -> Result<RepositoryPage, SourceError> {
            Ok(RepositoryPage {
                repositories: Vec::new(),
                page,
                per_page,
                has_more: false,
            })
        }

        async fn repository(
            &self,
            _credential: &Credential,
            owner: &str,
            name: &str,
        ) -> Result<Repository, SourceError> {
            Err(SourceError::NotFound(format!("repository {}/{} not found", owner, name)))
        }

        async fn branches(
            &self,
            _credential: &Credential,
            _owner: &str,
            _name: &str,
        ) -> Result<Vec<Branch>, SourceError> {
            Ok(Vec::new())
        }

        async fn search(
            &self,
            _credential: &Credential,
            _query: &str,
            _page: u32,
            _per_page: u32,
        ) -> Result<Vec<Repository>, SourceError> {
            Ok(Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::{
        matchers::{header, method, path, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    fn repo_json() -> serde_json::Value {
        json!({
            "id": 42,
            "name": "demo",
            "full_name": "acme/demo",
            "owner": { "login": "acme" },
            "private": true,
            "clone_url": "https://github.com/acme/demo.git",
            "default_branch": "main",
        })
    }

    fn client(server: &MockServer) -> GitHubClient {
        GitHubClient::new(&format!("{}/", server.uri()), Duration::from_secs(5)).unwrap()
    }

    fn coords(branch: &str) -> RepositoryCoordinates {
        RepositoryCoordinates {
            owner: "acme".to_string(),
            name: "demo".to_string(),
            branch: branch.to_string(),
        }
    }

    #[tokio::test]
    async fn test_resolve_default_branch_and_dockerfile() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/demo"))
            .and(header("authorization", "Bearer gh-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(repo_json()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/demo/branches/main"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "main", "protected": false, "commit": { "sha": "abc123" }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/demo/contents/Dockerfile"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/demo/contents/dockerfile"))
            .and(query_param("ref", "main"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let resolved = client(&server)
            .resolve(&coords(""), &Credential::new("gh-token"))
            .await
            .unwrap();
        assert_eq!(resolved.repository.full_name, "acme/demo");
        assert_eq!(resolved.repository.branch, "main");
        assert_eq!(resolved.repository.commit_sha.as_deref(), Some("abc123"));
        assert!(resolved.repository.private);
        assert_eq!(resolved.dockerfile.as_deref(), Some("dockerfile"));
    }

    #[tokio::test]
    async fn test_bad_token_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = client(&server)
            .resolve(&coords("main"), &Credential::new("expired"))
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Auth(_)));
        assert!(matches!(DeployError::from(err), DeployError::GitHubAuth(_)));
    }

    #[tokio::test]
    async fn test_missing_branch_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/demo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(repo_json()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/demo/branches/nope"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = client(&server)
            .resolve(&coords("nope"), &Credential::new("gh-token"))
            .await
            .unwrap_err();
        match err {
            SourceError::NotFound(msg) => assert!(msg.contains("branch nope")),
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_list_repositories_paging() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/user/repos"))
            .and(query_param("per_page", "1"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([repo_json()])))
            .mount(&server)
            .await;

        let page = client(&server)
            .list_repositories(&Credential::new("gh-token"), 2, 1)
            .await
            .unwrap();
        assert_eq!(page.repositories.len(), 1);
        assert_eq!(page.repositories[0].owner, "acme");
        assert!(page.has_more);
    }

    #[tokio::test]
    async fn test_credential_cache() {
        let cache = CredentialCache::new();
        cache.store("u1", Credential::new("t1")).await;
        assert_eq!(cache.get("u1").await, Some(Credential::new("t1")));
        cache.forget("u1").await;
        assert_eq!(cache.get("u1").await, None);
    }
}

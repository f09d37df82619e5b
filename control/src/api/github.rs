use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    Extension, Json,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use super::auth::CurrentUser;
use super::error::{json_body, query_params, ApiResult};
use super::AppState;
use crate::error::DeployError;
use crate::github::{Branch, Repository, RepositoryPage};
use crate::types::{Credential, GitHubTokenRequest, User};

pub const GITHUB_TOKEN_HEADER: &str = "x-github-token";

const DEFAULT_PER_PAGE: u32 = 30;
const MAX_PER_PAGE: u32 = 100;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageQuery {
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

impl PageQuery {
    fn resolve(&self) -> (u32, u32) {
        let page = self.page.unwrap_or(1).max(1);
        let per_page = self
            .per_page
            .unwrap_or(DEFAULT_PER_PAGE)
            .clamp(1, MAX_PER_PAGE);
        (page, per_page)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchQuery {
    pub q: Option<String>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

/// GitHub credential for this request: the header first, then the user's
/// cached token.
pub async fn optional_credential(
    state: &AppState,
    headers: &HeaderMap,
    user: &User,
) -> Option<Credential> {
    let from_header = headers
        .get(GITHUB_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(Credential::new);
    match from_header {
        Some(credential) => Some(credential),
        None => state.credentials.get(&user.id).await,
    }
}

pub async fn require_credential(
    state: &AppState,
    headers: &HeaderMap,
    user: &User,
) -> ApiResult<Credential> {
    optional_credential(state, headers, user)
        .await
        .ok_or_else(|| DeployError::GitHubAuth("GitHub token required".to_string()).into())
}

/// GET /api/v1/github/repos?page=&perPage=
pub async fn list_repositories(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    headers: HeaderMap,
    query: Result<Query<PageQuery>, QueryRejection>,
) -> ApiResult<Json<RepositoryPage>> {
    let (page, per_page) = query_params(query)?.resolve();
    let credential = require_credential(&state, &headers, &user).await?;
    let repos = state
        .source
        .list_repositories(&credential, page, per_page)
        .await?;
    Ok(Json(repos))
}

/// GET /api/v1/github/repos/:owner/:repo
pub async fn get_repository(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    headers: HeaderMap,
    Path((owner, repo)): Path<(String, String)>,
) -> ApiResult<Json<Repository>> {
    let credential = require_credential(&state, &headers, &user).await?;
    Ok(Json(state.source.repository(&credential, &owner, &repo).await?))
}

/// GET /api/v1/github/repos/:owner/:repo/branches
pub async fn list_branches(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    headers: HeaderMap,
    Path((owner, repo)): Path<(String, String)>,
) -> ApiResult<Json<Vec<Branch>>> {
    let credential = require_credential(&state, &headers, &user).await?;
    Ok(Json(state.source.branches(&credential, &owner, &repo).await?))
}

/// GET /api/v1/github/search?q=
pub async fn search_repositories(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    headers: HeaderMap,
    query: Result<Query<SearchQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<Repository>>> {
    let query = query_params(query)?;
    let q = query
        .q
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .ok_or_else(|| DeployError::validation("q", "search query is required"))?
        .to_string();
    let (page, per_page) = PageQuery {
        page: query.page,
        per_page: query.per_page,
    }
    .resolve();
    let credential = require_credential(&state, &headers, &user).await?;
    Ok(Json(
        state.source.search(&credential, &q, page, per_page).await?,
    ))
}

/// POST /api/v1/github/token - Keep the caller's GitHub token in memory
pub async fn store_token(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    payload: Result<Json<GitHubTokenRequest>, JsonRejection>,
) -> ApiResult<StatusCode> {
    let req = json_body(payload)?;
    let token = req.token.trim();
    if token.is_empty() {
        return Err(DeployError::validation("token", "must not be empty").into());
    }
    state
        .credentials
        .store(&user.id, Credential::new(token))
        .await;
    info!(user = %user.username, "GitHub token cached");
    Ok(StatusCode::NO_CONTENT)
}

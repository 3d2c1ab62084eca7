//! GitHub REST client authenticated as a GitHub App.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use axum::http;
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::header::HeaderMap;
use reqwest::{Client, Request, Response, StatusCode, Url};
use reqwest_middleware::{ClientWithMiddleware, Middleware, Next, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use keeper_core::effect::Reaction;
use keeper_core::report::ReviewComment;
use keeper_core::snapshot::{
    AuthorAssociation, CheckStatus, FileChange, FileStatus, PrState, PullRequestDetails, ReviewSignal,
    ReviewState,
};
use keeper_core::RepoRef;

use crate::api::{ApiError, RepositoryApi};
use crate::retry::RateBudget;

const GITHUB_API: &str = "https://api.github.com";
const ACCEPT: &str = "application/vnd.github+json";
const PER_PAGE: usize = 100;

#[derive(Clone)]
pub struct GitHubClient {
    client: ClientWithMiddleware,
    app_id: u64,
    private_key: String,
    token_cache: Arc<RwLock<HashMap<u64, (String, SystemTime)>>>,
}

#[derive(Debug, Serialize)]
struct GitHubAppClaims {
    iss: u64,
    iat: u64,
    exp: u64,
}

#[derive(Debug, Deserialize)]
struct InstallationTokenResponse {
    token: String,
    expires_at: String,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    login: String,
    #[serde(rename = "type", default)]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct LabelResponse {
    name: String,
}

#[derive(Debug, Deserialize)]
struct HeadResponse {
    sha: String,
}

#[derive(Debug, Deserialize)]
pub struct PullResponse {
    number: u64,
    user: UserResponse,
    author_association: AuthorAssociation,
    #[serde(default)]
    draft: bool,
    body: Option<String>,
    #[serde(default)]
    labels: Vec<LabelResponse>,
    mergeable: Option<bool>,
    head: HeadResponse,
    state: String,
    #[serde(default)]
    merged: bool,
}

impl From<PullResponse> for PullRequestDetails {
    fn from(pull: PullResponse) -> Self {
        PullRequestDetails {
            number: pull.number,
            is_bot: pull.user.kind.eq_ignore_ascii_case("bot"),
            author: pull.user.login,
            author_association: pull.author_association,
            is_draft: pull.draft,
            description: pull.body.unwrap_or_default(),
            labels: pull.labels.into_iter().map(|label| label.name).collect(),
            mergeable: pull.mergeable,
            head_sha: pull.head.sha,
            state: if pull.state == "open" {
                PrState::Open
            } else {
                PrState::Closed
            },
            merged: pull.merged,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PullFileResponse {
    filename: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct ContentsResponse {
    content: String,
    #[serde(default)]
    encoding: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    number: u64,
}

#[derive(Debug, Deserialize)]
struct CheckRunsResponse {
    check_runs: Vec<CheckRunResponse>,
}

#[derive(Debug, Deserialize)]
pub struct CheckRunResponse {
    pub status: String,
    pub conclusion: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReviewResponse {
    pub state: String,
    pub author_association: AuthorAssociation,
    pub commit_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IssueResponse {
    number: u64,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    message: String,
}

/// Draws one request from the shared [`RateBudget`] before every call.
pub struct BudgetMiddleware {
    budget: Arc<RateBudget>,
}

impl BudgetMiddleware {
    pub fn new(budget: Arc<RateBudget>) -> Self {
        Self { budget }
    }
}

#[async_trait]
impl Middleware for BudgetMiddleware {
    async fn handle(
        &self,
        req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        self.budget.acquire().await;
        next.run(req, extensions).await
    }
}

pub fn create_github_client(budget: Arc<RateBudget>) -> Result<ClientWithMiddleware, ApiError> {
    let client = Client::builder()
        .user_agent(format!("algorithms-keeper/{}", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| ApiError::Unexpected(format!("failed to create HTTP client: {e}")))?;

    Ok(reqwest_middleware::ClientBuilder::new(client)
        .with(BudgetMiddleware::new(budget))
        .build())
}

impl GitHubClient {
    pub fn new(app_id: u64, private_key: String, budget: Arc<RateBudget>) -> Result<Self, ApiError> {
        Ok(Self {
            client: create_github_client(budget)?,
            app_id,
            private_key,
            token_cache: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    fn generate_jwt(&self) -> Result<String, ApiError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| ApiError::Unexpected(format!("system clock before epoch: {e}")))?
            .as_secs();

        let claims = GitHubAppClaims {
            iss: self.app_id,
            iat: now - 60,  // Issued 60 seconds ago to account for clock skew
            exp: now + 600, // Expires in 10 minutes
        };

        let encoding_key = EncodingKey::from_rsa_pem(self.private_key.as_bytes())
            .map_err(|e| ApiError::Unexpected(format!("failed to parse private key: {e}")))?;
        encode(&Header::new(Algorithm::RS256), &claims, &encoding_key)
            .map_err(|e| ApiError::Unexpected(format!("failed to encode JWT: {e}")))
    }

    async fn get_installation_token(&self, installation_id: u64) -> Result<String, ApiError> {
        // Reuse the cached token until five minutes before it expires
        {
            let cache = self.token_cache.read().await;
            if let Some((token, expires_at)) = cache.get(&installation_id) {
                if expires_at
                    .duration_since(SystemTime::now())
                    .unwrap_or_default()
                    .as_secs()
                    > 300
                {
                    return Ok(token.clone());
                }
            }
        }

        let jwt = self.generate_jwt()?;
        let url = format!("{GITHUB_API}/app/installations/{installation_id}/access_tokens");

        info!("Requesting new installation access token for {}", installation_id);

        let request = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", jwt))
            .header("Accept", ACCEPT);
        let token_response: InstallationTokenResponse = read_json(send(request).await?).await?;

        let expires_at = DateTime::parse_from_rfc3339(&token_response.expires_at)
            .map_err(|e| ApiError::Unexpected(format!("bad token expiry: {e}")))?
            .with_timezone(&Utc);
        let expires_at_system = UNIX_EPOCH + Duration::from_secs(expires_at.timestamp().max(0) as u64);

        self.token_cache
            .write()
            .await
            .insert(installation_id, (token_response.token.clone(), expires_at_system));

        info!("Obtained installation access token for {}", installation_id);
        Ok(token_response.token)
    }

    async fn authorized(&self, repo: &RepoRef, request: RequestBuilder) -> Result<RequestBuilder, ApiError> {
        let token = self.get_installation_token(repo.installation_id).await?;
        Ok(request
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", ACCEPT))
    }

    async fn get_json<T: DeserializeOwned>(&self, repo: &RepoRef, url: &str) -> Result<T, ApiError> {
        let request = self.authorized(repo, self.client.get(url)).await?;
        read_json(send(request).await?).await
    }

    /// Follow `page=` until a short page comes back.
    async fn get_paginated<T: DeserializeOwned>(&self, repo: &RepoRef, url: &str) -> Result<Vec<T>, ApiError> {
        let mut items = Vec::new();
        for page in 1.. {
            let request = self
                .authorized(repo, self.client.get(url))
                .await?
                .query(&[("per_page", PER_PAGE.to_string()), ("page", page.to_string())]);
            let batch: Vec<T> = read_json(send(request).await?).await?;
            let done = batch.len() < PER_PAGE;
            items.extend(batch);
            if done {
                break;
            }
        }
        Ok(items)
    }

    async fn send_json(
        &self,
        repo: &RepoRef,
        request: RequestBuilder,
        body: serde_json::Value,
    ) -> Result<Response, ApiError> {
        let request = self
            .authorized(repo, request)
            .await?
            .header("Content-Type", "application/json")
            .body(body.to_string());
        send(request).await
    }

    async fn search_issues(&self, repo: &RepoRef, query: &str) -> Result<Vec<u64>, ApiError> {
        let request = self
            .authorized(repo, self.client.get(format!("{GITHUB_API}/search/issues")))
            .await?
            .query(&[("q", query), ("per_page", "100")]);
        let response: SearchResponse = read_json(send(request).await?).await?;
        Ok(response.items.into_iter().map(|item| item.number).collect())
    }
}

fn repo_url(repo: &RepoRef) -> String {
    format!("{GITHUB_API}/repos/{}/{}", repo.owner, repo.name)
}

async fn send(request: RequestBuilder) -> Result<Response, ApiError> {
    let response = request.send().await.map_err(|e| {
        debug!("GitHub request failed: {}", e);
        ApiError::Transient(e.to_string())
    })?;
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status();
    let headers = response.headers().clone();
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorResponse>(&text)
        .map(|error| error.message)
        .unwrap_or(text);
    let error = classify_response(status, &headers, message, Utc::now());
    if !error.is_not_found() {
        error!("GitHub API error: {} - {}", status, error);
    }
    Err(error)
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    response
        .json()
        .await
        .map_err(|e| ApiError::Unexpected(format!("failed to parse response: {e}")))
}

/// Map a failed response onto the error kinds the retry layer understands.
pub fn classify_response(status: StatusCode, headers: &HeaderMap, message: String, now: DateTime<Utc>) -> ApiError {
    match status.as_u16() {
        404 | 410 => ApiError::NotFound(message),
        code @ (403 | 429) => match rate_limit_reset(headers, now) {
            Some(reset_at) => ApiError::RateLimited { reset_at },
            None if code == 429 => ApiError::RateLimited {
                reset_at: now + chrono::Duration::seconds(60),
            },
            None => ApiError::Rejected {
                status: code,
                message,
            },
        },
        408 => ApiError::Transient(message),
        code if code >= 500 => ApiError::Transient(message),
        code => ApiError::Rejected {
            status: code,
            message,
        },
    }
}

fn header_number(headers: &HeaderMap, name: &str) -> Option<i64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

/// When a rate-limited request may be retried, from `retry-after` or the
/// primary rate-limit headers.
fn rate_limit_reset(headers: &HeaderMap, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if let Some(seconds) = header_number(headers, "retry-after") {
        return Some(now + chrono::Duration::seconds(seconds.max(0)));
    }
    if header_number(headers, "x-ratelimit-remaining") != Some(0) {
        return None;
    }
    Some(
        header_number(headers, "x-ratelimit-reset")
            .and_then(|reset| DateTime::from_timestamp(reset, 0))
            .unwrap_or_else(|| now + chrono::Duration::seconds(60)),
    )
}

/// Pending until every run completed; failing when any run failed, timed out
/// or finished without a conclusion.
pub fn aggregate_check_runs(runs: &[CheckRunResponse]) -> CheckStatus {
    if runs.is_empty() || runs.iter().any(|run| run.status != "completed") {
        return CheckStatus::Pending;
    }
    let failed = runs.iter().any(|run| {
        matches!(
            run.conclusion.as_deref(),
            None | Some("failure") | Some("timed_out")
        )
    });
    if failed {
        CheckStatus::Failing
    } else {
        CheckStatus::Passing
    }
}

/// The last approval or change request by a member or owner.
pub fn latest_review_signal(reviews: &[ReviewResponse], head_sha: &str) -> ReviewSignal {
    reviews
        .iter()
        .filter(|review| review.author_association.is_member_or_owner())
        .filter_map(|review| {
            let state = match review.state.as_str() {
                "APPROVED" => ReviewState::Approved,
                "CHANGES_REQUESTED" => ReviewState::ChangesRequested,
                _ => return None,
            };
            Some((state, review.commit_id.as_deref()))
        })
        .last()
        .map_or_else(ReviewSignal::default, |(state, commit)| {
            ReviewSignal::new(state, commit.is_some_and(|commit| commit != head_sha))
        })
}

/// The contents API returns base64 with embedded newlines.
pub fn decode_content(content: &str, encoding: &str) -> Result<String, ApiError> {
    if !encoding.is_empty() && encoding != "base64" {
        return Err(ApiError::Unexpected(format!("unsupported encoding {encoding}")));
    }
    let compact: String = content.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = general_purpose::STANDARD
        .decode(compact)
        .map_err(|e| ApiError::Unexpected(format!("invalid base64 content: {e}")))?;
    String::from_utf8(bytes).map_err(|e| ApiError::Unexpected(format!("file is not UTF-8: {e}")))
}

#[async_trait]
impl RepositoryApi for GitHubClient {
    async fn get_pull_request(&self, repo: &RepoRef, number: u64) -> Result<PullRequestDetails, ApiError> {
        let url = format!("{}/pulls/{}", repo_url(repo), number);
        let pull: PullResponse = self.get_json(repo, &url).await?;
        Ok(pull.into())
    }

    async fn list_changed_files(&self, repo: &RepoRef, number: u64) -> Result<Vec<FileChange>, ApiError> {
        let url = format!("{}/pulls/{}/files", repo_url(repo), number);
        let files: Vec<PullFileResponse> = self.get_paginated(repo, &url).await?;
        Ok(files
            .into_iter()
            .map(|file| FileChange::new(file.filename, FileStatus::from_github(&file.status)))
            .collect())
    }

    async fn get_file_content(&self, repo: &RepoRef, path: &str, git_ref: &str) -> Result<String, ApiError> {
        let mut url = Url::parse(&format!("{}/contents", repo_url(repo)))
            .map_err(|e| ApiError::Unexpected(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| ApiError::Unexpected("cannot extend contents URL".to_string()))?
            .extend(path.split('/'));
        url.query_pairs_mut().append_pair("ref", git_ref);
        let contents: ContentsResponse = self.get_json(repo, url.as_str()).await?;
        decode_content(&contents.content, &contents.encoding)
    }

    async fn list_labels(&self, repo: &RepoRef, number: u64) -> Result<BTreeSet<String>, ApiError> {
        let url = format!("{}/issues/{}/labels", repo_url(repo), number);
        let labels: Vec<LabelResponse> = self.get_paginated(repo, &url).await?;
        Ok(labels.into_iter().map(|label| label.name).collect())
    }

    async fn add_labels(&self, repo: &RepoRef, number: u64, labels: &BTreeSet<String>) -> Result<(), ApiError> {
        info!("Adding {:?} to {}#{}", labels, repo, number);
        let url = format!("{}/issues/{}/labels", repo_url(repo), number);
        self.send_json(repo, self.client.post(url), json!({ "labels": labels }))
            .await
            .map(drop)
    }

    async fn remove_label(&self, repo: &RepoRef, number: u64, label: &str) -> Result<(), ApiError> {
        info!("Removing {:?} from {}#{}", label, repo, number);
        let mut url = Url::parse(&format!("{}/issues/{}/labels", repo_url(repo), number))
            .map_err(|e| ApiError::Unexpected(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| ApiError::Unexpected("cannot extend labels URL".to_string()))?
            .push(label);
        let request = self.authorized(repo, self.client.delete(url)).await?;
        send(request).await.map(drop)
    }

    async fn create_comment(&self, repo: &RepoRef, number: u64, body: &str) -> Result<(), ApiError> {
        info!("Commenting on {}#{}", repo, number);
        let url = format!("{}/issues/{}/comments", repo_url(repo), number);
        self.send_json(repo, self.client.post(url), json!({ "body": body }))
            .await
            .map(drop)
    }

    async fn close(&self, repo: &RepoRef, number: u64) -> Result<(), ApiError> {
        info!("Closing {}#{}", repo, number);
        let url = format!("{}/issues/{}", repo_url(repo), number);
        self.send_json(repo, self.client.patch(url), json!({ "state": "closed" }))
            .await
            .map(drop)
    }

    async fn list_open_pulls(&self, repo: &RepoRef, author: &str) -> Result<Vec<u64>, ApiError> {
        let query = format!("type:pr state:open repo:{}/{} author:{}", repo.owner, repo.name, author);
        self.search_issues(repo, &query).await
    }

    async fn get_check_run_status(&self, repo: &RepoRef, head_sha: &str) -> Result<CheckStatus, ApiError> {
        let url = format!(
            "{}/commits/{}/check-runs?per_page={}",
            repo_url(repo),
            head_sha,
            PER_PAGE
        );
        let response: CheckRunsResponse = self.get_json(repo, &url).await?;
        Ok(aggregate_check_runs(&response.check_runs))
    }

    async fn get_review_state(
        &self,
        repo: &RepoRef,
        number: u64,
        head_sha: &str,
    ) -> Result<ReviewSignal, ApiError> {
        let url = format!("{}/pulls/{}/reviews", repo_url(repo), number);
        let reviews: Vec<ReviewResponse> = self.get_paginated(repo, &url).await?;
        Ok(latest_review_signal(&reviews, head_sha))
    }

    async fn create_review(
        &self,
        repo: &RepoRef,
        number: u64,
        commit_sha: &str,
        body: &str,
        comments: &[ReviewComment],
    ) -> Result<(), ApiError> {
        info!(
            "Posting review with {} comment(s) on {}#{}",
            comments.len(),
            repo,
            number
        );
        let url = format!("{}/pulls/{}/reviews", repo_url(repo), number);
        let comments: Vec<serde_json::Value> = comments
            .iter()
            .map(|comment| {
                json!({
                    "path": comment.path,
                    "line": comment.line,
                    "side": "RIGHT",
                    "body": comment.body,
                })
            })
            .collect();
        let payload = json!({
            "commit_id": commit_sha,
            "body": body,
            "event": "COMMENT",
            "comments": comments,
        });
        self.send_json(repo, self.client.post(url), payload)
            .await
            .map(drop)
    }

    async fn add_reaction(&self, repo: &RepoRef, comment_id: u64, reaction: Reaction) -> Result<(), ApiError> {
        let url = format!("{}/issues/comments/{}/reactions", repo_url(repo), comment_id);
        self.send_json(
            repo,
            self.client.post(url),
            json!({ "content": reaction.as_github() }),
        )
        .await
        .map(drop)
    }

    async fn create_issue(&self, repo: &RepoRef, title: &str, body: &str) -> Result<u64, ApiError> {
        info!("Opening issue {:?} in {}", title, repo);
        let url = format!("{}/issues", repo_url(repo));
        let response = self
            .send_json(repo, self.client.post(url), json!({ "title": title, "body": body }))
            .await?;
        let issue: IssueResponse = read_json(response).await?;
        Ok(issue.number)
    }

    async fn find_pull_for_commit(&self, repo: &RepoRef, sha: &str) -> Result<Option<u64>, ApiError> {
        let query = format!("type:pr state:open repo:{}/{} sha:{}", repo.owner, repo.name, sha);
        Ok(self.search_issues(repo, &query).await?.into_iter().next())
    }
}

use axum::{
    body::Bytes,
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{Json, Response},
    routing::post,
    Router,
};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use keeper_core::event::CommentEvent;
use keeper_core::snapshot::{AuthorAssociation, IssueSnapshot};
use keeper_core::{EventEnvelope, EventKind, Payload, RepoRef};

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct GitHubWebhookPayload {
    pub action: Option<String>,
    pub repository: Option<Repository>,
    pub installation: Option<Installation>,
    pub sender: Option<User>,
    pub pull_request: Option<PullRequest>,
    pub issue: Option<Issue>,
    pub comment: Option<Comment>,
    pub check_run: Option<CheckRun>,
    /// Repositories granted by an `installation.created` event.
    pub repositories: Option<Vec<InstalledRepository>>,
    /// Repositories granted by an `installation_repositories.added` event.
    pub repositories_added: Option<Vec<InstalledRepository>>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Repository {
    pub name: String,
    pub owner: User,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InstalledRepository {
    pub full_name: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Installation {
    pub id: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct User {
    pub login: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

impl User {
    fn is_bot(&self) -> bool {
        self.kind.eq_ignore_ascii_case("bot")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PullRequest {
    pub number: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Issue {
    pub number: u64,
    pub user: User,
    pub body: Option<String>,
    pub state: String,
    pub pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Comment {
    pub id: u64,
    pub body: String,
    pub user: User,
    pub author_association: AuthorAssociation,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CheckRun {
    pub head_sha: String,
    #[serde(default)]
    pub pull_requests: Vec<PullRequest>,
}

#[derive(Serialize)]
pub struct WebhookResponse {
    pub message: String,
}

impl GitHubWebhookPayload {
    /// Normalize a delivery into the envelope the dispatcher routes on.
    /// Payloads missing the object their event kind needs become
    /// [`Payload::Empty`].
    pub fn into_envelope(self, kind: EventKind, delivery_id: String) -> EventEnvelope {
        let installation_id = self.installation.as_ref().map_or(0, |installation| installation.id);
        let repository = self
            .repository
            .as_ref()
            .map(|repo| RepoRef::new(installation_id, &repo.owner.login, &repo.name));
        let sender_is_bot = self.sender.as_ref().is_some_and(User::is_bot);

        let payload = match kind {
            EventKind::PullRequest => self.pull_request.map(|pr| Payload::PullRequest {
                number: pr.number,
                sender_is_bot,
            }),
            EventKind::PullRequestReview => self
                .pull_request
                .map(|pr| Payload::Review { number: pr.number }),
            EventKind::Issues => self.issue.map(|issue| {
                Payload::Issue(IssueSnapshot {
                    number: issue.number,
                    author: issue.user.login,
                    body: issue.body.unwrap_or_default(),
                })
            }),
            EventKind::IssueComment => match (self.issue, self.comment) {
                (Some(issue), Some(comment)) => Some(Payload::Comment(CommentEvent {
                    issue_number: issue.number,
                    is_pull_request: issue.pull_request.is_some(),
                    issue_open: issue.state == "open",
                    comment_id: comment.id,
                    body: comment.body,
                    author: comment.user.login,
                    author_association: comment.author_association,
                })),
                _ => None,
            },
            EventKind::CheckRun => self.check_run.map(|run| Payload::CheckRun {
                head_sha: run.head_sha,
                pull_numbers: run.pull_requests.into_iter().map(|pr| pr.number).collect(),
            }),
            EventKind::Installation | EventKind::InstallationRepositories => {
                let granted = self.repositories_added.or(self.repositories).unwrap_or_default();
                let repositories = granted
                    .iter()
                    .filter_map(|repo| {
                        let (owner, name) = repo.full_name.split_once('/')?;
                        Some(RepoRef::new(installation_id, owner, name))
                    })
                    .collect();
                Some(Payload::Installation { repositories })
            }
            EventKind::Ping | EventKind::Other => None,
        };

        EventEnvelope {
            kind,
            action: self.action.unwrap_or_default(),
            delivery_id,
            repository,
            payload: payload.unwrap_or(Payload::Empty),
        }
    }
}

type HmacSha256 = Hmac<Sha256>;

fn verify_github_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    let Some(signature_hex) = signature.strip_prefix("sha256=") else {
        return false;
    };

    let signature_bytes = match hex::decode(signature_hex) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };

    mac.update(payload);

    // Use constant-time verification
    mac.verify_slice(&signature_bytes).is_ok()
}

async fn verify_webhook_signature(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    let signature = parts
        .headers
        .get("x-hub-signature-256")
        .and_then(|h| h.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    if !verify_github_signature(&state.webhook_secret, &bytes, signature) {
        error!("Invalid webhook signature");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let request = Request::from_parts(parts, axum::body::Body::from(bytes));
    Ok(next.run(request).await)
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

pub async fn github_webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, StatusCode> {
    let event_name = header(&headers, "x-github-event").ok_or(StatusCode::BAD_REQUEST)?;
    let delivery_id = header(&headers, "x-github-delivery")
        .map(str::to_string)
        .unwrap_or_else(|| {
            warn!("Webhook without a delivery id");
            Uuid::new_v4().to_string()
        });

    let kind = EventKind::from_header(event_name);
    if kind == EventKind::Ping {
        info!("Received ping");
        return Ok(Json(WebhookResponse {
            message: "pong".to_string(),
        }));
    }

    let payload: GitHubWebhookPayload = serde_json::from_slice(&body).map_err(|e| {
        warn!("Unparseable {} payload: {}", event_name, e);
        StatusCode::BAD_REQUEST
    })?;
    let envelope = payload.into_envelope(kind, delivery_id);
    info!("Received {} ({})", envelope.log_summary(), envelope.delivery_id);

    let dispatcher = state.dispatcher.clone();
    tokio::spawn(async move {
        let outcome = dispatcher.dispatch(envelope).await;
        debug!("Dispatch finished: {:?}", outcome);
    });

    Ok(Json(WebhookResponse {
        message: "Event accepted".to_string(),
    }))
}

pub fn webhook_router(middleware_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/webhook", post(github_webhook_handler))
        .route_layer(middleware::from_fn_with_state(
            middleware_state,
            verify_webhook_signature,
        ))
}

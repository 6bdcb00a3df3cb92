//! Rate-limited Slack Web API client with bot-token failover.
//!
//! Every call rotates through a candidate token list (the bot pool plus the
//! supplied token, or the user's token alone for personal tokens) across a
//! bounded number of retry rounds. Rate limits rotate to the next token
//! immediately and only sleep once the whole rotation is exhausted; revoked
//! credentials fail the call immediately.

use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Prefix of short-lived personal user tokens. A personal token is never
/// substituted with a bot token: the caller asked for that user's view.
const USER_TOKEN_PREFIX: &str = "xoxp-";

/// Delay between conversation-listing pages.
const PAGE_DELAY_MS: u64 = 500;

#[derive(Debug, Error)]
pub enum SlackApiError {
    /// The credential is revoked, inactive, or otherwise permanently bad.
    /// Never retried; callers discard the job this credential belongs to.
    #[error("credential invalid: {0}")]
    CredentialInvalid(String),
    #[error("no valid credentials remaining")]
    NoValidCredentials,
    #[error("max retries exceeded on {0}")]
    MaxRetriesExceeded(String),
}

impl SlackApiError {
    pub fn is_credential_fatal(&self) -> bool {
        matches!(self, SlackApiError::CredentialInvalid(_))
    }
}

/// Fixed ordered pool of long-lived bot tokens, shared read-only by every
/// concurrent caller.
#[derive(Debug, Clone, Default)]
pub struct TokenPool {
    tokens: Vec<String>,
}

impl TokenPool {
    /// Comma-separated tokens from SLACK_BOT_TOKENS.
    pub fn from_env() -> Self {
        let tokens = std::env::var("SLACK_BOT_TOKENS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Self { tokens }
    }

    pub fn new(tokens: Vec<String>) -> Self {
        Self { tokens }
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn first(&self) -> Option<&str> {
        self.tokens.first().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

pub struct SlackApi {
    client: reqwest::Client,
    base_url: String,
    pool: TokenPool,
    retry_rounds: usize,
}

impl SlackApi {
    pub fn new(base_url: impl Into<String>, pool: TokenPool, retry_rounds: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            pool,
            retry_rounds,
        }
    }

    pub fn pool(&self) -> &TokenPool {
        &self.pool
    }

    fn candidate_tokens(&self, initial: &str) -> Vec<String> {
        if initial.starts_with(USER_TOKEN_PREFIX) {
            return vec![initial.to_string()];
        }
        let mut out: Vec<String> = Vec::new();
        for t in self.pool.tokens.iter().map(String::as_str).chain([initial]) {
            if !t.is_empty() && !out.iter().any(|x| x == t) {
                out.push(t.to_string());
            }
        }
        out
    }

    /// Issue one logical API call with retry, token rotation, and backoff.
    /// Returns the raw `ok: true` payload; typed wrappers validate it.
    pub async fn call(
        &self,
        endpoint: &str,
        token: &str,
        params: &[(&str, &str)],
    ) -> Result<Value, SlackApiError> {
        let mut candidates = self.candidate_tokens(token);
        if candidates.is_empty() {
            return Err(SlackApiError::NoValidCredentials);
        }
        let url = format!("{}/{}", self.base_url, endpoint);

        for round in 0..self.retry_rounds {
            let mut i = 0;
            while i < candidates.len() {
                let tok = candidates[i].clone();
                let last = i + 1 == candidates.len();

                let resp = match self
                    .client
                    .get(&url)
                    .query(params)
                    .bearer_auth(&tok)
                    .send()
                    .await
                {
                    Ok(r) => r,
                    Err(e) => {
                        log::warn!("[SLACK_API] Request error on {}: {}", endpoint, e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        i += 1;
                        continue;
                    }
                };

                let retry_after = resp
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(1);
                let http_rate_limited = resp.status().as_u16() == 429;

                let body: Value = match resp.json().await {
                    Ok(v) => v,
                    Err(_) if http_rate_limited => Value::Null,
                    Err(e) => {
                        log::warn!("[SLACK_API] Invalid response on {}: {}", endpoint, e);
                        i += 1;
                        continue;
                    }
                };

                if body.get("ok").and_then(Value::as_bool).unwrap_or(false) {
                    return Ok(body);
                }

                let err = body
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown_error");

                if http_rate_limited || err == "ratelimited" {
                    if last {
                        log::warn!(
                            "[SLACK_API] Rate limited on {} with all tokens, retrying after {}s (round {}/{})",
                            endpoint,
                            retry_after,
                            round + 1,
                            self.retry_rounds
                        );
                        tokio::time::sleep(Duration::from_secs(retry_after + 1)).await;
                    }
                    i += 1;
                    continue;
                }

                match err {
                    "token_revoked" | "account_inactive" | "invalid_auth" => {
                        return Err(SlackApiError::CredentialInvalid(err.to_string()));
                    }
                    "not_allowed_token_type" => {
                        // This token can never serve this endpoint; drop it
                        // from the rotation for the rest of the call.
                        candidates.remove(i);
                        if candidates.is_empty() {
                            return Err(SlackApiError::NoValidCredentials);
                        }
                    }
                    other => {
                        log::warn!(
                            "[SLACK_API] API error on {} with token ending in ...{}: {}",
                            endpoint,
                            token_tail(&tok),
                            other
                        );
                        i += 1;
                    }
                }
            }

            tokio::time::sleep(Duration::from_secs(round as u64 + 1)).await;
        }

        Err(SlackApiError::MaxRetriesExceeded(endpoint.to_string()))
    }

    // =====================================================
    // Typed Endpoint Wrappers
    // =====================================================

    /// List the conversations the token's user is a member of, following
    /// pagination cursors until exhausted. A failure after the first page
    /// stops early with what was gathered; a first-page failure propagates.
    pub async fn list_conversations(
        &self,
        token: &str,
        types: &str,
    ) -> Result<Vec<Conversation>, SlackApiError> {
        let mut conversations: Vec<Conversation> = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut params = vec![("types", types), ("limit", "200"), ("exclude_archived", "true")];
            if let Some(c) = cursor.as_deref() {
                params.push(("cursor", c));
            }

            let body = match self.call("users.conversations", token, &params).await {
                Ok(b) => b,
                Err(e) if e.is_credential_fatal() || conversations.is_empty() => return Err(e),
                Err(e) => {
                    log::warn!("[SLACK_API] Conversation listing stopped early: {}", e);
                    break;
                }
            };

            if let Some(arr) = body.get("channels") {
                let page: Vec<Conversation> =
                    serde_json::from_value(arr.clone()).unwrap_or_default();
                conversations.extend(page);
            }

            cursor = body
                .pointer("/response_metadata/next_cursor")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string);
            if cursor.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(PAGE_DELAY_MS)).await;
        }

        Ok(conversations)
    }

    /// Total match count for a search query.
    pub async fn search_count(&self, token: &str, query: &str) -> Result<u64, SlackApiError> {
        let body = self
            .call("search.messages", token, &[("query", query), ("count", "1")])
            .await?;
        Ok(body
            .pointer("/messages/total")
            .and_then(Value::as_u64)
            .unwrap_or(0))
    }

    pub async fn user_info(
        &self,
        token: &str,
        user_id: &str,
    ) -> Result<Option<UserInfo>, SlackApiError> {
        let body = self.call("users.info", token, &[("user", user_id)]).await?;
        Ok(body
            .get("user")
            .cloned()
            .and_then(|u| serde_json::from_value(u).ok()))
    }

    /// Open (or reopen) a direct-message conversation, returning its id.
    pub async fn open_dm(
        &self,
        token: &str,
        user_id: &str,
    ) -> Result<Option<String>, SlackApiError> {
        let body = self
            .call("conversations.open", token, &[("users", user_id)])
            .await?;
        Ok(body
            .pointer("/channel/id")
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    pub async fn post_message(
        &self,
        token: &str,
        channel: &str,
        text: &str,
    ) -> Result<(), SlackApiError> {
        self.call("chat.postMessage", token, &[("channel", channel), ("text", text)])
            .await?;
        Ok(())
    }
}

/// A conversation from `users.conversations`.
#[derive(Debug, Clone, Deserialize)]
pub struct Conversation {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub is_im: bool,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub is_mpim: bool,
    /// DM partner, present on `is_im` conversations.
    #[serde(default)]
    pub user: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserProfile {
    pub image_192: Option<String>,
    pub image_512: Option<String>,
}

/// A user record from `users.info`.
#[derive(Debug, Clone, Deserialize)]
pub struct UserInfo {
    pub name: String,
    pub real_name: Option<String>,
    #[serde(default)]
    pub profile: Option<UserProfile>,
}

impl UserInfo {
    pub fn display_name(&self) -> &str {
        self.real_name
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.name)
    }

    pub fn avatar(&self) -> Option<String> {
        self.profile
            .as_ref()
            .and_then(|p| p.image_192.clone().or_else(|| p.image_512.clone()))
    }
}

fn token_tail(token: &str) -> &str {
    &token[token.len().saturating_sub(4)..]
}

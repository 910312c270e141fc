//! GitHub collector: fetches pull requests and issues authored by a given
//! identity within a time window, via the REST search API.
#![allow(clippy::cast_possible_truncation)]

use std::cell::Cell;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::error::CollectorError;
use crate::types::{AttributeValue, Evidence, EvidenceKind, ScalarValue};

use crate::prefilter::issue_refs_in_text;

use super::traits::{Capabilities, Collector, Window};

const MAX_RETRIES: u32 = 5;
const RATE_LIMIT_PAUSE_THRESHOLD: u32 = 5;

/// GitHub REST API collector, scoped to a single `owner/repo`.
#[derive(Debug)]
pub struct GitHubCollector {
    owner: String,
    repo: String,
    token: Option<String>,
    client: Client,
    rate_remaining: Cell<u32>,
    rate_reset: Cell<u64>,
}

impl GitHubCollector {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>, token: Option<String>) -> Self {
        crate::ensure_tls_provider_installed();
        Self {
            owner: owner.into(),
            repo: repo.into(),
            token,
            client: Client::new(),
            rate_remaining: Cell::new(u32::MAX),
            rate_reset: Cell::new(0),
        }
    }
}

#[async_trait::async_trait(?Send)]
impl Collector for GitHubCollector {
    fn name(&self) -> &'static str {
        "github"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            kinds: vec![EvidenceKind::MergeRequest, EvidenceKind::Ticket],
            supports_user_window: true,
        }
    }

    #[instrument(skip_all, name = "github_collect", fields(identity = %identity))]
    async fn collect(
        &self,
        identity: &str,
        window: Window,
    ) -> Result<Vec<Evidence>, CollectorError> {
        if self.token.is_none() {
            return Err(CollectorError::AuthError {
                name: "github".to_string(),
                detail: "no token configured".to_string(),
            });
        }

        let mut evidence = Vec::new();
        evidence.extend(self.fetch_pull_requests(identity, window).await?);
        evidence.extend(self.fetch_issues(identity, window).await?);
        Ok(evidence)
    }
}

impl GitHubCollector {
    async fn fetch_pull_requests(
        &self,
        identity: &str,
        window: Window,
    ) -> Result<Vec<Evidence>, CollectorError> {
        let query = format!(
            "repo:{}/{} is:pr author:{identity} created:{}..{}",
            self.owner,
            self.repo,
            window.from.format("%Y-%m-%d"),
            window.to.format("%Y-%m-%d"),
        );
        let results: GhSearchResult<GhIssueOrPr> = self
            .api_get(&format!(
                "/search/issues?q={}&per_page=100",
                urlencode(&query)
            ))
            .await?;

        let mut evidence = Vec::new();
        for item in results.items {
            let mut attrs = std::collections::HashMap::new();
            attrs.insert(
                "number".to_string(),
                AttributeValue::Scalar(ScalarValue::Int(i64::try_from(item.number).unwrap_or(0))),
            );
            attrs.insert(
                "state".to_string(),
                AttributeValue::Scalar(ScalarValue::Str(item.state.clone())),
            );
            let body = item.body.clone().unwrap_or_default();
            let refs = issue_refs_in_text(&body);
            if !refs.is_empty() {
                attrs.insert(
                    "references".to_string(),
                    AttributeValue::List(
                        refs.iter()
                            .map(|r| ScalarValue::Int(i64::try_from(r.number).unwrap_or(0)))
                            .collect(),
                    ),
                );
                let closes: Vec<ScalarValue> = refs
                    .iter()
                    .filter(|r| r.closing)
                    .map(|r| ScalarValue::Int(i64::try_from(r.number).unwrap_or(0)))
                    .collect();
                if !closes.is_empty() {
                    attrs.insert("closes".to_string(), AttributeValue::List(closes));
                }
            }

            let login = item
                .user
                .as_ref()
                .map_or_else(|| identity.to_string(), |u| u.login.clone());
            match Evidence::try_new(
                format!("pr-{}", item.number),
                "github",
                EvidenceKind::MergeRequest,
                login,
                &item.created_at,
                item.title.clone(),
                body,
                item.html_url.clone(),
            ) {
                Ok(mut e) => {
                    e.attributes = attrs;
                    evidence.push(e);
                }
                Err(e) => warn!(error = %e, number = item.number, "skipping unparseable PR"),
            }
        }
        Ok(evidence)
    }

    async fn fetch_issues(
        &self,
        identity: &str,
        window: Window,
    ) -> Result<Vec<Evidence>, CollectorError> {
        let query = format!(
            "repo:{}/{} is:issue author:{identity} created:{}..{}",
            self.owner,
            self.repo,
            window.from.format("%Y-%m-%d"),
            window.to.format("%Y-%m-%d"),
        );
        let results: GhSearchResult<GhIssueOrPr> = self
            .api_get(&format!(
                "/search/issues?q={}&per_page=100",
                urlencode(&query)
            ))
            .await?;

        let mut evidence = Vec::new();
        for item in results.items {
            let mut attrs = std::collections::HashMap::new();
            attrs.insert(
                "number".to_string(),
                AttributeValue::Scalar(ScalarValue::Int(i64::try_from(item.number).unwrap_or(0))),
            );
            attrs.insert(
                "state".to_string(),
                AttributeValue::Scalar(ScalarValue::Str(item.state.clone())),
            );
            if !item.labels.is_empty() {
                attrs.insert(
                    "labels".to_string(),
                    AttributeValue::List(
                        item.labels
                            .iter()
                            .map(|l| ScalarValue::Str(l.name.clone()))
                            .collect(),
                    ),
                );
            }

            let login = item
                .user
                .as_ref()
                .map_or_else(|| identity.to_string(), |u| u.login.clone());
            match Evidence::try_new(
                format!("issue-{}", item.number),
                "github",
                EvidenceKind::Ticket,
                login,
                &item.created_at,
                item.title.clone(),
                item.body.clone().unwrap_or_default(),
                item.html_url.clone(),
            ) {
                Ok(mut e) => {
                    e.attributes = attrs;
                    evidence.push(e);
                }
                Err(e) => warn!(error = %e, number = item.number, "skipping unparseable issue"),
            }
        }
        Ok(evidence)
    }

    async fn api_get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, CollectorError> {
        let url = format!("https://api.github.com{path}");
        self.wait_for_rate_reset().await;

        let mut delay = Duration::from_secs(1);
        for attempt in 0..=MAX_RETRIES {
            let mut req = self
                .client
                .get(&url)
                .header("Accept", "application/vnd.github+json")
                .header("User-Agent", "corr-cli/0.1");
            if let Some(token) = &self.token {
                req = req.header("Authorization", format!("Bearer {token}"));
            }
            debug!(url = %url, attempt, "github api request");

            let resp = req.send().await.map_err(|e| CollectorError::Unavailable {
                name: "github".to_string(),
                detail: e.to_string(),
            })?;
            self.update_rate_limit(&resp);

            if resp.status().is_success() {
                return resp.json().await.map_err(|e| CollectorError::InvalidRequest {
                    name: "github".to_string(),
                    detail: format!("parse response: {e}"),
                });
            }

            let status = resp.status().as_u16();
            if (status == 403 || status == 429) && attempt < MAX_RETRIES {
                let wait = resp
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .map_or(delay, Duration::from_secs);
                warn!(attempt, status, wait_secs = wait.as_secs(), "rate limited, backing off");
                tokio::time::sleep(wait).await;
                delay = (delay * 2).min(Duration::from_secs(60));
                continue;
            }

            return Err(CollectorError::RateLimited {
                name: "github".to_string(),
                retry_after_secs: 60,
            });
        }

        Err(CollectorError::Timeout {
            name: "github".to_string(),
            timeout_secs: 0,
        })
    }

    fn update_rate_limit(&self, resp: &reqwest::Response) {
        if let Some(remaining) = resp
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u32>().ok())
        {
            self.rate_remaining.set(remaining);
        }
        if let Some(reset) = resp
            .headers()
            .get("x-ratelimit-reset")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
        {
            self.rate_reset.set(reset);
        }
    }

    async fn wait_for_rate_reset(&self) {
        if self.rate_remaining.get() > RATE_LIMIT_PAUSE_THRESHOLD {
            return;
        }
        let reset_at = self.rate_reset.get();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        if reset_at > now {
            tokio::time::sleep(Duration::from_secs(reset_at - now + 1)).await;
        }
    }
}

#[derive(Debug, Deserialize)]
struct GhSearchResult<T> {
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct GhIssueOrPr {
    number: u64,
    title: String,
    state: String,
    body: Option<String>,
    created_at: String,
    html_url: Option<String>,
    user: Option<GhUser>,
    #[serde(default)]
    labels: Vec<GhLabel>,
}

#[derive(Debug, Deserialize)]
struct GhUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct GhLabel {
    name: String,
}

fn urlencode(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            ' ' => "%20".to_string(),
            ':' => "%3A".to_string(),
            '/' => "%2F".to_string(),
            c => c.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_token_yields_auth_error() {
        let collector = GitHubCollector::new("owner", "repo", None);
        let window = Window {
            from: "2025-01-01T00:00:00Z".parse().unwrap(),
            to: "2025-12-31T00:00:00Z".parse().unwrap(),
        };
        let result = collector.collect("alice", window).await;
        assert!(matches!(result, Err(CollectorError::AuthError { .. })));
    }

    #[test]
    fn deserialize_issue_or_pr() {
        let json = r#"{
            "number": 42,
            "title": "Fix login crash",
            "state": "open",
            "body": "closes #10",
            "created_at": "2025-03-10T10:00:00Z",
            "html_url": "https://github.com/o/r/issues/42",
            "user": {"login": "alice"},
            "labels": [{"name": "bug"}]
        }"#;
        let item: GhIssueOrPr = serde_json::from_str(json).unwrap();
        assert_eq!(item.number, 42);
        assert_eq!(item.user.unwrap().login, "alice");
        assert_eq!(item.labels.len(), 1);
    }

    #[test]
    fn urlencode_escapes_query_chars() {
        assert_eq!(urlencode("a b:c/d"), "a%20b%3Ac%2Fd");
    }
}

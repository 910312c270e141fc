//! GitLab collector: fetches merge requests and issues authored by a given
//! identity within a time window, via the REST v4 API.
#![allow(clippy::cast_possible_truncation)]

use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::error::CollectorError;
use crate::types::{AttributeValue, Evidence, EvidenceKind, ScalarValue};

use crate::prefilter::issue_refs_in_text;

use super::traits::{Capabilities, Collector, Window};

/// GitLab REST API collector, scoped to a single project.
#[derive(Debug)]
pub struct GitLabCollector {
    /// URL-encoded project path (e.g., "owner%2Frepo").
    project_path: String,
    api_base: String,
    token: Option<String>,
    client: Client,
}

impl GitLabCollector {
    pub fn new(project_path: impl Into<String>, api_base: impl Into<String>, token: Option<String>) -> Self {
        crate::ensure_tls_provider_installed();
        Self {
            project_path: project_path.into(),
            api_base: api_base.into(),
            token,
            client: Client::new(),
        }
    }
}

#[async_trait::async_trait(?Send)]
impl Collector for GitLabCollector {
    fn name(&self) -> &'static str {
        "gitlab"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            kinds: vec![EvidenceKind::MergeRequest, EvidenceKind::Ticket],
            supports_user_window: true,
        }
    }

    #[instrument(skip_all, name = "gitlab_collect", fields(identity = %identity))]
    async fn collect(
        &self,
        identity: &str,
        window: Window,
    ) -> Result<Vec<Evidence>, CollectorError> {
        if self.token.is_none() {
            return Err(CollectorError::AuthError {
                name: "gitlab".to_string(),
                detail: "no token configured".to_string(),
            });
        }

        let mut evidence = Vec::new();
        evidence.extend(self.fetch_merge_requests(identity, window).await?);
        evidence.extend(self.fetch_issues(identity, window).await?);
        Ok(evidence)
    }
}

impl GitLabCollector {
    async fn fetch_merge_requests(
        &self,
        identity: &str,
        window: Window,
    ) -> Result<Vec<Evidence>, CollectorError> {
        let mrs: Vec<GlMergeRequest> = self
            .api_get(&format!(
                "/projects/{}/merge_requests?state=all&author_username={identity}&created_after={}&created_before={}&per_page=100",
                self.project_path,
                window.from.to_rfc3339(),
                window.to.to_rfc3339(),
            ))
            .await?;

        let mut evidence = Vec::new();
        for mr in mrs {
            let mut attrs = std::collections::HashMap::new();
            attrs.insert(
                "iid".to_string(),
                AttributeValue::Scalar(ScalarValue::Int(i64::try_from(mr.iid).unwrap_or(0))),
            );
            attrs.insert(
                "state".to_string(),
                AttributeValue::Scalar(ScalarValue::Str(mr.state.clone())),
            );
            let desc = mr.description.clone().unwrap_or_default();
            let refs = issue_refs_in_text(&desc);
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

            match Evidence::try_new(
                format!("mr-{}", mr.iid),
                "gitlab",
                EvidenceKind::MergeRequest,
                mr.author.username.clone(),
                &mr.created_at,
                mr.title.clone(),
                desc,
                mr.web_url.clone(),
            ) {
                Ok(mut e) => {
                    e.attributes = attrs;
                    evidence.push(e);
                }
                Err(e) => warn!(error = %e, iid = mr.iid, "skipping unparseable merge request"),
            }
        }
        Ok(evidence)
    }

    async fn fetch_issues(
        &self,
        identity: &str,
        window: Window,
    ) -> Result<Vec<Evidence>, CollectorError> {
        let issues: Vec<GlIssue> = self
            .api_get(&format!(
                "/projects/{}/issues?state=all&author_username={identity}&created_after={}&created_before={}&per_page=100",
                self.project_path,
                window.from.to_rfc3339(),
                window.to.to_rfc3339(),
            ))
            .await?;

        let mut evidence = Vec::new();
        for issue in issues {
            let mut attrs = std::collections::HashMap::new();
            attrs.insert(
                "iid".to_string(),
                AttributeValue::Scalar(ScalarValue::Int(i64::try_from(issue.iid).unwrap_or(0))),
            );
            attrs.insert(
                "state".to_string(),
                AttributeValue::Scalar(ScalarValue::Str(issue.state.clone())),
            );
            if !issue.labels.is_empty() {
                attrs.insert(
                    "labels".to_string(),
                    AttributeValue::List(issue.labels.iter().cloned().map(ScalarValue::Str).collect()),
                );
            }

            match Evidence::try_new(
                format!("gl-issue-{}", issue.iid),
                "gitlab",
                EvidenceKind::Ticket,
                identity,
                &issue.created_at,
                issue.title.clone(),
                issue.description.clone().unwrap_or_default(),
                issue.web_url.clone(),
            ) {
                Ok(mut e) => {
                    e.attributes = attrs;
                    evidence.push(e);
                }
                Err(e) => warn!(error = %e, iid = issue.iid, "skipping unparseable issue"),
            }
        }
        Ok(evidence)
    }

    async fn api_get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, CollectorError> {
        let url = format!("{}{path}", self.api_base);

        let mut req = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .header("User-Agent", "corr-cli/0.1");
        if let Some(token) = &self.token {
            req = req.header("PRIVATE-TOKEN", token.as_str());
        }
        debug!(url = %url, "gitlab api request");

        let resp = req.send().await.map_err(|e| CollectorError::Unavailable {
            name: "gitlab".to_string(),
            detail: e.to_string(),
        })?;

        if let Some(remaining) = resp
            .headers()
            .get("ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u32>().ok())
        {
            if remaining < 10 {
                warn!(remaining, "gitlab api rate limit low");
            }
        }

        if resp.status().as_u16() == 429 {
            return Err(CollectorError::RateLimited {
                name: "gitlab".to_string(),
                retry_after_secs: 60,
            });
        }
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(CollectorError::InvalidRequest {
                name: "gitlab".to_string(),
                detail: format!("{status}: {body}"),
            });
        }

        resp.json().await.map_err(|e| CollectorError::InvalidRequest {
            name: "gitlab".to_string(),
            detail: format!("parse response: {e}"),
        })
    }
}

#[derive(Debug, Deserialize)]
struct GlMergeRequest {
    iid: u64,
    title: String,
    state: String,
    description: Option<String>,
    created_at: String,
    web_url: Option<String>,
    author: GlUser,
}

#[derive(Debug, Deserialize)]
struct GlIssue {
    iid: u64,
    title: String,
    state: String,
    description: Option<String>,
    created_at: String,
    web_url: Option<String>,
    #[serde(default)]
    labels: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GlUser {
    username: String,
}

/// Percent-encode a project path segment (e.g. `owner/repo` -> `owner%2Frepo`).
pub fn encode_project_path(owner: &str, repo: &str) -> String {
    format!("{}%2F{}", owner.replace('%', "%25"), repo.replace('%', "%25"))
}

//! Git history collector — walks commits reachable from HEAD, emitting one
//! [`Evidence`] item per commit authored by the requested identity within
//! the requested window.

use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use tracing::{instrument, warn};

use crate::error::CollectorError;
use crate::types::{Evidence, EvidenceKind};

use super::traits::{Capabilities, Collector, Window};

/// Git history collector.
#[derive(Debug)]
pub struct GitCollector {
    repo_path: PathBuf,
}

impl GitCollector {
    pub fn new(repo_path: &Path) -> Self {
        Self {
            repo_path: repo_path.to_path_buf(),
        }
    }

    fn open(&self) -> Result<gix::Repository, CollectorError> {
        gix::open(&self.repo_path).map_err(|e| CollectorError::Unavailable {
            name: "git".to_string(),
            detail: e.to_string(),
        })
    }

    /// An author matches `identity` if it equals the commit's author name or
    /// email, case-insensitively. The identity-to-(source,handle) mapping
    /// lives outside the collector, in [`crate::types::UserIdentityMap`].
    fn author_matches(identity: &str, name: &str, email: &str) -> bool {
        identity.eq_ignore_ascii_case(name) || identity.eq_ignore_ascii_case(email)
    }
}

#[async_trait::async_trait(?Send)]
impl Collector for GitCollector {
    fn name(&self) -> &'static str {
        "git"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            kinds: vec![EvidenceKind::Commit],
            supports_user_window: true,
        }
    }

    #[instrument(skip_all, name = "git_collect", fields(identity = %identity))]
    async fn collect(
        &self,
        identity: &str,
        window: Window,
    ) -> Result<Vec<Evidence>, CollectorError> {
        let repo = self.open()?;
        let head = repo
            .head_commit()
            .map_err(|e| CollectorError::Unavailable {
                name: "git".to_string(),
                detail: e.to_string(),
            })?;
        let walk = head.ancestors().all().map_err(|e| CollectorError::Unavailable {
            name: "git".to_string(),
            detail: format!("failed to walk history: {e}"),
        })?;

        let mut evidence = Vec::new();
        for info in walk {
            let Ok(info) = info else { continue };
            let Ok(commit) = repo.find_commit(info.id) else {
                continue;
            };
            let Ok(author_sig) = commit.author() else {
                continue;
            };
            let author_name = author_sig.name.to_string();
            let author_email = author_sig.email.to_string();
            if !Self::author_matches(identity, &author_name, &author_email) {
                continue;
            }
            let author_time = author_sig
                .time()
                .map_or_else(|_| Utc::now(), |t| gix_time_to_chrono(&t));
            if author_time < window.from || author_time > window.to {
                continue;
            }

            let sha = info.id.to_string();
            let message = commit.message_raw_sloppy().to_string();
            let (title, body) = split_commit_message(&message);

            match Evidence::try_new(
                &sha,
                "git",
                EvidenceKind::Commit,
                &author_email,
                &author_time.to_rfc3339(),
                &title,
                &body,
                None,
            ) {
                Ok(item) => evidence.push(item),
                Err(e) => warn!(sha = %sha, error = %e, "skipping unparseable commit"),
            }
        }

        Ok(evidence)
    }
}

/// Git convention: first line is the title, remainder (after a blank line)
/// is the body.
fn split_commit_message(message: &str) -> (String, String) {
    let mut lines = message.lines();
    let title = lines.next().unwrap_or_default().to_string();
    let body = lines.collect::<Vec<_>>().join("\n").trim().to_string();
    (title, body)
}

fn gix_time_to_chrono(time: &gix::date::Time) -> DateTime<Utc> {
    Utc.timestamp_opt(time.seconds, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn create_test_repo(dir: &Path) {
        let run = |args: &[&str]| {
            Command::new("git")
                .args(args)
                .current_dir(dir)
                .env("GIT_AUTHOR_NAME", "Test")
                .env("GIT_AUTHOR_EMAIL", "test@example.com")
                .env("GIT_COMMITTER_NAME", "Test")
                .env("GIT_COMMITTER_EMAIL", "test@example.com")
                .output()
                .expect("git command failed")
        };

        run(&["init", "--initial-branch=main"]);
        run(&["config", "user.email", "test@example.com"]);
        run(&["config", "user.name", "Test"]);

        std::fs::write(dir.join("a.txt"), "one").unwrap();
        run(&["add", "."]);
        run(&["commit", "-m", "Add a\n\nDetails about a"]);

        std::fs::write(dir.join("a.txt"), "two").unwrap();
        run(&["add", "."]);
        run(&["commit", "-m", "Update a"]);
    }

    #[tokio::test]
    async fn collect_matches_author_and_window() {
        let tmp = tempfile::tempdir().unwrap();
        create_test_repo(tmp.path());

        let collector = GitCollector::new(tmp.path());
        let window = Window {
            from: "2000-01-01T00:00:00Z".parse().unwrap(),
            to: "2100-01-01T00:00:00Z".parse().unwrap(),
        };

        let evidence = collector.collect("test@example.com", window).await.unwrap();
        assert_eq!(evidence.len(), 2);
        assert!(evidence.iter().all(|e| e.kind == EvidenceKind::Commit));
    }

    #[tokio::test]
    async fn collect_excludes_other_authors() {
        let tmp = tempfile::tempdir().unwrap();
        create_test_repo(tmp.path());

        let collector = GitCollector::new(tmp.path());
        let window = Window {
            from: "2000-01-01T00:00:00Z".parse().unwrap(),
            to: "2100-01-01T00:00:00Z".parse().unwrap(),
        };

        let evidence = collector.collect("nobody@example.com", window).await.unwrap();
        assert!(evidence.is_empty());
    }

    #[test]
    fn split_commit_message_separates_title_and_body() {
        let (title, body) = split_commit_message("Fix bug\n\nLonger explanation\nsecond line");
        assert_eq!(title, "Fix bug");
        assert_eq!(body, "Longer explanation\nsecond line");
    }
}

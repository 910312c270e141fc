//! The collector protocol and the registry that fans out across
//! registered adapters.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{instrument, warn};

use crate::config::ConcurrencyConfig;
use crate::error::CollectorError;
use crate::types::Evidence;

/// Collector capabilities, advertised up front so the orchestrator can
/// filter which adapters apply to a request.
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    pub kinds: Vec<crate::types::EvidenceKind>,
    pub supports_user_window: bool,
}

#[derive(Debug, Clone)]
pub struct Health {
    pub ok: bool,
    pub detail: String,
}

/// A time window, inclusive.
#[derive(Debug, Clone, Copy)]
pub struct Window {
    pub from: chrono::DateTime<chrono::Utc>,
    pub to: chrono::DateTime<chrono::Utc>,
}

/// Common interface for all source adapters.
///
/// `?Send` because a `gix::Repository` (held by [`GitCollector`]) contains
/// `RefCell`s and cannot be held across await points in a `Send` future.
#[async_trait::async_trait(?Send)]
pub trait Collector {
    /// Unique, stable name (e.g. `"git"`, `"github"`, `"gitlab"`).
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// Fetch evidence for `identity` within `window`. Finite and
    /// non-restartable per call — a fresh call re-fetches from scratch.
    async fn collect(
        &self,
        identity: &str,
        window: Window,
    ) -> Result<Vec<Evidence>, CollectorError>;

    async fn health(&self) -> Health {
        Health {
            ok: true,
            detail: "ok".to_string(),
        }
    }
}

/// A collector that failed during a run. Surfaced as a `PartialCollection`
/// warning on the run result rather than a fatal error.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PartialCollectionWarning {
    pub collector: String,
    pub reason: String,
}

/// Outcome of a registry-wide collection fan-out.
#[derive(Debug, Default)]
pub struct CollectionOutcome {
    pub evidence: Vec<Evidence>,
    pub warnings: Vec<PartialCollectionWarning>,
}

/// Read-mostly collector registry: frozen after startup registration, reads
/// are lock-free (a plain `Vec` behind an `Arc`).
#[derive(Default)]
pub struct CollectorRegistry {
    collectors: Vec<Arc<dyn Collector>>,
}

impl std::fmt::Debug for CollectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorRegistry")
            .field("names", &self.list())
            .finish()
    }
}

impl CollectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, collector: Arc<dyn Collector>) {
        self.collectors.push(collector);
    }

    pub fn list(&self) -> Vec<&'static str> {
        self.collectors.iter().map(|c| c.name()).collect()
    }

    /// Probe one adapter by name. `None` if no adapter carries that name.
    pub async fn health_check(&self, name: &str) -> Option<Health> {
        for collector in &self.collectors {
            if collector.name() == name {
                return Some(collector.health().await);
            }
        }
        None
    }

    /// Collect across every registered adapter concurrently, joined with a
    /// fan-in barrier. One adapter's failure yields a warning; it does not
    /// abort the others. Each adapter gets its own timeout: a slow or dead
    /// collector can't stall the fan-out past `collector_timeout_secs`.
    ///
    /// `join_all` rather than `JoinSet` because the collector futures are
    /// `?Send` (see the trait docs) and so can't cross a `tokio::spawn`
    /// boundary; they interleave cooperatively on the calling task instead.
    #[instrument(skip_all, name = "collector_fanout")]
    pub async fn collect_all(
        &self,
        identity: &str,
        window: Window,
        config: &ConcurrencyConfig,
    ) -> CollectionOutcome {
        let timeout = Duration::from_secs(config.collector_timeout_secs);

        let results = futures::future::join_all(self.collectors.iter().map(|collector| {
            let name = collector.name();
            async move {
                (
                    name,
                    tokio::time::timeout(timeout, collector.collect(identity, window)).await,
                )
            }
        }))
        .await;

        let mut outcome = CollectionOutcome::default();
        for (name, result) in results {
            match result {
                Ok(Ok(items)) => outcome.evidence.extend(items),
                Ok(Err(err)) => {
                    warn!(collector = name, error = %err, "collector failed");
                    outcome.warnings.push(PartialCollectionWarning {
                        collector: name.to_string(),
                        reason: err.to_string(),
                    });
                }
                Err(_) => {
                    warn!(collector = name, "collector timed out");
                    outcome.warnings.push(PartialCollectionWarning {
                        collector: name.to_string(),
                        reason: format!("timed out after {}s", config.collector_timeout_secs),
                    });
                }
            }
        }
        outcome
    }

    /// Deduplicate collected evidence by fingerprint, keeping the later
    /// timestamp's fields on conflict.
    pub fn deduplicate(evidence: Vec<Evidence>) -> Vec<Evidence> {
        let mut by_fingerprint: HashMap<u64, Evidence> = HashMap::new();
        for item in evidence {
            let fp = item.fingerprint();
            match by_fingerprint.get(&fp) {
                Some(existing) if existing.timestamp >= item.timestamp => {}
                _ => {
                    by_fingerprint.insert(fp, item);
                }
            }
        }
        by_fingerprint.into_values().collect()
    }
}

//! Deterministic in-memory collector for tests.

use crate::collector::traits::{Capabilities, Collector, Health, Window};
use crate::error::CollectorError;
use crate::types::Evidence;

pub struct MockCollector {
    name: &'static str,
    evidence: Vec<Evidence>,
    failure: Option<CollectorError>,
}

impl MockCollector {
    pub fn healthy(name: &'static str, evidence: Vec<Evidence>) -> Self {
        Self {
            name,
            evidence,
            failure: None,
        }
    }

    pub fn unavailable(name: &'static str) -> Self {
        Self {
            name,
            evidence: Vec::new(),
            failure: Some(CollectorError::Unavailable {
                name: name.to_string(),
                detail: "mock unavailable".to_string(),
            }),
        }
    }
}

#[async_trait::async_trait(?Send)]
impl Collector for MockCollector {
    fn name(&self) -> &'static str {
        self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    async fn collect(
        &self,
        _identity: &str,
        _window: Window,
    ) -> Result<Vec<Evidence>, CollectorError> {
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        Ok(self.evidence.clone())
    }

    async fn health(&self) -> Health {
        Health {
            ok: self.failure.is_none(),
            detail: self
                .failure
                .as_ref()
                .map(std::string::ToString::to_string)
                .unwrap_or_else(|| "ok".to_string()),
        }
    }
}

//! Layered error types for the correlation core.
//!
//! Each component gets its own `thiserror` enum; all of them feed into
//! [`CorrError`] via `#[from]`. [`CorrError::kind`] re-classifies any
//! concrete variant into the error taxonomy used by the orchestrator to
//! decide between a fatal abort and a degraded-success completion.

/// Top-level correlation core error.
#[derive(thiserror::Error, Debug)]
pub enum CorrError {
    #[error("evidence error: {0}")]
    Evidence(#[from] EvidenceError),

    #[error("collector error: {0}")]
    Collector(#[from] CollectorError),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("budget error: {0}")]
    Budget(#[from] BudgetError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("orchestrator cancelled")]
    Cancelled,

    #[error("internal invariant violated: {0}")]
    InvariantViolation(String),
}

#[derive(thiserror::Error, Debug)]
pub enum EvidenceError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("timestamp is not parseable: {0}")]
    UnparseableTimestamp(String),

    #[error("duplicate id within (source, kind): {0}")]
    DuplicateId(String),
}

#[derive(thiserror::Error, Debug, Clone)]
pub enum CollectorError {
    #[error("auth failed for collector {name}: {detail}")]
    AuthError { name: String, detail: String },

    #[error("rate limited by collector {name}, retry after {retry_after_secs}s")]
    RateLimited { name: String, retry_after_secs: u64 },

    #[error("collector {name} unavailable: {detail}")]
    Unavailable { name: String, detail: String },

    #[error("invalid request to collector {name}: {detail}")]
    InvalidRequest { name: String, detail: String },

    #[error("collector {name} timed out after {timeout_secs}s")]
    Timeout { name: String, timeout_secs: u64 },
}

#[derive(thiserror::Error, Debug)]
pub enum ProviderError {
    #[error("network error calling {provider}: {detail}")]
    Network { provider: String, detail: String },

    #[error("provider {provider} returned malformed response: {detail}")]
    Malformed { provider: String, detail: String },

    #[error("provider {provider} rejected the request: {detail}")]
    InvalidRequest { provider: String, detail: String },

    #[error("provider {provider} auth failed: {detail}")]
    AuthFailed { provider: String, detail: String },
}

#[derive(thiserror::Error, Debug)]
pub enum BudgetError {
    #[error("budget denied: projected cost {projected_micro} exceeds remaining {remaining_micro}")]
    Denied {
        projected_micro: i64,
        remaining_micro: i64,
    },

    #[error("no active reservation for handle {0}")]
    UnknownReservation(u64),

    #[error("ledger invariant violated: {0}")]
    LedgerInvariant(String),
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(String),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("parse error: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, CorrError>;

/// Coarse failure-policy taxonomy. Several concrete variants map onto the
/// same bucket, which is the whole point: the orchestrator reacts to the
/// bucket, not the concrete error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    PartialCollection,
    ProviderTransient,
    ProviderFatal,
    BudgetDenied,
    Cancelled,
    InvariantViolation,
}

impl CorrError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CorrError::Evidence(_) => ErrorKind::InvalidInput,
            CorrError::Collector(CollectorError::RateLimited { .. } | CollectorError::Timeout { .. }) => {
                ErrorKind::ProviderTransient
            }
            CorrError::Collector(_) => ErrorKind::PartialCollection,
            CorrError::Provider(ProviderError::Network { .. }) => ErrorKind::ProviderTransient,
            CorrError::Provider(_) => ErrorKind::ProviderFatal,
            CorrError::Budget(_) => ErrorKind::BudgetDenied,
            CorrError::Store(_) | CorrError::Config(_) => ErrorKind::InvalidInput,
            CorrError::Cancelled => ErrorKind::Cancelled,
            CorrError::InvariantViolation(_) => ErrorKind::InvariantViolation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_is_provider_transient() {
        let err = CorrError::Collector(CollectorError::RateLimited {
            name: "github".into(),
            retry_after_secs: 30,
        });
        assert_eq!(err.kind(), ErrorKind::ProviderTransient);
    }

    #[test]
    fn auth_error_is_partial_collection() {
        let err = CorrError::Collector(CollectorError::AuthError {
            name: "gitlab".into(),
            detail: "bad token".into(),
        });
        assert_eq!(err.kind(), ErrorKind::PartialCollection);
    }

    #[test]
    fn budget_denied_maps_to_budget_denied_kind() {
        let err = CorrError::Budget(BudgetError::Denied {
            projected_micro: 100,
            remaining_micro: 10,
        });
        assert_eq!(err.kind(), ErrorKind::BudgetDenied);
    }

    #[test]
    fn invariant_violation_does_not_downgrade() {
        let err = CorrError::InvariantViolation("ledger went negative".into());
        assert_eq!(err.kind(), ErrorKind::InvariantViolation);
    }
}

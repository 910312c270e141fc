//! Correlation core library: collectors, the three-tier correlation pipeline,
//! the budget ledger, and the opaque evidence/story store.
//!
//! The main entry point is the orchestrator, which runs evidence through
//! Collect → Filter → Embed → Adjudicate → Score → Group → Enrich over a
//! [`store::Store`].

pub mod budget;
pub mod cancel;
pub mod collector;
pub mod config;
pub mod cost_projector;
pub mod embedding;
pub mod error;
pub mod grouping;
pub mod insights;
pub mod llm;
pub mod observability;
pub mod orchestrator;
pub mod prefilter;
pub mod scorer;
pub mod store;
pub mod types;

/// Installs the `aws-lc-rs` crypto provider used by `rustls` for outbound
/// HTTPS requests (the `reqwest` dependency is built with
/// `rustls-tls-webpki-roots-no-provider`, which requires the process to pick
/// a provider explicitly rather than pulling in `ring`). Safe to call more
/// than once; only the first call takes effect.
pub fn ensure_tls_provider_installed() {
    static INSTALLED: std::sync::Once = std::sync::Once::new();
    INSTALLED.call_once(|| {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}

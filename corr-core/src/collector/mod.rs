//! Collector registry: pluggable evidence sources. Each collector
//! adapts one platform (local git, GitHub, GitLab) to the common
//! [`traits::Collector`] contract; the registry runs them concurrently and
//! merges the results, treating a single collector's failure as a warning
//! rather than aborting the run.

pub mod git;
pub mod github;
pub mod gitlab;
pub mod traits;

#[cfg(test)]
pub mod mock;

pub use git::GitCollector;
pub use github::GitHubCollector;
pub use gitlab::GitLabCollector;
pub use traits::{
    Capabilities, Collector, CollectionOutcome, CollectorRegistry, Health, PartialCollectionWarning, Window,
};

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Canonical person id, as assigned by the identity-mapping system outside
/// the core.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PersonId(pub String);

/// A mapping from `(source, handle)` to a canonical person id.
///
/// Maintained outside the core; the core consumes it as authoritative. An
/// unmapped handle is not an error — author-based correlations are simply
/// disabled for that evidence item.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserIdentityMap {
    entries: HashMap<(String, String), PersonId>,
}

impl UserIdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, source: impl Into<String>, handle: impl Into<String>, person: PersonId) {
        self.entries.insert((source.into(), handle.into()), person);
    }

    pub fn resolve(&self, source: &str, handle: &str) -> Option<&PersonId> {
        self.entries.get(&(source.to_string(), handle.to_string()))
    }

    pub fn is_mapped(&self, source: &str, handle: &str) -> bool {
        self.resolve(source, handle).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmapped_handle_resolves_to_none() {
        let map = UserIdentityMap::new();
        assert!(map.resolve("github", "alice").is_none());
        assert!(!map.is_mapped("github", "alice"));
    }

    #[test]
    fn mapped_handle_resolves_across_sources() {
        let mut map = UserIdentityMap::new();
        map.insert("github", "alice-gh", PersonId("p-1".into()));
        map.insert("jira", "alice.j", PersonId("p-1".into()));

        assert_eq!(
            map.resolve("github", "alice-gh"),
            Some(&PersonId("p-1".into()))
        );
        assert_eq!(
            map.resolve("jira", "alice.j"),
            Some(&PersonId("p-1".into()))
        );
        assert!(map.resolve("github", "alice.j").is_none());
    }
}

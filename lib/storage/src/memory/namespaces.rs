use dashmap::DashMap;
use quadmem_model::Namespace;

/// The store's prefix → IRI namespace table.
///
/// Namespaces have a lifecycle independent from statements: they are not
/// versioned or transactional, but they are persisted alongside the
/// statements by the binary snapshot codec.
#[derive(Debug, Default)]
pub struct NamespaceStore {
    map: DashMap<String, String>,
}

impl NamespaceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, prefix: impl Into<String>, iri: impl Into<String>) {
        self.map.insert(prefix.into(), iri.into());
    }

    pub fn get(&self, prefix: &str) -> Option<String> {
        self.map.get(prefix).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, prefix: &str) -> bool {
        self.map.remove(prefix).is_some()
    }

    pub fn iter(&self) -> Vec<Namespace> {
        self.map
            .iter()
            .map(|entry| Namespace::new(entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&self) {
        self.map.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_remove() {
        let namespaces = NamespaceStore::new();
        namespaces.set("ex", "http://example.com/");
        assert_eq!(namespaces.get("ex").as_deref(), Some("http://example.com/"));

        // Re-setting a prefix replaces the mapping.
        namespaces.set("ex", "http://example.org/");
        assert_eq!(namespaces.get("ex").as_deref(), Some("http://example.org/"));

        assert!(namespaces.remove("ex"));
        assert!(!namespaces.remove("ex"));
        assert_eq!(namespaces.get("ex"), None);
    }
}

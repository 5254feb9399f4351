use std::sync::Mutex;

use async_trait::async_trait;
use common::registry::{MemoryRegistry, Snapshots};
use common::{Document, Fields, Filter, Registry, RegistryError};

struct Rule {
    collection: String,
    id: Option<String>,
    remaining: usize,
}

/// Memory registry whose writes can be made to fail with a 503.
pub struct FailingRegistry {
    inner: MemoryRegistry,
    rules: Mutex<Vec<Rule>>,
}

impl FailingRegistry {
    pub fn new(inner: MemoryRegistry) -> Self {
        Self { inner, rules: Mutex::new(Vec::new()) }
    }

    /// Fail the next `times` writes to `collection`, or only to `collection/id`.
    pub fn fail_sets(&self, collection: &str, id: Option<&str>, times: usize) {
        self.rules.lock().unwrap().push(Rule {
            collection: collection.to_string(),
            id: id.map(str::to_string),
            remaining: times,
        });
    }

    fn should_fail(&self, collection: &str, id: &str) -> bool {
        let mut rules = self.rules.lock().unwrap();
        let rule = rules.iter_mut().find(|r| {
            r.remaining > 0 && r.collection == collection && r.id.as_deref().map_or(true, |want| want == id)
        });
        match rule {
            Some(rule) => {
                rule.remaining -= 1;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl Registry for FailingRegistry {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, RegistryError> {
        self.inner.get(collection, id).await
    }

    async fn query(&self, collection: &str, filters: &[Filter]) -> Result<Vec<Document>, RegistryError> {
        self.inner.query(collection, filters).await
    }

    async fn set(&self, collection: &str, id: &str, fields: Fields, merge: bool) -> Result<(), RegistryError> {
        if self.should_fail(collection, id) {
            return Err(RegistryError::Status { status: 503, path: common::doc_path(collection, id) });
        }
        self.inner.set(collection, id, fields, merge).await
    }

    async fn add(&self, collection: &str, fields: Fields) -> Result<String, RegistryError> {
        self.inner.add(collection, fields).await
    }

    async fn listen(&self, collection: &str, filters: &[Filter]) -> Result<Snapshots, RegistryError> {
        self.inner.listen(collection, filters).await
    }
}

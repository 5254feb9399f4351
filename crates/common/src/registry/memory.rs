use std::collections::BTreeMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::broadcast;

use super::{Document, Fields, Filter, Registry, RegistryError, Snapshots};

type Collections = BTreeMap<String, BTreeMap<String, Fields>>;

/// In-process registry. Documents are kept in id order, so generated ids
/// preserve creation order.
#[derive(Clone)]
pub struct MemoryRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    docs: Mutex<Collections>,
    changes: broadcast::Sender<String>,
    next_id: AtomicU64,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistry {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                docs: Mutex::new(BTreeMap::new()),
                changes,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    fn snapshot(&self, collection: &str, filters: &[Filter]) -> Vec<Document> {
        let docs = self.inner.docs.lock().unwrap_or_else(|e| e.into_inner());
        docs.get(collection)
            .map(|c| {
                c.iter()
                    .filter(|(_, fields)| filters.iter().all(|f| f.matches(fields)))
                    .map(|(id, fields)| Document { id: id.clone(), fields: fields.clone() })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn write(&self, collection: &str, id: &str, fields: Fields, merge: bool) {
        {
            let mut docs = self.inner.docs.lock().unwrap_or_else(|e| e.into_inner());
            let coll = docs.entry(collection.to_string()).or_default();
            match coll.get_mut(id) {
                Some(existing) if merge => {
                    for (k, v) in fields {
                        existing.insert(k, v);
                    }
                }
                _ => {
                    coll.insert(id.to_string(), fields);
                }
            }
        }
        // no receivers is fine
        let _ = self.inner.changes.send(collection.to_string());
    }

    /// Number of documents in a collection.
    pub fn count(&self, collection: &str) -> usize {
        let docs = self.inner.docs.lock().unwrap_or_else(|e| e.into_inner());
        docs.get(collection).map(|c| c.len()).unwrap_or(0)
    }
}

fn check_path(collection: &str) -> Result<(), RegistryError> {
    if collection.trim_matches('/').is_empty() {
        return Err(RegistryError::InvalidPath(collection.to_string()));
    }
    Ok(())
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, RegistryError> {
        check_path(collection)?;
        let docs = self.inner.docs.lock().unwrap_or_else(|e| e.into_inner());
        Ok(docs
            .get(collection)
            .and_then(|c| c.get(id))
            .map(|fields| Document { id: id.to_string(), fields: fields.clone() }))
    }

    async fn query(&self, collection: &str, filters: &[Filter]) -> Result<Vec<Document>, RegistryError> {
        check_path(collection)?;
        Ok(self.snapshot(collection, filters))
    }

    async fn set(&self, collection: &str, id: &str, fields: Fields, merge: bool) -> Result<(), RegistryError> {
        check_path(collection)?;
        self.write(collection, id, fields, merge);
        Ok(())
    }

    async fn add(&self, collection: &str, fields: Fields) -> Result<String, RegistryError> {
        check_path(collection)?;
        let n = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let id = format!("doc{n:08}");
        self.write(collection, &id, fields, false);
        Ok(id)
    }

    async fn listen(&self, collection: &str, filters: &[Filter]) -> Result<Snapshots, RegistryError> {
        check_path(collection)?;
        // subscribe before the first snapshot so no change slips in between
        let rx = self.inner.changes.subscribe();
        let state = (self.clone(), rx, collection.to_string(), filters.to_vec(), None::<Vec<Document>>);
        let stream = futures::stream::unfold(state, |(reg, mut rx, collection, filters, mut last)| async move {
            loop {
                if last.is_some() {
                    match rx.recv().await {
                        Ok(changed) if changed != collection => continue,
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
                let current = reg.snapshot(&collection, &filters);
                if last.as_ref() == Some(&current) {
                    continue;
                }
                last = Some(current.clone());
                return Some((Ok(current), (reg, rx, collection, filters, last)));
            }
        });
        Ok(stream.boxed())
    }
}

use super::{ApplyFn, Doc, DocStore, Mutation};
use crate::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

/// Process-local store. The single mutex makes every operation trivially
/// atomic, which is all we need for tests and ephemeral deployments.
#[derive(Default)]
pub(crate) struct MemoryStore {
    collections: Mutex<HashMap<String, BTreeMap<String, Doc>>>,
}

#[async_trait]
impl DocStore for MemoryStore {
    async fn read(&self, collection: &str, id: &str) -> Result<Option<Doc>> {
        let collections = self.collections.lock().await;
        Ok(collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    async fn transactional_update(
        &self,
        collection: &str,
        id: &str,
        apply: ApplyFn<'_>,
    ) -> Result<()> {
        let mut collections = self.collections.lock().await;

        let current = collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned();

        match apply(current)? {
            Mutation::Keep => {}
            Mutation::Put(doc) => {
                collections
                    .entry(collection.to_owned())
                    .or_default()
                    .insert(id.to_owned(), doc);
            }
            Mutation::Delete => {
                if let Some(docs) = collections.get_mut(collection) {
                    docs.remove(id);
                }
            }
        }

        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        let mut collections = self.collections.lock().await;
        Ok(collections
            .get_mut(collection)
            .map(|docs| docs.remove(id).is_some())
            .unwrap_or(false))
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, Doc)>> {
        let collections = self.collections.lock().await;
        Ok(collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .map(|(id, doc)| (id.clone(), doc.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn update_creates_reads_and_deletes() {
        let store = MemoryStore::default();

        assert_eq!(store.read("users", "1").await.unwrap(), None);

        store
            .transactional_update("users", "1", &mut |doc| {
                assert_eq!(doc, None);
                Ok(Mutation::Put(json!({ "tokens": 60 })))
            })
            .await
            .unwrap();

        assert_eq!(
            store.read("users", "1").await.unwrap(),
            Some(json!({ "tokens": 60 }))
        );

        assert!(store.delete("users", "1").await.unwrap());
        assert!(!store.delete("users", "1").await.unwrap());
    }

    #[tokio::test]
    async fn failed_closure_leaves_doc_intact() {
        let store = MemoryStore::default();

        store
            .transactional_update("users", "1", &mut |_| Ok(Mutation::Put(json!({ "tokens": 3 }))))
            .await
            .unwrap();

        let result = store
            .transactional_update("users", "1", &mut |_| {
                Err(crate::fatal!("transaction aborted on purpose"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(
            store.read("users", "1").await.unwrap(),
            Some(json!({ "tokens": 3 }))
        );
    }

    #[tokio::test]
    async fn list_returns_whole_collection() {
        let store = MemoryStore::default();

        for id in ["a", "b"] {
            store
                .transactional_update("promocodes", id, &mut |_| {
                    Ok(Mutation::Put(json!({ "uses_left": 1 })))
                })
                .await
                .unwrap();
        }

        let listed = store.list("promocodes").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(store.list("users").await.unwrap().is_empty());
    }
}

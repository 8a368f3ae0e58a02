use super::{ApplyFn, Doc, DocStore, Mutation, StoreError};
use crate::prelude::*;
use crate::{encoding, err_ctx, Result};
use async_trait::async_trait;
use fs_err::tokio as fs;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::Mutex;

type State = BTreeMap<String, BTreeMap<String, Doc>>;

/// Stores all collections in a single JSON file. Every committed mutation
/// rewrites the file via a temp file plus an atomic rename, and the new state
/// reaches the disk before it becomes visible to readers.
pub(crate) struct JsonFileStore {
    path: PathBuf,
    state: Mutex<State>,
}

impl JsonFileStore {
    pub(crate) async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let state = match fs::read_to_string(&path).await {
            Ok(content) => encoding::from_json_string(&content)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "State file doesn't exist yet, starting empty");
                State::default()
            }
            Err(err) => {
                return Err(crate::err!(StoreError::LoadFile {
                    path: path.display().to_string(),
                    source: err,
                }))
            }
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    async fn persist(&self, state: &State) -> Result<()> {
        let content = encoding::to_json_string_pretty(state);
        let tmp_path = self.path.with_extension("json.tmp");

        let persist = err_ctx!(StoreError::PersistFile {
            path: self.path.display().to_string()
        });

        fs::write(&tmp_path, content).await.map_err(persist)?;
        fs::rename(&tmp_path, &self.path).await.map_err(persist)?;

        Ok(())
    }
}

#[async_trait]
impl DocStore for JsonFileStore {
    async fn read(&self, collection: &str, id: &str) -> Result<Option<Doc>> {
        let state = self.state.lock().await;
        Ok(state
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
        let mut state = self.state.lock().await;

        let current = state
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned();

        let mut next = state.clone();
        match apply(current)? {
            Mutation::Keep => return Ok(()),
            Mutation::Put(doc) => {
                next.entry(collection.to_owned())
                    .or_default()
                    .insert(id.to_owned(), doc);
            }
            Mutation::Delete => {
                if let Some(docs) = next.get_mut(collection) {
                    docs.remove(id);
                }
            }
        }

        self.persist(&next).await?;
        *state = next;

        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;

        let exists = state
            .get(collection)
            .map(|docs| docs.contains_key(id))
            .unwrap_or(false);

        if !exists {
            return Ok(false);
        }

        let mut next = state.clone();
        if let Some(docs) = next.get_mut(collection) {
            docs.remove(id);
        }

        self.persist(&next).await?;
        *state = next;

        Ok(true)
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, Doc)>> {
        let state = self.state.lock().await;
        Ok(state
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
    async fn state_survives_a_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        {
            let store = JsonFileStore::load(&path).await.unwrap();
            store
                .transactional_update("users", "42", &mut |_| {
                    Ok(Mutation::Put(json!({ "tokens": 55 })))
                })
                .await
                .unwrap();
        }

        let reloaded = JsonFileStore::load(&path).await.unwrap();
        assert_eq!(
            reloaded.read("users", "42").await.unwrap(),
            Some(json!({ "tokens": 55 }))
        );
    }

    #[tokio::test]
    async fn keep_mutation_doesnt_touch_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = JsonFileStore::load(&path).await.unwrap();
        store
            .transactional_update("users", "1", &mut |_| Ok(Mutation::Keep))
            .await
            .unwrap();

        assert!(!path.exists());
    }

    #[tokio::test]
    async fn delete_reports_whether_doc_existed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = JsonFileStore::load(&path).await.unwrap();
        store
            .transactional_update("promocodes", "WELCOME", &mut |_| {
                Ok(Mutation::Put(json!({ "amount": 10, "uses_left": 1 })))
            })
            .await
            .unwrap();

        assert!(store.delete("promocodes", "WELCOME").await.unwrap());
        assert!(!store.delete("promocodes", "WELCOME").await.unwrap());
    }
}

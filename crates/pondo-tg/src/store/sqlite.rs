use super::{ApplyFn, Doc, DocStore, Mutation, StoreError};
use crate::prelude::*;
use crate::{err, err_ctx, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{ConnectOptions, Connection, Row, SqliteConnection, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Mutex;

/// Sqlite-backed store. All documents live in a single `documents` table
/// keyed by `(collection, id)` with the JSON payload stored as text.
///
/// Reads go through the pool. Every `transactional_update` runs on a single
/// dedicated writer connection behind a mutex: sqlite allows one writer at a
/// time anyway, and serializing writers in process means a transaction never
/// hits SQLITE_BUSY upgrading a read lock to a write lock.
pub(crate) struct SqliteStore {
    pool: SqlitePool,
    writer: Mutex<SqliteConnection>,
}

impl SqliteStore {
    pub(crate) async fn new(path: &str, pool_size: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{path}"))
            .map_err(err_ctx!(StoreError::Connect {
                path: path.to_owned()
            }))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(pool_size)
            .connect_with(options.clone())
            .await
            .map_err(err_ctx!(StoreError::Connect {
                path: path.to_owned()
            }))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(err_ctx!(StoreError::Migrate))?;

        let writer = options.connect().await.map_err(err_ctx!(StoreError::Connect {
            path: path.to_owned()
        }))?;

        Ok(Self {
            pool,
            writer: Mutex::new(writer),
        })
    }

    async fn read_in_conn(
        conn: &mut SqliteConnection,
        collection: &str,
        id: &str,
    ) -> Result<Option<Doc>> {
        let row = sqlx::query("select doc from documents where collection = ? and id = ?")
            .bind(collection)
            .bind(id)
            .fetch_optional(conn)
            .await
            .map_err(StoreError::from)?;

        row.map(|row| decode_doc(collection, id, row.get("doc")))
            .transpose()
    }
}

#[async_trait]
impl DocStore for SqliteStore {
    async fn read(&self, collection: &str, id: &str) -> Result<Option<Doc>> {
        let mut conn = self.pool.acquire().await.map_err(StoreError::from)?;
        Self::read_in_conn(&mut conn, collection, id).await
    }

    async fn transactional_update(
        &self,
        collection: &str,
        id: &str,
        apply: ApplyFn<'_>,
    ) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let mut tx = writer.begin().await.map_err(StoreError::from)?;

        match transact(&mut tx, collection, id, apply).await {
            Ok(()) => {
                tx.commit().await.map_err(StoreError::from)?;
                Ok(())
            }
            Err(err) => {
                // Dropping the transaction rolls it back
                debug!(err_id = %err.id(), collection, id, "Document update aborted");
                Err(err)
            }
        }
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        let deleted = sqlx::query("delete from documents where collection = ? and id = ?")
            .bind(collection)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)?;

        Ok(deleted.rows_affected() > 0)
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, Doc)>> {
        let rows = sqlx::query("select id, doc from documents where collection = ? order by id")
            .bind(collection)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::from)?;

        rows.into_iter()
            .map(|row| {
                let id: String = row.get("id");
                let doc = decode_doc(collection, &id, row.get("doc"))?;
                Ok((id, doc))
            })
            .collect()
    }
}

async fn transact(
    conn: &mut SqliteConnection,
    collection: &str,
    id: &str,
    apply: ApplyFn<'_>,
) -> Result<()> {
    let current = SqliteStore::read_in_conn(&mut *conn, collection, id).await?;

    match apply(current)? {
        Mutation::Keep => {}
        Mutation::Put(doc) => {
            sqlx::query(
                "insert into documents (collection, id, doc) values (?, ?, ?) \
                 on conflict (collection, id) do update set doc = excluded.doc",
            )
            .bind(collection)
            .bind(id)
            .bind(crate::encoding::to_json_string(&doc))
            .execute(conn)
            .await
            .map_err(StoreError::from)?;
        }
        Mutation::Delete => {
            sqlx::query("delete from documents where collection = ? and id = ?")
                .bind(collection)
                .bind(id)
                .execute(conn)
                .await
                .map_err(StoreError::from)?;
        }
    }

    Ok(())
}

fn decode_doc(collection: &str, id: &str, raw: String) -> Result<Doc> {
    serde_json::from_str(&raw).map_err(|source| {
        err!(StoreError::CorruptDoc {
            collection: collection.to_owned(),
            id: id.to_owned(),
            source,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn test_store(dir: &tempfile::TempDir) -> SqliteStore {
        let path = dir.path().join("test.sqlite");
        SqliteStore::new(path.to_str().unwrap(), 5).await.unwrap()
    }

    #[tokio::test]
    async fn update_creates_reads_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;

        store
            .transactional_update("users", "7", &mut |doc| {
                assert_eq!(doc, None);
                Ok(Mutation::Put(json!({ "tokens": 60, "model": "gpt-4o" })))
            })
            .await
            .unwrap();

        assert_eq!(
            store.read("users", "7").await.unwrap(),
            Some(json!({ "tokens": 60, "model": "gpt-4o" }))
        );

        assert!(store.delete("users", "7").await.unwrap());
        assert_eq!(store.read("users", "7").await.unwrap(), None);
    }

    #[tokio::test]
    async fn aborted_update_is_rolled_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;

        store
            .transactional_update("users", "7", &mut |_| {
                Ok(Mutation::Put(json!({ "tokens": 10 })))
            })
            .await
            .unwrap();

        let result = store
            .transactional_update("users", "7", &mut |_| {
                Err(crate::fatal!("transaction aborted on purpose"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(
            store.read("users", "7").await.unwrap(),
            Some(json!({ "tokens": 10 }))
        );
    }

    #[test_log::test(tokio::test)]
    async fn concurrent_updates_are_serialized() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(test_store(&dir).await);

        store
            .transactional_update("users", "7", &mut |_| Ok(Mutation::Put(json!({ "n": 0 }))))
            .await
            .unwrap();

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .transactional_update("users", "7", &mut |doc| {
                            let mut doc = doc.unwrap();
                            let n = doc["n"].as_i64().unwrap();
                            doc["n"] = json!(n + 1);
                            Ok(Mutation::Put(doc))
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(store.read("users", "7").await.unwrap(), Some(json!({ "n": 10 })));
    }

    #[test_log::test(tokio::test)]
    async fn concurrent_debits_never_double_spend() {
        use crate::billing::{DebitOutcome, Ledger};

        let dir = tempfile::tempdir().unwrap();
        let store: std::sync::Arc<dyn DocStore> = std::sync::Arc::new(test_store(&dir).await);
        let ledger = Ledger::new(store, 60);

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.debit(1, 5).await })
            })
            .collect();

        let mut charged = 0;
        for task in tasks {
            if let DebitOutcome::Charged { .. } = task.await.unwrap().unwrap() {
                charged += 1;
            }
        }

        // 60 tokens cover exactly 12 charges of 5
        assert_eq!(charged, 12);
        assert_eq!(ledger.balance(1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn list_is_scoped_to_the_collection() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;

        store
            .transactional_update("promocodes", "A", &mut |_| {
                Ok(Mutation::Put(json!({ "amount": 5, "uses_left": 2 })))
            })
            .await
            .unwrap();
        store
            .transactional_update("users", "1", &mut |_| Ok(Mutation::Put(json!({ "tokens": 1 }))))
            .await
            .unwrap();

        let promos = store.list("promocodes").await.unwrap();
        assert_eq!(promos.len(), 1);
        assert_eq!(promos[0].0, "A");
    }
}

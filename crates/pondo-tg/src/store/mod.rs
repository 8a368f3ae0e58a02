//! Document storage for user profiles and promo codes.
//!
//! The rest of the crate talks to storage only via the [`DocStore`] trait.
//! The backend is selected at startup from the `STORE_URL` env var:
//!
//! - `memory:` keeps everything in process memory (tests, throwaway runs)
//! - `sqlite:path/to/db.sqlite` uses an sqlite database file
//! - `path/to/state.json` uses a single JSON file rewritten on every commit

mod json_file;
mod memory;
mod sqlite;

pub(crate) use json_file::JsonFileStore;
pub(crate) use memory::MemoryStore;
pub(crate) use sqlite::SqliteStore;

use crate::prelude::*;
use crate::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

/// Collection of per-user profile documents, keyed by the user id.
pub(crate) const USERS: &str = "users";

/// Collection of promo code documents, keyed by the normalized code.
pub(crate) const PROMOCODES: &str = "promocodes";

/// A document is a free-form JSON object. The billing layer owns the schema.
pub(crate) type Doc = serde_json::Value;

/// What a transactional closure decided to do with the document it saw.
pub(crate) enum Mutation {
    /// Leave the document as it was (including "still absent").
    Keep,
    /// Write this version of the document.
    Put(Doc),
    /// Remove the document if it exists.
    Delete,
}

/// The closure invoked inside of [`DocStore::transactional_update`]. It sees
/// the current version of the document (or `None` if it doesn't exist) and
/// returns the mutation to apply. Returning an error aborts the transaction
/// and nothing is written.
pub(crate) type ApplyFn<'a> = &'a mut (dyn FnMut(Option<Doc>) -> Result<Mutation> + Send);

/// Minimal transactional document store interface. Every backend must make
/// `transactional_update` atomic per `(collection, id)` pair: concurrent
/// updates of the same document never interleave, and the closure always
/// observes the latest committed version.
#[async_trait]
pub(crate) trait DocStore: Send + Sync {
    async fn read(&self, collection: &str, id: &str) -> Result<Option<Doc>>;

    async fn transactional_update(
        &self,
        collection: &str,
        id: &str,
        apply: ApplyFn<'_>,
    ) -> Result<()>;

    async fn delete(&self, collection: &str, id: &str) -> Result<bool>;

    /// All documents of a collection as `(id, doc)` pairs, in unspecified order.
    async fn list(&self, collection: &str) -> Result<Vec<(String, Doc)>>;
}

fn default_pool_size() -> u32 {
    5
}

#[derive(Deserialize)]
pub(crate) struct Config {
    pub(crate) url: String,

    #[serde(default = "default_pool_size")]
    pub(crate) pool_size: u32,
}

/// Open the store backend designated by the config.
pub(crate) async fn init(config: &Config) -> Result<Arc<dyn DocStore>> {
    let url = config.url.as_str();

    if url == "memory:" {
        info!("Using the in-memory document store");
        return Ok(Arc::new(MemoryStore::default()));
    }

    if let Some(path) = url.strip_prefix("sqlite:") {
        info!(path, "Using the sqlite document store");
        return Ok(Arc::new(SqliteStore::new(path, config.pool_size).await?));
    }

    if url.ends_with(".json") {
        info!(path = url, "Using the JSON file document store");
        return Ok(Arc::new(JsonFileStore::load(url).await?));
    }

    Err(crate::err!(StoreError::UnsupportedUrl {
        url: url.to_owned()
    }))
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum StoreError {
    #[error("Failed to open the sqlite database at `{path}`")]
    Connect { path: String, source: sqlx::Error },

    #[error("Failed to run the database migrations")]
    Migrate {
        source: sqlx::migrate::MigrateError,
    },

    #[error("Database query failed")]
    Query {
        #[from]
        source: sqlx::Error,
    },

    #[error("Failed to load the state file `{path}`")]
    LoadFile {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to persist the state file `{path}`")]
    PersistFile {
        path: String,
        source: std::io::Error,
    },

    #[error("Document `{collection}/{id}` holds malformed JSON")]
    CorruptDoc {
        collection: String,
        id: String,
        source: serde_json::Error,
    },

    #[error(
        "Unsupported store URL `{url}`. Expected `memory:`, `sqlite:<path>` or a `*.json` path"
    )]
    UnsupportedUrl { url: String },
}

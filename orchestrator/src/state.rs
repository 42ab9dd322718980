use crate::db::{Db, SqliteStore};
use crate::store::ArtifactStore;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
}

impl AppState {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Artifact store scoped to one run.
    pub fn store_for(&self, run_id: Uuid) -> Arc<dyn ArtifactStore> {
        Arc::new(SqliteStore::new(self.db.clone(), run_id))
    }
}

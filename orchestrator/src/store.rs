//! Artifact store: the only state shared between proving units.
//!
//! Each key is written by exactly one unit. Readers never wait for a key; a missing artifact is
//! an immediate [`AppError::ArtifactMissing`].

use crate::errors::AppError;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::RwLock;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    /// Signed intervals and readings for one base emissions proof.
    IntervalBatch,
    Emissions,
    /// Customer records and claimed subtree root for one base shares proof.
    CustomerBatch,
    Shares,
    ClaimInput,
    Claim,
    Credentials,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::IntervalBatch => "interval-batch",
            Stage::Emissions => "emissions",
            Stage::CustomerBatch => "customer-batch",
            Stage::Shares => "shares",
            Stage::ClaimInput => "claim-input",
            Stage::Claim => "claim",
            Stage::Credentials => "credentials",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArtifactKey {
    pub stage: Stage,
    pub level: u32,
    pub index: u64,
}

impl ArtifactKey {
    pub fn new(stage: Stage, level: u32, index: u64) -> Self {
        Self { stage, level, index }
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.stage, self.level, self.index)
    }
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Write (or deterministically overwrite) one artifact.
    async fn put(&self, key: &ArtifactKey, bytes: Vec<u8>) -> Result<(), AppError>;

    async fn get(&self, key: &ArtifactKey) -> Result<Option<Vec<u8>>, AppError>;
}

pub async fn put_json<T: Serialize + ?Sized>(
    store: &dyn ArtifactStore,
    key: &ArtifactKey,
    value: &T,
) -> Result<(), AppError> {
    let bytes = serde_json::to_vec(value)?;
    store.put(key, bytes).await
}

pub async fn require_json<T: DeserializeOwned>(
    store: &dyn ArtifactStore,
    key: &ArtifactKey,
) -> Result<T, AppError> {
    let bytes = store
        .get(key)
        .await?
        .ok_or_else(|| AppError::ArtifactMissing(key.to_string()))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Process-local store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    artifacts: RwLock<HashMap<ArtifactKey, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.artifacts.read().await.len()
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn put(&self, key: &ArtifactKey, bytes: Vec<u8>) -> Result<(), AppError> {
        self.artifacts.write().await.insert(*key, bytes);
        Ok(())
    }

    async fn get(&self, key: &ArtifactKey) -> Result<Option<Vec<u8>>, AppError> {
        Ok(self.artifacts.read().await.get(key).cloned())
    }
}

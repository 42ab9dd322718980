//! Batch scheduler: base proofs over fixed-size batches, then pairwise merges level by level.
//!
//! Units within a level run concurrently (bounded by a semaphore); a level must finish
//! completely before the next one is submitted. Every unit reads its inputs from the artifact
//! store, proves on a blocking thread, re-verifies the proof against a freshly compiled key and
//! writes exactly one artifact.

use crate::errors::AppError;
use crate::models::{ClaimInput, CustomerBatchInput, IntervalBatchInput};
use crate::store::{ArtifactKey, ArtifactStore, Stage, put_json, require_json};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use zk_emissions::CarbonError;
use zk_emissions::programs::{EmissionsProgram, EmissionsWitness, SharesProgram, SharesWitness};
use zk_emissions::proof::{ProofOf, ProofSystem, Statement, prove_checked};
use zk_emissions::types::AggregateNode;
use zk_emissions::verifier::ClaimProgram;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnitOfWork {
    SharesBase { index: u64 },
    SharesStep { level: u32, index: u64 },
    EmissionsBase { index: u64 },
    EmissionsStep { level: u32, index: u64 },
    Claim { customer: u64 },
}

struct Inner<P> {
    system: P,
    store: Arc<dyn ArtifactStore>,
    shares: SharesProgram,
    emissions: EmissionsProgram,
    permits: Semaphore,
}

#[derive(Clone)]
pub struct BatchScheduler<P> {
    inner: Arc<Inner<P>>,
}

impl<P: ProofSystem + Clone + 'static> BatchScheduler<P> {
    pub fn new(
        system: P,
        store: Arc<dyn ArtifactStore>,
        shares: SharesProgram,
        emissions: EmissionsProgram,
        parallelism: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                system,
                store,
                shares,
                emissions,
                permits: Semaphore::new(parallelism.max(1)),
            }),
        }
    }

    pub fn output_key(&self, unit: &UnitOfWork) -> ArtifactKey {
        match *unit {
            UnitOfWork::SharesBase { index } => {
                ArtifactKey::new(Stage::Shares, self.inner.shares.base_level(), index)
            }
            UnitOfWork::SharesStep { level, index } => ArtifactKey::new(Stage::Shares, level, index),
            UnitOfWork::EmissionsBase { index } => ArtifactKey::new(Stage::Emissions, 0, index),
            UnitOfWork::EmissionsStep { level, index } => ArtifactKey::new(Stage::Emissions, level, index),
            UnitOfWork::Claim { customer } => ArtifactKey::new(Stage::Claim, 0, customer),
        }
    }

    /// Start one unit. It waits for a permit, then runs to completion or failure.
    pub fn submit(&self, unit: UnitOfWork) -> JoinHandle<Result<ArtifactKey, AppError>> {
        let this = self.clone();
        tokio::spawn(async move {
            let _permit = this
                .inner
                .permits
                .acquire()
                .await
                .map_err(|e| AppError::Scheduler(e.to_string()))?;
            this.execute(unit).await
        })
    }

    /// Barrier: submit every unit of a level and wait for all of them.
    ///
    /// All units are awaited even after a failure; the first error is returned and the level
    /// counts as incomplete.
    pub async fn run_level(&self, units: Vec<UnitOfWork>) -> Result<Vec<ArtifactKey>, AppError> {
        let handles: Vec<_> = units.into_iter().map(|u| (u, self.submit(u))).collect();

        let mut keys = Vec::with_capacity(handles.len());
        let mut first_error = None;
        for (unit, handle) in handles {
            match handle.await {
                Ok(Ok(key)) => keys.push(key),
                Ok(Err(e)) => {
                    tracing::error!(?unit, error = %e, "unit failed");
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    tracing::error!(?unit, error = %e, "unit panicked or was cancelled");
                    first_error.get_or_insert(AppError::Join(e));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(keys),
        }
    }

    /// Emissions phases over `batches` base batches. Returns the key of the final proof.
    pub async fn prove_total_emissions(&self, batches: u64) -> Result<ArtifactKey, AppError> {
        if !batches.is_power_of_two() {
            return Err(CarbonError::UnsupportedConfiguration(format!(
                "{batches} emissions batches cannot be merged pairwise"
            ))
            .into());
        }

        info!(stage = %Stage::Emissions, batches, "base level");
        let mut keys = self
            .run_level((0..batches).map(|index| UnitOfWork::EmissionsBase { index }).collect())
            .await?;

        let mut level = 0u32;
        let mut width = batches;
        while width > 1 {
            level += 1;
            width /= 2;
            info!(stage = %Stage::Emissions, level, width, "merge level");
            keys = self
                .run_level((0..width).map(|index| UnitOfWork::EmissionsStep { level, index }).collect())
                .await?;
        }

        keys.pop()
            .ok_or_else(|| AppError::Scheduler("emissions phase produced no proof".into()))
    }

    /// Shares phases over `batches` base batches, up to the tree root.
    pub async fn prove_customer_shares(&self, batches: u64) -> Result<ArtifactKey, AppError> {
        let shares = &self.inner.shares;
        let leaves = 1u64 << shares.root_level();
        if batches * shares.batch_size() as u64 != leaves {
            return Err(CarbonError::UnsupportedConfiguration(format!(
                "{batches} batches of {} do not cover {leaves} leaves",
                shares.batch_size()
            ))
            .into());
        }

        info!(stage = %Stage::Shares, batches, level = shares.base_level(), "base level");
        let mut keys = self
            .run_level((0..batches).map(|index| UnitOfWork::SharesBase { index }).collect())
            .await?;

        let mut width = batches;
        for level in shares.base_level() + 1..=shares.root_level() {
            width /= 2;
            info!(stage = %Stage::Shares, level, width, "merge level");
            keys = self
                .run_level((0..width).map(|index| UnitOfWork::SharesStep { level, index }).collect())
                .await?;
        }

        keys.pop()
            .ok_or_else(|| AppError::Scheduler("shares phase produced no proof".into()))
    }

    async fn execute(&self, unit: UnitOfWork) -> Result<ArtifactKey, AppError> {
        let key = self.output_key(&unit);
        let store = &*self.inner.store;

        match unit {
            UnitOfWork::SharesBase { index } => {
                let input: CustomerBatchInput =
                    require_json(store, &ArtifactKey::new(Stage::CustomerBatch, 0, index)).await?;
                let witness = SharesWitness::Base { records: input.records };
                let proof = self.prove(self.inner.shares, input.root, witness).await?;
                put_json(store, &key, &proof).await?;
            }
            UnitOfWork::SharesStep { level, index } => {
                let (left, right): (ProofOf<SharesProgram>, _) =
                    self.children(Stage::Shares, level, index).await?;
                let parent = AggregateNode::combine(&left.public_input, &right.public_input)?;
                let proof = self
                    .prove(self.inner.shares, parent, SharesWitness::Step { left, right })
                    .await?;
                put_json(store, &key, &proof).await?;
            }
            UnitOfWork::EmissionsBase { index } => {
                let input: IntervalBatchInput =
                    require_json(store, &ArtifactKey::new(Stage::IntervalBatch, 0, index)).await?;
                let witness = EmissionsWitness::Base {
                    intensities: input.batch.intensities,
                    grid_operator_pk: input.grid_operator_pk,
                    readings: input.batch.readings,
                    meter_pk: input.meter_pk,
                };
                let proof = self.prove(self.inner.emissions, (), witness).await?;
                put_json(store, &key, &proof).await?;
            }
            UnitOfWork::EmissionsStep { level, index } => {
                let (left, right): (ProofOf<EmissionsProgram>, _) =
                    self.children(Stage::Emissions, level, index).await?;
                let proof = self
                    .prove(self.inner.emissions, (), EmissionsWitness::Step { left, right })
                    .await?;
                put_json(store, &key, &proof).await?;
            }
            UnitOfWork::Claim { customer } => {
                let input: ClaimInput =
                    require_json(store, &ArtifactKey::new(Stage::ClaimInput, 0, customer)).await?;
                let program = ClaimProgram {
                    shares: self.inner.shares,
                    emissions: self.inner.emissions,
                };
                let proof = self.prove(program, input.public, input.private).await?;
                put_json(store, &key, &proof).await?;
            }
        }

        debug!(stage = %key.stage, level = key.level, index = key.index, "artifact written");
        Ok(key)
    }

    async fn children<T: serde::de::DeserializeOwned>(
        &self,
        stage: Stage,
        level: u32,
        index: u64,
    ) -> Result<(T, T), AppError> {
        let store = &*self.inner.store;
        let below = level
            .checked_sub(1)
            .ok_or_else(|| AppError::Scheduler(format!("{stage} step at level 0")))?;
        let left = require_json(store, &ArtifactKey::new(stage, below, 2 * index)).await?;
        let right = require_json(store, &ArtifactKey::new(stage, below, 2 * index + 1)).await?;
        Ok((left, right))
    }

    /// Prove and self-verify on a blocking thread.
    async fn prove<S>(
        &self,
        statement: S,
        public: S::PublicInput,
        private: S::PrivateInput,
    ) -> Result<ProofOf<S>, AppError>
    where
        S: Statement + Send + 'static,
        S::PrivateInput: Send + 'static,
    {
        let system = self.inner.system.clone();
        let proof = tokio::task::spawn_blocking(move || prove_checked(&system, &statement, public, &private))
            .await??;
        Ok(proof)
    }
}

//! Prover and verifier pipelines.

use crate::config::RunConfig;
use crate::dataset::{self, Stream, rng_for};
use crate::db;
use crate::errors::AppError;
use crate::models::{
    ClaimInput, CustomerBatchInput, IntervalBatchInput, PublishedCredentials, RunStatus, RunSummary,
    VerifyReport,
};
use crate::scheduler::{BatchScheduler, UnitOfWork};
use crate::state::AppState;
use crate::store::{ArtifactKey, ArtifactStore, Stage, put_json, require_json};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;
use zk_emissions::CarbonError;
use zk_emissions::ledger;
use zk_emissions::programs::{EmissionsProgram, SharesProgram};
use zk_emissions::proof::{ProofOf, ProofSystem, TranscriptSystem};
use zk_emissions::tree::MerkleSumTree;
use zk_emissions::types::fr_to_hex;
use zk_emissions::verifier::{
    ClaimProgram, CompositionVerifier, EntityClaimWitness, PublicEntityRecord, allocate_emissions,
    verify_claim_proof,
};

/// Generate one reporting period, prove it and issue claim proofs, writing everything to `store`.
pub async fn prove_period<P: ProofSystem + Clone + 'static>(
    system: P,
    store: Arc<dyn ArtifactStore>,
    config: &RunConfig,
) -> Result<RunSummary, AppError> {
    config.validate()?;
    let (shares, emissions) = config.programs()?;
    let bounds = shares.bounds();
    let (period_start, period_end) = (config.period_start, config.period_end());

    let provisioned = dataset::provision_keys(&mut rng_for(config.seed, Stream::Keys))?;
    let trusted = provisioned.chain.verify(&provisioned.anchors)?;
    let grid = provisioned.registry.get(&provisioned.roles.grid_operator)?;
    let meter = provisioned.registry.get(&provisioned.roles.meter)?;

    let scheduler = BatchScheduler::new(system, store.clone(), shares, emissions, config.parallelism);

    // Emissions: sign the feed and the meter series, then prove.
    let intensities: Vec<_> = dataset::generate_intensity_feed(
        &mut rng_for(config.seed, Stream::Intensity),
        config.intervals,
        period_start,
    )
    .into_iter()
    .map(|f| grid.sign(f))
    .collect();
    let readings: Vec<_> = dataset::generate_readings(
        &mut rng_for(config.seed, Stream::Readings),
        config.intervals,
        period_start,
    )
    .into_iter()
    .map(|r| meter.sign(r))
    .collect();

    let batches = ledger::partition(&intensities, &readings, config.interval_batch)?;
    let emission_batches = batches.len() as u64;
    for (k, batch) in batches.into_iter().enumerate() {
        let input = IntervalBatchInput {
            batch,
            grid_operator_pk: grid.public_key(),
            meter_pk: meter.public_key(),
        };
        put_json(&*store, &ArtifactKey::new(Stage::IntervalBatch, 0, k as u64), &input).await?;
    }

    let emissions_key = scheduler.prove_total_emissions(emission_batches).await?;
    let emissions_proof: ProofOf<EmissionsProgram> = require_json(&*store, &emissions_key).await?;
    let total = emissions_proof.public_output.total_emissions;
    info!(total_emissions = %total, period_start, period_end, "emissions proved");

    // Shares: build the tree, hand each batch its subtree root, then prove up to the root.
    let customers = dataset::generate_customers(
        &mut rng_for(config.seed, Stream::Customers),
        config.customers,
        period_start,
        period_end,
        &bounds,
    )?;
    let tree = MerkleSumTree::from_customers(shares.tree_height(), &customers, bounds)?;

    let batch = shares.batch_size() as u64;
    let share_batches = tree.leaf_count() / batch;
    for k in 0..share_batches {
        let records = (k * batch..(k + 1) * batch)
            .map(|i| customers.get(i as usize).cloned())
            .collect();
        let input = CustomerBatchInput {
            root: tree.node(shares.base_level() as usize, k),
            records,
        };
        put_json(&*store, &ArtifactKey::new(Stage::CustomerBatch, 0, k), &input).await?;
    }

    let shares_key = scheduler.prove_customer_shares(share_batches).await?;
    let shares_proof: ProofOf<SharesProgram> = require_json(&*store, &shares_key).await?;
    if shares_proof.public_input != tree.root() {
        return Err(CarbonError::Consistency("composed root differs from the tree root".into()).into());
    }
    let tree_root_hex = fr_to_hex(&tree.root().content_hash);
    info!(root = %tree_root_hex, height = tree.height(), "shares proved");

    let allocations = allocate_emissions(total, &customers)?;

    let credentials = PublishedCredentials {
        anchors: provisioned.anchors,
        grid_operator_pk: trusted.grid_operator,
        meter_pk: trusted.meter,
        tree_root: tree.root().content_hash,
    };
    put_json(&*store, &ArtifactKey::new(Stage::Credentials, 0, 0), &credentials).await?;

    // Per-customer claims.
    for (i, (customer, emissions)) in customers.iter().zip(&allocations).enumerate().take(config.claims) {
        let index = i as u64;
        tree.validate(index)?;
        let public = PublicEntityRecord {
            invoice: customer.invoice,
            emissions: *emissions,
            meter_ca_pk: provisioned.anchors.meter_ca,
            grid_ca_pk: provisioned.anchors.grid_ca,
            tree_root_hash: tree.root().content_hash,
            meter_pk: trusted.meter,
            grid_operator_pk: trusted.grid_operator,
        };
        let private = EntityClaimWitness {
            customer: customer.clone(),
            witness: tree.witness(index)?,
            emissions_proof: emissions_proof.clone(),
            shares_proof: shares_proof.clone(),
            chain: provisioned.chain.clone(),
        };
        put_json(&*store, &ArtifactKey::new(Stage::ClaimInput, 0, index), &ClaimInput { public, private })
            .await?;
    }
    scheduler
        .run_level(
            (0..config.claims as u64)
                .map(|customer| UnitOfWork::Claim { customer })
                .collect(),
        )
        .await?;
    info!(claims = config.claims, "claim proofs issued");

    Ok(RunSummary {
        run_id: None,
        customers: customers.len(),
        tree_height: tree.height(),
        tree_root_hex,
        total_emissions: total,
        period_start,
        period_end,
        claims_issued: config.claims,
    })
}

/// Check one customer's claim. A failed check is a rejection in the report; only storage and
/// decoding problems are errors.
pub async fn verify_customer<P: ProofSystem>(
    system: &P,
    store: &dyn ArtifactStore,
    config: &RunConfig,
    customer: u64,
    full: bool,
) -> Result<VerifyReport, AppError> {
    let (shares, emissions) = config.programs()?;
    let program = ClaimProgram { shares, emissions };

    let credentials: PublishedCredentials =
        require_json(store, &ArtifactKey::new(Stage::Credentials, 0, 0)).await?;
    let proof: ProofOf<ClaimProgram> = require_json(store, &ArtifactKey::new(Stage::Claim, 0, customer)).await?;
    let private = if full {
        let input: ClaimInput = require_json(store, &ArtifactKey::new(Stage::ClaimInput, 0, customer)).await?;
        Some(input.private)
    } else {
        None
    };

    let outcome = (|| -> Result<u128, CarbonError> {
        let record = verify_claim_proof(
            system,
            &program,
            &proof,
            &credentials.anchors,
            &credentials.trusted_keys(),
        )?;
        if record.invoice.customer_id != customer {
            return Err(CarbonError::InvoiceMismatch(format!(
                "claim stored for customer {customer} names customer {}",
                record.invoice.customer_id
            )));
        }
        if record.tree_root_hash != credentials.tree_root {
            return Err(CarbonError::WitnessRootMismatch);
        }
        if let Some(private) = &private {
            CompositionVerifier::new(system, &shares, &emissions).check(&record, private)?;
        }
        Ok(record.emissions)
    })();

    let report = match outcome {
        Ok(emissions) => {
            info!(customer, %emissions, full, "claim accepted");
            VerifyReport {
                run_id: None,
                customer,
                accepted: true,
                full_replay: full,
                emissions: Some(emissions),
                rejection: None,
            }
        }
        Err(e) => {
            warn!(customer, error = %e, "claim rejected");
            VerifyReport {
                run_id: None,
                customer,
                accepted: false,
                full_replay: full,
                emissions: None,
                rejection: Some(e.to_string()),
            }
        }
    };
    Ok(report)
}

/// Record a run, prove it, and mark it ready or failed.
pub async fn run_prover(state: &AppState, config: &RunConfig) -> Result<RunSummary, AppError> {
    let run_id = Uuid::new_v4();
    db::insert_run(&state.db, run_id, config).await?;
    info!(%run_id, customers = config.customers, intervals = config.intervals, "starting run");

    match prove_period(TranscriptSystem, state.store_for(run_id), config).await {
        Ok(mut summary) => {
            db::set_run_ready(&state.db, run_id, &summary.tree_root_hex, summary.total_emissions).await?;
            summary.run_id = Some(run_id);
            info!(%run_id, "run ready");
            Ok(summary)
        }
        Err(e) => {
            let _ = db::set_run_failed(&state.db, run_id, &format!("{e}")).await;
            Err(e)
        }
    }
}

pub async fn run_verifier(
    state: &AppState,
    run_id: Uuid,
    customer: u64,
    full: bool,
) -> Result<VerifyReport, AppError> {
    let run = db::get_run(&state.db, run_id)
        .await?
        .ok_or(AppError::RunNotFound(run_id))?;
    if run.status != RunStatus::Ready {
        let status = match &run.error {
            Some(error) => format!("{} ({error})", run.status.as_str()),
            None => run.status.as_str().to_owned(),
        };
        return Err(AppError::RunNotReady { run_id, status });
    }
    info!(
        %run_id,
        created_at = %run.created_at,
        root = run.tree_root_hex.as_deref().unwrap_or_default(),
        total_emissions = ?run.total_emissions,
        customer,
        "verifying claim"
    );

    let store = state.store_for(run_id);
    let mut report = verify_customer(&TranscriptSystem, &*store, &run.config, customer, full).await?;
    report.run_id = Some(run_id);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use zk_emissions::constants::SHARE_TOTAL;

    fn config() -> RunConfig {
        RunConfig {
            customers: 6,
            customer_batch: 2,
            intervals: 8,
            interval_batch: 2,
            period_start: 1_750_334_400,
            seed: 9,
            claims: 3,
            parallelism: 4,
        }
    }

    #[tokio::test]
    async fn issued_claims_verify() {
        let store = Arc::new(MemoryStore::new());
        let summary = prove_period(TranscriptSystem, store.clone(), &config()).await.unwrap();
        assert_eq!(summary.tree_height, 4);
        assert_eq!(summary.claims_issued, 3);

        let mut sum = 0u128;
        for customer in 0..3 {
            let report = verify_customer(&TranscriptSystem, &*store, &config(), customer, true)
                .await
                .unwrap();
            assert!(report.accepted, "{:?}", report.rejection);
            sum += report.emissions.unwrap();
        }
        assert!(sum < summary.total_emissions * SHARE_TOTAL);

        let err = verify_customer(&TranscriptSystem, &*store, &config(), 4, false).await.unwrap_err();
        assert!(matches!(err, AppError::ArtifactMissing(_)));
    }

    #[tokio::test]
    async fn tampered_claim_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        prove_period(TranscriptSystem, store.clone(), &config()).await.unwrap();

        let key = ArtifactKey::new(Stage::Claim, 0, 1);
        let mut proof: ProofOf<ClaimProgram> = require_json(&*store, &key).await.unwrap();
        proof.public_input.emissions += 1;
        put_json(&*store, &key, &proof).await.unwrap();

        let report = verify_customer(&TranscriptSystem, &*store, &config(), 1, false).await.unwrap();
        assert!(!report.accepted);
        assert!(report.rejection.unwrap().contains("customer-emissions-claim"));
    }

    #[tokio::test]
    async fn verifier_shape_must_match_prover_shape() {
        let store = Arc::new(MemoryStore::new());
        prove_period(TranscriptSystem, store.clone(), &config()).await.unwrap();

        let other = RunConfig { customer_batch: 4, ..config() };
        let report = verify_customer(&TranscriptSystem, &*store, &other, 0, false).await.unwrap();
        assert!(!report.accepted);
    }

    #[tokio::test]
    async fn run_lifecycle_through_database() {
        let db = db::connect_in_memory().await.unwrap();
        db::init_schema(&db).await.unwrap();
        let state = AppState::new(db);

        let summary = run_prover(&state, &config()).await.unwrap();
        let run_id = summary.run_id.unwrap();
        let run = db::get_run(&state.db, run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Ready);
        assert_eq!(run.total_emissions, Some(summary.total_emissions));
        assert_eq!(run.tree_root_hex.as_deref(), Some(summary.tree_root_hex.as_str()));

        let report = run_verifier(&state, run_id, 2, true).await.unwrap();
        assert!(report.accepted);
        assert_eq!(report.run_id, Some(run_id));

        assert!(matches!(
            run_verifier(&state, Uuid::new_v4(), 0, false).await,
            Err(AppError::RunNotFound(_))
        ));
    }

    #[tokio::test]
    async fn failed_run_is_recorded() {
        let db = db::connect_in_memory().await.unwrap();
        db::init_schema(&db).await.unwrap();
        let state = AppState::new(db);

        let bad = RunConfig { claims: 7, ..config() };
        assert!(matches!(run_prover(&state, &bad).await, Err(AppError::Config(_))));

        let status: Vec<String> = sqlx::query_scalar("SELECT status FROM runs")
            .fetch_all(&state.db)
            .await
            .unwrap();
        assert_eq!(status, vec!["failed".to_string()]);
    }
}

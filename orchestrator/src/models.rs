use crate::config::RunConfig;
use ark_bn254::Fr;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zk_emissions::ledger::IntervalBatch;
use zk_emissions::trust::{PublicKey, TrustAnchors, TrustedKeys};
use zk_emissions::types::{AggregateNode, Customer, fr_hex};
use zk_emissions::verifier::{EntityClaimWitness, PublicEntityRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Generating,
    Ready,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Generating => "generating",
            RunStatus::Ready => "ready",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "generating" => RunStatus::Generating,
            "ready" => RunStatus::Ready,
            _ => RunStatus::Failed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub config: RunConfig,
    pub status: RunStatus,
    pub tree_root_hex: Option<String>,
    pub total_emissions: Option<u128>,
    pub error: Option<String>,
}

/// Input of one base shares unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerBatchInput {
    /// Subtree root the batch must rebuild to.
    pub root: AggregateNode,
    pub records: Vec<Option<Customer>>,
}

/// Input of one base emissions unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalBatchInput {
    pub batch: IntervalBatch,
    pub grid_operator_pk: PublicKey,
    pub meter_pk: PublicKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimInput {
    pub public: PublicEntityRecord,
    pub private: EntityClaimWitness,
}

/// What the operator publishes for auditors once a run is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedCredentials {
    pub anchors: TrustAnchors,
    pub grid_operator_pk: PublicKey,
    pub meter_pk: PublicKey,
    #[serde(with = "fr_hex")]
    pub tree_root: Fr,
}

impl PublishedCredentials {
    pub fn trusted_keys(&self) -> TrustedKeys {
        TrustedKeys {
            grid_operator: self.grid_operator_pk,
            meter: self.meter_pk,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Option<Uuid>,
    pub customers: usize,
    pub tree_height: usize,
    pub tree_root_hex: String,
    pub total_emissions: u128,
    pub period_start: u64,
    pub period_end: u64,
    pub claims_issued: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyReport {
    pub run_id: Option<Uuid>,
    pub customer: u64,
    pub accepted: bool,
    pub full_replay: bool,
    pub emissions: Option<u128>,
    pub rejection: Option<String>,
}

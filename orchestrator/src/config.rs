use crate::errors::AppError;
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;
use zk_emissions::constants::{
    DEFAULT_CUSTOMER_BATCH_SIZE, DEFAULT_INTERVAL_BATCH_SIZE, DEFAULT_NUM_CUSTOMERS,
    DEFAULT_NUM_INTERVALS, INTERVAL_SECONDS,
};
use zk_emissions::programs::{EmissionsProgram, SharesProgram};
use zk_emissions::tree::MerkleSumTree;
use zk_emissions::types::RatioBounds;

#[derive(Debug, Parser)]
#[command(name = "carbon-ledger", version, about = "Prove and verify per-customer carbon emission claims")]
pub struct Cli {
    /// Directory holding the ledger database.
    #[arg(long, env = "LEDGER_DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    /// SQLite URL; defaults to `ledger.sqlite` under the data directory.
    #[arg(long, env = "LEDGER_DATABASE_URL")]
    pub database_url: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn database_url(&self) -> String {
        self.database_url.clone().unwrap_or_else(|| {
            let db_path = self.data_dir.join("ledger.sqlite");
            format!("sqlite:{}", db_path.to_string_lossy())
        })
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Generate a reporting period, prove it end to end and issue claim proofs.
    Prove(ProveArgs),
    /// Check one customer's claim from a finished run.
    Verify(VerifyArgs),
}

#[derive(Debug, Clone, Args)]
pub struct ProveArgs {
    #[arg(long, default_value_t = DEFAULT_NUM_CUSTOMERS)]
    pub customers: usize,

    /// Leaves per base shares proof (power of two).
    #[arg(long, default_value_t = DEFAULT_CUSTOMER_BATCH_SIZE)]
    pub customer_batch: usize,

    /// Half-hour intervals in the period.
    #[arg(long, default_value_t = DEFAULT_NUM_INTERVALS)]
    pub intervals: usize,

    #[arg(long, default_value_t = DEFAULT_INTERVAL_BATCH_SIZE)]
    pub interval_batch: usize,

    /// Start of the reporting period (RFC 3339).
    #[arg(long, default_value = "2025-06-19T12:00:00Z")]
    pub period_start: DateTime<Utc>,

    #[arg(long, default_value_t = 0)]
    pub seed: u64,

    /// Issue claim proofs for the first N customers only.
    #[arg(long)]
    pub claims: Option<usize>,

    /// Concurrent proving units (defaults to available parallelism).
    #[arg(long)]
    pub parallelism: Option<usize>,

    /// Keep artifacts in memory and do not record the run.
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
}

impl ProveArgs {
    pub fn into_config(self) -> Result<RunConfig, AppError> {
        let period_start = u64::try_from(self.period_start.timestamp())
            .map_err(|_| AppError::Config("period start must not precede 1970".into()))?;

        let config = RunConfig {
            customers: self.customers,
            customer_batch: self.customer_batch,
            intervals: self.intervals,
            interval_batch: self.interval_batch,
            period_start,
            seed: self.seed,
            claims: self.claims.unwrap_or(self.customers),
            parallelism: self.parallelism.unwrap_or_else(default_parallelism),
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Args)]
pub struct VerifyArgs {
    #[arg(long)]
    pub run_id: Uuid,

    /// Customer (leaf index) whose claim is checked.
    #[arg(long)]
    pub customer: u64,

    /// Also replay the full composition from the stored private record.
    #[arg(long, default_value_t = false)]
    pub full: bool,
}

pub fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Parameters of one reporting-period run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub customers: usize,
    pub customer_batch: usize,
    pub intervals: usize,
    pub interval_batch: usize,
    /// Unix seconds.
    pub period_start: u64,
    pub seed: u64,
    pub claims: usize,
    pub parallelism: usize,
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.customers == 0 {
            return Err(AppError::Config("at least one customer is required".into()));
        }
        if !self.customer_batch.is_power_of_two() {
            return Err(AppError::Config(format!(
                "customer batch {} is not a power of two",
                self.customer_batch
            )));
        }
        if self.interval_batch == 0 || self.intervals == 0 || self.intervals % self.interval_batch != 0 {
            return Err(AppError::Config(format!(
                "{} intervals do not split into batches of {}",
                self.intervals, self.interval_batch
            )));
        }
        let batches = self.intervals / self.interval_batch;
        if !batches.is_power_of_two() {
            return Err(AppError::Config(format!(
                "{batches} interval batches is not a power of two"
            )));
        }
        if self.claims > self.customers {
            return Err(AppError::Config(format!(
                "cannot issue {} claims for {} customers",
                self.claims, self.customers
            )));
        }
        if self.parallelism == 0 {
            return Err(AppError::Config("parallelism must be positive".into()));
        }
        Ok(())
    }

    pub fn period_end(&self) -> u64 {
        self.period_start + self.intervals as u64 * INTERVAL_SECONDS
    }

    /// Tree height: enough leaves for every customer and at least one full batch.
    pub fn tree_height(&self) -> usize {
        MerkleSumTree::height_for(self.customers.max(self.customer_batch))
    }

    /// Programs for this run. Their shape fixes the verification keys.
    pub fn programs(&self) -> Result<(SharesProgram, EmissionsProgram), AppError> {
        let shares = SharesProgram::new(self.customer_batch, self.tree_height(), RatioBounds::default())?;
        let emissions = EmissionsProgram::new(self.interval_batch)?;
        Ok((shares, emissions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("carbon-ledger").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn prove_defaults_match_constants() {
        let cli = parse(&["--data-dir", "/tmp/ledger", "prove"]);
        assert_eq!(cli.database_url(), "sqlite:/tmp/ledger/ledger.sqlite");
        let Command::Prove(args) = cli.command else {
            panic!("expected prove");
        };
        let config = args.into_config().unwrap();
        assert_eq!(config.customers, 128);
        assert_eq!(config.customer_batch, 16);
        assert_eq!(config.intervals / config.interval_batch, 16);
        assert_eq!(config.claims, 128);
        assert_eq!(config.period_end() - config.period_start, 30 * 24 * 3_600);
        assert_eq!(config.tree_height(), 8);
    }

    #[test]
    fn unbalanced_interval_batches_are_rejected() {
        let cli = parse(&["prove", "--intervals", "1440", "--interval-batch", "120"]);
        let Command::Prove(args) = cli.command else {
            panic!("expected prove");
        };
        assert!(matches!(args.into_config(), Err(AppError::Config(_))));
    }

    #[test]
    fn small_customer_set_still_fills_a_batch() {
        let config = RunConfig {
            customers: 3,
            customer_batch: 8,
            intervals: 4,
            interval_batch: 2,
            period_start: 0,
            seed: 1,
            claims: 3,
            parallelism: 2,
        };
        config.validate().unwrap();
        assert_eq!(config.tree_height(), 4);
        let (shares, _) = config.programs().unwrap();
        assert_eq!(shares.base_level(), shares.root_level());
    }

    #[test]
    fn verify_requires_run_and_customer() {
        let cli = parse(&[
            "verify",
            "--run-id",
            "6f1c9a4e-3c2b-4d52-9b55-0e1f5c2a7d10",
            "--customer",
            "5",
        ]);
        let Command::Verify(args) = cli.command else {
            panic!("expected verify");
        };
        assert_eq!(args.customer, 5);
        assert!(!args.full);
    }
}

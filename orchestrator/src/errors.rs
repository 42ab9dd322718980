use thiserror::Error;
use uuid::Uuid;
use zk_emissions::CarbonError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Carbon(#[from] CarbonError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("artifact {0} not found")]
    ArtifactMissing(String),

    #[error("run {0} not found")]
    RunNotFound(Uuid),

    #[error("run {run_id} is {status}, not ready")]
    RunNotReady { run_id: Uuid, status: String },

    #[error("scheduler stopped: {0}")]
    Scheduler(String),

    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

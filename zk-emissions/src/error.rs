use thiserror::Error;

/// Every failure the aggregation and composition layer can raise.
///
/// All variants are fatal to the unit of work that detected them. Nothing here is retried or
/// downgraded; a verifier maps any of them to a rejection of the whole claim.
#[derive(Debug, Error)]
pub enum CarbonError {
    #[error("leaf index {index} is out of range for {leaf_count} leaves")]
    IndexOutOfRange { index: u64, leaf_count: u64 },

    #[error("tree consistency violated: {0}")]
    Consistency(String),

    #[error("tree is sealed; leaf writes are no longer accepted")]
    TreeSealed,

    #[error("signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("temporal chain broken at interval {index}: {reason}")]
    TemporalChainBroken { index: usize, reason: String },

    #[error("meter counter went backwards between readings {index} and {}", .index + 1)]
    MeterRegression { index: usize },

    #[error("share total mismatch: expected {expected}, got {got}")]
    ShareTotalMismatch { expected: u128, got: u128 },

    #[error("proof verification failed for statement {statement}")]
    ProofVerificationFailed { statement: String },

    #[error("statement {statement} unsatisfied: {reason}")]
    StatementUnsatisfied { statement: &'static str, reason: String },

    #[error("customer {customer_id} share/cost ratio outside [{lower}, {upper}]")]
    RatioOutOfBand { customer_id: u64, lower: u128, upper: u128 },

    #[error("value out of range: {0}")]
    ValueOutOfRange(String),

    #[error("key binding mismatch: {0}")]
    KeyBindingMismatch(String),

    #[error("invoice mismatch: {0}")]
    InvoiceMismatch(String),

    #[error("witness does not reproduce the committed tree root")]
    WitnessRootMismatch,

    #[error("claimed emissions {claimed} do not equal total x share = {expected}")]
    EmissionsMismatch { claimed: u128, expected: u128 },

    #[error("period mismatch: emissions cover [{emissions_from}, {emissions_to}], invoice bills [{invoice_from}, {invoice_to}]")]
    PeriodMismatch {
        emissions_from: u64,
        emissions_to: u64,
        invoice_from: u64,
        invoice_to: u64,
    },

    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    #[error("arithmetic overflow while computing {0}")]
    Overflow(&'static str),

    #[error("serialization error: {0}")]
    Serialization(String),
}

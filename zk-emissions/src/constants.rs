//! Crate-wide constants used by the proof programs and host-side orchestration.

use ark_bn254::Fr;
use ark_crypto_primitives::sponge::poseidon::{PoseidonConfig, PoseidonSponge, find_poseidon_ark_and_mds};
use ark_crypto_primitives::sponge::CryptographicSponge;
use ark_ff::PrimeField;
use std::sync::OnceLock;

/// Fixed global total that all customer share allocations must add up to.
///
/// 100(%) is far too coarse for a large customer base, so shares are expressed as fractions of
/// 2^64. Every per-customer fraction is then an exact integer.
pub const SHARE_TOTAL: u128 = 1 << 64;

/// Lower bound of the acceptable shares-per-cost-unit ratio.
///
/// With 2^64 shares spread over a revenue of roughly 2^30 cents per period, honest data sits a
/// few powers of two around this band.
pub const RATIO_LOWER_BOUND: u128 = 1 << 23;

/// Upper bound of the acceptable shares-per-cost-unit ratio.
pub const RATIO_UPPER_BOUND: u128 = 1 << 25;

/// Resource charges (cents) below which a customer counts as negligible.
pub const COST_NEGLIGIBLE_THRESHOLD: u128 = 1 << 6;

/// Share allocation below which a customer counts as negligible.
///
/// The ratio band is only skipped when BOTH cost and share are below their thresholds.
pub const SHARE_NEGLIGIBLE_THRESHOLD: u128 = 1 << 40;

/// Length of the secret per-customer nonce mixed into the leaf hash.
pub const NONCE_LEN: usize = 24;

/// Default number of customers in a synthetic reporting period.
pub const DEFAULT_NUM_CUSTOMERS: usize = 128;

/// Default number of leaves proved together by one base shares statement.
pub const DEFAULT_CUSTOMER_BATCH_SIZE: usize = 16;

/// Default number of half-hourly intervals in a reporting period (30 days).
pub const DEFAULT_NUM_INTERVALS: usize = 1440;

/// Default number of intervals proved together by one base emissions statement.
///
/// Must divide the interval count into a power-of-two number of batches: 1440 / 90 = 16.
pub const DEFAULT_INTERVAL_BATCH_SIZE: usize = 90;

/// Length of one carbon-intensity interval, in seconds.
pub const INTERVAL_SECONDS: u64 = 30 * 60;

// Poseidon sponge configuration.
//
// A width-3 sponge (rate=2, capacity=1) absorbs the two child hashes of an internal node in a
// single permutation.
pub const POSEIDON_RATE: usize = 2;
pub const POSEIDON_CAPACITY: usize = 1;

pub const POSEIDON_FULL_ROUNDS: usize = 8;
pub const POSEIDON_PARTIAL_ROUNDS: usize = 57;

/// Poseidon S-box exponent (alpha).
pub const POSEIDON_ALPHA: u64 = 5;

static POSEIDON: OnceLock<PoseidonConfig<Fr>> = OnceLock::new();

/// Deterministically derive Poseidon parameters for BN254::Fr.
///
/// Derivation walks the Grain LFSR, so the result is computed once and shared.
pub fn poseidon_config() -> &'static PoseidonConfig<Fr> {
    POSEIDON.get_or_init(|| {
        let prime_bits = Fr::MODULUS_BIT_SIZE as u64;

        let (ark, mds) = find_poseidon_ark_and_mds::<Fr>(
            prime_bits,
            POSEIDON_RATE,
            POSEIDON_FULL_ROUNDS as u64,
            POSEIDON_PARTIAL_ROUNDS as u64,
            0,
        );

        PoseidonConfig::new(
            POSEIDON_FULL_ROUNDS,
            POSEIDON_PARTIAL_ROUNDS,
            POSEIDON_ALPHA,
            mds,
            ark,
            POSEIDON_RATE,
            POSEIDON_CAPACITY,
        )
    })
}

/// Poseidon hash of a sequence of field elements.
pub fn poseidon_hash(inputs: &[Fr]) -> Fr {
    let mut sponge = PoseidonSponge::<Fr>::new(poseidon_config());
    sponge.absorb(&inputs.to_vec());
    sponge.squeeze_field_elements::<Fr>(1)[0]
}

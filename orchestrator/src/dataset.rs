//! Synthetic reporting-period data and key provisioning.
//!
//! Everything is drawn from seeded ChaCha20 streams so a run is reproducible from its seed.

use crate::errors::AppError;
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use zk_emissions::constants::{INTERVAL_SECONDS, NONCE_LEN, SHARE_TOTAL};
use zk_emissions::ledger::{IntensityFactor, MeterReading};
use zk_emissions::trust::{ChainOfTrust, KeyCustody, KeyRegistry, Role, RoleId, TrustAnchors};
use zk_emissions::types::{Customer, Invoice, Nonce, RatioBounds};

/// Independent streams derived from one run seed.
#[derive(Clone, Copy, Debug)]
pub enum Stream {
    Keys = 1,
    Customers = 2,
    Intensity = 3,
    Readings = 4,
}

pub fn seed_for(seed: u64, stream: Stream) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[0..8].copy_from_slice(&0x4341_5242_4f4e_4c47u64.to_le_bytes()); // "CARBONLG"
    out[8..16].copy_from_slice(&seed.to_le_bytes());
    out[16..24].copy_from_slice(&(stream as u64).to_le_bytes());
    out
}

pub fn rng_for(seed: u64, stream: Stream) -> ChaCha20Rng {
    ChaCha20Rng::from_seed(seed_for(seed, stream))
}

/// Customers whose shares add up to exactly [`SHARE_TOTAL`] and whose charges sit inside the band.
///
/// Raw weights are drawn from `[2^40, 2^48)` and scaled to the total; the rounding remainder goes
/// to the last customer. Resource charges are then drawn from `[share / upper, share / lower]`.
pub fn generate_customers<R: RngCore>(
    rng: &mut R,
    count: usize,
    period_from: u64,
    period_to: u64,
    bounds: &RatioBounds,
) -> Result<Vec<Customer>, AppError> {
    if count == 0 {
        return Err(AppError::Config("cannot generate an empty customer set".into()));
    }

    let weights: Vec<u128> = (0..count).map(|_| rng.gen_range(1u128 << 40..1u128 << 48)).collect();
    let weight_sum: u128 = weights.iter().sum();

    let mut shares: Vec<u128> = weights.iter().map(|w| w * SHARE_TOTAL / weight_sum).collect();
    let allocated: u128 = shares.iter().sum();
    if let Some(last) = shares.last_mut() {
        *last += SHARE_TOTAL - allocated;
    }

    let mut customers = Vec::with_capacity(count);
    for (i, share) in shares.into_iter().enumerate() {
        let min_cost = share.div_ceil(bounds.upper);
        let max_cost = share / bounds.lower;
        let resource_charges = rng.gen_range(min_cost..=max_cost);

        let mut nonce = [0u8; NONCE_LEN];
        rng.fill_bytes(&mut nonce);

        customers.push(Customer {
            share_allocation: share,
            nonce: Nonce(nonce),
            invoice: Invoice {
                customer_id: i as u64,
                period_from,
                period_to,
                resource_charges,
                other_charges: rng.gen_range(500..10_000),
            },
        });
    }
    Ok(customers)
}

/// Stand-in for the public half-hourly intensity feed (gCO2/kWh).
pub fn generate_intensity_feed<R: RngCore>(rng: &mut R, intervals: usize, start: u64) -> Vec<IntensityFactor> {
    (0..intervals as u64)
        .map(|i| IntensityFactor {
            value: rng.gen_range(40..400),
            time_from: start + i * INTERVAL_SECONDS,
            time_to: start + (i + 1) * INTERVAL_SECONDS,
        })
        .collect()
}

/// Cumulative meter counters, one per interval boundary.
pub fn generate_readings<R: RngCore>(rng: &mut R, intervals: usize, start: u64) -> Vec<MeterReading> {
    let mut value = rng.gen_range(0..1_000_000u64);
    let mut out = Vec::with_capacity(intervals + 1);
    for i in 0..=intervals as u64 {
        out.push(MeterReading {
            value,
            timestamp: start + i * INTERVAL_SECONDS,
        });
        value += rng.gen_range(40_000..50_000);
    }
    out
}

/// Role identities of one deployment.
#[derive(Debug, Clone)]
pub struct Roles {
    pub grid_ca: RoleId,
    pub meter_ca: RoleId,
    pub grid_operator: RoleId,
    pub manufacturer: RoleId,
    pub meter: RoleId,
}

impl Default for Roles {
    fn default() -> Self {
        Self {
            grid_ca: RoleId::new(Role::CertificateAuthority, "grid-ca"),
            meter_ca: RoleId::new(Role::CertificateAuthority, "meter-ca"),
            grid_operator: RoleId::new(Role::GridOperator, "grid-operator"),
            manufacturer: RoleId::new(Role::Manufacturer, "meter-manufacturer"),
            meter: RoleId::new(Role::Meter, "dc-meter-01"),
        }
    }
}

pub struct Provisioned {
    pub registry: KeyRegistry,
    pub roles: Roles,
    pub anchors: TrustAnchors,
    pub chain: ChainOfTrust,
}

/// Generate every role key and issue the three credentials.
pub fn provision_keys(rng: &mut ChaCha20Rng) -> Result<Provisioned, AppError> {
    let roles = Roles::default();
    let mut registry = KeyRegistry::new();
    for id in [
        &roles.grid_ca,
        &roles.meter_ca,
        &roles.grid_operator,
        &roles.manufacturer,
        &roles.meter,
    ] {
        registry.insert(KeyCustody::generate(id.clone(), rng));
    }

    registry.issue(&roles.grid_ca, &roles.grid_operator)?;
    registry.issue(&roles.meter_ca, &roles.manufacturer)?;
    registry.issue(&roles.manufacturer, &roles.meter)?;

    let anchors = TrustAnchors {
        grid_ca: registry.public_key(&roles.grid_ca)?,
        meter_ca: registry.public_key(&roles.meter_ca)?,
    };
    let chain = ChainOfTrust::from_registry(&registry, &roles.grid_operator, &roles.manufacturer, &roles.meter)?;

    Ok(Provisioned {
        registry,
        roles,
        anchors,
        chain,
    })
}

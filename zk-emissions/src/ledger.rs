//! Emissions ledger: signed carbon-intensity factors times signed meter deltas.

use crate::error::CarbonError;
use crate::trust::{PublicKey, Signable, SignedArtifact};
use serde::{Deserialize, Serialize};

/// Grams CO2e per unit of energy for one interval, as published by the grid operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntensityFactor {
    pub value: u64,
    pub time_from: u64,
    pub time_to: u64,
}

impl Signable for IntensityFactor {
    const DOMAIN: &'static [u8] = b"carbon-ledger/intensity/v1";

    fn signing_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(24);
        out.extend_from_slice(&self.value.to_le_bytes());
        out.extend_from_slice(&self.time_from.to_le_bytes());
        out.extend_from_slice(&self.time_to.to_le_bytes());
        out
    }
}

/// Cumulative meter counter at a point in time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterReading {
    pub value: u64,
    pub timestamp: u64,
}

impl Signable for MeterReading {
    const DOMAIN: &'static [u8] = b"carbon-ledger/reading/v1";

    fn signing_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        out.extend_from_slice(&self.value.to_le_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out
    }
}

pub type SignedIntensity = SignedArtifact<IntensityFactor>;
pub type SignedReading = SignedArtifact<MeterReading>;

/// Public output of an emissions statement over a contiguous time range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmissionsOutput {
    pub total_emissions: u128,
    pub grid_operator_pk: PublicKey,
    pub meter_pk: PublicKey,
    pub period_start: u64,
    pub period_end: u64,
}

/// Verify, chain and sum one contiguous run of intervals.
///
/// All signatures are checked before any arithmetic so a forged input never contributes to a
/// total.
pub fn tally(
    intensities: &[SignedIntensity],
    grid_operator_pk: &PublicKey,
    readings: &[SignedReading],
    meter_pk: &PublicKey,
) -> Result<EmissionsOutput, CarbonError> {
    if intensities.is_empty() {
        return Err(CarbonError::ValueOutOfRange("no intensity intervals".into()));
    }
    if readings.len() != intensities.len() + 1 {
        return Err(CarbonError::TemporalChainBroken {
            index: intensities.len().min(readings.len()),
            reason: format!(
                "{} intervals need {} readings, got {}",
                intensities.len(),
                intensities.len() + 1,
                readings.len()
            ),
        });
    }

    for intensity in intensities {
        intensity.verify(grid_operator_pk)?;
    }
    for reading in readings {
        reading.verify(meter_pk)?;
    }

    let mut total: u128 = 0;
    for (i, intensity) in intensities.iter().enumerate() {
        let factor = &intensity.payload;
        let start = &readings[i].payload;
        let end = &readings[i + 1].payload;

        if factor.time_from != start.timestamp || factor.time_to != end.timestamp {
            return Err(CarbonError::TemporalChainBroken {
                index: i,
                reason: format!(
                    "interval [{}, {}] vs readings at {} and {}",
                    factor.time_from, factor.time_to, start.timestamp, end.timestamp
                ),
            });
        }
        if end.value < start.value {
            return Err(CarbonError::MeterRegression { index: i });
        }

        let contribution = factor.value as u128 * (end.value - start.value) as u128;
        total = total
            .checked_add(contribution)
            .ok_or(CarbonError::Overflow("total emissions"))?;
    }

    Ok(EmissionsOutput {
        total_emissions: total,
        grid_operator_pk: *grid_operator_pk,
        meter_pk: *meter_pk,
        period_start: readings[0].payload.timestamp,
        period_end: readings[readings.len() - 1].payload.timestamp,
    })
}

/// Join two adjacent-in-time sub-totals.
pub fn merge(left: &EmissionsOutput, right: &EmissionsOutput) -> Result<EmissionsOutput, CarbonError> {
    if left.grid_operator_pk != right.grid_operator_pk {
        return Err(CarbonError::KeyBindingMismatch(
            "sub-totals signed by different grid operators".into(),
        ));
    }
    if left.meter_pk != right.meter_pk {
        return Err(CarbonError::KeyBindingMismatch(
            "sub-totals read from different meters".into(),
        ));
    }
    if left.period_end != right.period_start {
        return Err(CarbonError::TemporalChainBroken {
            index: 0,
            reason: format!(
                "left range ends at {}, right range starts at {}",
                left.period_end, right.period_start
            ),
        });
    }

    Ok(EmissionsOutput {
        total_emissions: left
            .total_emissions
            .checked_add(right.total_emissions)
            .ok_or(CarbonError::Overflow("total emissions"))?,
        grid_operator_pk: left.grid_operator_pk,
        meter_pk: left.meter_pk,
        period_start: left.period_start,
        period_end: right.period_end,
    })
}

/// A contiguous slice of intervals plus the readings that bracket it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalBatch {
    /// Offset of the first interval in the full series.
    pub offset: usize,
    pub intensities: Vec<SignedIntensity>,
    pub readings: Vec<SignedReading>,
}

/// Split the full series into base batches of `batch_size` intervals.
///
/// Adjacent batches share their boundary reading. The recursive merge pairs batches level by
/// level, so the batch count has to be a power of two.
pub fn partition(
    intensities: &[SignedIntensity],
    readings: &[SignedReading],
    batch_size: usize,
) -> Result<Vec<IntervalBatch>, CarbonError> {
    if batch_size == 0 || intensities.is_empty() || intensities.len() % batch_size != 0 {
        return Err(CarbonError::UnsupportedConfiguration(format!(
            "{} intervals cannot be split into batches of {batch_size}",
            intensities.len()
        )));
    }
    let batches = intensities.len() / batch_size;
    if !batches.is_power_of_two() {
        return Err(CarbonError::UnsupportedConfiguration(format!(
            "{batches} interval batches is not a power of two"
        )));
    }
    if readings.len() != intensities.len() + 1 {
        return Err(CarbonError::TemporalChainBroken {
            index: intensities.len().min(readings.len()),
            reason: format!("expected {} readings, got {}", intensities.len() + 1, readings.len()),
        });
    }

    Ok((0..batches)
        .map(|k| {
            let offset = k * batch_size;
            IntervalBatch {
                offset,
                intensities: intensities[offset..offset + batch_size].to_vec(),
                readings: readings[offset..=offset + batch_size].to_vec(),
            }
        })
        .collect())
}

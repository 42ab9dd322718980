//! Types shared between the proof programs and the host-side prover/verifier.

use crate::constants::{
    COST_NEGLIGIBLE_THRESHOLD, NONCE_LEN, RATIO_LOWER_BOUND, RATIO_UPPER_BOUND,
    SHARE_NEGLIGIBLE_THRESHOLD, SHARE_TOTAL, poseidon_hash,
};
use crate::error::CarbonError;
use ark_bn254::Fr;
use ark_ff::PrimeField;
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Hex (canonical compressed encoding) of a field element.
pub fn fr_to_hex(x: &Fr) -> String {
    let mut bytes = Vec::new();
    // Writing into a Vec cannot fail.
    let _ = x.serialize_compressed(&mut bytes);
    hex::encode(bytes)
}

pub fn fr_from_hex(s: &str) -> Result<Fr, CarbonError> {
    let bytes = hex::decode(s).map_err(|e| CarbonError::Serialization(format!("invalid hex: {e}")))?;
    Fr::deserialize_compressed(&bytes[..])
        .map_err(|e| CarbonError::Serialization(format!("invalid field bytes: {e}")))
}

/// serde adapter: field elements travel as hex strings so every component agrees on the bytes.
pub mod fr_hex {
    use super::{fr_from_hex, fr_to_hex};
    use ark_bn254::Fr;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(x: &Fr, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&fr_to_hex(x))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Fr, D::Error> {
        let s = String::deserialize(d)?;
        fr_from_hex(&s).map_err(D::Error::custom)
    }
}

/// serde adapter for fixed-size byte arrays (keys, signatures, nonces).
pub mod hex_array {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer, const N: usize>(bytes: &[u8; N], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(d: D) -> Result<[u8; N], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(&s).map_err(D::Error::custom)?;
        bytes
            .try_into()
            .map_err(|b: Vec<u8>| D::Error::custom(format!("expected {N} bytes, got {}", b.len())))
    }
}

/// serde adapter for opaque proof bytes.
pub mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(D::Error::custom)
    }
}

/// Closed band `[lower, upper]` for shares per unit of resource charges.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatioBounds {
    pub lower: u128,
    pub upper: u128,
}

impl Default for RatioBounds {
    fn default() -> Self {
        Self {
            lower: RATIO_LOWER_BOUND,
            upper: RATIO_UPPER_BOUND,
        }
    }
}

/// Secret per-customer salt so a leaf hash cannot be brute-forced from the public invoice.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nonce(#[serde(with = "hex_array")] pub [u8; NONCE_LEN]);

impl Nonce {
    /// 24 bytes always fit below the BN254 scalar modulus, so the mapping is injective.
    pub fn to_field(&self) -> Fr {
        Fr::from_le_bytes_mod_order(&self.0)
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Nonce(..)")
    }
}

/// Per-customer invoice for one billing period.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub customer_id: u64,
    /// Billing period start (unix seconds).
    pub period_from: u64,
    /// Billing period end (unix seconds).
    pub period_to: u64,
    /// Usage-based charges in cents (cost category A). Subject to the ratio band.
    pub resource_charges: u128,
    /// Everything else on the bill in cents (cost category B).
    pub other_charges: u128,
}

/// One committed customer record: a leaf of the customer tree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    /// Fraction of [`SHARE_TOTAL`] attributed to this customer.
    pub share_allocation: u128,
    pub nonce: Nonce,
    pub invoice: Invoice,
}

impl Customer {
    /// Leaf content hash.
    ///
    /// Field order is fixed; the per-customer claim recomputes it from the public invoice.
    pub fn hash(&self) -> Fr {
        record_hash(&self.invoice, self.share_allocation, &self.nonce)
    }

    pub fn leaf(&self, bounds: &RatioBounds) -> AggregateNode {
        AggregateNode {
            content_hash: self.hash(),
            total_shares: self.share_allocation,
            total_resource_charges: self.invoice.resource_charges,
            total_other_charges: self.invoice.other_charges,
            ratio_lower_bound: bounds.lower,
            ratio_upper_bound: bounds.upper,
        }
    }

    /// Negligible customers skip the ratio band. Both cost AND share must be below threshold.
    pub fn is_negligible(&self) -> bool {
        self.invoice.resource_charges < COST_NEGLIGIBLE_THRESHOLD
            && self.share_allocation < SHARE_NEGLIGIBLE_THRESHOLD
    }

    /// Range and ratio checks every base shares statement enforces per record.
    pub fn check_admissible(&self, bounds: &RatioBounds) -> Result<(), CarbonError> {
        let id = self.invoice.customer_id;

        if self.share_allocation > SHARE_TOTAL {
            return Err(CarbonError::ValueOutOfRange(format!(
                "customer {id} share {} exceeds the share total",
                self.share_allocation
            )));
        }
        // Costs stay below the share total so running sums cannot overflow.
        if self.invoice.resource_charges >= SHARE_TOTAL || self.invoice.other_charges >= SHARE_TOTAL {
            return Err(CarbonError::ValueOutOfRange(format!(
                "customer {id} charges exceed the share total"
            )));
        }

        if self.is_negligible() {
            return Ok(());
        }

        // lower <= share / cost <= upper  <=>  lower * cost <= share <= upper * cost
        let cost = self.invoice.resource_charges;
        let min_share = cost
            .checked_mul(bounds.lower)
            .ok_or(CarbonError::Overflow("ratio lower bound"))?;
        let max_share = cost
            .checked_mul(bounds.upper)
            .ok_or(CarbonError::Overflow("ratio upper bound"))?;

        if self.share_allocation < min_share || self.share_allocation > max_share {
            return Err(CarbonError::RatioOutOfBand {
                customer_id: id,
                lower: bounds.lower,
                upper: bounds.upper,
            });
        }
        Ok(())
    }
}

/// Hash of the public invoice fields plus the private share allocation and nonce.
pub fn record_hash(invoice: &Invoice, share_allocation: u128, nonce: &Nonce) -> Fr {
    poseidon_hash(&[
        Fr::from(invoice.customer_id),
        Fr::from(invoice.resource_charges),
        Fr::from(invoice.period_from),
        Fr::from(invoice.period_to),
        Fr::from(invoice.other_charges),
        Fr::from(share_allocation),
        nonce.to_field(),
    ])
}

/// A Merkle-sum tree node: content hash plus running sums and the (fixed) ratio band.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateNode {
    #[serde(with = "fr_hex")]
    pub content_hash: Fr,
    pub total_shares: u128,
    pub total_resource_charges: u128,
    pub total_other_charges: u128,
    pub ratio_lower_bound: u128,
    pub ratio_upper_bound: u128,
}

impl AggregateNode {
    /// Canonical empty leaf.
    pub fn zero(bounds: &RatioBounds) -> Self {
        Self {
            content_hash: Fr::from(0u64),
            total_shares: 0,
            total_resource_charges: 0,
            total_other_charges: 0,
            ratio_lower_bound: bounds.lower,
            ratio_upper_bound: bounds.upper,
        }
    }

    pub fn bounds(&self) -> RatioBounds {
        RatioBounds {
            lower: self.ratio_lower_bound,
            upper: self.ratio_upper_bound,
        }
    }

    /// Parent of two siblings. Position matters for the hash only.
    ///
    /// Children with different ratio bounds are a hard failure.
    pub fn combine(left: &Self, right: &Self) -> Result<Self, CarbonError> {
        if left.ratio_lower_bound != right.ratio_lower_bound
            || left.ratio_upper_bound != right.ratio_upper_bound
        {
            return Err(CarbonError::Consistency(format!(
                "ratio bounds differ between siblings: [{}, {}] vs [{}, {}]",
                left.ratio_lower_bound,
                left.ratio_upper_bound,
                right.ratio_lower_bound,
                right.ratio_upper_bound
            )));
        }

        Ok(Self {
            content_hash: poseidon_hash(&[left.content_hash, right.content_hash]),
            total_shares: left
                .total_shares
                .checked_add(right.total_shares)
                .ok_or(CarbonError::Overflow("total shares"))?,
            total_resource_charges: left
                .total_resource_charges
                .checked_add(right.total_resource_charges)
                .ok_or(CarbonError::Overflow("total resource charges"))?,
            total_other_charges: left
                .total_other_charges
                .checked_add(right.total_other_charges)
                .ok_or(CarbonError::Overflow("total other charges"))?,
            ratio_lower_bound: left.ratio_lower_bound,
            ratio_upper_bound: left.ratio_upper_bound,
        })
    }

    /// Name of the first field that differs from `other`, if any.
    pub fn first_difference(&self, other: &Self) -> Option<&'static str> {
        if self.content_hash != other.content_hash {
            Some("content hash")
        } else if self.total_shares != other.total_shares {
            Some("total shares")
        } else if self.total_resource_charges != other.total_resource_charges {
            Some("total resource charges")
        } else if self.total_other_charges != other.total_other_charges {
            Some("total other charges")
        } else if self.ratio_lower_bound != other.ratio_lower_bound {
            Some("ratio lower bound")
        } else if self.ratio_upper_bound != other.ratio_upper_bound {
            Some("ratio upper bound")
        } else {
            None
        }
    }
}

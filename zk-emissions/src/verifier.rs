//! Per-customer emissions claim: the final composition of the emissions proof, the shares proof,
//! the chain of trust and one customer's tree witness.

use crate::constants::SHARE_TOTAL;
use crate::error::CarbonError;
use crate::programs::{EmissionsProgram, SharesProgram};
use crate::proof::{ProofOf, ProofSystem, Statement, verify_fresh};
use crate::tree::Witness;
use crate::trust::{ChainOfTrust, PublicKey, TrustAnchors, TrustedKeys};
use crate::types::{AggregateNode, Customer, Invoice, fr_hex, record_hash};
use ark_bn254::Fr;
use serde::{Deserialize, Serialize};

/// Everything a customer (or auditor) sees about one claim.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicEntityRecord {
    pub invoice: Invoice,
    /// Emissions attributed to this customer, in units of 1 / SHARE_TOTAL of the total.
    pub emissions: u128,
    pub meter_ca_pk: PublicKey,
    pub grid_ca_pk: PublicKey,
    #[serde(with = "fr_hex")]
    pub tree_root_hash: Fr,
    pub meter_pk: PublicKey,
    pub grid_operator_pk: PublicKey,
}

/// Private side of a claim.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntityClaimWitness {
    pub customer: Customer,
    pub witness: Witness,
    pub emissions_proof: ProofOf<EmissionsProgram>,
    pub shares_proof: ProofOf<SharesProgram>,
    pub chain: ChainOfTrust,
}

/// Replays every check of a claim. Keys are always compiled locally from the programs.
pub struct CompositionVerifier<'a, P> {
    system: &'a P,
    shares: &'a SharesProgram,
    emissions: &'a EmissionsProgram,
}

impl<'a, P: ProofSystem> CompositionVerifier<'a, P> {
    pub fn new(system: &'a P, shares: &'a SharesProgram, emissions: &'a EmissionsProgram) -> Self {
        Self {
            system,
            shares,
            emissions,
        }
    }

    /// Accept the claim and return the customer's emissions, or name the first failed check.
    pub fn check(
        &self,
        public: &PublicEntityRecord,
        private: &EntityClaimWitness,
    ) -> Result<u128, CarbonError> {
        let emissions = &private.emissions_proof.public_output;
        let root = &private.shares_proof.public_input;

        // 1. both final proofs, against freshly compiled keys
        verify_fresh(self.system, self.emissions, &private.emissions_proof)?;
        verify_fresh(self.system, self.shares, &private.shares_proof)?;
        if private.shares_proof.public_output != self.shares.root_level() {
            return Err(CarbonError::StatementUnsatisfied {
                statement: SharesProgram::NAME,
                reason: format!(
                    "proof covers level {}, the root is level {}",
                    private.shares_proof.public_output,
                    self.shares.root_level()
                ),
            });
        }

        // 3. the three custody hops
        let anchors = TrustAnchors {
            grid_ca: public.grid_ca_pk,
            meter_ca: public.meter_ca_pk,
        };
        let trusted = private.chain.verify(&anchors)?;

        // 2. keys inside the emissions output are the certified ones
        check_key("grid operator", &emissions.grid_operator_pk, &trusted.grid_operator)?;
        check_key("meter", &emissions.meter_pk, &trusted.meter)?;
        check_key("disclosed grid operator", &public.grid_operator_pk, &trusted.grid_operator)?;
        check_key("disclosed meter", &public.meter_pk, &trusted.meter)?;

        // 4. public invoice is the committed one
        if private.customer.invoice != public.invoice {
            return Err(CarbonError::InvoiceMismatch(format!(
                "disclosed invoice for customer {} differs from the committed record",
                public.invoice.customer_id
            )));
        }
        let bounds = self.shares.bounds();
        let leaf = AggregateNode {
            content_hash: record_hash(
                &public.invoice,
                private.customer.share_allocation,
                &private.customer.nonce,
            ),
            total_shares: private.customer.share_allocation,
            total_resource_charges: public.invoice.resource_charges,
            total_other_charges: public.invoice.other_charges,
            ratio_lower_bound: bounds.lower,
            ratio_upper_bound: bounds.upper,
        };
        if leaf.content_hash != private.customer.hash() {
            return Err(CarbonError::InvoiceMismatch("record hash does not match its fields".into()));
        }

        // 5. the leaf is in the proven tree
        if private.witness.path.len() != self.shares.root_level() as usize {
            return Err(CarbonError::WitnessRootMismatch);
        }
        let replayed = private.witness.calculate_root(&leaf)?;
        if replayed != *root || root.content_hash != public.tree_root_hash {
            return Err(CarbonError::WitnessRootMismatch);
        }

        // 6. shares add up exactly
        if root.total_shares != SHARE_TOTAL {
            return Err(CarbonError::ShareTotalMismatch {
                expected: SHARE_TOTAL,
                got: root.total_shares,
            });
        }

        // 7. claimed emissions are exactly total x share
        let expected = emissions
            .total_emissions
            .checked_mul(private.customer.share_allocation)
            .ok_or(CarbonError::Overflow("customer emissions"))?;
        if public.emissions != expected {
            return Err(CarbonError::EmissionsMismatch {
                claimed: public.emissions,
                expected,
            });
        }

        // 8. same period
        if emissions.period_start != public.invoice.period_from
            || emissions.period_end != public.invoice.period_to
        {
            return Err(CarbonError::PeriodMismatch {
                emissions_from: emissions.period_start,
                emissions_to: emissions.period_end,
                invoice_from: public.invoice.period_from,
                invoice_to: public.invoice.period_to,
            });
        }

        Ok(public.emissions)
    }
}

fn check_key(what: &str, got: &PublicKey, certified: &PublicKey) -> Result<(), CarbonError> {
    if got != certified {
        return Err(CarbonError::KeyBindingMismatch(format!(
            "{what} key {got} is not the certified {certified}"
        )));
    }
    Ok(())
}

/// The claim checks wrapped as a statement, so a customer receives a proof that only reveals
/// [`PublicEntityRecord`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClaimProgram {
    pub shares: SharesProgram,
    pub emissions: EmissionsProgram,
}

impl Statement for ClaimProgram {
    const NAME: &'static str = "customer-emissions-claim";

    type PublicInput = PublicEntityRecord;
    type PublicOutput = ();
    type PrivateInput = EntityClaimWitness;

    fn shape(&self) -> String {
        format!("shares[{}];emissions[{}]", self.shares.shape(), self.emissions.shape())
    }

    fn synthesize<P: ProofSystem>(
        &self,
        system: &P,
        public: &PublicEntityRecord,
        private: &EntityClaimWitness,
    ) -> Result<(), CarbonError> {
        CompositionVerifier::new(system, &self.shares, &self.emissions).check(public, private)?;
        Ok(())
    }
}

/// Exact per-customer emissions, in order. Refuses to allocate unless shares sum to the total.
pub fn allocate_emissions(total_emissions: u128, customers: &[Customer]) -> Result<Vec<u128>, CarbonError> {
    let mut sum: u128 = 0;
    for c in customers {
        sum = sum
            .checked_add(c.share_allocation)
            .ok_or(CarbonError::Overflow("share sum"))?;
    }
    if sum != SHARE_TOTAL {
        return Err(CarbonError::ShareTotalMismatch {
            expected: SHARE_TOTAL,
            got: sum,
        });
    }

    customers
        .iter()
        .map(|c| {
            total_emissions
                .checked_mul(c.share_allocation)
                .ok_or(CarbonError::Overflow("customer emissions"))
        })
        .collect()
}

/// Auditor-side acceptance of a customer's claim proof.
///
/// The claim key is compiled here; the keys disclosed in the record must equal the ones the
/// auditor obtained independently.
pub fn verify_claim_proof<P: ProofSystem>(
    system: &P,
    program: &ClaimProgram,
    proof: &ProofOf<ClaimProgram>,
    anchors: &TrustAnchors,
    keys: &TrustedKeys,
) -> Result<PublicEntityRecord, CarbonError> {
    verify_fresh(system, program, proof)?;

    let record = &proof.public_input;
    check_key("grid CA", &record.grid_ca_pk, &anchors.grid_ca)?;
    check_key("meter CA", &record.meter_ca_pk, &anchors.meter_ca)?;
    check_key("grid operator", &record.grid_operator_pk, &keys.grid_operator)?;
    check_key("meter", &record.meter_pk, &keys.meter)?;

    Ok(record.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::NONCE_LEN;
    use crate::types::Nonce;

    fn with_share(share: u128) -> Customer {
        Customer {
            share_allocation: share,
            nonce: Nonce([0; NONCE_LEN]),
            invoice: Invoice {
                customer_id: 0,
                period_from: 0,
                period_to: 1,
                resource_charges: 0,
                other_charges: 0,
            },
        }
    }

    #[test]
    fn allocation_is_exact() {
        let customers = vec![with_share(SHARE_TOTAL / 4), with_share(SHARE_TOTAL * 3 / 4)];
        let out = allocate_emissions(1_000, &customers).unwrap();
        assert_eq!(out, vec![1_000 * (SHARE_TOTAL / 4), 1_000 * (SHARE_TOTAL * 3 / 4)]);
        assert_eq!(out.iter().sum::<u128>(), 1_000 * SHARE_TOTAL);
    }

    #[test]
    fn allocation_refuses_short_shares() {
        let customers = vec![with_share(SHARE_TOTAL / 2), with_share(SHARE_TOTAL / 2 - 1)];
        assert!(matches!(
            allocate_emissions(1_000, &customers),
            Err(CarbonError::ShareTotalMismatch { .. })
        ));
    }
}

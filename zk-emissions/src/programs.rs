//! The recursive proof programs: shares (customer tree) and emissions (interval series).
//!
//! Each program has a base method over one batch and a step method that verifies two child
//! proofs of the same program and joins their outputs. Both methods share one verification key.

use crate::error::CarbonError;
use crate::ledger::{self, EmissionsOutput, SignedIntensity, SignedReading};
use crate::proof::{ProofOf, ProofSystem, Statement, verify_fresh};
use crate::trust::PublicKey;
use crate::types::{AggregateNode, Customer, RatioBounds};
use serde::{Deserialize, Serialize};

/// Proves that an [`AggregateNode`] is the root of a subtree of admissible customer records.
///
/// Public input is the claimed subtree root; public output is the level it sits at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SharesProgram {
    batch_size: usize,
    tree_height: usize,
    bounds: RatioBounds,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SharesWitness {
    /// One batch of leaves; `None` is an empty (zero) leaf.
    Base { records: Vec<Option<Customer>> },
    Step {
        left: ProofOf<SharesProgram>,
        right: ProofOf<SharesProgram>,
    },
}

impl SharesProgram {
    pub fn new(batch_size: usize, tree_height: usize, bounds: RatioBounds) -> Result<Self, CarbonError> {
        if tree_height == 0 || tree_height > 64 {
            return Err(CarbonError::UnsupportedConfiguration(format!(
                "tree height {tree_height} outside 1..=64"
            )));
        }
        let leaves = 1u128 << (tree_height - 1);
        if !batch_size.is_power_of_two() || batch_size as u128 > leaves {
            return Err(CarbonError::UnsupportedConfiguration(format!(
                "customer batch {batch_size} must be a power of two dividing {leaves} leaves"
            )));
        }
        Ok(Self {
            batch_size,
            tree_height,
            bounds,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn tree_height(&self) -> usize {
        self.tree_height
    }

    pub fn bounds(&self) -> RatioBounds {
        self.bounds
    }

    /// Tree level of a base proof's root.
    pub fn base_level(&self) -> u32 {
        self.batch_size.trailing_zeros()
    }

    /// Level of the tree root.
    pub fn root_level(&self) -> u32 {
        self.tree_height as u32 - 1
    }

    fn unsatisfied(reason: String) -> CarbonError {
        CarbonError::StatementUnsatisfied {
            statement: Self::NAME,
            reason,
        }
    }

    fn base(&self, root: &AggregateNode, records: &[Option<Customer>]) -> Result<u32, CarbonError> {
        if records.len() != self.batch_size {
            return Err(Self::unsatisfied(format!(
                "batch holds {} records, expected {}",
                records.len(),
                self.batch_size
            )));
        }

        let mut level = Vec::with_capacity(records.len());
        for record in records {
            level.push(match record {
                Some(customer) => {
                    customer.check_admissible(&self.bounds)?;
                    customer.leaf(&self.bounds)
                }
                None => AggregateNode::zero(&self.bounds),
            });
        }
        while level.len() > 1 {
            level = level
                .chunks(2)
                .map(|pair| AggregateNode::combine(&pair[0], &pair[1]))
                .collect::<Result<_, _>>()?;
        }

        if let Some(field) = level[0].first_difference(root) {
            return Err(Self::unsatisfied(format!("rebuilt batch root differs in {field}")));
        }
        Ok(self.base_level())
    }

    fn step<P: ProofSystem>(
        &self,
        system: &P,
        root: &AggregateNode,
        left: &ProofOf<Self>,
        right: &ProofOf<Self>,
    ) -> Result<u32, CarbonError> {
        verify_fresh(system, self, left)?;
        verify_fresh(system, self, right)?;

        if left.public_output != right.public_output {
            return Err(Self::unsatisfied(format!(
                "children sit at levels {} and {}",
                left.public_output, right.public_output
            )));
        }
        let level = left.public_output + 1;
        if level > self.root_level() {
            return Err(Self::unsatisfied(format!("level {level} is above the root")));
        }

        let parent = AggregateNode::combine(&left.public_input, &right.public_input)?;
        if let Some(field) = parent.first_difference(root) {
            return Err(Self::unsatisfied(format!("combined children differ in {field}")));
        }
        Ok(level)
    }
}

impl Statement for SharesProgram {
    const NAME: &'static str = "customer-shares";

    type PublicInput = AggregateNode;
    type PublicOutput = u32;
    type PrivateInput = SharesWitness;

    fn shape(&self) -> String {
        format!(
            "batch={};height={};band={}..{}",
            self.batch_size, self.tree_height, self.bounds.lower, self.bounds.upper
        )
    }

    fn synthesize<P: ProofSystem>(
        &self,
        system: &P,
        public: &AggregateNode,
        private: &SharesWitness,
    ) -> Result<u32, CarbonError> {
        match private {
            SharesWitness::Base { records } => self.base(public, records),
            SharesWitness::Step { left, right } => self.step(system, public, left, right),
        }
    }
}

/// Proves total emissions over a contiguous, signed interval range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EmissionsProgram {
    batch_size: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum EmissionsWitness {
    Base {
        intensities: Vec<SignedIntensity>,
        grid_operator_pk: PublicKey,
        readings: Vec<SignedReading>,
        meter_pk: PublicKey,
    },
    Step {
        left: ProofOf<EmissionsProgram>,
        right: ProofOf<EmissionsProgram>,
    },
}

impl EmissionsProgram {
    pub fn new(batch_size: usize) -> Result<Self, CarbonError> {
        if batch_size == 0 {
            return Err(CarbonError::UnsupportedConfiguration(
                "interval batch size must be positive".into(),
            ));
        }
        Ok(Self { batch_size })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

impl Statement for EmissionsProgram {
    const NAME: &'static str = "total-emissions";

    type PublicInput = ();
    type PublicOutput = EmissionsOutput;
    type PrivateInput = EmissionsWitness;

    fn shape(&self) -> String {
        format!("batch={}", self.batch_size)
    }

    fn synthesize<P: ProofSystem>(
        &self,
        system: &P,
        _public: &(),
        private: &EmissionsWitness,
    ) -> Result<EmissionsOutput, CarbonError> {
        match private {
            EmissionsWitness::Base {
                intensities,
                grid_operator_pk,
                readings,
                meter_pk,
            } => {
                if intensities.len() != self.batch_size {
                    return Err(CarbonError::StatementUnsatisfied {
                        statement: Self::NAME,
                        reason: format!(
                            "batch holds {} intervals, expected {}",
                            intensities.len(),
                            self.batch_size
                        ),
                    });
                }
                ledger::tally(intensities, grid_operator_pk, readings, meter_pk)
            }
            EmissionsWitness::Step { left, right } => {
                verify_fresh(system, self, left)?;
                verify_fresh(system, self, right)?;
                ledger::merge(&left.public_output, &right.public_output)
            }
        }
    }
}

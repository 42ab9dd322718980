//! The proving-capability seam.
//!
//! Statements describe what must hold; a [`ProofSystem`] turns a satisfied statement into a
//! portable [`Proof`] and checks proofs against verification keys it compiled itself.

use crate::error::CarbonError;
use crate::types::{base64_bytes, hex_array};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Identifies one compiled statement. Always recomputed by the verifying side.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationKey {
    pub statement: String,
    #[serde(with = "hex_array")]
    pub digest: [u8; 32],
}

/// Opaque proof plus the public values it is bound to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof<I, O> {
    pub statement: String,
    pub public_input: I,
    pub public_output: O,
    #[serde(with = "base64_bytes")]
    pub proof_bytes: Vec<u8>,
}

pub type ProofOf<S> = Proof<<S as Statement>::PublicInput, <S as Statement>::PublicOutput>;

/// A predicate over public and private values.
pub trait Statement {
    const NAME: &'static str;

    type PublicInput: Clone + Serialize + DeserializeOwned + Send + Sync + 'static;
    type PublicOutput: Clone + Serialize + DeserializeOwned + Send + Sync + 'static;
    type PrivateInput;

    /// Parameters that fix the constraint system. Two instances with the same name and shape
    /// compile to the same key.
    fn shape(&self) -> String;

    /// Check the statement and return its public output. Any error means "unsatisfied".
    ///
    /// Recursive statements use `system` to verify child proofs.
    fn synthesize<P: ProofSystem>(
        &self,
        system: &P,
        public: &Self::PublicInput,
        private: &Self::PrivateInput,
    ) -> Result<Self::PublicOutput, CarbonError>;
}

pub trait ProofSystem: Send + Sync {
    fn compile<S: Statement>(&self, statement: &S) -> Result<VerificationKey, CarbonError>;

    fn prove<S: Statement>(
        &self,
        statement: &S,
        public: S::PublicInput,
        private: &S::PrivateInput,
    ) -> Result<ProofOf<S>, CarbonError>;

    fn verify<I: Serialize, O: Serialize>(
        &self,
        proof: &Proof<I, O>,
        vk: &VerificationKey,
    ) -> Result<bool, CarbonError>;
}

/// Verify `proof` against a key compiled here and now from `statement`.
pub fn verify_fresh<S: Statement, P: ProofSystem>(
    system: &P,
    statement: &S,
    proof: &ProofOf<S>,
) -> Result<(), CarbonError> {
    let vk = system.compile(statement)?;
    if proof.statement != S::NAME || !system.verify(proof, &vk)? {
        return Err(CarbonError::ProofVerificationFailed {
            statement: proof.statement.clone(),
        });
    }
    Ok(())
}

/// Prove, then re-verify the fresh proof before handing it out (fail closed).
pub fn prove_checked<S: Statement, P: ProofSystem>(
    system: &P,
    statement: &S,
    public: S::PublicInput,
    private: &S::PrivateInput,
) -> Result<ProofOf<S>, CarbonError> {
    let proof = system.prove(statement, public, private)?;
    verify_fresh(system, statement, &proof)?;
    Ok(proof)
}

const TRANSCRIPT_KEY_CONTEXT: &str = "carbon-ledger 2025 transcript verification key v1";

/// Reference proving capability.
///
/// A proof is a BLAKE3 MAC, keyed by the verification key, over the public values, emitted only
/// after the statement was satisfied. It binds proofs to their statement and public values but
/// is neither zero-knowledge nor sound against a prover that skips synthesis.
#[derive(Clone, Copy, Debug, Default)]
pub struct TranscriptSystem;

impl TranscriptSystem {
    fn transcript<I: Serialize, O: Serialize>(
        statement: &str,
        public_input: &I,
        public_output: &O,
    ) -> Result<Vec<u8>, CarbonError> {
        serde_json::to_vec(&(statement, public_input, public_output))
            .map_err(|e| CarbonError::Serialization(e.to_string()))
    }
}

impl ProofSystem for TranscriptSystem {
    fn compile<S: Statement>(&self, statement: &S) -> Result<VerificationKey, CarbonError> {
        let mut hasher = blake3::Hasher::new_derive_key(TRANSCRIPT_KEY_CONTEXT);
        hasher.update(S::NAME.as_bytes());
        hasher.update(&[0]);
        hasher.update(statement.shape().as_bytes());

        Ok(VerificationKey {
            statement: S::NAME.to_owned(),
            digest: *hasher.finalize().as_bytes(),
        })
    }

    fn prove<S: Statement>(
        &self,
        statement: &S,
        public: S::PublicInput,
        private: &S::PrivateInput,
    ) -> Result<ProofOf<S>, CarbonError> {
        let vk = self.compile(statement)?;
        let output = statement.synthesize(self, &public, private)?;

        let transcript = Self::transcript(S::NAME, &public, &output)?;
        let mac = blake3::keyed_hash(&vk.digest, &transcript);

        Ok(Proof {
            statement: S::NAME.to_owned(),
            public_input: public,
            public_output: output,
            proof_bytes: mac.as_bytes().to_vec(),
        })
    }

    fn verify<I: Serialize, O: Serialize>(
        &self,
        proof: &Proof<I, O>,
        vk: &VerificationKey,
    ) -> Result<bool, CarbonError> {
        if proof.statement != vk.statement {
            return Ok(false);
        }
        let Ok(tag) = <[u8; 32]>::try_from(proof.proof_bytes.as_slice()) else {
            return Ok(false);
        };

        let transcript = Self::transcript(&proof.statement, &proof.public_input, &proof.public_output)?;
        // blake3::Hash equality is constant time.
        Ok(blake3::keyed_hash(&vk.digest, &transcript) == blake3::Hash::from(tag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Proves knowledge of a factorisation of the public input.
    struct Product {
        max_factor: u64,
    }

    impl Statement for Product {
        const NAME: &'static str = "test/product";
        type PublicInput = u64;
        type PublicOutput = u64;
        type PrivateInput = (u64, u64);

        fn shape(&self) -> String {
            format!("max={}", self.max_factor)
        }

        fn synthesize<P: ProofSystem>(
            &self,
            _system: &P,
            public: &u64,
            (a, b): &(u64, u64),
        ) -> Result<u64, CarbonError> {
            if *a > self.max_factor || *b > self.max_factor || a * b != *public {
                return Err(CarbonError::StatementUnsatisfied {
                    statement: Self::NAME,
                    reason: "not a factorisation".into(),
                });
            }
            Ok(a + b)
        }
    }

    #[test]
    fn honest_proof_verifies_and_tampering_does_not() {
        let system = TranscriptSystem;
        let stmt = Product { max_factor: 100 };
        let proof = prove_checked(&system, &stmt, 91, &(7, 13)).unwrap();
        assert_eq!(proof.public_output, 20);

        let mut forged = proof.clone();
        forged.public_input = 92;
        assert!(verify_fresh(&system, &stmt, &forged).is_err());

        let mut forged = proof.clone();
        forged.public_output = 21;
        assert!(verify_fresh(&system, &stmt, &forged).is_err());
    }

    #[test]
    fn unsatisfied_statement_yields_no_proof() {
        let stmt = Product { max_factor: 100 };
        assert!(matches!(
            TranscriptSystem.prove(&stmt, 91, &(7, 12)),
            Err(CarbonError::StatementUnsatisfied { .. })
        ));
    }

    #[test]
    fn key_depends_on_shape() {
        let system = TranscriptSystem;
        let small = Product { max_factor: 10 };
        let large = Product { max_factor: 100 };
        assert_ne!(system.compile(&small).unwrap(), system.compile(&large).unwrap());

        let proof = system.prove(&large, 91, &(7, 13)).unwrap();
        assert!(matches!(
            verify_fresh(&system, &small, &proof),
            Err(CarbonError::ProofVerificationFailed { .. })
        ));
    }

    #[test]
    fn proof_survives_json() {
        let stmt = Product { max_factor: 100 };
        let proof = TranscriptSystem.prove(&stmt, 91, &(7, 13)).unwrap();
        let json = serde_json::to_string(&proof).unwrap();
        let back: ProofOf<Product> = serde_json::from_str(&json).unwrap();
        verify_fresh(&TranscriptSystem, &stmt, &back).unwrap();
    }
}

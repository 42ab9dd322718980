//! Key custody and the chain of trust binding meter, manufacturer, grid operator and the CAs.
//!
//! Every signed message starts with a domain tag and the signer's own public key, so a
//! signature produced for one relationship cannot be replayed as another.

use crate::error::CarbonError;
use crate::types::hex_array;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

const KEY_DOMAIN: &[u8] = b"carbon-ledger/signed-key/v1";

/// Ed25519 verifying-key bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "hex_array")] pub [u8; 32]);

impl PublicKey {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    fn verifying_key(&self) -> Result<VerifyingKey, CarbonError> {
        VerifyingKey::from_bytes(&self.0)
            .map_err(|e| CarbonError::SignatureInvalid(format!("malformed public key: {e}")))
    }

    fn verify(&self, message: &[u8], signature: &[u8; 64], what: &str) -> Result<(), CarbonError> {
        let sig = Signature::from_bytes(signature);
        self.verifying_key()?
            .verify_strict(message, &sig)
            .map_err(|_| CarbonError::SignatureInvalid(format!("{what} does not open under {self}")))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}..)", &self.to_hex()[..16])
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    CertificateAuthority,
    GridOperator,
    Manufacturer,
    Meter,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoleId {
    pub role: Role,
    pub identity: String,
}

impl RoleId {
    pub fn new(role: Role, identity: impl Into<String>) -> Self {
        Self {
            role,
            identity: identity.into(),
        }
    }
}

/// A public key vouched for by a signer, together with the identity it was issued to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedKey {
    pub public_key: PublicKey,
    pub identity: String,
    #[serde(with = "hex_array")]
    pub signature: [u8; 64],
    pub signer: PublicKey,
}

impl SignedKey {
    fn message(signer: &PublicKey, subject: &PublicKey, identity: &str) -> Vec<u8> {
        let mut msg = Vec::with_capacity(KEY_DOMAIN.len() + 64 + identity.len());
        msg.extend_from_slice(KEY_DOMAIN);
        msg.extend_from_slice(&signer.0);
        msg.extend_from_slice(&subject.0);
        msg.extend_from_slice(identity.as_bytes());
        msg
    }

    /// Fails unless this key was signed by `expected_signer`.
    pub fn verify(&self, expected_signer: &PublicKey) -> Result<(), CarbonError> {
        if self.signer != *expected_signer {
            return Err(CarbonError::SignatureInvalid(format!(
                "key for {} was signed by {}, expected {}",
                self.identity, self.signer, expected_signer
            )));
        }
        let msg = Self::message(&self.signer, &self.public_key, &self.identity);
        expected_signer.verify(&msg, &self.signature, &format!("key binding for {}", self.identity))
    }
}

/// Payloads that can be signed as artifacts.
pub trait Signable {
    const DOMAIN: &'static [u8];

    /// Canonical byte encoding covered by the signature.
    fn signing_bytes(&self) -> Vec<u8>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedArtifact<T> {
    pub payload: T,
    #[serde(with = "hex_array")]
    pub signature: [u8; 64],
    pub signer: PublicKey,
}

impl<T: Signable> SignedArtifact<T> {
    fn message(signer: &PublicKey, payload: &T) -> Vec<u8> {
        let body = payload.signing_bytes();
        let mut msg = Vec::with_capacity(T::DOMAIN.len() + 32 + body.len());
        msg.extend_from_slice(T::DOMAIN);
        msg.extend_from_slice(&signer.0);
        msg.extend_from_slice(&body);
        msg
    }

    /// Fails unless the payload was signed by `expected_signer`.
    pub fn verify(&self, expected_signer: &PublicKey) -> Result<(), CarbonError> {
        if self.signer != *expected_signer {
            return Err(CarbonError::SignatureInvalid(format!(
                "artifact signed by {}, expected {}",
                self.signer, expected_signer
            )));
        }
        let msg = Self::message(&self.signer, &self.payload);
        expected_signer.verify(&msg, &self.signature, "artifact signature")
    }
}

/// Owns one role's secret key. Never serialised.
pub struct KeyCustody {
    id: RoleId,
    signing: SigningKey,
    credential: Option<SignedKey>,
}

impl KeyCustody {
    pub fn from_secret(id: RoleId, secret: [u8; 32]) -> Self {
        Self {
            id,
            signing: SigningKey::from_bytes(&secret),
            credential: None,
        }
    }

    pub fn generate<R: RngCore + CryptoRng>(id: RoleId, rng: &mut R) -> Self {
        let mut secret = [0u8; 32];
        rng.fill_bytes(&mut secret);
        Self::from_secret(id, secret)
    }

    pub fn id(&self) -> &RoleId {
        &self.id
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing.verifying_key().to_bytes())
    }

    /// Credential issued to this role by its authority, if any.
    pub fn credential(&self) -> Option<&SignedKey> {
        self.credential.as_ref()
    }

    /// Vouch for `subject` under `identity`. Deterministic for a given secret key.
    pub fn sign_key(&self, subject: &PublicKey, identity: &str) -> SignedKey {
        let signer = self.public_key();
        let msg = SignedKey::message(&signer, subject, identity);
        SignedKey {
            public_key: *subject,
            identity: identity.to_owned(),
            signature: self.signing.sign(&msg).to_bytes(),
            signer,
        }
    }

    pub fn sign<T: Signable>(&self, payload: T) -> SignedArtifact<T> {
        let signer = self.public_key();
        let msg = SignedArtifact::message(&signer, &payload);
        SignedArtifact {
            signature: self.signing.sign(&msg).to_bytes(),
            payload,
            signer,
        }
    }
}

impl fmt::Debug for KeyCustody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyCustody")
            .field("id", &self.id)
            .field("public_key", &self.public_key())
            .field("secret", &"<redacted>")
            .field("credential", &self.credential.is_some())
            .finish()
    }
}

/// Explicit role-identity to key-custody mapping, passed around by reference.
#[derive(Debug, Default)]
pub struct KeyRegistry {
    entries: BTreeMap<RoleId, KeyCustody>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a custody; returns its public key.
    pub fn insert(&mut self, custody: KeyCustody) -> PublicKey {
        let pk = custody.public_key();
        self.entries.insert(custody.id.clone(), custody);
        pk
    }

    pub fn get(&self, id: &RoleId) -> Result<&KeyCustody, CarbonError> {
        self.entries
            .get(id)
            .ok_or_else(|| CarbonError::KeyBindingMismatch(format!("no key custody for {id:?}")))
    }

    pub fn public_key(&self, id: &RoleId) -> Result<PublicKey, CarbonError> {
        Ok(self.get(id)?.public_key())
    }

    /// `issuer` signs `subject`'s key under the subject's identity; the credential is stored on
    /// the subject and returned.
    pub fn issue(&mut self, issuer: &RoleId, subject: &RoleId) -> Result<SignedKey, CarbonError> {
        let subject_pk = self.public_key(subject)?;
        let credential = self.get(issuer)?.sign_key(&subject_pk, &subject.identity);
        if let Some(custody) = self.entries.get_mut(subject) {
            custody.credential = Some(credential.clone());
        }
        Ok(credential)
    }

    fn credential(&self, id: &RoleId) -> Result<SignedKey, CarbonError> {
        self.get(id)?
            .credential()
            .cloned()
            .ok_or_else(|| CarbonError::KeyBindingMismatch(format!("{id:?} holds no credential")))
    }
}

/// Root keys the auditor obtains out of band.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustAnchors {
    pub grid_ca: PublicKey,
    pub meter_ca: PublicKey,
}

/// The three signed custody hops.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainOfTrust {
    /// Grid-operator key, signed by the grid CA.
    pub grid_operator: SignedKey,
    /// Manufacturer key, signed by the meter CA.
    pub manufacturer: SignedKey,
    /// Meter key, signed by the manufacturer.
    pub meter: SignedKey,
}

/// Keys that survived chain-of-trust verification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrustedKeys {
    pub grid_operator: PublicKey,
    pub meter: PublicKey,
}

impl ChainOfTrust {
    /// Collect already-issued credentials from the registry.
    pub fn from_registry(
        registry: &KeyRegistry,
        grid_operator: &RoleId,
        manufacturer: &RoleId,
        meter: &RoleId,
    ) -> Result<Self, CarbonError> {
        Ok(Self {
            grid_operator: registry.credential(grid_operator)?,
            manufacturer: registry.credential(manufacturer)?,
            meter: registry.credential(meter)?,
        })
    }

    pub fn verify(&self, anchors: &TrustAnchors) -> Result<TrustedKeys, CarbonError> {
        self.grid_operator.verify(&anchors.grid_ca)?;
        self.manufacturer.verify(&anchors.meter_ca)?;
        self.meter.verify(&self.manufacturer.public_key)?;

        Ok(TrustedKeys {
            grid_operator: self.grid_operator.public_key,
            meter: self.meter.public_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    struct Fixture {
        registry: KeyRegistry,
        anchors: TrustAnchors,
        grid: RoleId,
        maker: RoleId,
        meter: RoleId,
    }

    fn fixture() -> Fixture {
        let mut rng = ChaCha20Rng::seed_from_u64(11);
        let grid_ca = RoleId::new(Role::CertificateAuthority, "grid-ca");
        let meter_ca = RoleId::new(Role::CertificateAuthority, "meter-ca");
        let grid = RoleId::new(Role::GridOperator, "grid-1");
        let maker = RoleId::new(Role::Manufacturer, "maker-1");
        let meter = RoleId::new(Role::Meter, "meter-1");

        let mut registry = KeyRegistry::new();
        for id in [&grid_ca, &meter_ca, &grid, &maker, &meter] {
            registry.insert(KeyCustody::generate(id.clone(), &mut rng));
        }
        registry.issue(&grid_ca, &grid).unwrap();
        registry.issue(&meter_ca, &maker).unwrap();
        registry.issue(&maker, &meter).unwrap();

        let anchors = TrustAnchors {
            grid_ca: registry.public_key(&grid_ca).unwrap(),
            meter_ca: registry.public_key(&meter_ca).unwrap(),
        };
        Fixture { registry, anchors, grid, maker, meter }
    }

    #[derive(Clone, Serialize, Deserialize)]
    struct Note(u64);

    impl Signable for Note {
        const DOMAIN: &'static [u8] = b"test/note";
        fn signing_bytes(&self) -> Vec<u8> {
            self.0.to_le_bytes().to_vec()
        }
    }

    #[test]
    fn all_three_hops_verify() {
        let f = fixture();
        let chain = ChainOfTrust::from_registry(&f.registry, &f.grid, &f.maker, &f.meter).unwrap();
        let keys = chain.verify(&f.anchors).unwrap();
        assert_eq!(keys.meter, f.registry.public_key(&f.meter).unwrap());
        assert_eq!(keys.grid_operator, f.registry.public_key(&f.grid).unwrap());
    }

    #[test]
    fn swapped_anchor_fails_a_hop() {
        let f = fixture();
        let chain = ChainOfTrust::from_registry(&f.registry, &f.grid, &f.maker, &f.meter).unwrap();
        let swapped = TrustAnchors {
            grid_ca: f.anchors.meter_ca,
            meter_ca: f.anchors.grid_ca,
        };
        assert!(matches!(chain.verify(&swapped), Err(CarbonError::SignatureInvalid(_))));
    }

    #[test]
    fn identity_substitution_is_detected() {
        let f = fixture();
        let mut chain = ChainOfTrust::from_registry(&f.registry, &f.grid, &f.maker, &f.meter).unwrap();
        chain.meter.identity = "meter-2".into();
        assert!(matches!(chain.verify(&f.anchors), Err(CarbonError::SignatureInvalid(_))));
    }

    #[test]
    fn claimed_signer_is_not_trusted() {
        let f = fixture();
        let mut rng = ChaCha20Rng::seed_from_u64(99);
        let rogue = KeyCustody::generate(RoleId::new(Role::Manufacturer, "rogue"), &mut rng);
        let meter_pk = f.registry.public_key(&f.meter).unwrap();

        let mut chain = ChainOfTrust::from_registry(&f.registry, &f.grid, &f.maker, &f.meter).unwrap();
        chain.meter = rogue.sign_key(&meter_pk, "meter-1");
        assert!(chain.verify(&f.anchors).is_err());
    }

    #[test]
    fn signing_is_deterministic() {
        let f = fixture();
        let ca = f.registry.get(&RoleId::new(Role::CertificateAuthority, "grid-ca")).unwrap();
        let pk = f.registry.public_key(&f.grid).unwrap();
        assert_eq!(ca.sign_key(&pk, "grid-1"), ca.sign_key(&pk, "grid-1"));
    }

    #[test]
    fn serialized_artifacts_still_verify() {
        let f = fixture();
        let meter = f.registry.get(&f.meter).unwrap();
        let signed = meter.sign(Note(42));

        let json = serde_json::to_string(&signed).unwrap();
        let back: SignedArtifact<Note> = serde_json::from_str(&json).unwrap();
        back.verify(&meter.public_key()).unwrap();

        let credential = meter.credential().unwrap();
        let json = serde_json::to_string(credential).unwrap();
        let back: SignedKey = serde_json::from_str(&json).unwrap();
        back.verify(&f.registry.public_key(&f.maker).unwrap()).unwrap();
    }

    #[test]
    fn custody_debug_redacts_secret() {
        let f = fixture();
        let rendered = format!("{:?}", f.registry.get(&f.meter).unwrap());
        assert!(rendered.contains("<redacted>"));
    }
}

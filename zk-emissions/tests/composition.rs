use zk_emissions::CarbonError;
use zk_emissions::constants::{NONCE_LEN, SHARE_TOTAL};
use zk_emissions::ledger::{self, IntensityFactor, MeterReading};
use zk_emissions::programs::{EmissionsProgram, EmissionsWitness, SharesProgram, SharesWitness};
use zk_emissions::proof::{ProofOf, ProofSystem, TranscriptSystem, prove_checked};
use zk_emissions::tree::MerkleSumTree;
use zk_emissions::trust::{ChainOfTrust, KeyCustody, KeyRegistry, Role, RoleId, TrustAnchors, TrustedKeys};
use zk_emissions::types::{AggregateNode, Customer, Invoice, Nonce, RatioBounds};
use zk_emissions::verifier::{
    ClaimProgram, CompositionVerifier, EntityClaimWitness, PublicEntityRecord, allocate_emissions,
    verify_claim_proof,
};

const START: u64 = 1_750_334_400;
const INTERVALS: usize = 8;
const HEIGHT: usize = 4;

#[derive(Default)]
struct Options {
    period_shift: u64,
    drop_last_customer: bool,
    rogue_meter: bool,
}

struct Fixture {
    customers: Vec<Customer>,
    tree: MerkleSumTree,
    shares: SharesProgram,
    emissions: EmissionsProgram,
    shares_root: ProofOf<SharesProgram>,
    emissions_root: ProofOf<EmissionsProgram>,
    chain: ChainOfTrust,
    anchors: TrustAnchors,
    keys: TrustedKeys,
}

fn customers(n: usize, period_shift: u64) -> Vec<Customer> {
    // 8 x 2^61 = 2^64; cost 2^37 puts every ratio at 2^24, inside the band.
    (0..n as u64)
        .map(|id| Customer {
            share_allocation: 1 << 61,
            nonce: Nonce([id as u8 + 7; NONCE_LEN]),
            invoice: Invoice {
                customer_id: id,
                period_from: START + period_shift,
                period_to: START + period_shift + INTERVALS as u64 * 1_800,
                resource_charges: 1 << 37,
                other_charges: 1_000 + id as u128,
            },
        })
        .collect()
}

fn prove_shares(
    program: &SharesProgram,
    tree: &MerkleSumTree,
    records: &[Option<Customer>],
) -> ProofOf<SharesProgram> {
    let system = TranscriptSystem;
    let mut level: Vec<_> = records
        .chunks(program.batch_size())
        .enumerate()
        .map(|(k, chunk)| {
            let root = tree.node(program.base_level() as usize, k as u64);
            prove_checked(&system, program, root, &SharesWitness::Base { records: chunk.to_vec() })
                .unwrap()
        })
        .collect();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|p| {
                let parent = AggregateNode::combine(&p[0].public_input, &p[1].public_input).unwrap();
                let witness = SharesWitness::Step { left: p[0].clone(), right: p[1].clone() };
                prove_checked(&system, program, parent, &witness).unwrap()
            })
            .collect();
    }
    level.pop().unwrap()
}

fn build(opts: Options) -> Fixture {
    let seed = |b: u8| [b; 32];
    let grid_ca = RoleId::new(Role::CertificateAuthority, "grid-ca");
    let meter_ca = RoleId::new(Role::CertificateAuthority, "meter-ca");
    let grid = RoleId::new(Role::GridOperator, "grid-1");
    let maker = RoleId::new(Role::Manufacturer, "maker-1");
    let meter = RoleId::new(Role::Meter, "meter-1");

    let mut registry = KeyRegistry::new();
    for (i, id) in [&grid_ca, &meter_ca, &grid, &maker, &meter].into_iter().enumerate() {
        registry.insert(KeyCustody::from_secret(id.clone(), seed(i as u8 + 1)));
    }
    registry.issue(&grid_ca, &grid).unwrap();
    registry.issue(&meter_ca, &maker).unwrap();
    registry.issue(&maker, &meter).unwrap();

    let rogue = KeyCustody::from_secret(RoleId::new(Role::Meter, "rogue"), seed(0xee));
    let grid_key = registry.get(&grid).unwrap();
    let meter_key = if opts.rogue_meter { &rogue } else { registry.get(&meter).unwrap() };

    let intensities: Vec<_> = (0..INTERVALS as u64)
        .map(|i| {
            grid_key.sign(IntensityFactor {
                value: 200 + i,
                time_from: START + i * 1_800,
                time_to: START + (i + 1) * 1_800,
            })
        })
        .collect();
    let readings: Vec<_> = (0..=INTERVALS as u64)
        .map(|i| meter_key.sign(MeterReading { value: 10_000 + i * 45_000, timestamp: START + i * 1_800 }))
        .collect();

    let system = TranscriptSystem;
    let emissions = EmissionsProgram::new(2).unwrap();
    let mut level: Vec<_> = ledger::partition(&intensities, &readings, 2)
        .unwrap()
        .into_iter()
        .map(|b| {
            let witness = EmissionsWitness::Base {
                intensities: b.intensities,
                grid_operator_pk: grid_key.public_key(),
                readings: b.readings,
                meter_pk: meter_key.public_key(),
            };
            prove_checked(&system, &emissions, (), &witness).unwrap()
        })
        .collect();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|p| {
                let witness = EmissionsWitness::Step { left: p[0].clone(), right: p[1].clone() };
                prove_checked(&system, &emissions, (), &witness).unwrap()
            })
            .collect();
    }
    let emissions_root = level.pop().unwrap();

    let n = if opts.drop_last_customer { 7 } else { 8 };
    let customers = customers(n, opts.period_shift);
    let tree = MerkleSumTree::from_customers(HEIGHT, &customers, RatioBounds::default()).unwrap();
    let shares = SharesProgram::new(2, HEIGHT, RatioBounds::default()).unwrap();
    let mut records: Vec<_> = customers.iter().cloned().map(Some).collect();
    records.resize(tree.leaf_count() as usize, None);
    let shares_root = prove_shares(&shares, &tree, &records);

    let chain = ChainOfTrust::from_registry(&registry, &grid, &maker, &meter).unwrap();
    let anchors = TrustAnchors {
        grid_ca: registry.public_key(&grid_ca).unwrap(),
        meter_ca: registry.public_key(&meter_ca).unwrap(),
    };
    let keys = chain.verify(&anchors).unwrap();

    Fixture {
        customers,
        tree,
        shares,
        emissions,
        shares_root,
        emissions_root,
        chain,
        anchors,
        keys,
    }
}

impl Fixture {
    fn claim(&self, index: usize) -> (PublicEntityRecord, EntityClaimWitness) {
        let customer = self.customers[index].clone();
        let public = PublicEntityRecord {
            invoice: customer.invoice,
            emissions: self.emissions_root.public_output.total_emissions * customer.share_allocation,
            meter_ca_pk: self.anchors.meter_ca,
            grid_ca_pk: self.anchors.grid_ca,
            tree_root_hash: self.tree.root().content_hash,
            meter_pk: self.keys.meter,
            grid_operator_pk: self.keys.grid_operator,
        };
        let private = EntityClaimWitness {
            customer,
            witness: self.tree.witness(index as u64).unwrap(),
            emissions_proof: self.emissions_root.clone(),
            shares_proof: self.shares_root.clone(),
            chain: self.chain.clone(),
        };
        (public, private)
    }

    fn check(&self, public: &PublicEntityRecord, private: &EntityClaimWitness) -> Result<u128, CarbonError> {
        CompositionVerifier::new(&TranscriptSystem, &self.shares, &self.emissions).check(public, private)
    }
}

#[test]
fn every_customer_claim_verifies() {
    let f = build(Options::default());
    assert_eq!(f.shares_root.public_input, f.tree.root());
    assert_eq!(f.shares_root.public_input.total_shares, SHARE_TOTAL);

    let expected_total: u128 = (0..INTERVALS as u128).map(|i| (200 + i) * 45_000).sum();
    assert_eq!(f.emissions_root.public_output.total_emissions, expected_total);

    let mut sum = 0u128;
    for i in 0..f.customers.len() {
        let (public, private) = f.claim(i);
        sum += f.check(&public, &private).unwrap();
    }
    assert_eq!(sum, expected_total * SHARE_TOTAL);

    let allocated = allocate_emissions(expected_total, &f.customers).unwrap();
    assert_eq!(allocated.iter().sum::<u128>(), sum);
}

#[test]
fn claim_proof_is_accepted_by_auditor() {
    let f = build(Options::default());
    let program = ClaimProgram { shares: f.shares, emissions: f.emissions };
    let (public, private) = f.claim(3);

    let proof = TranscriptSystem.prove(&program, public.clone(), &private).unwrap();
    let record = verify_claim_proof(&TranscriptSystem, &program, &proof, &f.anchors, &f.keys).unwrap();
    assert_eq!(record, public);

    let mut other = f.keys;
    other.meter = f.anchors.grid_ca;
    assert!(matches!(
        verify_claim_proof(&TranscriptSystem, &program, &proof, &f.anchors, &other),
        Err(CarbonError::KeyBindingMismatch(_))
    ));
}

#[test]
fn inflated_claim_is_rejected() {
    let f = build(Options::default());
    let (mut public, private) = f.claim(0);
    public.emissions += 1;
    assert!(matches!(f.check(&public, &private), Err(CarbonError::EmissionsMismatch { .. })));

    let program = ClaimProgram { shares: f.shares, emissions: f.emissions };
    assert!(TranscriptSystem.prove(&program, public, &private).is_err());
}

#[test]
fn witness_of_another_customer_is_rejected() {
    let f = build(Options::default());
    let (public, mut private) = f.claim(0);
    private.witness = f.tree.witness(1).unwrap();
    assert!(matches!(f.check(&public, &private), Err(CarbonError::WitnessRootMismatch)));
}

#[test]
fn edited_invoice_is_rejected() {
    let f = build(Options::default());
    let (mut public, private) = f.claim(2);
    public.invoice.other_charges -= 1;
    assert!(matches!(f.check(&public, &private), Err(CarbonError::InvoiceMismatch(_))));

    // Editing both sides changes the leaf hash, which the witness no longer reaches.
    let (mut public, mut private) = f.claim(2);
    public.invoice.other_charges -= 1;
    private.customer.invoice.other_charges -= 1;
    assert!(matches!(f.check(&public, &private), Err(CarbonError::WitnessRootMismatch)));
}

#[test]
fn billing_period_must_match_emissions_period() {
    let f = build(Options { period_shift: 1_800, ..Default::default() });
    let (public, private) = f.claim(0);
    assert!(matches!(f.check(&public, &private), Err(CarbonError::PeriodMismatch { .. })));
}

#[test]
fn incomplete_share_set_is_rejected() {
    let f = build(Options { drop_last_customer: true, ..Default::default() });
    assert_eq!(f.shares_root.public_input.total_shares, 7 << 61);
    let (public, private) = f.claim(0);
    assert!(matches!(
        f.check(&public, &private),
        Err(CarbonError::ShareTotalMismatch { expected: SHARE_TOTAL, .. })
    ));
    assert!(allocate_emissions(1, &f.customers).is_err());
}

#[test]
fn readings_from_uncertified_meter_are_rejected() {
    let f = build(Options { rogue_meter: true, ..Default::default() });
    let (public, private) = f.claim(0);
    assert!(matches!(f.check(&public, &private), Err(CarbonError::KeyBindingMismatch(_))));
}

#[test]
fn wrong_trust_anchor_is_rejected() {
    let f = build(Options::default());
    let (mut public, private) = f.claim(0);
    public.meter_ca_pk = public.grid_ca_pk;
    assert!(matches!(f.check(&public, &private), Err(CarbonError::SignatureInvalid(_))));
}

#[test]
fn forged_root_output_is_rejected() {
    let f = build(Options::default());
    let (public, mut private) = f.claim(0);
    private.shares_proof.public_input.total_other_charges += 1;
    assert!(matches!(
        f.check(&public, &private),
        Err(CarbonError::ProofVerificationFailed { .. })
    ));

    let (public, mut private) = f.claim(0);
    private.emissions_proof.public_output.total_emissions *= 2;
    assert!(matches!(
        f.check(&public, &private),
        Err(CarbonError::ProofVerificationFailed { .. })
    ));
}

#[test]
fn intermediate_level_proof_is_not_a_root() {
    let f = build(Options::default());
    let system = TranscriptSystem;
    let records: Vec<_> = f.customers[..2].iter().cloned().map(Some).collect();
    let base = prove_checked(&system, &f.shares, f.tree.node(1, 0), &SharesWitness::Base { records })
        .unwrap();
    assert_eq!(base.public_output, 1);

    let (public, mut private) = f.claim(0);
    private.shares_proof = base;
    assert!(matches!(
        f.check(&public, &private),
        Err(CarbonError::StatementUnsatisfied { .. })
    ));
}

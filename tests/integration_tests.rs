//! Integration tests for the arithmetic kernel, validation, signing,
//! Merkle accumulator, rule DSL and attestations.

use nuaudit::kernel::{self, apply};
use nuaudit::merkle::empty_root;
use nuaudit::validator::{assert_pair, validate_pair};
use nuaudit::{
    add, assert_invariants, catch, catch_with, compose, compute_content_hash, flip, merkle_root,
    multiply, sha256, validate, Attestation, Attestor, Direction, Level, Logic, MerkleTree,
    MonitorConfig, NuError, NuPair, Operation, PublicKey, Rule, RuleDsl, SigningIdentity,
};

const EPS: f64 = 1e-12;

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() <= EPS * b.abs().max(1.0)
}

fn leaves(n: usize) -> Vec<[u8; 32]> {
    (0..n).map(|i| sha256(format!("leaf-{}", i).as_bytes())).collect()
}

// ============================================================================
// Kernel Tests
// ============================================================================

#[test]
fn test_add_concrete_example() {
    let out = add(NuPair::new(10.0, 0.5), NuPair::new(20.0, 1.0));
    assert_eq!(out.nominal, 30.0);
    assert!(approx(out.uncertainty, (0.25f64 + 1.0).sqrt()));
    assert!(approx(out.uncertainty, 1.118_033_988_749_895));
}

#[test]
fn test_add_commutative_nominal_exact() {
    let a = NuPair::new(1.25, 0.3);
    let b = NuPair::new(-7.5, 0.4);
    let ab = add(a, b);
    let ba = add(b, a);
    assert_eq!(ab.nominal, ba.nominal);
    assert!(approx(ab.uncertainty, ba.uncertainty));
}

#[test]
fn test_multiply_includes_cross_term() {
    let out = multiply(NuPair::new(2.0, 0.1), NuPair::new(3.0, 0.2));
    assert_eq!(out.nominal, 6.0);
    let expected = (0.4f64 * 0.4 + 0.3 * 0.3 + 0.02 * 0.02).sqrt();
    assert!(approx(out.uncertainty, expected));
    assert!(out.uncertainty > 0.5);
}

#[test]
fn test_multiply_margin_is_unity() {
    assert_eq!(kernel::MULTIPLY_MARGIN, 1.0);
}

#[test]
fn test_compose_concrete_example() {
    let out = compose(NuPair::new(10.0, 5.0), NuPair::new(10.0, 3.0)).expect("compose");
    assert!(approx(out.nominal, 10.0));
    assert!(approx(out.uncertainty, (225.0f64 / 34.0).sqrt()));
    assert!(out.uncertainty <= 3.0);
}

#[test]
fn test_compose_weights_favor_smaller_uncertainty() {
    let out = compose(NuPair::new(0.0, 1.0), NuPair::new(10.0, 3.0)).expect("compose");
    // weights 0.9 / 0.1
    assert!(approx(out.nominal, 1.0));
    assert!(out.uncertainty < 1.0);
}

#[test]
fn test_compose_exact_input_dominates() {
    let exact = NuPair::new(4.0, 0.0);
    let noisy = NuPair::new(9.0, 2.0);
    assert_eq!(compose(exact, noisy).expect("compose"), exact);
    assert_eq!(compose(noisy, exact).expect("compose"), exact);
}

#[test]
fn test_compose_collapsed_input_carries_no_information() {
    let known = NuPair::new(4.0, 1.0);
    assert_eq!(compose(NuPair::COLLAPSED, known).expect("compose"), known);
    assert_eq!(compose(known, NuPair::COLLAPSED).expect("compose"), known);
}

#[test]
fn test_compose_rejects_two_exact_inputs() {
    let result = compose(NuPair::exact(1.0), NuPair::exact(2.0));
    assert!(matches!(
        result,
        Err(NuError::Precondition { operation, .. }) if operation == "compose"
    ));
}

#[test]
fn test_compose_large_uncertainties_do_not_overflow() {
    let out = compose(NuPair::new(1.0, 1e200), NuPair::new(3.0, 1e200)).expect("compose");
    assert!(approx(out.nominal, 2.0));
    assert!(out.uncertainty.is_finite());
    assert!(out.uncertainty <= 1e200);
}

#[test]
fn test_catch_passes_valid_pairs() {
    let pair = NuPair::new(3.0, 0.5);
    assert_eq!(catch(pair), pair);
}

#[test]
fn test_catch_collapses_invalid_pairs() {
    for bad in [
        NuPair::new(1.0, -1.0),
        NuPair::new(f64::NAN, 1.0),
        NuPair::new(1.0, f64::NAN),
        NuPair::new(f64::INFINITY, 1.0),
        NuPair::new(f64::INFINITY, f64::INFINITY),
    ] {
        let out = catch(bad);
        assert_eq!(out.nominal, 0.0);
        assert_eq!(out.uncertainty, f64::INFINITY);
    }
}

#[test]
fn test_catch_with_custom_default_nominal() {
    let recovered = catch_with(NuPair::new(1.0, -0.1), 42.0);
    assert_eq!(recovered, NuPair::collapsed(42.0));
    assert_eq!(recovered.uncertainty, f64::INFINITY);

    let kept = NuPair::new(3.0, 0.25);
    assert_eq!(catch_with(kept, 42.0), kept);
}

#[test]
fn test_flip_is_involutive_bitwise() {
    let pair = NuPair::new(0.1 + 0.2, 1e-300);
    let twice = flip(flip(pair));
    assert_eq!(twice.nominal.to_bits(), pair.nominal.to_bits());
    assert_eq!(twice.uncertainty.to_bits(), pair.uncertainty.to_bits());
    assert_eq!(flip(pair).nominal, -pair.nominal);
}

#[test]
fn test_apply_dispatches_and_checks_arity() {
    let a = NuPair::new(1.0, 0.1);
    let b = NuPair::new(2.0, 0.2);
    assert_eq!(apply(&Operation::Add, &[a, b]).expect("add"), add(a, b));
    assert_eq!(apply(&Operation::Flip, &[a]).expect("flip"), flip(a));

    let wrong = apply(&Operation::Add, &[a]);
    assert!(matches!(wrong, Err(NuError::Precondition { .. })));

    let custom = apply(&Operation::parse("integrate"), &[a]);
    assert!(matches!(custom, Err(NuError::Precondition { .. })));
}

// ============================================================================
// Validator Tests
// ============================================================================

#[test]
fn test_validate_accepts_ordinary_and_collapsed_pairs() {
    assert!(validate(1.0, 0.0));
    assert!(validate(-5.0, 2.0));
    assert!(validate(f64::INFINITY, f64::INFINITY));
    assert!(validate(0.0, f64::INFINITY));
}

#[test]
fn test_validate_rejects_bad_pairs() {
    assert!(!validate(1.0, -0.001));
    assert!(!validate(f64::NAN, 1.0));
    assert!(!validate(1.0, f64::NAN));
    assert!(!validate(f64::INFINITY, 1.0));
    assert!(!validate(f64::NEG_INFINITY, 0.0));
}

#[test]
fn test_assert_invariants_returns_typed_error() {
    assert!(assert_invariants(1.0, 1.0, "add").is_ok());
    let err = assert_invariants(2.0, -1.0, "multiply").expect_err("negative uncertainty");
    match err {
        NuError::InvariantViolation { operation, nominal, uncertainty } => {
            assert_eq!(operation, "multiply");
            assert_eq!(nominal, 2.0);
            assert_eq!(uncertainty, -1.0);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_pair_helpers() {
    let pair = NuPair::new(10.0, 2.0);
    assert!(validate_pair(&pair));
    assert!(assert_pair(&NuPair::new(1.0, -1.0), "flip").is_err());
    assert_eq!(pair.coverage(), 0.2);
    assert_eq!(NuPair::new(0.0, 1.0).coverage(), f64::INFINITY);
    assert!(pair.contains(11.5));
    assert!(!pair.contains(12.5));
    assert_eq!(<(f64, f64)>::from(pair), (10.0, 2.0));
}

// ============================================================================
// Signing Tests
// ============================================================================

#[test]
fn test_sign_verify_roundtrip() {
    let identity = SigningIdentity::generate();
    let signature = nuaudit::signing::sign(b"payload", &identity);
    assert_eq!(signature.len(), nuaudit::signing::SIGNATURE_LENGTH);
    assert!(nuaudit::signing::verify(b"payload", &signature, identity.public_key()));
    assert!(!nuaudit::signing::verify(b"payload!", &signature, identity.public_key()));
}

#[test]
fn test_verify_with_other_key_fails() {
    let a = SigningIdentity::generate();
    let b = SigningIdentity::generate();
    let signature = a.sign(b"msg");
    assert!(!b.public_key().verify(b"msg", &signature));
}

#[test]
fn test_malformed_signature_is_rejected_not_panicking() {
    let identity = SigningIdentity::generate();
    assert!(!identity.verify(b"msg", &[0u8; 10]));
    assert!(!identity.verify(b"msg", &[]));
}

#[test]
fn test_identity_restore_and_public_key_hex() {
    let identity = SigningIdentity::generate();
    let restored = SigningIdentity::from_bytes(&identity.secret_bytes());
    assert_eq!(identity.public_key(), restored.public_key());

    let hex_key = identity.public_key().to_hex();
    let parsed = PublicKey::from_hex(&hex_key).expect("parse");
    assert_eq!(&parsed, identity.public_key());
    assert!(matches!(PublicKey::from_hex("abcd"), Err(NuError::Signature { .. })));
}

#[test]
fn test_identity_debug_hides_secret() {
    let identity = SigningIdentity::from_bytes(&[7u8; 32]);
    let debug = format!("{:?}", identity);
    assert!(!debug.contains(&hex::encode([7u8; 32])));
    assert!(debug.contains(&identity.public_key().fingerprint()));
}

// ============================================================================
// Merkle Tests
// ============================================================================

#[test]
fn test_merkle_empty_and_single_leaf() {
    let tree = MerkleTree::new();
    assert!(tree.is_empty());
    assert_eq!(tree.root(), empty_root());
    assert_eq!(merkle_root(&[]), empty_root());

    let leaf = leaves(1)[0];
    let tree = MerkleTree::from_leaves(&[leaf]);
    assert_eq!(tree.root(), leaf);
}

#[test]
fn test_merkle_incremental_matches_full_rebuild() {
    for n in 0..=33 {
        let data = leaves(n);
        let mut tree = MerkleTree::new();
        for leaf in &data {
            let root = tree.append(*leaf);
            assert_eq!(root, tree.root());
        }
        assert_eq!(tree.len(), n);
        assert_eq!(tree.root(), merkle_root(&data), "mismatch at n={}", n);
    }
}

#[test]
fn test_merkle_odd_count_duplicates_last_node() {
    let data = leaves(3);
    let pair = |l: &[u8; 32], r: &[u8; 32]| {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(l);
        buf.extend_from_slice(r);
        sha256(&buf)
    };
    let expected = pair(&pair(&data[0], &data[1]), &pair(&data[2], &data[2]));
    assert_eq!(merkle_root(&data), expected);
}

#[test]
fn test_merkle_proofs_verify_for_every_leaf() {
    for n in 1..=12 {
        let tree = MerkleTree::from_leaves(&leaves(n));
        for i in 0..n {
            let proof = tree.generate_proof(i).expect("proof");
            assert!(proof.verify(), "proof {} of {} failed", i, n);
            assert_eq!(proof.root, tree.root());
        }
    }
}

#[test]
fn test_merkle_proof_detects_tampering() {
    let tree = MerkleTree::from_leaves(&leaves(7));
    let mut proof = tree.generate_proof(6).expect("proof");
    assert_eq!(proof.path[0].1, Direction::Right);

    proof.leaf_hash[0] ^= 1;
    assert!(!proof.verify());

    let other = MerkleTree::from_leaves(&leaves(8));
    let proof = tree.generate_proof(2).expect("proof");
    assert!(!proof.verify_against(&other.root()));
}

#[test]
fn test_merkle_proof_out_of_range() {
    let tree = MerkleTree::from_leaves(&leaves(2));
    assert!(matches!(tree.generate_proof(2), Err(NuError::NotFound { .. })));
}

#[test]
fn test_merkle_single_bit_change_changes_root() {
    let mut data = leaves(10);
    let original = merkle_root(&data);
    data[4][31] ^= 0x01;
    assert_ne!(merkle_root(&data), original);
}

// ============================================================================
// DSL Tests
// ============================================================================

#[test]
fn test_dsl_parse_config() {
    let text = r#"
        # default policy
        rule invariant
        rule coverage > 0.1 level: warning
        rule uncertainty > 5 level: error   # absolute bound
        halt_on_critical: true
        auto_log: true
    "#;
    let config = RuleDsl::parse_config(text).expect("parse");
    assert_eq!(
        config.rules,
        vec![
            Rule::Invariant,
            Rule::coverage(0.1, Level::Warning),
            Rule::threshold(5.0, Level::Error),
        ]
    );
    assert!(config.halt_on_critical);
    assert!(config.auto_log);
}

#[test]
fn test_dsl_nested_composites() {
    let rule = RuleDsl::parse_rule(
        "any(coverage > 0.5 level: critical, all(uncertainty > 2, coverage > 1 level: error))",
    )
    .expect("parse");
    match rule {
        Rule::Composite { logic: Logic::Or, rules } => {
            assert_eq!(rules.len(), 2);
            assert_eq!(rules[0], Rule::coverage(0.5, Level::Critical));
            assert_eq!(
                rules[1],
                Rule::all(vec![
                    Rule::threshold(2.0, Level::Warning),
                    Rule::coverage(1.0, Level::Error),
                ])
            );
        }
        other => panic!("unexpected rule: {:?}", other),
    }
}

#[test]
fn test_dsl_errors() {
    assert!(matches!(
        RuleDsl::parse_rule("coverage < 0.1"),
        Err(NuError::ParseError { .. })
    ));
    assert!(matches!(
        RuleDsl::parse_rule("coverage > abc"),
        Err(NuError::ParseError { .. })
    ));
    assert!(matches!(
        RuleDsl::parse_rule("coverage > 0.1 level: severe"),
        Err(NuError::ParseError { .. })
    ));
    assert!(matches!(
        RuleDsl::parse_rule("all(coverage > 1"),
        Err(NuError::ParseError { .. })
    ));
    assert!(matches!(
        RuleDsl::parse_config("rule invariant\nfrobnicate: yes"),
        Err(NuError::ParseError { source, .. }) if source == "line 2"
    ));
    assert!(matches!(
        RuleDsl::parse_config("auto_log: maybe"),
        Err(NuError::ParseError { .. })
    ));
}

#[test]
fn test_dsl_rejects_invalid_thresholds() {
    assert!(matches!(
        RuleDsl::parse_config("rule coverage > -1"),
        Err(NuError::InvalidConfig { .. })
    ));
    assert!(matches!(
        RuleDsl::parse_config("rule all()"),
        Err(NuError::InvalidConfig { .. })
    ));
}

// ============================================================================
// Attestation Tests
// ============================================================================

#[test]
fn test_attestation_roundtrip() {
    let identity = SigningIdentity::generate();
    let hash = sha256(b"artifact");
    let attestation =
        Attestation::create("artifact-1".to_string(), &hash, 1_700_000_000, &identity);

    assert!(attestation.verified);
    assert_eq!(attestation.hash, hex::encode(hash));
    assert!(attestation.verify(identity.public_key()));

    let json = attestation.to_json().expect("json");
    for key in ["target_id", "timestamp", "hash", "signature", "verified"] {
        assert!(json.get(key).is_some(), "missing {}", key);
    }
}

#[test]
fn test_attestation_detects_field_changes() {
    let identity = SigningIdentity::generate();
    let attestation = Attestation::create("t".to_string(), &sha256(b"x"), 10, &identity);

    let mut moved = attestation.clone();
    moved.timestamp = 11;
    assert!(!moved.verify(identity.public_key()));

    let mut rehashed = attestation.clone();
    rehashed.hash = hex::encode(sha256(b"y"));
    assert!(!rehashed.verify(identity.public_key()));

    let mut garbled = attestation;
    garbled.signature = "zz".to_string();
    assert!(!garbled.verify(identity.public_key()));
}

#[test]
fn test_attestor_config_attestation() {
    let attestor = Attestor::new(SigningIdentity::generate());
    let config = MonitorConfig::new(vec![Rule::Invariant, Rule::coverage(0.2, Level::Error)]);

    let attestation = attestor.attest_config("policy-v1", &config).expect("attest");
    assert!(attestor.contains("policy-v1").expect("contains"));
    assert_eq!(attestor.retrieve("policy-v1").expect("retrieve"), attestation);

    let hash = config.content_hash().expect("hash");
    assert!(attestor.validate("policy-v1", &hash).expect("validate"));

    let changed = MonitorConfig::new(vec![Rule::Invariant]);
    let changed_hash = changed.content_hash().expect("hash");
    assert!(!attestor.validate("policy-v1", &changed_hash).expect("validate"));
}

#[test]
fn test_attestor_missing_target() {
    let attestor = Attestor::new(SigningIdentity::generate());
    assert!(matches!(attestor.retrieve("nope"), Err(NuError::NotFound { .. })));
    assert!(!attestor.contains("nope").expect("contains"));
}

#[test]
fn test_content_hash_ignores_key_order() {
    let a = serde_json::json!({ "b": 1, "a": [1, 2, { "y": true, "x": null }] });
    let b = serde_json::json!({ "a": [1, 2, { "x": null, "y": true }], "b": 1 });
    assert_eq!(compute_content_hash(&a), compute_content_hash(&b));
    assert_eq!(compute_content_hash(&a).len(), 64);
}

#[test]
fn test_config_hash_is_deterministic() {
    let a = MonitorConfig::new(vec![Rule::coverage(0.1, Level::Warning)]).with_auto_log(true);
    let b = MonitorConfig::new(vec![Rule::coverage(0.1, Level::Warning)]).with_auto_log(true);
    assert_eq!(a.content_hash().expect("hash"), b.content_hash().expect("hash"));
    let c = a.clone().with_halt_on_critical(true);
    assert_ne!(a.content_hash().expect("hash"), c.content_hash().expect("hash"));
}

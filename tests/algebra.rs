use std::collections::BTreeMap;

use mqf::{Cqf, CqfError, CqfParams, LockMode, Residency};
use rand::{rngs::StdRng, Rng, SeedableRng};

const KEY_BITS: u64 = 22;

fn params(nslots: u64) -> CqfParams {
    CqfParams::new(nslots, KEY_BITS)
        .with_fixed_counter_bits(4)
        .with_seed(0x5eed)
}

/// A filter of `nslots` holding `n` random keys, and its exact contents.
fn random_filter(nslots: u64, n: usize, seed: u64) -> (Cqf, BTreeMap<u64, u64>) {
    let qf = Cqf::new(params(nslots)).unwrap();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut model = BTreeMap::new();
    for _ in 0..n {
        // a narrow key range so both filters share keys
        let key = rng.gen_range(0..1u64 << 12);
        let count = rng.gen_range(1..30);
        qf.insert(key, count, LockMode::NONE).unwrap();
        *model.entry(key).or_insert(0) += count;
    }
    (qf, model)
}

fn assert_holds(qf: &Cqf, model: &BTreeMap<u64, u64>) {
    for (&key, &count) in model {
        assert_eq!(qf.query(key), count, "key {key}");
    }
    assert_eq!(qf.ndistinct_elts(), model.len() as u64);
    assert_eq!(qf.nelts(), model.values().sum::<u64>());
    let mut keys: Vec<u64> = qf.iter().map(|r| r.key).collect();
    keys.sort_unstable();
    assert_eq!(keys, model.keys().copied().collect::<Vec<_>>());
}

#[test]
fn merge_matches_model() {
    let (a, ma) = random_filter(1 << 10, 500, 1);
    let (b, mb) = random_filter(1 << 9, 250, 2);
    let mut out = Cqf::new(params(1 << 11)).unwrap();
    Cqf::merge(&a, &b, &mut out).unwrap();
    let mut expected = ma.clone();
    for (key, count) in mb {
        *expected.entry(key).or_insert(0) += count;
    }
    assert_holds(&out, &expected);
    assert!(out.iter().map(|r| r.hash).collect::<Vec<_>>().windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn intersect_and_subtract_match_model() {
    let (a, ma) = random_filter(1 << 10, 500, 3);
    let (b, mb) = random_filter(1 << 10, 500, 4);

    let mut both = Cqf::new(params(1 << 10)).unwrap();
    Cqf::intersect(&a, &b, &mut both).unwrap();
    let expected: BTreeMap<u64, u64> = ma
        .iter()
        .filter_map(|(k, &ca)| mb.get(k).map(|&cb| (*k, ca.min(cb))))
        .collect();
    assert!(!expected.is_empty());
    assert_holds(&both, &expected);

    let mut diff = Cqf::new(params(1 << 10)).unwrap();
    Cqf::subtract(&a, &b, &mut diff).unwrap();
    let expected: BTreeMap<u64, u64> = ma
        .iter()
        .filter_map(|(k, &ca)| {
            let cb = mb.get(k).copied().unwrap_or(0);
            (ca > cb).then(|| (*k, ca - cb))
        })
        .collect();
    assert_holds(&diff, &expected);
}

#[test]
fn multi_merge_matches_model() {
    let parts: Vec<_> = (0..4).map(|i| random_filter(1 << 9, 150, 10 + i)).collect();
    let mut out = Cqf::new(params(1 << 11)).unwrap();
    let inputs: Vec<&Cqf> = parts.iter().map(|(qf, _)| qf).collect();
    Cqf::multi_merge(&inputs, &mut out).unwrap();
    let mut expected = BTreeMap::new();
    for (_, model) in &parts {
        for (&key, &count) in model {
            *expected.entry(key).or_insert(0) += count;
        }
    }
    assert_holds(&out, &expected);
}

#[test]
fn inner_product_matches_model() {
    let (a, ma) = random_filter(1 << 10, 400, 5);
    let (b, mb) = random_filter(1 << 10, 400, 6);
    let expected: u64 = ma
        .iter()
        .filter_map(|(k, &ca)| mb.get(k).map(|&cb| ca * cb))
        .sum();
    assert_eq!(a.inner_product(&b).unwrap(), expected);
    assert_eq!(b.inner_product(&a).unwrap(), expected);
    let norm = (ma.values().map(|&c| (c * c) as f64).sum::<f64>()).sqrt();
    assert!((a.magnitude() - norm).abs() < 1e-6);
    let cos = a.cosine_similarity(&b).unwrap();
    assert!(cos > 0.0 && cos <= 1.0);
}

#[test]
fn mismatched_widths_are_rejected() {
    let (a, _) = random_filter(1 << 9, 10, 7);
    let tagged = Cqf::new(params(1 << 9).with_tag_bits(2)).unwrap();
    let mut out = Cqf::new(params(1 << 9)).unwrap();
    for result in [
        Cqf::merge(&a, &tagged, &mut out),
        Cqf::intersect(&a, &tagged, &mut out),
        Cqf::subtract(&a, &tagged, &mut out),
    ] {
        assert!(matches!(result, Err(CqfError::IncompatibleMerge(_))));
    }
    assert!(out.is_empty());
}

#[test]
fn resize_grows_and_shrinks() {
    let (qf, model) = random_filter(1 << 9, 250, 8);
    let grown = qf.resize(1 << 12, Residency::InMemory, None).unwrap();
    assert_eq!(grown.geometry().nslots, 1 << 12);
    assert_holds(&grown, &model);

    let shrunk = grown.resize(1 << 9, Residency::InMemory, None).unwrap();
    assert_holds(&shrunk, &model);

    let too_small = shrunk.resize(64, Residency::InMemory, None);
    assert!(matches!(too_small, Err(CqfError::CapacityExhausted { .. })));
    assert_holds(&shrunk, &model);
    assert_holds(&qf, &model);
}

#[test]
fn resize_with_staging_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let (qf, model) = random_filter(1 << 9, 200, 9);
    let staging = dir.path().join("staging.mqf");
    let target = dir.path().join("resized.mqf");
    let resized = qf
        .resize(1 << 11, Residency::File(target.clone()), Some(&staging))
        .unwrap();
    assert_holds(&resized, &model);
    drop(resized);
    let reopened = Cqf::open(&target).unwrap();
    assert_holds(&reopened, &model);
}

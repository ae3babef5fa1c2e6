use mqf::{BufferedFilter, BufferedParams, Cqf, CqfError, CqfParams, LockMode, META_WORDS};
use rand::{rngs::StdRng, Rng, SeedableRng};

fn populated(params: CqfParams, n: usize, seed: u64) -> Cqf {
    let qf = Cqf::new(params).unwrap();
    let key_bits = qf.geometry().key_bits;
    let mut rng = StdRng::seed_from_u64(seed);
    for _ in 0..n {
        let key = rng.gen_range(0..1u64 << key_bits);
        qf.insert(key, rng.gen_range(1..100), LockMode::NONE).unwrap();
    }
    qf
}

#[test]
fn round_trip_is_query_equivalent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("filter.mqf");
    let qf = populated(
        CqfParams::new(1 << 10, 24).with_fixed_counter_bits(3).with_seed(42),
        400,
        1,
    );
    qf.serialize(&path).unwrap();

    for loaded in [Cqf::deserialize(&path).unwrap(), Cqf::open(&path).unwrap()] {
        assert!(loaded.equals(&qf));
        assert_eq!(loaded.metadata().nused_slots, qf.nused_slots());
        assert_eq!(loaded.noccupied_slots(), qf.noccupied_slots());
        for record in qf.iter() {
            assert_eq!(loaded.query(record.key), record.count);
        }
        assert_eq!(loaded.query(u64::MAX), qf.query(u64::MAX));
    }
}

#[test]
fn layout_is_header_then_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("filter.mqf");
    let qf = Cqf::in_memory(64, 16).unwrap();
    qf.serialize(&path).unwrap();
    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(bytes.len() as u64, qf.geometry().total_size_bytes());
    assert_eq!(&bytes[..8], &mqf::MAGIC.to_le_bytes());
    let total = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
    assert_eq!(total, bytes.len() as u64);
    let words_per_block = 4 + qf.geometry().bits_per_slot as usize;
    assert_eq!(
        bytes.len(),
        (META_WORDS + qf.geometry().nblocks as usize * words_per_block) * 8
    );
    assert!(bytes[META_WORDS * 8..].iter().all(|&b| b == 0));
}

#[test]
fn mapped_filter_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mapped.mqf");
    {
        let qf = Cqf::new(CqfParams::new(1 << 9, 20).in_file(&path)).unwrap();
        assert!(!qf.metadata().in_memory);
        for key in 0..200 {
            qf.insert(key, 2, LockMode::SPIN).unwrap();
        }
        qf.sync().unwrap();
    }
    {
        let qf = Cqf::open(&path).unwrap();
        assert_eq!(qf.nelts(), 400);
        for key in 0..100 {
            assert!(qf.remove(key, 2, LockMode::NONE).unwrap());
        }
    }
    let qf = Cqf::open(&path).unwrap();
    assert_eq!(qf.nelts(), 200);
    assert_eq!(qf.ndistinct_elts(), 100);
    assert_eq!(qf.query(50), 0);
    assert_eq!(qf.query(150), 2);
}

#[test]
fn existing_file_is_not_clobbered() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("taken.mqf");
    std::fs::write(&path, b"precious").unwrap();
    assert!(matches!(
        Cqf::new(CqfParams::new(64, 16).in_file(&path)),
        Err(CqfError::Io(_))
    ));
    assert_eq!(std::fs::read(&path).unwrap(), b"precious");
    assert!(matches!(
        Cqf::open(&path),
        Err(CqfError::MalformedPersisted(_))
    ));
}

#[test]
fn size_mismatch_is_malformed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("filter.mqf");
    populated(CqfParams::new(128, 16), 50, 2).serialize(&path).unwrap();
    let mut bytes = std::fs::read(&path).unwrap();
    bytes.extend_from_slice(&[0u8; 8]);
    std::fs::write(&path, &bytes).unwrap();
    let err = Cqf::deserialize(&path).unwrap_err();
    assert!(matches!(err, CqfError::MalformedPersisted(_)));
    assert!(err.to_string().contains("bytes"));
}

#[test]
fn buffered_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("buffered.mqf");
    let mut filter = BufferedFilter::new(
        BufferedParams::new(256, 1 << 12, 20)
            .with_fixed_counter_bits(2)
            .with_capacity_path(&path),
    )
    .unwrap();
    let mut rng = StdRng::seed_from_u64(3);
    let keys: Vec<u64> = (0..1500).map(|_| rng.gen_range(0..1u64 << 20)).collect();
    for &key in &keys {
        filter.insert(key, 1).unwrap();
    }
    assert!(filter.capacity_tier().ndistinct_elts() > 0);
    assert!(!filter.fast_tier().unwrap().is_empty());
    let expected: Vec<_> = filter.iter().collect();
    filter.set_flush_threshold(0.5).unwrap();
    filter.serialize(&path).unwrap();
    drop(filter);

    let mut loaded = BufferedFilter::deserialize(&path).unwrap();
    assert_eq!(loaded.iter().collect::<Vec<_>>(), expected);
    assert_eq!(loaded.flush_threshold(), 0.9);
    loaded.set_flush_threshold(0.5).unwrap();
    assert_eq!(loaded.flush_threshold(), 0.5);
    drop(loaded);

    let mapped = BufferedFilter::open(&path).unwrap();
    assert_eq!(mapped.capacity_tier().path(), Some(path.as_path()));
    assert!(mapped.fast_tier().unwrap().path().is_none());
    for &key in &keys {
        assert!(mapped.count_key(key) >= 1);
    }
    assert_eq!(mapped.iter().collect::<Vec<_>>(), expected);
}

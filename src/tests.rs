use crate::{Dict, DictCursor, Error, OrderedDict, RangeKey};
use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use rand::{Rng, RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tempfile::TempDir;

static TRACING: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
});

fn store_path(dir: &TempDir) -> PathBuf {
    Lazy::force(&TRACING);
    dir.path().join("store")
}

fn random_blob(rng: &mut impl Rng, max_len: usize) -> Vec<u8> {
    let len = rng.gen_range(0..=max_len);
    let mut blob = vec![0u8; len];
    rng.fill_bytes(&mut blob);
    blob
}

fn collect_forward(
    dict: &mut OrderedDict,
    min: RangeKey,
    max: RangeKey,
) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut iter = dict.range_forward(min, max).unwrap();
    let mut out = Vec::new();
    while !iter.is_at_end() {
        out.push(iter.read_record().unwrap());
        iter.advance().unwrap();
    }
    out
}

fn collect_backward(
    dict: &mut OrderedDict,
    min: RangeKey,
    max: RangeKey,
) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut iter = dict.range_backward(min, max).unwrap();
    let mut out = Vec::new();
    while !iter.is_at_end() {
        out.push(iter.read_record().unwrap());
        iter.advance().unwrap();
    }
    out
}

fn full_scan(dict: &mut Dict) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut cursor = DictCursor::default();
    let mut out = Vec::new();
    while let Some(record) = dict.scan(&mut cursor).unwrap() {
        out.push(record);
    }
    out
}

#[test]
fn hash_basic_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = store_path(&dir);

    let mut dict = Dict::open(&path, true).unwrap();
    assert_eq!(dict.add(b"foo", b"bar", false).unwrap(), (None, true));
    assert_eq!(dict.add(b"hello", b"w0rd", false).unwrap(), (None, true));
    assert_eq!(
        dict.update(b"hello", b"world", true).unwrap(),
        (Some(b"w0rd".to_vec()), true)
    );
    // a duplicate add leaves the map untouched
    assert_eq!(dict.add(b"foo", b"nope", true).unwrap(), (Some(b"bar".to_vec()), false));
    // updating an absent key is a no-op
    assert_eq!(dict.update(b"missing", b"x", true).unwrap(), (None, false));
    dict.close().unwrap();

    let mut dict = Dict::open(&path, false).unwrap();
    let mut scanned = full_scan(&mut dict);
    scanned.sort();
    assert_eq!(
        scanned,
        vec![
            (b"foo".to_vec(), b"bar".to_vec()),
            (b"hello".to_vec(), b"world".to_vec()),
        ]
    );
    assert_eq!(dict.has(b"foo", true).unwrap(), (Some(b"bar".to_vec()), true));
    assert_eq!(dict.delete(b"hello", true).unwrap(), (Some(b"world".to_vec()), true));
    assert_eq!(dict.has(b"hello", true).unwrap(), (None, false));
    dict.close().unwrap();
}

#[test]
fn tree_basic_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = store_path(&dir);

    let mut dict = OrderedDict::open(&path, true).unwrap();
    assert_eq!(dict.add(b"foo", b"bar", false).unwrap(), (None, true));
    assert_eq!(dict.add(b"hello", b"w0rd", false).unwrap(), (None, true));
    assert_eq!(
        dict.update(b"hello", b"world", true).unwrap(),
        (Some(b"w0rd".to_vec()), true)
    );
    dict.close().unwrap();

    let mut dict = OrderedDict::open(&path, false).unwrap();
    assert_eq!(
        collect_forward(&mut dict, RangeKey::Min, RangeKey::Max),
        vec![
            (b"foo".to_vec(), b"bar".to_vec()),
            (b"hello".to_vec(), b"world".to_vec()),
        ]
    );
    assert_eq!(
        collect_backward(&mut dict, RangeKey::Key(b"foo"), RangeKey::Max),
        vec![
            (b"hello".to_vec(), b"world".to_vec()),
            (b"foo".to_vec(), b"bar".to_vec()),
        ]
    );
    let mut iter = dict.range_forward(RangeKey::Min, RangeKey::Min).unwrap();
    assert_eq!(iter.read_key().unwrap(), b"foo");
    drop(iter);
    let mut iter = dict.range_backward(RangeKey::Max, RangeKey::Max).unwrap();
    assert_eq!(iter.read_key().unwrap(), b"hello");
    drop(iter);
    dict.close().unwrap();
}

#[test]
fn range_sentinel_edge_cases() {
    let dir = TempDir::new().unwrap();
    let mut dict = OrderedDict::open(store_path(&dir), true).unwrap();
    for key in [b"bb".as_slice(), b"dd", b"ff"] {
        dict.add(key, b"v", false).unwrap();
    }

    // reversed sentinels produce an empty range
    assert!(collect_forward(&mut dict, RangeKey::Max, RangeKey::Min).is_empty());
    // an upper bound of Min resolves to the first record
    assert_eq!(
        collect_forward(&mut dict, RangeKey::Key(b"bb"), RangeKey::Min),
        vec![(b"bb".to_vec(), b"v".to_vec())]
    );
    // bounds between keys
    assert_eq!(
        collect_forward(&mut dict, RangeKey::Key(b"cc"), RangeKey::Key(b"ee"))
            .into_iter()
            .map(|(k, _)| k)
            .collect::<Vec<_>>(),
        vec![b"dd".to_vec()]
    );
    assert!(collect_forward(&mut dict, RangeKey::Key(b"x"), RangeKey::Key(b"a")).is_empty());
    assert!(collect_forward(&mut dict, RangeKey::Key(b"g"), RangeKey::Max).is_empty());
    assert!(collect_backward(&mut dict, RangeKey::Min, RangeKey::Key(b"a")).is_empty());
    dict.close().unwrap();
}

#[test]
fn empty_tree_iterators_are_exhausted() {
    let dir = TempDir::new().unwrap();
    let mut dict = OrderedDict::open(store_path(&dir), true).unwrap();
    let mut iter = dict.range_forward(RangeKey::Min, RangeKey::Max).unwrap();
    assert!(iter.is_at_end());
    assert!(matches!(iter.read_key(), Err(Error::ExhaustedIterator)));
    assert!(matches!(iter.advance(), Err(Error::ExhaustedIterator)));
    drop(iter);
    dict.close().unwrap();
}

#[test]
fn large_spilled_records() {
    let dir = TempDir::new().unwrap();
    let mut dict = OrderedDict::open(store_path(&dir), true).unwrap();
    let baseline = dict.stats().space.allocated_size;

    let mut rng = Xoshiro256PlusPlus::seed_from_u64(7);
    let mut key = vec![0u8; 4096];
    let mut value = vec![0u8; 4096];
    rng.fill_bytes(&mut key);
    rng.fill_bytes(&mut value);

    assert_eq!(dict.add(&key, &value, false).unwrap(), (None, true));
    assert!(dict.stats().space.allocated_size > baseline);
    assert_eq!(dict.has(&key, true).unwrap(), (Some(value.clone()), true));
    assert_eq!(dict.stats().payload_size, 8192);

    // a shorter prefix of a spilled key is a different key
    assert_eq!(dict.has(&key[..300], false).unwrap(), (None, false));

    assert_eq!(dict.delete(&key, true).unwrap(), (Some(value), true));
    assert_eq!(dict.stats().space.allocated_size, baseline);
    assert_eq!(dict.stats().payload_size, 0);
    dict.close().unwrap();
}

#[test]
fn hash_scale_and_destroy() {
    let dir = TempDir::new().unwrap();
    let path = store_path(&dir);
    let mut dict = Dict::open(&path, true).unwrap();

    const N: u64 = 100_000;
    for i in 0..N {
        let key = i.to_be_bytes();
        let (_, inserted) = dict.add(&key, &i.to_le_bytes(), false).unwrap();
        assert!(inserted);
    }
    assert_eq!(dict.stats().item_count, N as i64);
    dict.validate();
    dict.close().unwrap();

    let mut dict = Dict::open(&path, false).unwrap();
    assert_eq!(dict.stats().item_count, N as i64);
    for i in 0..N {
        let (value, present) = dict.has(&i.to_be_bytes(), true).unwrap();
        assert!(present, "key {i} lost");
        assert_eq!(value.unwrap(), i.to_le_bytes());
    }

    let mut order: Vec<u64> = (0..N).collect();
    order.shuffle(&mut Xoshiro256PlusPlus::seed_from_u64(0x1234567890abcdef));
    for &i in &order {
        let (_, existed) = dict.delete(&i.to_be_bytes(), false).unwrap();
        assert!(existed);
    }
    let stats = dict.stats();
    assert_eq!(stats.slot_count, 1);
    assert_eq!(stats.item_count, 0);
    assert_eq!(stats.payload_size, 0);
    dict.validate();

    let stats = dict.destroy().unwrap();
    assert_eq!(stats.allocated_size, 0);
    assert_eq!(stats.block_count, 0);
}

#[test]
fn hash_random_ops_match_model() {
    let dir = TempDir::new().unwrap();
    let path = store_path(&dir);
    let mut dict = Dict::open(&path, true).unwrap();
    let mut model: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(0xdead_beef);

    for round in 0..4 {
        for _ in 0..2000 {
            let key = random_blob(&mut rng, 48);
            let value = random_blob(&mut rng, 64);
            match rng.gen_range(0..5) {
                0 => {
                    let (previous, inserted) = dict.add(&key, &value, true).unwrap();
                    assert_eq!(previous.as_ref(), model.get(&key));
                    assert_eq!(inserted, !model.contains_key(&key));
                    model.entry(key).or_insert(value);
                }
                1 => {
                    let (previous, existed) = dict.update(&key, &value, true).unwrap();
                    assert_eq!(previous.as_ref(), model.get(&key));
                    assert_eq!(existed, model.contains_key(&key));
                    if existed {
                        model.insert(key, value);
                    }
                }
                2 => {
                    let (previous, inserted) = dict.add_or_update(&key, &value, true).unwrap();
                    assert_eq!(previous.as_ref(), model.get(&key));
                    assert_eq!(inserted, !model.contains_key(&key));
                    model.insert(key, value);
                }
                3 => {
                    let (previous, existed) = dict.delete(&key, true).unwrap();
                    assert_eq!(previous.as_ref(), model.get(&key));
                    assert_eq!(existed, model.contains_key(&key));
                    model.remove(&key);
                }
                _ => {
                    let (value, present) = dict.has(&key, true).unwrap();
                    assert_eq!(value.as_ref(), model.get(&key));
                    assert_eq!(present, model.contains_key(&key));
                }
            }
        }
        dict.validate();

        let mut scanned = full_scan(&mut dict);
        scanned.sort();
        let mut expected: Vec<(Vec<u8>, Vec<u8>)> =
            model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        expected.sort();
        assert_eq!(scanned, expected, "scan mismatch in round {round}");

        dict.close().unwrap();
        dict = Dict::open(&path, false).unwrap();
        dict.validate();
    }
    dict.close().unwrap();
}

#[test]
fn tree_random_ops_match_model() {
    let dir = TempDir::new().unwrap();
    let path = store_path(&dir);
    let mut dict = OrderedDict::open(&path, true).unwrap();
    let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(0x1234567890abcdef);

    for round in 0..4 {
        for _ in 0..1500 {
            // half the keys come from small pools so updates, upserts and
            // deletes regularly hit keys that are already present; the
            // spilled pool exercises the overflow paths on reused keys
            let key = match rng.gen_range(0..20) {
                0 => random_blob(&mut rng, 400),
                1 => {
                    let mut key = vec![b'k'; 300];
                    key.extend_from_slice(format!("{:02}", rng.gen_range(0..40)).as_bytes());
                    key
                }
                2..=9 => format!("hot-{:03}", rng.gen_range(0..150)).into_bytes(),
                _ => random_blob(&mut rng, 32),
            };
            let value = if rng.gen_range(0..20) == 0 {
                random_blob(&mut rng, 300)
            } else {
                random_blob(&mut rng, 40)
            };
            match rng.gen_range(0..5) {
                0 => {
                    let (previous, inserted) = dict.add(&key, &value, true).unwrap();
                    assert_eq!(previous.as_ref(), model.get(&key));
                    assert_eq!(inserted, !model.contains_key(&key));
                    model.entry(key).or_insert(value);
                }
                1 => {
                    let (previous, existed) = dict.update(&key, &value, true).unwrap();
                    assert_eq!(previous.as_ref(), model.get(&key));
                    assert_eq!(existed, model.contains_key(&key));
                    if existed {
                        model.insert(key, value);
                    }
                }
                2 => {
                    let (previous, inserted) = dict.add_or_update(&key, &value, true).unwrap();
                    assert_eq!(previous.as_ref(), model.get(&key));
                    assert_eq!(inserted, !model.contains_key(&key));
                    model.insert(key, value);
                }
                3 => {
                    let (previous, existed) = dict.delete(&key, true).unwrap();
                    assert_eq!(previous.as_ref(), model.get(&key));
                    assert_eq!(existed, model.contains_key(&key));
                    model.remove(&key);
                }
                _ => {
                    let (value, present) = dict.has(&key, true).unwrap();
                    assert_eq!(value.as_ref(), model.get(&key));
                    assert_eq!(present, model.contains_key(&key));
                }
            }
        }
        dict.validate();

        let expected: Vec<(Vec<u8>, Vec<u8>)> =
            model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        assert_eq!(
            collect_forward(&mut dict, RangeKey::Min, RangeKey::Max),
            expected,
            "full scan mismatch in round {round}"
        );

        // random subranges, both directions
        for _ in 0..20 {
            let a = random_blob(&mut rng, 40);
            let b = random_blob(&mut rng, 40);
            let (min, max) = if a <= b { (a, b) } else { (b, a) };
            let expected: Vec<(Vec<u8>, Vec<u8>)> = model
                .range(min.clone()..=max.clone())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            let forward =
                collect_forward(&mut dict, RangeKey::Key(&min), RangeKey::Key(&max));
            assert_eq!(forward, expected);
            let mut backward =
                collect_backward(&mut dict, RangeKey::Key(&min), RangeKey::Key(&max));
            backward.reverse();
            assert_eq!(backward, expected);
        }

        dict.close().unwrap();
        dict = OrderedDict::open(&path, false).unwrap();
        dict.validate();
    }
    dict.close().unwrap();
}

#[test]
fn tree_scale_with_reinsertions() {
    let dir = TempDir::new().unwrap();
    let path = store_path(&dir);
    let mut dict = OrderedDict::open(&path, true).unwrap();
    let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(42);

    const N: u32 = 30_000;
    let mut keys = Vec::with_capacity(N as usize);
    for i in 0..N {
        let mut key = [0u8; 12];
        key[..8].copy_from_slice(&rng.next_u64().to_be_bytes());
        key[8..].copy_from_slice(&i.to_be_bytes());
        keys.push(key.to_vec());
    }
    for (i, key) in keys.iter().enumerate() {
        let mut value = vec![0u8; 100];
        value[..8].copy_from_slice(&(i as u64).to_be_bytes());
        dict.add_or_update(key, &value, false).unwrap();
        model.insert(key.clone(), value);
        // half of the keys get deleted along the way and half of those
        // reinserted with a new value
        if i % 2 == 1 {
            let victim = &keys[rng.gen_range(0..=i)];
            dict.delete(victim, false).unwrap();
            model.remove(victim);
            if i % 4 == 1 {
                dict.add(victim, b"resurrected", false).unwrap();
                model.insert(victim.clone(), b"resurrected".to_vec());
            }
        }
    }
    assert!(dict.stats().height >= 3, "tree stayed flat: {:?}", dict.stats());
    dict.validate();

    let expected: Vec<(Vec<u8>, Vec<u8>)> =
        model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    assert_eq!(collect_forward(&mut dict, RangeKey::Min, RangeKey::Max), expected);
    assert_eq!(dict.stats().record_count, model.len() as i64);

    // drain and destroy: everything must come back
    for key in model.keys() {
        let (_, existed) = dict.delete(key, false).unwrap();
        assert!(existed);
    }
    assert_eq!(dict.stats().record_count, 0);
    assert_eq!(dict.stats().payload_size, 0);
    assert_eq!(dict.stats().leaf_count, 1);
    assert_eq!(dict.stats().height, 1);
    dict.validate();
    let stats = dict.destroy().unwrap();
    assert_eq!(stats.allocated_size, 0);
    assert_eq!(stats.block_count, 0);
}

#[test]
fn persistence_preserves_order_and_stats() {
    let dir = TempDir::new().unwrap();
    let path = store_path(&dir);
    let mut dict = OrderedDict::open(&path, true).unwrap();
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(99);
    let mut model = BTreeMap::new();
    for _ in 0..3000 {
        let key = random_blob(&mut rng, 24);
        let value = random_blob(&mut rng, 24);
        dict.add_or_update(&key, &value, false).unwrap();
        model.insert(key, value);
    }
    let stats = dict.stats();
    dict.close().unwrap();

    let mut dict = OrderedDict::open(&path, false).unwrap();
    let reopened = dict.stats();
    assert_eq!(reopened.height, stats.height);
    assert_eq!(reopened.leaf_count, stats.leaf_count);
    assert_eq!(reopened.non_leaf_count, stats.non_leaf_count);
    assert_eq!(reopened.record_count, stats.record_count);
    assert_eq!(reopened.payload_size, stats.payload_size);
    assert_eq!(reopened.space.allocated_size, stats.space.allocated_size);
    assert_eq!(reopened.space.block_count, stats.space.block_count);
    let expected: Vec<(Vec<u8>, Vec<u8>)> =
        model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    assert_eq!(collect_forward(&mut dict, RangeKey::Min, RangeKey::Max), expected);
    dict.validate();
    dict.close().unwrap();
}

#[test]
fn store_kinds_do_not_mix() {
    let dir = TempDir::new().unwrap();
    let path = store_path(&dir);
    let mut dict = Dict::open(&path, true).unwrap();
    dict.add(b"k", b"v", false).unwrap();
    dict.close().unwrap();

    match OrderedDict::open(&path, false) {
        Err(Error::Corruption(_)) => {}
        other => panic!("unexpected: {:?}", other.map(|_| ())),
    }
}

#[test]
fn second_writer_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = store_path(&dir);
    let dict = Dict::open(&path, true).unwrap();
    match Dict::open(&path, false) {
        Err(Error::Io(_)) => {}
        other => panic!("unexpected: {:?}", other.map(|_| ())),
    }
    dict.close().unwrap();
}

#[test]
fn empty_keys_and_values_are_legal() {
    let dir = TempDir::new().unwrap();
    let mut dict = Dict::open(store_path(&dir), true).unwrap();
    assert_eq!(dict.add(b"", b"", false).unwrap(), (None, true));
    assert_eq!(dict.has(b"", true).unwrap(), (Some(Vec::new()), true));
    dict.close().unwrap();

    let dir = TempDir::new().unwrap();
    let mut dict = OrderedDict::open(store_path(&dir), true).unwrap();
    assert_eq!(dict.add(b"", b"empty key", false).unwrap(), (None, true));
    assert_eq!(dict.add(b"k", b"", false).unwrap(), (None, true));
    assert_eq!(
        collect_forward(&mut dict, RangeKey::Min, RangeKey::Max),
        vec![
            (Vec::new(), b"empty key".to_vec()),
            (b"k".to_vec(), Vec::new()),
        ]
    );
    dict.close().unwrap();
}

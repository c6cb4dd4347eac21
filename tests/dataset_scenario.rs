// End-to-end dataset flows through the public API: JSON rows over tiny
// trunks, boundary-size sweeps, and shuffled epochs.
use serde_json::{json, Value};
use trunkrow::api::{PoolShuffle, RecordSource, RowStorage, StreamMode, TrunkOptions, Whence};

fn storage(dir: &tempfile::TempDir, max_trunk_size: u64) -> RowStorage {
    RowStorage::open_uri(&format!("file://{}", dir.path().display()))
        .expect("storage")
        .with_trunk_options(TrunkOptions::new(max_trunk_size))
}

fn row(i: u64) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "index": i,
        "bbb": "aaa",
        "ccc": i as f64 * 3.1415926 + 3.0,
    }))
    .expect("encode row")
}

fn decode(raw: &[u8]) -> Value {
    serde_json::from_slice(raw).expect("decode row")
}

#[test]
fn json_rows_survive_tiny_trunks() {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = storage(&dir, 16);

    let mut writer = storage
        .open("test", "rows", StreamMode::Write, None)
        .expect("open write");
    for i in 0..117 {
        writer.write(&row(i)).expect("write");
    }
    writer.close().expect("close");

    let mut reader = storage
        .open("test", "rows", StreamMode::Read, None)
        .expect("open read");
    assert_eq!(reader.size(), 117);

    for i in 0..117 {
        let record = reader.read().expect("read").expect("record");
        let value = decode(&record);
        assert_eq!(value["index"].as_u64(), Some(i));
        assert_eq!(value["bbb"].as_str(), Some("aaa"));
        let ccc = value["ccc"].as_f64().expect("ccc");
        assert!((ccc - (i as f64 * 3.1415926 + 3.0)).abs() < 1e-9);
    }
    assert_eq!(reader.read().expect("read"), None);

    let random = decode(&reader.pread(60).expect("pread"));
    assert_eq!(random["index"].as_u64(), Some(60));

    reader.seek(1, Whence::End).expect("seek");
    let last = decode(&reader.read().expect("read").expect("record"));
    assert_eq!(last["index"].as_u64(), Some(116));
}

#[test]
fn trunk_size_never_shows_through() {
    // Records of varying length against trunk sizes around, at, and far
    // from the payload boundaries.
    let records: Vec<Vec<u8>> = (0..50u32)
        .map(|i| vec![i as u8; (i as usize * 7) % 23 + 1])
        .collect();
    let total: usize = records.iter().map(Vec::len).sum();

    for max_trunk_size in [3, 8, 16, total as u64 - 1, total as u64, total as u64 + 1, 1 << 20] {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = storage(&dir, max_trunk_size);

        let mut writer = storage
            .open("test", "sweep", StreamMode::Write, None)
            .expect("open write");
        for record in &records {
            writer.write(record).expect("write");
        }
        writer.close().expect("close");

        let mut reader = storage
            .open("test", "sweep", StreamMode::Read, None)
            .expect("open read");
        for (i, record) in records.iter().enumerate() {
            assert_eq!(
                reader.read().expect("read").as_deref(),
                Some(record.as_slice()),
                "sequential record {i} with max_trunk_size {max_trunk_size}"
            );
        }
        assert_eq!(reader.read().expect("read"), None);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(
                &reader.pread(i as u64).expect("pread"),
                record,
                "random record {i} with max_trunk_size {max_trunk_size}"
            );
        }
    }
}

#[test]
fn sharded_shuffled_epochs_cover_the_dataset() {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = storage(&dir, 4096);
    let total = 1200u64;

    let mut writer = storage
        .open("test", "epochs", StreamMode::Write, None)
        .expect("open write");
    for i in 0..total {
        writer.write(&i.to_le_bytes()).expect("write");
    }
    writer.close().expect("close");

    let world = 3u64;
    let mut seen = Vec::new();
    let mut per_rank_first_epoch = Vec::new();
    for rank in 0..world {
        let shard = storage
            .open("test", "epochs", StreamMode::Read, None)
            .expect("open read")
            .shard(rank, world)
            .expect("shard");
        let mut shuffle = PoolShuffle::new(shard, 42, 64);

        shuffle.set_epoch(0).expect("epoch");
        let first: Vec<Vec<u8>> = drain(&mut shuffle);
        shuffle.set_epoch(0).expect("epoch");
        assert_eq!(drain(&mut shuffle), first, "epoch replay for rank {rank}");

        shuffle.set_epoch(1).expect("epoch");
        let second = drain(&mut shuffle);
        assert_ne!(first, second, "epochs must reorder for rank {rank}");
        assert_eq!(sorted(first.clone()), sorted(second));

        per_rank_first_epoch.push(first.len() as u64);
        seen.extend(first);
    }

    // 1200 records over 3 ranks divides evenly, so the shards cover
    // everything exactly once.
    assert_eq!(per_rank_first_epoch, vec![total / world; world as usize]);
    let mut indices: Vec<u64> = seen
        .iter()
        .map(|raw| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(raw);
            u64::from_le_bytes(bytes)
        })
        .collect();
    indices.sort_unstable();
    assert_eq!(indices, (0..total).collect::<Vec<u64>>());
}

fn drain(source: &mut dyn RecordSource) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(record) = source.read().expect("read") {
        out.push(record);
    }
    out
}

fn sorted(mut records: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
    records.sort();
    records
}

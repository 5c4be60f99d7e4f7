// End-to-end append then random-access lookup through the public API.
mod common;

use common::{HOUR_MS, XorShift64, init_tracing, small_options};
use ledgerstone::api::{AppendOutcome, ErrorKind, Queue, SetClock, ValidationStatus};

#[test]
fn appended_records_are_readable_by_index_after_reopen() {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = SetClock::new(HOUR_MS * 7 + 11);
    let mut rng = XorShift64::new(0x5eed);
    let payloads: Vec<Vec<u8>> = (0..600).map(|_| rng.payload(300)).collect();

    let queue = Queue::open(dir.path(), small_options(&clock)).expect("open");
    let mut appender = queue.acquire_appender().expect("appender");
    let mut indices = Vec::with_capacity(payloads.len());
    for payload in &payloads {
        match appender.append(payload).expect("append") {
            AppendOutcome::Committed { index } => indices.push(index),
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    appender.close().expect("close appender");
    assert_eq!(indices.first().copied(), Some(7u64 << 32));
    assert!(indices.windows(2).all(|pair| pair[1] == pair[0] + 1));

    let report = queue.verify().expect("verify");
    assert_eq!(report.status, ValidationStatus::Ok, "{report:?}");
    assert_eq!(report.last_good_cycle, Some(7));
    assert_eq!(report.last_good_seq, Some(599));
    queue.close().expect("close");

    let queue = Queue::open(dir.path(), small_options(&clock)).expect("reopen");
    assert_eq!(queue.last_index().expect("last"), Some((7u64 << 32) | 599));
    let mut order: Vec<usize> = (0..payloads.len()).collect();
    for i in (1..order.len()).rev() {
        let j = rng.next_u64() as usize % (i + 1);
        order.swap(i, j);
    }
    for position in order {
        let read = queue.read(indices[position]).expect("read");
        assert_eq!(read, payloads[position], "record {position}");
    }
    let err = queue.read((7u64 << 32) | 600).expect_err("past end");
    assert_eq!(err.kind(), ErrorKind::NotFound);
    queue.close().expect("close");
}

#[test]
fn documents_and_metadata_interleave_without_shifting_sequences() {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = SetClock::new(HOUR_MS);
    let queue = Queue::open(dir.path(), small_options(&clock)).expect("open");
    let mut appender = queue.acquire_appender().expect("appender");

    for i in 0..20u32 {
        if i % 3 == 0 {
            let mut meta = appender.writing_document(true).expect("meta");
            meta.write_bytes(b"marker").expect("write");
            meta.close().expect("close meta");
        }
        let mut doc = appender.writing_document(false).expect("doc");
        doc.write_bytes(&i.to_le_bytes()).expect("write");
        assert_eq!(doc.close().expect("close").index(), Some((1u64 << 32) | u64::from(i)));
    }
    for i in 0..20u32 {
        let read = queue.read((1u64 << 32) | u64::from(i)).expect("read");
        assert_eq!(read, i.to_le_bytes());
    }
    appender.close().expect("close");
    assert!(queue.verify().expect("verify").is_ok());
    queue.close().expect("close");
}

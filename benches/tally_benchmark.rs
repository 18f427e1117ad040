use chrono::NaiveDate;
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use recorder::storage::{TallyIncrement, TallyPeriod, TallyStore};
use recorder::types::{EventId, PayloadValue};

fn increment(event: u8, amount: u32) -> TallyIncrement {
    TallyIncrement {
        event_id: EventId::from_bytes([event; 16]),
        date: NaiveDate::from_ymd_opt(2024, 5, 20).unwrap(),
        unix_user_id: 1000,
        payload: Some(PayloadValue::String("bench".to_string())),
        amount,
    }
}

fn bench_single_commit(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = TallyStore::open(dir.path().join("bench.db")).unwrap();
    let inc = increment(1, 5);

    c.bench_function("tally_commit_single", |b| {
        b.iter(|| store.increment(black_box(&inc)).unwrap())
    });
}

fn bench_batch_commit(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = TallyStore::open(dir.path().join("bench.db")).unwrap();
    let batch: Vec<TallyIncrement> = (0..64).map(|i| increment(i, 1)).collect();

    c.bench_function("tally_commit_batch_64", |b| {
        b.iter(|| store.commit(black_box(&batch)).unwrap())
    });
}

fn bench_rollup_settle(c: &mut Criterion) {
    let today = NaiveDate::from_ymd_opt(2024, 6, 2).unwrap();

    c.bench_function("tally_rows_before_and_settle", |b| {
        b.iter_batched(
            || {
                let dir = tempfile::tempdir().unwrap();
                let store = TallyStore::open(dir.path().join("bench.db")).unwrap();
                let batch: Vec<TallyIncrement> = (0..64).map(|i| increment(i, 3)).collect();
                store.commit(&batch).unwrap();
                (dir, store)
            },
            |(_dir, store)| {
                let mut rows = store.rows_before(TallyPeriod::Day, today).unwrap();
                rows.extend(store.rows_before(TallyPeriod::Month, today).unwrap());
                store.settle(&rows).unwrap();
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(
    benches,
    bench_single_commit,
    bench_batch_commit,
    bench_rollup_settle
);
criterion_main!(benches);

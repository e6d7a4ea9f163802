//! End-to-end diffs against the in-memory backend.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use futures::StreamExt;
use table_diff::core::ColumnInfo;
use table_diff::{
    DbKey, DbValue, DiffError, DiffOptions, DiffRecord, MemoryDatabase, Row, TableDiffer,
    TablePath, TableSegment,
};

fn ratings(keys: impl IntoIterator<Item = i64>) -> MemoryDatabase {
    let db = MemoryDatabase::new();
    db.create_table(
        "ratings",
        vec![
            ColumnInfo::new("id", "bigint", false),
            ColumnInfo::new("rating", "integer", true),
        ],
    )
    .unwrap();
    db.insert_rows(
        "ratings",
        keys.into_iter()
            .map(|id| Row::new(id, vec![DbValue::Int(id % 5)])),
    )
    .unwrap();
    db
}

fn segment(db: &Arc<MemoryDatabase>) -> TableSegment {
    TableSegment::new(db.clone(), TablePath::parse("ratings").unwrap(), "id")
        .unwrap()
        .with_extra_columns(["rating"])
        .unwrap()
}

fn options(threshold: u64, factor: usize, concurrent: bool) -> DiffOptions {
    DiffOptions {
        bisection_factor: factor,
        bisection_threshold: threshold,
        concurrent,
        max_workers: Some(8),
    }
}

async fn run(a: &Arc<MemoryDatabase>, b: &Arc<MemoryDatabase>, options: DiffOptions) -> Vec<DiffRecord> {
    TableDiffer::new(options)
        .unwrap()
        .diff_tables(segment(a), segment(b))
        .collect_all()
        .await
        .unwrap()
}

fn signed_keys(records: &[DiffRecord]) -> BTreeSet<(char, DbKey)> {
    records.iter().map(|r| (r.sign(), r.key().clone())).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_identical_million_rows_prune_at_root() {
    let a = Arc::new(ratings(1..=1_000_000));
    let b = Arc::new(a.snapshot());

    let records = run(&a, &b, DiffOptions::default()).await;
    assert!(records.is_empty());

    for db in [&a, &b] {
        let counts = db.query_counts();
        assert_eq!(counts.count_and_checksum, 1);
        assert_eq!(counts.fetch_rows, 0);
        assert_eq!(counts.checkpoints, 0);
    }
}

#[tokio::test]
async fn test_single_added_row() {
    let a = Arc::new(ratings(1..=100));
    let b = Arc::new(ratings(1..=101));

    let records = run(&a, &b, DiffOptions::default()).await;
    assert_eq!(
        records,
        vec![DiffRecord::Added {
            key: DbKey::Int(101),
            values: vec![DbValue::Int(1)],
        }]
    );
}

#[tokio::test]
async fn test_single_changed_column() {
    let a = Arc::new(ratings(1..=100));
    let b = Arc::new(a.snapshot());
    b.update("ratings", 50i64, "rating", DbValue::Int(42)).unwrap();

    let records = run(&a, &b, DiffOptions::default()).await;
    assert_eq!(records.len(), 1);
    match &records[0] {
        DiffRecord::Changed { key, a, b, changes } => {
            assert_eq!(key, &DbKey::Int(50));
            assert_eq!(a, &vec![DbValue::Int(0)]);
            assert_eq!(b, &vec![DbValue::Int(42)]);
            assert_eq!(changes.len(), 1);
            assert_eq!(changes[0].column, "rating");
        }
        other => panic!("expected a changed record, got {:?}", other),
    }
}

#[tokio::test]
async fn test_deep_bisection_query_count_is_logarithmic() {
    let a = Arc::new(ratings(1..=1000));
    let b = Arc::new(a.snapshot());
    b.update("ratings", 777i64, "rating", DbValue::Int(9)).unwrap();

    let records = run(&a, &b, options(10, 2, true)).await;
    assert_eq!(signed_keys(&records), BTreeSet::from([('~', DbKey::Int(777))]));

    // one root check plus two sibling checks per level of log2(1000 / 10)
    let bound = 1 + 2 * 8;
    for db in [&a, &b] {
        let aggregates = db.query_counts().aggregates();
        assert!(aggregates <= bound, "{} aggregate queries", aggregates);
    }
    assert!(b.query_counts().fetch_rows <= 2);
}

#[tokio::test]
async fn test_diff_against_itself_is_empty() {
    let db = Arc::new(ratings((1..=5000).filter(|k| k % 3 != 0)));
    for concurrent in [true, false] {
        assert!(run(&db, &db, options(16, 4, concurrent)).await.is_empty());
    }
}

fn scattered_differences() -> (Arc<MemoryDatabase>, Arc<MemoryDatabase>, BTreeSet<(char, DbKey)>) {
    let a = ratings(1..=3000);
    let b = a.snapshot();
    let mut expected = BTreeSet::new();
    for key in [5i64, 123, 999, 1000, 2047, 2999] {
        b.update("ratings", key, "rating", DbValue::Null).unwrap();
        expected.insert(('~', DbKey::Int(key)));
    }
    for key in [1500i64, 1501, 3000] {
        b.delete("ratings", key).unwrap();
        expected.insert(('-', DbKey::Int(key)));
    }
    for key in 3001i64..=3003 {
        b.insert("ratings", key, vec![DbValue::Int(1)]).unwrap();
        expected.insert(('+', DbKey::Int(key)));
    }
    (Arc::new(a), Arc::new(b), expected)
}

#[tokio::test]
async fn test_sequential_records_arrive_in_key_order() {
    let (a, b, expected) = scattered_differences();
    let records = run(&a, &b, options(16, 4, false)).await;

    let keys: Vec<DbKey> = records.iter().map(|r| r.key().clone()).collect();
    assert!(keys.windows(2).all(|w| w[0] < w[1]), "{:?}", keys);
    assert_eq!(signed_keys(&records), expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_runs_agree() {
    let (a, b, expected) = scattered_differences();
    let first = run(&a, &b, options(16, 4, true)).await;
    let second = run(&a, &b, options(16, 4, true)).await;
    assert_eq!(first.len(), expected.len());
    assert_eq!(signed_keys(&first), expected);
    assert_eq!(signed_keys(&second), expected);
}

#[tokio::test]
async fn test_stats_track_the_run() {
    let (a, b, expected) = scattered_differences();
    let mut stream = TableDiffer::new(options(16, 4, false))
        .unwrap()
        .diff_tables(segment(&a), segment(&b));
    let mut emitted = 0;
    while let Some(record) = stream.next().await {
        record.unwrap();
        emitted += 1;
    }

    let stats = stream.stats();
    assert_eq!(stats.records_emitted, emitted);
    assert_eq!(emitted as usize, expected.len());
    assert!(stats.ranges_split >= 1);
    assert!(stats.ranges_pruned >= 1);
    assert!(stats.ranges_checked > stats.ranges_split);
    assert!(stats.rows_fetched > 0);
}

#[tokio::test]
async fn test_key_bounds_limit_the_diff() {
    let (a, b, _) = scattered_differences();
    let bounded = |db: &Arc<MemoryDatabase>| {
        segment(db)
            .with_key_range(Some(DbKey::Int(100)), Some(DbKey::Int(1501)))
            .unwrap()
    };
    let records = TableDiffer::new(options(16, 4, false))
        .unwrap()
        .diff_tables(bounded(&a), bounded(&b))
        .collect_all()
        .await
        .unwrap();
    assert_eq!(
        signed_keys(&records),
        BTreeSet::from([
            ('~', DbKey::Int(123)),
            ('~', DbKey::Int(999)),
            ('~', DbKey::Int(1000)),
            ('-', DbKey::Int(1500)),
        ])
    );
}

#[tokio::test]
async fn test_time_range_restricts_both_sides() {
    let day = |d: u32| {
        NaiveDate::from_ymd_opt(2022, 3, d)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    };
    let build = || {
        let db = MemoryDatabase::new();
        db.create_table(
            "events",
            vec![
                ColumnInfo::new("id", "bigint", false),
                ColumnInfo::new("updated_at", "timestamp", false),
            ],
        )
        .unwrap();
        db
    };
    let a = build();
    let b = build();
    for id in 1..=20i64 {
        a.insert("events", id, vec![day(id as u32).into()]).unwrap();
        if id != 3 && id != 15 {
            b.insert("events", id, vec![day(id as u32).into()]).unwrap();
        }
    }
    let (a, b) = (Arc::new(a), Arc::new(b));

    let window = |db: &Arc<MemoryDatabase>| {
        TableSegment::new(db.clone(), TablePath::parse("events").unwrap(), "id")
            .unwrap()
            .with_update_column("updated_at")
            .unwrap()
            .with_time_range(Some(day(10)), Some(day(20)))
            .unwrap()
    };
    let records = TableDiffer::new(options(4, 2, false))
        .unwrap()
        .diff_tables(window(&a), window(&b))
        .collect_all()
        .await
        .unwrap();
    assert_eq!(signed_keys(&records), BTreeSet::from([('-', DbKey::Int(15))]));
}

#[tokio::test]
async fn test_text_keys_in_byte_order() {
    let build = |keys: &[&str]| {
        let db = MemoryDatabase::new();
        db.create_table(
            "users",
            vec![
                ColumnInfo::new("login", "varchar(64)", false),
                ColumnInfo::new("name", "text", true),
            ],
        )
        .unwrap();
        for key in keys {
            db.insert("users", *key, vec![DbValue::from(key.to_uppercase())])
                .unwrap();
        }
        Arc::new(db)
    };
    let a = build(&["alice", "Bob", "carol", "dave", "Eve", "frank"]);
    let b = build(&["alice", "carol", "dave", "Eve", "frank", "zed"]);
    b.update("users", "dave", "name", "David").unwrap();

    let users = |db: &Arc<MemoryDatabase>| {
        TableSegment::new(db.clone(), TablePath::parse("users").unwrap(), "login")
            .unwrap()
            .with_extra_columns(["name"])
            .unwrap()
    };
    let records = TableDiffer::new(options(1, 2, false))
        .unwrap()
        .diff_tables(users(&a), users(&b))
        .collect_all()
        .await
        .unwrap();
    let summary: Vec<String> = records.iter().map(|r| format!("{} {}", r.sign(), r.key())).collect();
    assert_eq!(summary, vec!["- \"Bob\"", "~ \"dave\"", "+ \"zed\""]);
}

#[tokio::test]
async fn test_connectivity_failure_ends_the_stream() {
    let a = Arc::new(ratings(1..=1000));
    let b = Arc::new(a.snapshot());
    b.update("ratings", 777i64, "rating", DbValue::Int(9)).unwrap();
    b.fail_queries_after(4);

    let items: Vec<_> = TableDiffer::new(options(10, 2, true))
        .unwrap()
        .diff_tables(segment(&a), segment(&b))
        .collect()
        .await;

    assert_eq!(items.iter().filter(|item| item.is_err()).count(), 1);
    match items.last() {
        Some(Err(err)) => assert!(err.is_retryable(), "{}", err),
        other => panic!("expected a trailing error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_collect_all_returns_first_error() {
    let a = Arc::new(ratings(1..=100));
    let b = Arc::new(a.snapshot());
    b.fail_queries_after(1);

    let err = TableDiffer::new(options(10, 2, false))
        .unwrap()
        .diff_tables(segment(&a), segment(&b))
        .collect_all()
        .await
        .unwrap_err();
    assert!(matches!(err, DiffError::Connectivity { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dropping_the_stream_stops_new_queries() {
    let a = Arc::new(ratings(1..=4000).with_latency(Duration::from_millis(2)));
    let b = Arc::new(a.snapshot());
    for key in (1..=4000i64).step_by(7) {
        b.update("ratings", key, "rating", DbValue::Null).unwrap();
    }

    let mut stream = TableDiffer::new(options(8, 4, true))
        .unwrap()
        .diff_tables(segment(&a), segment(&b));
    assert!(stream.next().await.is_some());
    drop(stream);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let settled = a.query_counts().range_queries() + b.query_counts().range_queries();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let later = a.query_counts().range_queries() + b.query_counts().range_queries();

    assert_eq!(settled, later);
    assert_eq!(a.in_flight() + b.in_flight(), 0);
    // far fewer than a full run's leaf fetches
    assert!(b.query_counts().fetch_rows < 500);
}

#[tokio::test]
async fn test_cancel_ends_the_stream() {
    let a = Arc::new(ratings(1..=2000).with_latency(Duration::from_millis(1)));
    let b = Arc::new(a.snapshot());
    for key in (1..=2000i64).step_by(5) {
        b.update("ratings", key, "rating", DbValue::Null).unwrap();
    }

    let mut stream = TableDiffer::new(options(8, 4, false))
        .unwrap()
        .diff_tables(segment(&a), segment(&b));
    assert!(stream.next().await.is_some());
    stream.cancel();
    assert!(stream.is_cancelled());

    let mut remaining = 0;
    while let Some(item) = stream.next().await {
        item.unwrap();
        remaining += 1;
    }
    assert!(remaining < 100, "{} records after cancel", remaining);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_per_side_query_budget() {
    let a = Arc::new(
        ratings(1..=2000)
            .with_latency(Duration::from_millis(2))
            .with_max_concurrency(3),
    );
    let b = Arc::new(a.snapshot());
    for key in (1..=2000i64).step_by(11) {
        b.update("ratings", key, "rating", DbValue::Null).unwrap();
    }

    let options = DiffOptions {
        max_workers: Some(16),
        ..options(8, 8, true)
    };
    let records = run(&a, &b, options).await;
    assert_eq!(records.len(), (1..=2000).step_by(11).count());

    assert!(a.peak_in_flight() <= 3, "side a peaked at {}", a.peak_in_flight());
    assert!(b.peak_in_flight() <= 3, "side b peaked at {}", b.peak_in_flight());
}

#[tokio::test]
async fn test_missing_column_fails_before_range_queries() {
    let a = Arc::new(ratings(1..=100));
    let b = Arc::new(a.snapshot());
    let with_stars = |db: &Arc<MemoryDatabase>| {
        segment(db).with_extra_columns(["rating", "stars"]).unwrap()
    };

    let err = TableDiffer::new(DiffOptions::default())
        .unwrap()
        .diff_tables(with_stars(&a), with_stars(&b))
        .collect_all()
        .await
        .unwrap_err();
    assert!(matches!(err, DiffError::Schema(_)), "{}", err);
    assert_eq!(a.query_counts().range_queries(), 0);
    assert_eq!(b.query_counts().range_queries(), 0);
}

#[tokio::test]
async fn test_incomparable_key_domains() {
    let a = Arc::new(ratings(1..=10));
    let b = MemoryDatabase::new();
    b.create_table(
        "ratings",
        vec![
            ColumnInfo::new("id", "varchar(36)", false),
            ColumnInfo::new("rating", "integer", true),
        ],
    )
    .unwrap();
    let b = Arc::new(b);

    let err = TableDiffer::new(DiffOptions::default())
        .unwrap()
        .diff_tables(segment(&a), segment(&b))
        .collect_all()
        .await
        .unwrap_err();
    assert!(matches!(err, DiffError::Schema(_)), "{}", err);
    assert_eq!(a.query_counts().range_queries(), 0);
}

#[tokio::test]
async fn test_mismatched_bounds_are_rejected() {
    let a = Arc::new(ratings(1..=10));
    let narrowed = segment(&a)
        .with_key_range(Some(DbKey::Int(2)), None)
        .unwrap();

    let err = TableDiffer::new(DiffOptions::default())
        .unwrap()
        .diff_tables(segment(&a), narrowed)
        .collect_all()
        .await
        .unwrap_err();
    assert!(matches!(err, DiffError::Precondition(_)));
}

fn notes(rows: impl IntoIterator<Item = (i64, DbValue, DbValue)>) -> Arc<MemoryDatabase> {
    let db = MemoryDatabase::new();
    db.create_table(
        "notes",
        vec![
            ColumnInfo::new("id", "bigint", false),
            ColumnInfo::new("head", "text", true),
            ColumnInfo::new("tail", "text", true),
        ],
    )
    .unwrap();
    db.insert_rows(
        "notes",
        rows.into_iter().map(|(id, head, tail)| Row::new(id, vec![head, tail])),
    )
    .unwrap();
    Arc::new(db)
}

#[tokio::test]
async fn test_lookalike_rows_are_not_pruned() {
    let plain = |id: i64| (id, DbValue::from(format!("h{}", id)), DbValue::from("t"));
    let a = notes((1..=1000).map(|id| match id {
        250 => (id, DbValue::from("NULL"), DbValue::from("t")),
        750 => (id, DbValue::from("a|b"), DbValue::from("c")),
        _ => plain(id),
    }));
    let b = notes((1..=1000).map(|id| match id {
        250 => (id, DbValue::Null, DbValue::from("t")),
        750 => (id, DbValue::from("a"), DbValue::from("b|c")),
        _ => plain(id),
    }));

    let notes_segment = |db: &Arc<MemoryDatabase>| {
        TableSegment::new(db.clone(), TablePath::parse("notes").unwrap(), "id")
            .unwrap()
            .with_extra_columns(["head", "tail"])
            .unwrap()
    };
    let records = TableDiffer::new(options(10, 2, false))
        .unwrap()
        .diff_tables(notes_segment(&a), notes_segment(&b))
        .collect_all()
        .await
        .unwrap();

    assert_eq!(
        signed_keys(&records),
        BTreeSet::from([('~', DbKey::Int(250)), ('~', DbKey::Int(750))])
    );
}

#[tokio::test]
async fn test_large_leaf_streams_before_it_finishes() {
    let a = Arc::new(ratings(0..0));
    let b = Arc::new(ratings(1..=20_000));

    let mut stream = TableDiffer::new(options(10, 2, false))
        .unwrap()
        .diff_tables(segment(&a), segment(&b));
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.key(), &DbKey::Int(1));

    // the merge stalls on the record buffer instead of reading the whole side
    let fetched = stream.stats().rows_fetched;
    assert!(fetched < 4_000, "{} rows fetched before the first record", fetched);

    let mut added = 1;
    while let Some(record) = stream.next().await {
        assert_eq!(record.unwrap().sign(), '+');
        added += 1;
    }
    assert_eq!(added, 20_000);
    assert_eq!(stream.stats().rows_fetched, 20_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_workers_bound_ranges_in_progress() {
    let a = Arc::new(ratings(1..=3000).with_latency(Duration::from_millis(2)));
    let b = Arc::new(a.snapshot());
    for key in (1..=3000i64).step_by(13) {
        b.update("ratings", key, "rating", DbValue::Null).unwrap();
    }

    let options = DiffOptions {
        max_workers: Some(3),
        ..options(10, 4, true)
    };
    let mut stream = TableDiffer::new(options)
        .unwrap()
        .diff_tables(segment(&a), segment(&b));
    let mut changed = 0;
    while let Some(record) = stream.next().await {
        assert_eq!(record.unwrap().sign(), '~');
        changed += 1;
    }
    assert_eq!(changed, (1..=3000).step_by(13).count());

    let stats = stream.stats();
    assert!(stats.peak_active_ranges <= 3, "{} ranges at once", stats.peak_active_ranges);
    assert!(stats.peak_active_ranges >= 2, "ranges never overlapped");
    assert!(a.peak_in_flight() <= 3, "side a peaked at {}", a.peak_in_flight());
    assert!(b.peak_in_flight() <= 3, "side b peaked at {}", b.peak_in_flight());
}

#[tokio::test]
async fn test_sequential_run_compares_one_range_at_a_time() {
    let (a, b, _) = scattered_differences();
    let mut stream = TableDiffer::new(options(16, 4, false))
        .unwrap()
        .diff_tables(segment(&a), segment(&b));
    while let Some(record) = stream.next().await {
        record.unwrap();
    }
    assert_eq!(stream.stats().peak_active_ranges, 1);
}

#[tokio::test]
async fn test_one_database_needs_room_for_both_sides() {
    let db = Arc::new(ratings(1..=100).with_max_concurrency(1));
    let err = TableDiffer::new(DiffOptions::default())
        .unwrap()
        .diff_tables(segment(&db), segment(&db))
        .collect_all()
        .await
        .unwrap_err();
    assert!(matches!(err, DiffError::Precondition(_)), "{:?}", err);
    assert_eq!(db.query_counts().range_queries(), 0);

    // the root range is merged row by row through one shared budget
    let db = Arc::new(ratings(1..=100).with_max_concurrency(2));
    let records = TableDiffer::new(options(200, 2, true))
        .unwrap()
        .diff_tables(segment(&db), segment(&db))
        .collect_all()
        .await
        .unwrap();
    assert!(records.is_empty());
}

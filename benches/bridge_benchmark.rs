use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sql_bridge::prelude::*;
use sql_bridge::{EngineOptions, NativeEngine};
use tokio::runtime::Runtime;

// Deterministic rows so runs are comparable
fn generate_rows(num_rows: usize) -> Vec<Params> {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    (0..num_rows)
        .map(|i| {
            let blob_len = rng.random_range(10..=20);
            let blob: Vec<u8> = (0..blob_len).map(|_| rng.random_range(0..=255)).collect();
            Params::positional([
                Value::from(i64::try_from(i).unwrap_or(i64::MAX)),
                Value::from(format!("text-{}", rng.random_range(1..1000))),
                Value::from(rng.random_range(0.0..1000.0)),
                Value::from(blob),
            ])
        })
        .collect()
}

fn setup(dir: &tempfile::TempDir) -> Result<Database, SqlBridgeError> {
    let engine = NativeEngine::new(&EngineOptions::new(dir.path()))?;
    let module = Module::new(engine);
    let db = Database::open(&module, None)?;
    db.run(
        "CREATE TABLE test (a INTEGER PRIMARY KEY, b TEXT, c REAL, d BLOB)",
        None,
    )?;
    Ok(db)
}

fn benchmark_inserts(c: &mut Criterion) {
    let rows = generate_rows(10_000);
    let mut group = c.benchmark_group("bridge_inserts");

    group.bench_function(BenchmarkId::new("prepared_run", "10k_rows"), |b| {
        b.iter(|| {
            let dir = tempfile::tempdir().unwrap();
            let db = setup(&dir).unwrap();
            db.run("BEGIN", None).unwrap();
            let mut stmt = db.prepare("INSERT INTO test VALUES (?, ?, ?, ?)", None).unwrap();
            for params in &rows {
                stmt.run(Some(params)).unwrap();
            }
            stmt.free();
            db.run("COMMIT", None).unwrap();
        });
    });
    group.finish();
}

fn benchmark_scalar_function(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let db = setup(&dir).unwrap();
    db.create_function("twice", Arity::Exact(1), |args: &[Value]| {
        Ok(args[0].as_int().map(|n| n * 2))
    })
    .unwrap();

    let mut group = c.benchmark_group("bridge_functions");
    for size in [100_i64, 10_000] {
        group.bench_with_input(BenchmarkId::new("twice", size), &size, |b, &size| {
            let params = Params::positional([size]);
            b.iter(|| {
                db.exec(
                    "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n WHERE x < ?)
                     SELECT sum(twice(x)) FROM n",
                    Some(&params),
                )
                .unwrap()
            });
        });
    }
    group.finish();
}

fn benchmark_worker_round_trip(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let client = rt
        .block_on(WorkerClient::spawn(WorkerOptions::new(EngineOptions::new(
            dir.path(),
        ))))
        .unwrap();

    c.bench_function("worker_exec_select_1", |b| {
        b.to_async(&rt)
            .iter(|| async { client.exec("SELECT 1", None).await.unwrap() });
    });
}

criterion_group!(
    benches,
    benchmark_inserts,
    benchmark_scalar_function,
    benchmark_worker_round_trip
);
criterion_main!(benches);

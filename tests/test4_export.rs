#![cfg(feature = "native")]
use sql_bridge::prelude::*;

mod common;
use common::TestEngine;

#[test]
fn export_round_trips_through_open() -> Result<(), Box<dyn std::error::Error>> {
    let engine = TestEngine::new()?;
    let db = engine.open()?;
    db.run(
        "CREATE TABLE kv (k TEXT PRIMARY KEY, v BLOB);
         INSERT INTO kv VALUES ('a', x'010203'), ('b', NULL);",
        None,
    )?;
    let image = db.export()?;
    assert!(image.starts_with(b"SQLite format 3\0"));

    // the exporting database stays usable
    db.run("INSERT INTO kv VALUES ('c', x'04')", None)?;
    assert_eq!(db.exec("SELECT count(*) FROM kv", None)?[0].values[0][0], Value::Integer(3));

    let copy = Database::open(&engine.module, Some(&image))?;
    assert_ne!(copy.filename(), db.filename());
    let results = copy.exec("SELECT k, v FROM kv ORDER BY k", None)?;
    assert_eq!(
        results[0].values,
        vec![
            vec![Value::Text("a".into()), Value::Blob(vec![1, 2, 3])],
            vec![Value::Text("b".into()), Value::Null],
        ]
    );
    Ok(())
}

#[test]
fn export_finalizes_statements_and_drops_functions() -> Result<(), Box<dyn std::error::Error>> {
    let engine = TestEngine::new()?;
    let db = engine.open()?;
    db.run("CREATE TABLE t (a); INSERT INTO t VALUES (1);", None)?;
    db.create_function("one", Arity::Exact(0), |_: &[Value]| Ok(1_i64))?;
    let mut stmt = db.prepare("SELECT a FROM t", None)?;

    db.export()?;
    assert_eq!(db.open_statement_count(), 0);
    assert!(matches!(stmt.step(), Err(SqlBridgeError::StatementClosed)));
    let err = db.exec("SELECT one()", None).unwrap_err();
    assert_eq!(err.to_string(), "no such function: one");
    assert_eq!(engine.module.free_slot_count(), 1);

    // extension functions come back with the new connection
    assert_eq!(
        db.exec("SELECT reverse('ab')", None)?[0].values[0][0],
        Value::Text("ba".into())
    );
    Ok(())
}

#[test]
fn empty_database_exports_and_reopens() -> Result<(), Box<dyn std::error::Error>> {
    let engine = TestEngine::new()?;
    let db = engine.open()?;
    let image = db.export()?;
    let copy = Database::open(&engine.module, Some(&image))?;
    assert!(copy.exec("SELECT name FROM sqlite_master", None)?.is_empty());
    Ok(())
}

#[test]
fn garbage_image_fails_on_first_read() -> Result<(), Box<dyn std::error::Error>> {
    let engine = TestEngine::new()?;
    let garbage = vec![0x42_u8; 4096];
    {
        // the header is checked on first read, not on open
        let db = Database::open(&engine.module, Some(&garbage))?;
        let err = db.exec("SELECT * FROM sqlite_master", None).unwrap_err();
        assert_eq!(err.to_string(), "file is not a database");
    }
    let leftovers = std::fs::read_dir(engine.dir.path())?
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("dbfile_"))
        .count();
    assert_eq!(leftovers, 0);
    Ok(())
}

#[test]
fn export_of_closed_database_fails() -> Result<(), Box<dyn std::error::Error>> {
    let engine = TestEngine::new()?;
    let db = engine.open()?;
    db.close()?;
    assert!(matches!(db.export(), Err(SqlBridgeError::DatabaseClosed)));
    Ok(())
}

#[test]
fn failed_reopen_after_export_removes_the_file() -> Result<(), Box<dyn std::error::Error>> {
    use sql_bridge::engine::native::PAGE_SIZE;

    let engine = TestEngine::with_max_memory(Some(2 * PAGE_SIZE))?;
    let db = engine.open()?;
    db.run("CREATE TABLE t (a)", None)?;
    let filename = db.filename().to_string();
    assert!(engine.file_exists(&filename));

    let bridge = engine.module.bridge();
    let mut filler = Vec::new();
    let mut size = PAGE_SIZE;
    while size >= 8 {
        while let Ok(ptr) = bridge.allocate(size) {
            filler.push(ptr);
        }
        size /= 2;
    }
    let err = db.export().unwrap_err();
    assert!(matches!(err, SqlBridgeError::OutOfMemory { .. }), "{err}");
    assert!(!db.is_open());
    assert!(!engine.file_exists(&filename));

    for ptr in filler {
        bridge.free(ptr);
    }
    drop(db);
    assert!(!engine.file_exists(&filename));
    Ok(())
}

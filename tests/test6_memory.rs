#![cfg(feature = "native")]
use sql_bridge::engine::Engine;
use sql_bridge::engine::native::PAGE_SIZE;
use sql_bridge::prelude::*;

mod common;
use common::TestEngine;

#[test]
fn strings_and_blobs_cross_the_boundary() -> Result<(), Box<dyn std::error::Error>> {
    let engine = TestEngine::new()?;
    let bridge = engine.module.bridge();

    let long = "ünïcødé ".repeat(40);
    let (ptr, len) = bridge.write_utf8(&long)?;
    assert_eq!(len, long.len() + 1);
    assert_eq!(bridge.read_utf8(ptr)?, long);
    bridge.free(ptr);

    let blob = bridge.write_blob(&[])?;
    assert_ne!(blob, 0);
    assert!(bridge.read_blob(blob, 0)?.is_empty());
    bridge.free(blob);

    let slot = bridge.allocate(16)?;
    bridge.write_i64(slot, -5)?;
    bridge.write_f64(slot + 8, 0.25)?;
    assert_eq!(bridge.read_i64(slot)?, -5);
    assert!((bridge.read_f64(slot + 8)? - 0.25).abs() < f64::EPSILON);
    bridge.free(slot);

    assert_eq!(bridge.read_utf8(0)?, "");
    assert!(matches!(
        bridge.read_u32(0),
        Err(SqlBridgeError::MemoryAccess { address: 0, .. })
    ));
    assert_eq!(engine.native.allocated_bytes(), 0);
    Ok(())
}

#[test]
fn scoped_allocations_are_released() -> Result<(), Box<dyn std::error::Error>> {
    let engine = TestEngine::new()?;
    let bridge = engine.module.bridge();
    {
        let mut scope = bridge.scoped();
        scope.write_utf8("first")?;
        scope.write_blob(&[1, 2, 3])?;
        scope.allocate(100)?;
        assert!(engine.native.allocated_bytes() >= 109);
    }
    assert_eq!(engine.native.allocated_bytes(), 0);
    Ok(())
}

#[test]
fn exhausted_memory_is_an_error() -> Result<(), Box<dyn std::error::Error>> {
    let engine = TestEngine::with_max_memory(Some(2 * PAGE_SIZE))?;
    let bridge = engine.module.bridge();
    assert!(matches!(
        bridge.allocate(4 * PAGE_SIZE),
        Err(SqlBridgeError::OutOfMemory { .. })
    ));
    assert!(engine.native.memory_size() <= 2 * PAGE_SIZE);

    let db = engine.open()?;
    db.run("CREATE TABLE t (a TEXT)", None)?;
    let huge = "x".repeat(3 * PAGE_SIZE);
    let err = db
        .run("INSERT INTO t VALUES (?)", Some(&Params::positional([huge])))
        .unwrap_err();
    assert!(matches!(err, SqlBridgeError::OutOfMemory { .. }), "{err}");

    // nothing leaked, and smaller work still fits
    let baseline = engine.native.allocated_bytes();
    db.run("INSERT INTO t VALUES (?)", Some(&Params::positional(["small"])))?;
    assert_eq!(engine.native.allocated_bytes(), baseline);
    assert_eq!(db.open_statement_count(), 0);

    // a prepared statement survives a failed bind
    let mut stmt = db.prepare("SELECT length(?)", None)?;
    let before = engine.native.allocated_bytes();
    let err = stmt
        .bind(&Params::positional(["y".repeat(3 * PAGE_SIZE)]))
        .unwrap_err();
    assert!(matches!(err, SqlBridgeError::OutOfMemory { .. }));
    assert_eq!(engine.native.allocated_bytes(), before);
    assert_eq!(stmt.get(Some(&Params::positional(["abc"])))?, vec![Value::Integer(3)]);
    stmt.free();
    Ok(())
}

#[test]
fn large_rows_grow_memory_and_read_back() -> Result<(), Box<dyn std::error::Error>> {
    let engine = TestEngine::new()?;
    let db = engine.open()?;
    db.run("CREATE TABLE t (a BLOB)", None)?;
    let payload: Vec<u8> = (0..200_000_u32).map(|i| (i % 251) as u8).collect();
    db.run(
        "INSERT INTO t VALUES (?)",
        Some(&Params::positional([payload.clone()])),
    )?;
    let size_before = engine.native.memory_size();

    let results = db.exec("SELECT a FROM t", None)?;
    assert_eq!(results[0].values[0][0], Value::Blob(payload));
    assert!(engine.native.memory_size() >= size_before);
    assert_eq!(engine.native.allocated_bytes(), 0);
    Ok(())
}

#![cfg(feature = "native")]
use sql_bridge::prelude::*;

mod common;
use common::TestEngine;

fn seeded(engine: &TestEngine) -> Result<Database, SqlBridgeError> {
    let db = engine.open()?;
    db.run(
        "CREATE TABLE test (id INTEGER PRIMARY KEY, name TEXT, score REAL, data BLOB);
         INSERT INTO test VALUES (1, 'alpha', 1.5, x'0102');
         INSERT INTO test VALUES (2, 'beta', NULL, NULL);",
        None,
    )?;
    Ok(db)
}

#[test]
fn step_and_read_typed_rows() -> Result<(), Box<dyn std::error::Error>> {
    let engine = TestEngine::new()?;
    let db = seeded(&engine)?;

    let mut stmt = db.prepare("SELECT id, name, score, data FROM test ORDER BY id", None)?;
    assert_eq!(stmt.get_column_names()?, ["id", "name", "score", "data"]);
    assert_eq!(stmt.column_count()?, 0);

    assert!(stmt.step()?);
    assert_eq!(
        stmt.get(None)?,
        vec![
            Value::Integer(1),
            Value::Text("alpha".into()),
            Value::Float(1.5),
            Value::Blob(vec![1, 2]),
        ]
    );
    assert!(stmt.step()?);
    let row = stmt.get_as_object(None)?;
    assert_eq!(row.get("name"), Some(&Value::Text("beta".into())));
    assert_eq!(row.get("score"), Some(&Value::Null));
    assert_eq!(row.get("data"), Some(&Value::Null));
    assert!(!stmt.step()?);
    assert!(stmt.free());
    assert_eq!(db.open_statement_count(), 0);
    Ok(())
}

#[test]
fn positional_and_named_binding() -> Result<(), Box<dyn std::error::Error>> {
    let engine = TestEngine::new()?;
    let db = seeded(&engine)?;

    let mut stmt = db.prepare("SELECT name FROM test WHERE id = ?", None)?;
    let row = stmt.get(Some(&Params::positional([2])))?;
    assert_eq!(row, vec![Value::Text("beta".into())]);
    let row = stmt.get(Some(&Params::positional([1])))?;
    assert_eq!(row, vec![Value::Text("alpha".into())]);
    stmt.free();

    let mut stmt = db.prepare("SELECT :a || $b, @c", None)?;
    stmt.bind(&Params::named([
        (":a", Value::from("x")),
        ("$b", Value::from("y")),
        ("@c", Value::from(3)),
        (":unused", Value::from(9)),
    ]))?;
    assert!(stmt.step()?);
    assert_eq!(stmt.get(None)?, vec![Value::Text("xy".into()), Value::Integer(3)]);
    stmt.free();
    Ok(())
}

#[test]
fn numbers_bind_by_shape() -> Result<(), Box<dyn std::error::Error>> {
    let engine = TestEngine::new()?;
    let db = engine.open()?;
    let mut stmt = db.prepare("SELECT typeof(?), typeof(?), typeof(?), typeof(?), ?", None)?;
    let types = stmt.get(Some(&Params::positional([
        Value::Float(2.0),
        Value::Float(2.5),
        Value::Integer(1 << 40),
        Value::Bool(true),
        Value::Bool(false),
    ])))?;
    assert_eq!(
        types,
        vec![
            Value::Text("integer".into()),
            Value::Text("real".into()),
            Value::Text("integer".into()),
            Value::Text("integer".into()),
            Value::Integer(0),
        ]
    );
    stmt.free();
    Ok(())
}

#[test]
fn bind_value_cursor_and_column_getters() -> Result<(), Box<dyn std::error::Error>> {
    let engine = TestEngine::new()?;
    let db = seeded(&engine)?;

    let mut stmt = db.prepare("SELECT id, name, data FROM test WHERE id = ? OR name = ?", None)?;
    stmt.bind_value(&Value::Integer(1), None)?;
    stmt.bind_value(&Value::from("nobody"), None)?;
    assert!(stmt.step()?);
    assert!((stmt.get_number(None)? - 1.0).abs() < f64::EPSILON);
    assert_eq!(stmt.get_string(None)?, "alpha");
    assert_eq!(stmt.get_blob(None)?, vec![1, 2]);
    assert_eq!(stmt.get_string(Some(1))?, "alpha");
    assert!(!stmt.step()?);

    // reset rewinds the implicit parameter index too
    assert!(stmt.reset()?);
    stmt.bind_value(&Value::Integer(2), None)?;
    assert!(stmt.step()?);
    assert_eq!(stmt.get_string(Some(1))?, "beta");
    stmt.free();
    Ok(())
}

#[test]
fn run_executes_once_and_resets() -> Result<(), Box<dyn std::error::Error>> {
    let engine = TestEngine::new()?;
    let db = seeded(&engine)?;
    let mut insert = db.prepare("INSERT INTO test (id, name) VALUES (?, ?)", None)?;
    for id in 10..13 {
        assert!(insert.run(Some(&Params::positional([Value::from(id), Value::from("n")])))?);
    }
    insert.free();
    assert_eq!(db.get_rows_modified()?, 1);

    let results = db.exec("SELECT count(*) FROM test WHERE name = 'n'", None)?;
    assert_eq!(results[0].values, vec![vec![Value::Integer(3)]]);
    Ok(())
}

#[test]
fn bind_failure_releases_buffers() -> Result<(), Box<dyn std::error::Error>> {
    let engine = TestEngine::new()?;
    let db = engine.open()?;
    let mut stmt = db.prepare("SELECT ?", None)?;
    let too_many = Params::positional([Value::from("kept"), Value::from("extra")]);
    let err = stmt.bind(&too_many).unwrap_err();
    assert!(err.to_string().contains("column index out of range"), "{err}");

    // the error message copy is reused, so repeated failures settle at one level
    let before = engine.native.allocated_bytes();
    for _ in 0..3 {
        assert!(stmt.bind(&too_many).is_err());
        assert_eq!(engine.native.allocated_bytes(), before);
    }

    stmt.bind(&Params::positional(["ok"]))?;
    assert!(engine.native.allocated_bytes() > before);
    stmt.reset()?;
    assert_eq!(engine.native.allocated_bytes(), before);
    stmt.free();
    Ok(())
}

#[test]
fn closing_the_database_finalizes_statements() -> Result<(), Box<dyn std::error::Error>> {
    let engine = TestEngine::new()?;
    let db = seeded(&engine)?;
    let mut first = db.prepare("SELECT 1", None)?;
    let second = db.prepare("SELECT 2", None)?;
    assert_eq!(db.open_statement_count(), 2);
    assert_eq!(engine.native.live_statements(), 2);

    db.close()?;
    assert_eq!(engine.native.live_statements(), 0);
    assert!(!first.is_open());
    assert!(matches!(first.step(), Err(SqlBridgeError::StatementClosed)));
    assert!(matches!(first.get(None), Err(SqlBridgeError::StatementClosed)));
    assert!(first.free());
    assert!(second.free());
    Ok(())
}

#[test]
fn step_error_carries_engine_message() -> Result<(), Box<dyn std::error::Error>> {
    let engine = TestEngine::new()?;
    let db = engine.open()?;
    db.run("CREATE TABLE u (x INTEGER UNIQUE); INSERT INTO u VALUES (1);", None)?;
    let mut stmt = db.prepare("INSERT INTO u VALUES (1)", None)?;
    let err = stmt.step().unwrap_err();
    assert!(matches!(err, SqlBridgeError::EngineError(_)));
    assert!(err.to_string().contains("UNIQUE constraint failed"), "{err}");
    assert!(!stmt.reset()?);
    stmt.free();
    Ok(())
}

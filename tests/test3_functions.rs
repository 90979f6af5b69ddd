#![cfg(feature = "native")]
use std::cell::RefCell;
use std::rc::Rc;

use serde_json::json;
use sql_bridge::engine::Engine;
use sql_bridge::prelude::*;

mod common;
use common::TestEngine;

fn scalar(db: &Database, sql: &str) -> Result<Value, SqlBridgeError> {
    let results = db.exec(sql, None)?;
    Ok(results[0].values[0][0].clone())
}

#[test]
fn functions_receive_and_return_every_type() -> Result<(), Box<dyn std::error::Error>> {
    let engine = TestEngine::new()?;
    let db = engine.open()?;

    db.create_function("add", Arity::Exact(2), |args: &[Value]| {
        let a = args[0].as_float().ok_or("add expects numbers")?;
        let b = args[1].as_float().ok_or("add expects numbers")?;
        Ok(a + b)
    })?;
    db.create_function("kind", Arity::Exact(1), |args: &[Value]| {
        Ok(args[0].type_name())
    })?;
    db.create_function("echo", Arity::Exact(1), |args: &[Value]| Ok(args[0].clone()))?;
    db.create_function("nothing", Arity::Exact(0), |_: &[Value]| Ok(()))?;
    db.create_function("truthy", Arity::Exact(0), |_: &[Value]| Ok(true))?;

    assert_eq!(scalar(&db, "SELECT add(1, 2.5)")?, Value::Float(3.5));
    assert_eq!(scalar(&db, "SELECT kind(1)")?, Value::Text("integer".into()));
    assert_eq!(scalar(&db, "SELECT kind(1.5)")?, Value::Text("float".into()));
    assert_eq!(scalar(&db, "SELECT kind('a')")?, Value::Text("text".into()));
    assert_eq!(scalar(&db, "SELECT kind(x'00')")?, Value::Text("blob".into()));
    assert_eq!(scalar(&db, "SELECT kind(NULL)")?, Value::Text("null".into()));
    assert_eq!(scalar(&db, "SELECT echo('héllo')")?, Value::Text("héllo".into()));
    assert_eq!(scalar(&db, "SELECT echo(x'00ff')")?, Value::Blob(vec![0, 0xff]));
    assert_eq!(scalar(&db, "SELECT echo(42)")?, Value::Integer(42));
    assert_eq!(scalar(&db, "SELECT nothing()")?, Value::Null);
    assert_eq!(scalar(&db, "SELECT truthy()")?, Value::Integer(1));
    Ok(())
}

#[test]
fn variadic_functions_see_all_arguments() -> Result<(), Box<dyn std::error::Error>> {
    let engine = TestEngine::new()?;
    let db = engine.open()?;
    db.create_function("joined", Arity::Variadic, |args: &[Value]| {
        Ok(args
            .iter()
            .map(|v| v.as_text().unwrap_or("?").to_string())
            .collect::<Vec<_>>()
            .join(","))
    })?;
    assert_eq!(scalar(&db, "SELECT joined()")?, Value::Text(String::new()));
    assert_eq!(
        scalar(&db, "SELECT joined('a', 'b', 3)")?,
        Value::Text("a,b,?".into())
    );
    Ok(())
}

#[test]
fn function_errors_fail_the_statement() -> Result<(), Box<dyn std::error::Error>> {
    let engine = TestEngine::new()?;
    let db = engine.open()?;
    db.create_function("fail", Arity::Exact(0), |_: &[Value]| {
        Err::<i64, _>(FunctionError::new("custom failure"))
    })?;
    db.create_function("explode", Arity::Exact(0), |_: &[Value]| -> Result<i64, FunctionError> {
        panic!("kaboom")
    })?;
    db.create_function("object", Arity::Exact(0), |_: &[Value]| Ok(json!({"a": 1})))?;

    let err = db.exec("SELECT fail()", None).unwrap_err();
    assert_eq!(err.to_string(), "custom failure");

    let err = db.exec("SELECT explode()", None).unwrap_err();
    assert_eq!(err.to_string(), "panic in user function explode: kaboom");

    let err = db.exec("SELECT object()", None).unwrap_err();
    assert!(
        err.to_string()
            .starts_with("Wrong API use : tried to return a value of an unknown type"),
        "{err}"
    );

    // the connection stays usable
    assert_eq!(scalar(&db, "SELECT 1")?, Value::Integer(1));
    Ok(())
}

#[test]
fn json_return_values_map_to_sql_values() -> Result<(), Box<dyn std::error::Error>> {
    let engine = TestEngine::new()?;
    let db = engine.open()?;
    db.create_function("bytes", Arity::Exact(0), |_: &[Value]| Ok(json!([1, 2, 3])))?;
    db.create_function("maybe", Arity::Exact(1), |args: &[Value]| {
        Ok(args[0].as_int().map(|n| n * 2))
    })?;
    assert_eq!(scalar(&db, "SELECT bytes()")?, Value::Blob(vec![1, 2, 3]));
    assert_eq!(scalar(&db, "SELECT maybe(4)")?, Value::Integer(8));
    assert_eq!(scalar(&db, "SELECT maybe(NULL)")?, Value::Null);
    Ok(())
}

#[test]
fn stateful_functions_run_in_row_order() -> Result<(), Box<dyn std::error::Error>> {
    let engine = TestEngine::new()?;
    let db = engine.open()?;
    let calls = Rc::new(RefCell::new(Vec::new()));
    let seen = Rc::clone(&calls);
    let mut counter = 0_i64;
    db.create_function("tick", Arity::Exact(1), move |args: &[Value]| {
        counter += 1;
        seen.borrow_mut().push(args[0].clone());
        Ok(counter)
    })?;
    let results = db.exec(
        "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n WHERE x < 3)
         SELECT tick(x) FROM n",
        None,
    )?;
    assert_eq!(
        results[0].values,
        vec![
            vec![Value::Integer(1)],
            vec![Value::Integer(2)],
            vec![Value::Integer(3)],
        ]
    );
    assert_eq!(calls.borrow().len(), 3);
    Ok(())
}

#[test]
fn redefining_a_function_reuses_its_table_slot() -> Result<(), Box<dyn std::error::Error>> {
    let engine = TestEngine::new()?;
    let db = engine.open()?;
    db.create_function("version", Arity::Exact(0), |_: &[Value]| Ok(1_i64))?;
    let table_after_first = engine.native.table_len();
    assert_eq!(engine.module.free_slot_count(), 0);

    for version in 2_i64..6 {
        db.create_function("version", Arity::Exact(0), move |_: &[Value]| Ok(version))?;
        assert_eq!(scalar(&db, "SELECT version()")?, Value::Integer(version));
    }
    assert_eq!(engine.native.table_len(), table_after_first);

    // closing releases every slot back to the pool
    db.close()?;
    assert_eq!(engine.module.free_slot_count(), 1);
    Ok(())
}

#[test]
fn failed_redefinition_keeps_the_previous_function() -> Result<(), Box<dyn std::error::Error>> {
    use sql_bridge::engine::native::PAGE_SIZE;

    let engine = TestEngine::with_max_memory(Some(2 * PAGE_SIZE))?;
    let db = engine.open()?;
    db.create_function("f", Arity::Exact(0), |_: &[Value]| Ok(1_i64))?;
    let table_len = engine.native.table_len();

    let bridge = engine.module.bridge();
    let mut filler = Vec::new();
    let mut size = PAGE_SIZE;
    while size >= 8 {
        while let Ok(ptr) = bridge.allocate(size) {
            filler.push(ptr);
        }
        size /= 2;
    }
    let err = db
        .create_function("f", Arity::Exact(0), |_: &[Value]| Ok(2_i64))
        .unwrap_err();
    assert!(matches!(err, SqlBridgeError::OutOfMemory { .. }), "{err}");
    for ptr in filler {
        bridge.free(ptr);
    }

    assert_eq!(scalar(&db, "SELECT f()")?, Value::Integer(1));
    assert_eq!(engine.native.table_len(), table_len);
    db.close()?;
    assert_eq!(engine.module.free_slot_count(), 1);
    Ok(())
}

#[test]
fn functions_are_per_database()-> Result<(), Box<dyn std::error::Error>> {
    let engine = TestEngine::new()?;
    let first = engine.open()?;
    let second = engine.open()?;
    first.create_function("only_first", Arity::Exact(0), |_: &[Value]| Ok("yes"))?;
    assert_eq!(scalar(&first, "SELECT only_first()")?, Value::Text("yes".into()));
    let err = second.exec("SELECT only_first()", None).unwrap_err();
    assert_eq!(err.to_string(), "no such function: only_first");
    Ok(())
}

#[test]
fn functions_can_be_bound_and_used_in_prepared_statements() -> Result<(), Box<dyn std::error::Error>> {
    let engine = TestEngine::new()?;
    let db = engine.open()?;
    db.create_function("shout", Arity::Exact(1), |args: &[Value]| {
        Ok(args[0].as_text().map(str::to_uppercase))
    })?;
    let mut stmt = db.prepare("SELECT shout(?)", None)?;
    let row = stmt.get_as_object(Some(&Params::positional(["quiet"])))?;
    assert_eq!(row.get("shout(?)"), Some(&Value::Text("QUIET".into())));
    stmt.free();

    let before = engine.native.allocated_bytes();
    for _ in 0..10 {
        scalar(&db, "SELECT shout('abc')")?;
    }
    assert_eq!(engine.native.allocated_bytes(), before);
    Ok(())
}

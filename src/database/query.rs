use std::rc::Rc;

use super::core::Database;
use crate::engine::Handle;
use crate::error::SqlBridgeError;
use crate::results::{QueryResult, Row};
use crate::statement::{Statement, StatementCore};
use crate::types::Params;

impl Database {
    /// Execute `sql` for its effect.
    ///
    /// Without params every statement in `sql` runs through the engine's multi-statement
    /// exec. With params only the first statement is prepared, bound and stepped once.
    ///
    /// # Errors
    ///
    /// Returns `SqlBridgeError::DatabaseClosed` or the engine's error.
    pub fn run(&self, sql: &str, params: Option<&Params>) -> Result<(), SqlBridgeError> {
        let handle = self.shared.handle()?;
        if let Some(params) = params {
            let mut stmt = self.prepare(sql, Some(params))?;
            let outcome = stmt.step();
            stmt.free();
            return outcome.map(|_| ());
        }
        let mut scope = self.shared.bridge().scoped();
        let (ptr, _) = scope.write_utf8(sql)?;
        let rc = self.shared.engine().exec(handle, ptr, 0, 0, 0);
        self.shared.check(rc)
    }

    /// Execute every statement in `sql` and collect one block per statement that
    /// returned rows.
    ///
    /// `params` are bound to the first statement with result columns only, whether or
    /// not it ends up returning rows. Statements prepared here are finalized before
    /// returning, on success or error.
    ///
    /// # Errors
    ///
    /// Returns `SqlBridgeError::DatabaseClosed`, or the first binding or engine error;
    /// statements before the failing one have already run.
    pub fn exec(
        &self,
        sql: &str,
        params: Option<&Params>,
    ) -> Result<Vec<QueryResult>, SqlBridgeError> {
        let handle = self.shared.handle()?;
        let engine = self.shared.engine();
        let mut scope = self.shared.bridge().scoped();
        let (sql_ptr, _) = scope.write_utf8(sql)?;
        let stmt_out = scope.allocate(4)?;
        let tail_out = scope.allocate(4)?;
        let bridge = scope.bridge();

        let mut params = params;
        let mut results = Vec::new();
        let mut cursor = sql_ptr;
        while bridge.read_u8(cursor)? != 0 {
            bridge.write_u32(stmt_out, 0)?;
            bridge.write_u32(tail_out, 0)?;
            let rc = engine.prepare_v2(handle, cursor, -1, stmt_out, tail_out);
            self.shared.check(rc)?;
            let stmt_handle = bridge.read_u32(stmt_out)?;
            cursor = bridge.read_u32(tail_out)?;
            if stmt_handle == 0 {
                // comment or whitespace only
                continue;
            }
            let mut stmt = self.adopt(stmt_handle);
            let bound = if engine.column_count(stmt_handle) > 0 {
                params.take()
            } else {
                None
            };
            let block = collect_block(&mut stmt, bound);
            stmt.free();
            if let Some(block) = block? {
                results.push(block);
            }
        }
        Ok(results)
    }

    /// Prepare the first statement of `sql`, bind `params`, and call `on_row` for every
    /// row. `on_done` runs after the last row.
    ///
    /// The statement is finalized before returning. An error from `on_row` stops the
    /// iteration and is returned as is; `on_done` is not called then. Returns the number
    /// of rows delivered.
    ///
    /// # Errors
    ///
    /// Returns the preparation, binding or stepping error, or the callback's error.
    pub fn each<F, D, E>(
        &self,
        sql: &str,
        params: Option<&Params>,
        mut on_row: F,
        on_done: Option<D>,
    ) -> Result<usize, E>
    where
        F: FnMut(Row) -> Result<(), E>,
        D: FnOnce(),
        E: From<SqlBridgeError>,
    {
        let mut stmt = self.prepare(sql, params)?;
        let outcome: Result<usize, E> = (|| {
            let mut delivered = 0;
            while stmt.step()? {
                on_row(stmt.get_as_object(None)?)?;
                delivered += 1;
            }
            Ok(delivered)
        })();
        stmt.free();
        let delivered = outcome?;
        if let Some(on_done) = on_done {
            on_done();
        }
        Ok(delivered)
    }

    /// Prepare the first statement of `sql` and bind `params` if given.
    ///
    /// The statement stays registered with this database until it is freed, or until
    /// `export`/`close` finalizes it.
    ///
    /// # Errors
    ///
    /// Returns `SqlBridgeError::DatabaseClosed`, the engine's syntax error,
    /// `SqlBridgeError::NothingToPrepare` when `sql` holds no statement, or a binding
    /// error (the statement is freed then).
    pub fn prepare(&self, sql: &str, params: Option<&Params>) -> Result<Statement, SqlBridgeError> {
        let handle = self.shared.handle()?;
        let stmt_handle = {
            let mut scope = self.shared.bridge().scoped();
            let (sql_ptr, _) = scope.write_utf8(sql)?;
            let stmt_out = scope.allocate(4)?;
            scope.bridge().write_u32(stmt_out, 0)?;
            let rc = self.shared.engine().prepare_v2(handle, sql_ptr, -1, stmt_out, 0);
            self.shared.check(rc)?;
            scope.bridge().read_u32(stmt_out)?
        };
        if stmt_handle == 0 {
            return Err(SqlBridgeError::NothingToPrepare);
        }
        let mut stmt = self.adopt(stmt_handle);
        if let Some(params) = params
            && let Err(err) = stmt.bind(params)
        {
            stmt.free();
            return Err(err);
        }
        Ok(self.register(stmt_handle, stmt))
    }

    /// Wrap a prepared handle without registering it.
    fn adopt(&self, stmt_handle: Handle) -> Statement {
        Statement::new(StatementCore::new(stmt_handle), Rc::clone(&self.shared))
    }

    fn register(&self, stmt_handle: Handle, stmt: Statement) -> Statement {
        self.shared
            .statements
            .borrow_mut()
            .insert(stmt_handle, stmt.core());
        stmt
    }
}

fn collect_block(
    stmt: &mut Statement,
    params: Option<&Params>,
) -> Result<Option<QueryResult>, SqlBridgeError> {
    if let Some(params) = params {
        stmt.bind(params)?;
    }
    let mut block: Option<QueryResult> = None;
    while stmt.step()? {
        let row = stmt.get(None)?;
        match block.as_mut() {
            Some(block) => block.values.push(row),
            None => {
                block = Some(QueryResult {
                    columns: stmt.get_column_names()?,
                    values: vec![row],
                });
            }
        }
    }
    Ok(block)
}

use std::rc::Rc;
use std::sync::mpsc::{Receiver, Sender};

use crate::config::EngineOptions;
use crate::database::Database;
use crate::engine::loader::Loader;
use crate::error::SqlBridgeError;
use crate::module::Module;
use crate::types::Params;

use super::protocol::{Action, Request, Response};

/// Body of the worker thread: load the module, then serve requests until the channel
/// closes.
pub(super) fn run_worker(
    options: EngineOptions,
    requests: &Receiver<Request>,
    responses: &Sender<Response>,
) {
    let module = load_module(options);
    let mut worker = match module {
        Ok(module) => Worker { module, db: None },
        Err(message) => {
            tracing::error!(%message, "worker failed to load engine module");
            while let Ok(request) = requests.recv() {
                let _ = responses.send(Response::error(request.id, message.clone()));
            }
            return;
        }
    };

    while let Ok(request) = requests.recv() {
        let id = request.id;
        let action = request.action;
        if let Err(err) = worker.handle(request, responses) {
            tracing::debug!(id, action = action.as_str(), error = %err, "worker request failed");
            let _ = responses.send(Response::error(id, err.to_string()));
        }
    }

    if let Some(db) = worker.db.take()
        && let Err(err) = db.close()
    {
        tracing::warn!(error = %err, "failed to close worker database on shutdown");
    }
}

fn load_module(options: EngineOptions) -> Result<Rc<Module>, String> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .map_err(|err| format!("failed to start worker runtime: {err}"))?;
    let loader = Loader::new(options);
    runtime
        .block_on(loader.module())
        .map_err(|err| err.to_string())
}

struct Worker {
    module: Rc<Module>,
    db: Option<Database>,
}

impl Worker {
    fn handle(&mut self, request: Request, out: &Sender<Response>) -> Result<(), SqlBridgeError> {
        let id = request.id;
        match request.action {
            Action::Open => {
                self.close_current();
                self.db = Some(Database::open(&self.module, request.buffer.as_deref())?);
                send(out, Response::ready(id));
            }
            Action::Exec => {
                let sql = required_sql(&request, "exec")?;
                let params = decode_params(&request)?;
                let results = self.database()?.exec(sql, params.as_ref())?;
                send(out, Response::results(id, results));
            }
            Action::Each => {
                let sql = required_sql(&request, "each")?;
                let params = decode_params(&request)?;
                self.database()?.each(
                    sql,
                    params.as_ref(),
                    |row| {
                        send(out, Response::row(id, row));
                        Ok::<(), SqlBridgeError>(())
                    },
                    Some(|| send(out, Response::finished(id))),
                )?;
            }
            Action::Export => {
                let db = self.db.as_ref().ok_or(SqlBridgeError::DatabaseClosed)?;
                send(out, Response::buffer(id, db.export()?));
            }
            Action::Close => {
                if let Some(db) = self.db.take() {
                    db.close()?;
                }
                send(out, Response::ack(id));
            }
        }
        Ok(())
    }

    /// The open database, creating an empty one on first use.
    fn database(&mut self) -> Result<&Database, SqlBridgeError> {
        if self.db.is_none() {
            self.db = Some(Database::open(&self.module, None)?);
        }
        self.db.as_ref().ok_or(SqlBridgeError::DatabaseClosed)
    }

    fn close_current(&mut self) {
        if let Some(db) = self.db.take()
            && let Err(err) = db.close()
        {
            tracing::warn!(error = %err, "failed to close previous worker database");
        }
    }
}

fn required_sql<'r>(request: &'r Request, action: &str) -> Result<&'r str, SqlBridgeError> {
    request
        .sql
        .as_deref()
        .filter(|sql| !sql.is_empty())
        .ok_or_else(|| SqlBridgeError::Protocol(format!("{action}: Missing query string")))
}

fn decode_params(request: &Request) -> Result<Option<Params>, SqlBridgeError> {
    request.params.as_ref().map(Params::from_json).transpose()
}

fn send(out: &Sender<Response>, response: Response) {
    if out.send(response).is_err() {
        tracing::debug!("response dropped; router has gone away");
    }
}

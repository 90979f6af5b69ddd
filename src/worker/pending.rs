use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::{mpsc, oneshot};

use super::protocol::Response;
use crate::error::SqlBridgeError;

pub(crate) type Reply = Result<Response, SqlBridgeError>;

enum Pending {
    Single(oneshot::Sender<Reply>),
    Stream(mpsc::UnboundedSender<Reply>),
}

#[derive(Default)]
struct Table {
    entries: HashMap<u32, Pending>,
    closed: Option<String>,
}

/// Outstanding requests keyed by id. Responses may arrive in any order.
#[derive(Default)]
pub(crate) struct PendingCalls {
    table: Mutex<Table>,
}

impl PendingCalls {
    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(crate) fn register_single(
        &self,
        id: u32,
    ) -> Result<oneshot::Receiver<Reply>, SqlBridgeError> {
        let (tx, rx) = oneshot::channel();
        self.insert(id, Pending::Single(tx))?;
        Ok(rx)
    }

    pub(crate) fn register_stream(
        &self,
        id: u32,
    ) -> Result<mpsc::UnboundedReceiver<Reply>, SqlBridgeError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.insert(id, Pending::Stream(tx))?;
        Ok(rx)
    }

    fn insert(&self, id: u32, entry: Pending) -> Result<(), SqlBridgeError> {
        let mut table = self.lock();
        if let Some(reason) = &table.closed {
            return Err(SqlBridgeError::ConnectionError(reason.clone()));
        }
        table.entries.insert(id, entry);
        Ok(())
    }

    pub(crate) fn cancel(&self, id: u32) {
        self.lock().entries.remove(&id);
    }

    /// Route a response to whoever waits on its id.
    pub(crate) fn complete(&self, response: Response) {
        let id = response.id;
        let terminal = response.is_terminal();
        let mut table = self.lock();
        let entry = if terminal {
            table.entries.remove(&id)
        } else {
            match table.entries.get(&id) {
                Some(Pending::Stream(tx)) => {
                    if tx.send(response.into_result()).is_err() {
                        // receiver dropped mid-stream
                        table.entries.remove(&id);
                    }
                    return;
                }
                Some(Pending::Single(_)) => table.entries.remove(&id),
                None => None,
            }
        };
        drop(table);
        match entry {
            Some(Pending::Single(tx)) => {
                let _ = tx.send(response.into_result());
            }
            Some(Pending::Stream(tx)) => {
                let _ = tx.send(response.into_result());
            }
            None => tracing::warn!(id, "response for unknown request id"),
        }
    }

    /// Fail every outstanding request and refuse new ones.
    pub(crate) fn close_all(&self, reason: &str) {
        let entries = {
            let mut table = self.lock();
            table.closed = Some(reason.to_string());
            std::mem::take(&mut table.entries)
        };
        for (_, entry) in entries {
            let err = || Err(SqlBridgeError::ConnectionError(reason.to_string()));
            match entry {
                Pending::Single(tx) => {
                    let _ = tx.send(err());
                }
                Pending::Stream(tx) => {
                    let _ = tx.send(err());
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn outstanding(&self) -> usize {
        self.lock().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::Row;
    use crate::types::Value;
    use std::sync::Arc;

    #[tokio::test]
    async fn out_of_order_responses_reach_their_callers() {
        let pending = PendingCalls::default();
        let first = pending.register_single(1).unwrap();
        let second = pending.register_single(2).unwrap();

        pending.complete(Response::buffer(2, vec![2]));
        pending.complete(Response::error(1, "boom"));

        let second = second.await.unwrap().unwrap();
        assert_eq!(second.buffer, Some(vec![2]));
        let first = first.await.unwrap().unwrap_err();
        assert_eq!(first.to_string(), "boom");
        assert_eq!(pending.outstanding(), 0);
    }

    #[tokio::test]
    async fn stream_stays_registered_until_finished() {
        let pending = PendingCalls::default();
        let mut rows = pending.register_stream(5).unwrap();
        let row = Row::new(Arc::new(vec!["x".into()]), vec![Value::Integer(1)]);
        pending.complete(Response::row(5, row.clone()));
        pending.complete(Response::row(5, row));
        assert_eq!(pending.outstanding(), 1);
        pending.complete(Response::finished(5));
        assert_eq!(pending.outstanding(), 0);

        let mut seen = 0;
        while let Some(reply) = rows.recv().await {
            if reply.unwrap().row.is_some() {
                seen += 1;
            }
        }
        assert_eq!(seen, 2);
    }

    #[tokio::test]
    async fn close_all_fails_waiters_and_later_registrations() {
        let pending = PendingCalls::default();
        let waiter = pending.register_single(7).unwrap();
        pending.complete(Response::ready(99));
        pending.close_all("worker channel closed");
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, SqlBridgeError::ConnectionError(_)));
        assert!(pending.register_single(8).is_err());
    }
}

use tokio::sync::mpsc::UnboundedReceiver;

use super::manager::WorkerChannel;
use super::protocol::{Action, Request, Response};
use crate::config::WorkerOptions;
use crate::error::SqlBridgeError;
use crate::results::{QueryResult, Row};
use crate::types::Params;

/// Typed client for a database hosted on a worker thread.
///
/// Cloning shares the worker. Results cross the channel as owned data.
#[derive(Clone)]
pub struct WorkerClient {
    channel: WorkerChannel,
}

impl std::fmt::Debug for WorkerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerClient").finish_non_exhaustive()
    }
}

impl WorkerClient {
    /// Spawn a worker and wait until it has opened an empty database.
    ///
    /// # Errors
    ///
    /// Returns the spawn error or the worker's load/open error.
    pub async fn spawn(options: WorkerOptions) -> Result<Self, SqlBridgeError> {
        let client = Self {
            channel: WorkerChannel::spawn(options)?,
        };
        client.open(None).await?;
        Ok(client)
    }

    #[must_use]
    pub fn channel(&self) -> &WorkerChannel {
        &self.channel
    }

    /// Replace the worker's database with a new one, seeded with `buffer` if given.
    ///
    /// # Errors
    ///
    /// Returns `SqlBridgeError::Remote` if the worker cannot open it.
    pub async fn open(&self, buffer: Option<Vec<u8>>) -> Result<(), SqlBridgeError> {
        let response = self
            .channel
            .request(Request::new(Action::Open).with_buffer(buffer))
            .await?;
        if response.ready == Some(true) {
            Ok(())
        } else {
            Err(unexpected(Action::Open, &response))
        }
    }

    /// # Errors
    ///
    /// Returns `SqlBridgeError::Remote` with the engine's message on failure.
    pub async fn exec(
        &self,
        sql: &str,
        params: Option<&Params>,
    ) -> Result<Vec<QueryResult>, SqlBridgeError> {
        let request = Request::new(Action::Exec)
            .with_sql(sql)
            .with_params(params.map(Params::to_json));
        let response = self.channel.request(request).await?;
        response
            .results
            .ok_or_else(|| SqlBridgeError::Protocol("exec response without results".into()))
    }

    /// Stream the rows of the first statement in `sql`.
    ///
    /// # Errors
    ///
    /// Returns `SqlBridgeError::ConnectionError` if the request cannot be sent; query
    /// errors arrive through the stream.
    pub fn each(&self, sql: &str, params: Option<&Params>) -> Result<RowStream, SqlBridgeError> {
        let request = Request::new(Action::Each)
            .with_sql(sql)
            .with_params(params.map(Params::to_json));
        Ok(RowStream {
            replies: self.channel.request_stream(request)?,
            done: false,
        })
    }

    /// # Errors
    ///
    /// Returns `SqlBridgeError::Remote` (`Database closed`) if the worker has no database.
    pub async fn export(&self) -> Result<Vec<u8>, SqlBridgeError> {
        let mut response = self.channel.request(Request::new(Action::Export)).await?;
        match response.buffer.take() {
            Some(buffer) => Ok(buffer),
            None => Err(unexpected(Action::Export, &response)),
        }
    }

    /// Close the worker's database. The worker stays up; the next `exec` or `each`
    /// opens an empty database.
    ///
    /// # Errors
    ///
    /// Returns `SqlBridgeError::Remote` if the engine fails to close it.
    pub async fn close(&self) -> Result<(), SqlBridgeError> {
        self.channel.request(Request::new(Action::Close)).await?;
        Ok(())
    }
}

fn unexpected(action: Action, response: &Response) -> SqlBridgeError {
    SqlBridgeError::Protocol(format!(
        "unexpected response to {}: {response:?}",
        action.as_str()
    ))
}

/// Rows of an `each` request, in order.
pub struct RowStream {
    replies: UnboundedReceiver<Result<Response, SqlBridgeError>>,
    done: bool,
}

impl RowStream {
    /// The next row, or `None` once the query has finished.
    ///
    /// # Errors
    ///
    /// Returns the worker's error for the query, after which the stream is done.
    pub async fn next(&mut self) -> Option<Result<Row, SqlBridgeError>> {
        while !self.done {
            let reply = match self.replies.recv().await {
                Some(reply) => reply,
                None => {
                    self.done = true;
                    return Some(Err(SqlBridgeError::ConnectionError(
                        "row stream ended before the query finished".into(),
                    )));
                }
            };
            match reply {
                Ok(Response { row: Some(row), .. }) => return Some(Ok(row)),
                Ok(response) if response.is_terminal() => self.done = true,
                Ok(_) => {}
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
        None
    }

    /// Drain the stream into a vector.
    ///
    /// # Errors
    ///
    /// Returns the first error; rows received before it are discarded.
    pub async fn collect(mut self) -> Result<Vec<Row>, SqlBridgeError> {
        let mut rows = Vec::new();
        while let Some(row) = self.next().await {
            rows.push(row?);
        }
        Ok(rows)
    }
}

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use tokio::sync::mpsc as tokio_mpsc;

use super::dispatcher::run_worker;
use super::pending::PendingCalls;
use super::protocol::{Request, Response};
use crate::config::WorkerOptions;
use crate::error::SqlBridgeError;

static NEXT_CHANNEL: AtomicUsize = AtomicUsize::new(1);
static NEXT_ID: AtomicU32 = AtomicU32::new(1);

/// Request/response channel to a worker thread that owns the engine.
///
/// Every request gets a fresh id; responses are routed back by id, so calls may be
/// awaited concurrently and complete in any order.
#[derive(Clone)]
pub struct WorkerChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    sender: Mutex<Option<mpsc::Sender<Request>>>,
    pending: Arc<PendingCalls>,
}

impl WorkerChannel {
    /// Spawn the worker and its response router.
    ///
    /// # Errors
    ///
    /// Returns `SqlBridgeError::ConnectionError` if a thread cannot be spawned.
    pub fn spawn(options: WorkerOptions) -> Result<Self, SqlBridgeError> {
        let channel_id = NEXT_CHANNEL.fetch_add(1, Ordering::Relaxed);
        let (request_tx, request_rx) = mpsc::channel::<Request>();
        let (response_tx, response_rx) = mpsc::channel::<Response>();
        let pending = Arc::new(PendingCalls::default());

        let engine = options.engine;
        thread::Builder::new()
            .name(format!("{}-worker-{channel_id}", options.thread_name))
            .spawn(move || run_worker(engine, &request_rx, &response_tx))
            .map_err(|err| {
                SqlBridgeError::ConnectionError(format!("failed to spawn worker thread: {err}"))
            })?;

        let router_pending = Arc::clone(&pending);
        thread::Builder::new()
            .name(format!("{}-router-{channel_id}", options.thread_name))
            .spawn(move || {
                while let Ok(response) = response_rx.recv() {
                    router_pending.complete(response);
                }
                router_pending.close_all("worker channel closed");
            })
            .map_err(|err| {
                SqlBridgeError::ConnectionError(format!("failed to spawn router thread: {err}"))
            })?;

        tracing::debug!(channel_id, "worker channel started");
        Ok(Self {
            inner: Arc::new(ChannelInner {
                sender: Mutex::new(Some(request_tx)),
                pending,
            }),
        })
    }

    /// Send `request` and wait for its single response.
    ///
    /// # Errors
    ///
    /// Returns `SqlBridgeError::Remote` with the worker's error message, or
    /// `SqlBridgeError::ConnectionError` if the worker has gone away.
    pub async fn request(&self, request: Request) -> Result<Response, SqlBridgeError> {
        let id = self.next_id();
        let rx = self.inner.pending.register_single(id)?;
        self.post(id, request)?;
        rx.await
            .map_err(|_| connection_error("worker dropped response"))?
    }

    /// Send `request` and receive every response carrying its id, ending with the
    /// terminal one.
    ///
    /// # Errors
    ///
    /// Returns `SqlBridgeError::ConnectionError` if the request cannot be sent.
    pub fn request_stream(
        &self,
        request: Request,
    ) -> Result<tokio_mpsc::UnboundedReceiver<Result<Response, SqlBridgeError>>, SqlBridgeError> {
        let id = self.next_id();
        let rx = self.inner.pending.register_stream(id)?;
        self.post(id, request)?;
        Ok(rx)
    }

    /// Stop accepting requests. The worker finishes what it has queued and exits.
    pub fn shutdown(&self) {
        let sender = match self.inner.sender.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if sender.is_some() {
            tracing::debug!("worker channel shutting down");
        }
    }

    fn next_id(&self) -> u32 {
        loop {
            let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    fn post(&self, id: u32, mut request: Request) -> Result<(), SqlBridgeError> {
        request.id = id;
        let sent = match self.inner.sender.lock() {
            Ok(guard) => guard.as_ref().map(|tx| tx.send(request).is_ok()),
            Err(poisoned) => poisoned
                .into_inner()
                .as_ref()
                .map(|tx| tx.send(request).is_ok()),
        };
        if sent == Some(true) {
            Ok(())
        } else {
            self.inner.pending.cancel(id);
            Err(connection_error("worker channel closed"))
        }
    }
}

fn connection_error(message: &str) -> SqlBridgeError {
    SqlBridgeError::ConnectionError(message.to_string())
}

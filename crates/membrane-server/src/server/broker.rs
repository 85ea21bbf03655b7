//! Request/response correlation over a single worker stream.
//!
//! A worker stream is asynchronous in both directions: the membrane pushes
//! requests down the outbound half and the worker answers on the inbound half
//! in whatever order it finishes them. [`RequestBroker`] turns that into
//! ordinary round trips. Each request is tagged with a correlation ID, a
//! single-use response slot is parked under that ID, and the receive loop
//! started by [`RequestBroker::run`] completes the slot when the worker
//! answers with the same ID.
//!
//! The pending table is guarded by a read/write lock that is only held while
//! the map is mutated, never across an await.

use core::{
    pin::pin,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Duration,
};
use futures::{Stream, StreamExt};
use membrane_core::{
    Error, Result,
    types::{IdentifiableMessage, RequestId},
};
use parking_lot::RwLock;
use std::collections::{HashMap, hash_map::Entry};
use tokio::sync::{mpsc, oneshot};
use tonic::Status;

/// Response slot waiting for a worker answer.
///
/// The ticket distinguishes successive requests that reuse the same
/// correlation ID so a late cleanup never evicts somebody else's slot.
struct Pending<Resp> {
    ticket: u64,
    tx: oneshot::Sender<Resp>,
}

/// Correlates responses arriving on a worker stream with the requests that
/// produced them.
///
/// `Req` flows membrane to worker, `Resp` flows worker to membrane.
pub struct RequestBroker<Req, Resp> {
    outbound: mpsc::Sender<core::result::Result<Req, Status>>,
    pending: RwLock<HashMap<RequestId, Pending<Resp>>>,
    next_ticket: AtomicU64,
    started: AtomicBool,
    running: AtomicBool,
}

impl<Req, Resp> RequestBroker<Req, Resp>
where
    Req: IdentifiableMessage + Send + 'static,
    Resp: IdentifiableMessage + Send + 'static,
{
    /// Creates a broker writing requests to `outbound`.
    ///
    /// `outbound` is normally the sender half feeding the server-streaming
    /// response of a tonic handler.
    pub fn new(outbound: mpsc::Sender<core::result::Result<Req, Status>>) -> Self {
        Self {
            outbound,
            pending: RwLock::new(HashMap::new()),
            next_ticket: AtomicU64::new(0),
            started: AtomicBool::new(false),
            running: AtomicBool::new(false),
        }
    }

    /// Whether the receive loop is active.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Number of requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.pending.read().len()
    }

    /// Sends `request` to the worker and waits for the matching response.
    ///
    /// A blank correlation ID is replaced with a generated one. There is no
    /// deadline; use [`Self::send_timeout`] to bound the wait.
    ///
    /// # Errors
    ///
    /// - [`Error::BrokerNotRunning`] if [`Self::run`] has not been called.
    /// - [`Error::DuplicateRequestId`] if a request with the same ID is in
    ///   flight.
    /// - [`Error::WorkerDisconnected`] if the stream closes before a response
    ///   arrives.
    pub async fn send(&self, mut request: Req) -> Result<Resp> {
        if !self.is_running() {
            return Err(Error::BrokerNotRunning);
        }

        let id = request.ensure_id();
        let (tx, rx) = oneshot::channel();
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);

        match self.pending.write().entry(id.clone()) {
            Entry::Occupied(_) => return Err(Error::DuplicateRequestId { id }),
            Entry::Vacant(slot) => {
                slot.insert(Pending { ticket, tx });
            }
        }
        let _cleanup = PendingCleanup {
            pending: &self.pending,
            id: &id,
            ticket,
        };

        self.outbound
            .send(Ok(request))
            .await
            .map_err(|_| Error::WorkerDisconnected)?;

        rx.await.map_err(|_| Error::WorkerDisconnected)
    }

    /// Like [`Self::send`], but gives up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RequestTimeout`] when the deadline passes first. The
    /// pending entry is removed either way.
    pub async fn send_timeout(&self, mut request: Req, timeout: Duration) -> Result<Resp> {
        let id = request.ensure_id();
        match tokio::time::timeout(timeout, self.send(request)).await {
            Ok(result) => result,
            Err(_) => Err(Error::RequestTimeout { id, timeout }),
        }
    }

    /// Starts the receive loop over the worker's inbound stream.
    ///
    /// The broker is marked running as soon as this is called, before the
    /// returned future is first polled, so a caller can acknowledge the worker
    /// and begin sending right away. The future resolves when the stream ends:
    /// `Ok(())` on a clean close, [`Error::Stream`] when the stream yields an
    /// error. Any requester still waiting then fails with
    /// [`Error::WorkerDisconnected`].
    ///
    /// Responses whose ID matches no pending request are logged and dropped.
    ///
    /// # Errors
    ///
    /// Resolves to [`Error::BrokerAlreadyRunning`] if the loop was already
    /// started.
    pub fn run<'a, S>(&'a self, inbound: S) -> impl Future<Output = Result<()>> + Send + 'a
    where
        S: Stream<Item = core::result::Result<Resp, Status>> + Send + 'a,
    {
        let guard = if self.started.swap(true, Ordering::AcqRel) {
            None
        } else {
            self.running.store(true, Ordering::Release);
            Some(RunningGuard { broker: self })
        };

        async move {
            let Some(_guard) = guard else {
                return Err(Error::BrokerAlreadyRunning);
            };

            let mut inbound = pin!(inbound);
            while let Some(message) = inbound.next().await {
                match message {
                    Ok(response) => self.deliver(response),
                    Err(status) => {
                        tracing::debug!(code = ?status.code(), "worker stream errored");
                        return Err(Error::Stream(status));
                    }
                }
            }
            Ok(())
        }
    }

    fn deliver(&self, response: Resp) {
        let waiter = self.pending.write().remove(response.id());
        match waiter {
            Some(Pending { tx, .. }) => {
                if tx.send(response).is_err() {
                    tracing::debug!("requester went away before its response arrived");
                }
            }
            None => {
                tracing::error!(
                    id = response.id(),
                    "received response for unknown request ID, dropping"
                );
            }
        }
    }
}

/// Removes a request's pending slot when `send` returns or is cancelled.
struct PendingCleanup<'a, Resp> {
    pending: &'a RwLock<HashMap<RequestId, Pending<Resp>>>,
    id: &'a str,
    ticket: u64,
}

impl<Resp> Drop for PendingCleanup<'_, Resp> {
    fn drop(&mut self) {
        let mut pending = self.pending.write();
        if pending
            .get(self.id)
            .is_some_and(|entry| entry.ticket == self.ticket)
        {
            pending.remove(self.id);
        }
    }
}

/// Marks the broker stopped and fails outstanding requests once the receive
/// loop is gone.
struct RunningGuard<'a, Req, Resp> {
    broker: &'a RequestBroker<Req, Resp>,
}

impl<Req, Resp> Drop for RunningGuard<'_, Req, Resp> {
    fn drop(&mut self) {
        self.broker.running.store(false, Ordering::Release);
        // Dropping the senders wakes every waiter with a receive error.
        self.broker.pending.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use membrane_core::proto::topics::{
        ClientMessage, MessageResponse, ServerMessage, client_message,
    };
    use std::sync::Arc;
    use tokio_stream::wrappers::ReceiverStream;

    type Broker = RequestBroker<ServerMessage, ClientMessage>;
    type Inbound = mpsc::Sender<core::result::Result<ClientMessage, Status>>;
    type Outbound = mpsc::Receiver<core::result::Result<ServerMessage, Status>>;
    type InboundStream = ReceiverStream<core::result::Result<ClientMessage, Status>>;

    fn new_broker() -> (Arc<Broker>, Outbound, Inbound, InboundStream) {
        let (out_tx, out_rx) = mpsc::channel(8);
        let (in_tx, in_rx) = mpsc::channel(8);
        (
            Arc::new(RequestBroker::new(out_tx)),
            out_rx,
            in_tx,
            ReceiverStream::new(in_rx),
        )
    }

    fn reply(id: &str, success: bool) -> ClientMessage {
        ClientMessage {
            id: id.to_string(),
            content: Some(client_message::Content::MessageResponse(MessageResponse {
                success,
            })),
        }
    }

    fn request(id: &str) -> ServerMessage {
        ServerMessage {
            id: id.to_string(),
            content: None,
        }
    }

    fn success(message: &ClientMessage) -> bool {
        matches!(
            message.content,
            Some(client_message::Content::MessageResponse(MessageResponse { success: true }))
        )
    }

    /// Answers every request with `success = true`, echoing its ID.
    fn spawn_echo_worker(mut outbound: Outbound, inbound: Inbound) {
        tokio::spawn(async move {
            while let Some(Ok(request)) = outbound.recv().await {
                if inbound.send(Ok(reply(&request.id, true))).await.is_err() {
                    break;
                }
            }
        });
    }

    #[tokio::test]
    async fn send_before_run_is_rejected() {
        let (broker, _out, _in, _stream) = new_broker();
        let err = broker.send(request("a")).await.unwrap_err();
        assert!(matches!(err, Error::BrokerNotRunning));
    }

    #[tokio::test]
    async fn round_trip_delivers_matching_response() {
        let (broker, out, inbound, stream) = new_broker();
        let run = broker.run(stream);
        spawn_echo_worker(out, inbound);

        let response = tokio::select! {
            response = broker.send(request("req-1")) => response.unwrap(),
            _ = run => panic!("receive loop ended early"),
        };
        assert_eq!(response.id, "req-1");
        assert!(success(&response));
        assert_eq!(broker.pending_count(), 0);
    }

    #[tokio::test]
    async fn blank_ids_are_generated() {
        let (broker, out, inbound, stream) = new_broker();
        let run = broker.run(stream);
        spawn_echo_worker(out, inbound);

        let response = tokio::select! {
            response = broker.send(request("")) => response.unwrap(),
            _ = run => panic!("receive loop ended early"),
        };
        assert_eq!(response.id.len(), 26);
    }

    #[tokio::test]
    async fn duplicate_in_flight_id_fails() {
        let (broker, mut out, _inbound, stream) = new_broker();
        let _run = broker.run(stream);

        let first = tokio::spawn({
            let broker = Arc::clone(&broker);
            async move { broker.send(request("dup")).await }
        });
        // Wait until the first request is on the wire.
        let _ = out.recv().await.unwrap().unwrap();

        let err = broker.send(request("dup")).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateRequestId { ref id } if id == "dup"));
        assert_eq!(broker.pending_count(), 1);
        first.abort();
    }

    #[tokio::test]
    async fn unknown_ids_are_dropped_without_stopping_the_loop() {
        let (broker, mut out, inbound, stream) = new_broker();
        let run = tokio::spawn({
            let broker = Arc::clone(&broker);
            async move { broker.run(stream).await }
        });

        tokio::spawn(async move {
            let request = out.recv().await.unwrap().unwrap();
            inbound.send(Ok(reply("stray", true))).await.unwrap();
            inbound.send(Ok(reply(&request.id, false))).await.unwrap();
            while let Some(Ok(request)) = out.recv().await {
                if inbound.send(Ok(reply(&request.id, true))).await.is_err() {
                    break;
                }
            }
        });

        let first = broker.send(request("known")).await.unwrap();
        assert!(!success(&first));
        assert!(broker.is_running());

        let second = broker.send(request("after-stray")).await.unwrap();
        assert_eq!(second.id, "after-stray");
        assert!(success(&second));
        assert!(!run.is_finished());
        run.abort();
    }

    #[tokio::test]
    async fn closing_the_stream_fails_waiters() {
        let (broker, mut out, inbound, stream) = new_broker();
        let run = broker.run(stream);
        let worker = async move {
            let _ = out.recv().await;
            drop(inbound);
        };

        let (run_result, send_result, ()) =
            tokio::join!(run, broker.send(request("orphan")), worker);
        assert!(run_result.is_ok());
        assert!(matches!(send_result, Err(Error::WorkerDisconnected)));
        assert!(!broker.is_running());
        assert_eq!(broker.pending_count(), 0);
    }

    #[tokio::test]
    async fn stream_errors_end_the_loop() {
        let (broker, _out, inbound, stream) = new_broker();
        inbound
            .send(Err(Status::aborted("worker crashed")))
            .await
            .unwrap();
        let err = broker.run(stream).await.unwrap_err();
        assert!(matches!(err, Error::Stream(ref status) if status.message() == "worker crashed"));
        assert!(!broker.is_running());
    }

    #[tokio::test]
    async fn run_only_starts_once() {
        let (broker, _out, _in, stream) = new_broker();
        let (_, _, _, other) = new_broker();
        let _first = broker.run(stream);
        let err = broker.run(other).await.unwrap_err();
        assert!(matches!(err, Error::BrokerAlreadyRunning));
        assert!(broker.is_running());
    }

    #[tokio::test]
    async fn send_timeout_expires_and_cleans_up() {
        let (broker, _out, _inbound, stream) = new_broker();
        let _run = broker.run(stream);

        let err = broker
            .send_timeout(request("slow"), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RequestTimeout { ref id, .. } if id == "slow"));
        assert_eq!(broker.pending_count(), 0);
    }
}

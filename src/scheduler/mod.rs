//! Command client: the one place that talks to a transport.
//!
//! A worker task owns the adapter, which makes the single-in-flight rule
//! structural: requests queue in three priority lanes and the worker
//! dispatches the highest non-empty lane whenever the wire is free.
//! Message counters are assigned here, one wrapping u16 sequence per
//! client.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::{debug, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::cancel::CancelToken;
use crate::error::TransportError;
use crate::protocol::{Packet, packet};
use crate::transport::{SendOptions, Transport};

/// Extra wait beyond the request timeout before the transport is declared
/// stuck and force-closed.
const TIMEOUT_GRACE: Duration = Duration::from_millis(250);

const QUEUE_DEPTH: usize = 64;

/// Scheduling priority band. Within a lane requests are FIFO; across
/// lanes, high beats normal beats low at every dispatch point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Lane {
    High,
    #[default]
    Normal,
    Low,
}

#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub id: String,
    pub lane: Lane,
    /// Whether a caller may safely re-issue this request after a transport
    /// failure. The scheduler records it; retry policy lives above.
    pub idempotent: bool,
    pub timeout: Duration,
    pub packet_type: u8,
    pub payload: Vec<u8>,
    /// Overrides counter assignment, for replay and test traffic.
    pub expected_message_counter: Option<u16>,
    pub cancel: CancelToken,
}

impl CommandRequest {
    pub fn new(id: impl Into<String>, packet_type: u8, payload: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            lane: Lane::Normal,
            idempotent: false,
            timeout: crate::transport::DEFAULT_SEND_TIMEOUT,
            packet_type,
            payload,
            expected_message_counter: None,
            cancel: CancelToken::never(),
        }
    }

    pub fn with_lane(mut self, lane: Lane) -> Self {
        self.lane = lane;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[derive(Debug)]
pub struct CommandResult {
    pub request_id: String,
    pub message_counter: u16,
    /// `None` for fire-and-forget command types.
    pub reply: Option<Packet>,
    pub enqueued_at: Instant,
    pub started_at: Instant,
    pub finished_at: Instant,
    pub duration: Duration,
}

struct Staged {
    request: CommandRequest,
    enqueued_at: Instant,
    done: oneshot::Sender<Result<CommandResult, TransportError>>,
}

enum ClientMessage {
    Submit(Staged),
    Open(oneshot::Sender<Result<(), TransportError>>),
    Close(oneshot::Sender<Result<(), TransportError>>),
}

/// Handle to the worker task that owns the transport.
pub struct CommandClient {
    tx: mpsc::Sender<ClientMessage>,
    worker: JoinHandle<()>,
}

impl CommandClient {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let worker = tokio::spawn(run_worker(transport, rx));
        Self { tx, worker }
    }

    pub async fn open(&self) -> Result<(), TransportError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(ClientMessage::Open(done_tx))
            .await
            .map_err(|_| TransportError::TransportClosed)?;
        done_rx.await.map_err(|_| TransportError::TransportClosed)?
    }

    /// Closes the transport. Queued and in-flight requests fail; no
    /// request survives a close.
    pub async fn close(&self) -> Result<(), TransportError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(ClientMessage::Close(done_tx))
            .await
            .map_err(|_| TransportError::TransportClosed)?;
        done_rx.await.map_err(|_| TransportError::TransportClosed)?
    }

    pub async fn send(&self, request: CommandRequest) -> Result<CommandResult, TransportError> {
        let (done_tx, done_rx) = oneshot::channel();
        let staged = Staged {
            request,
            enqueued_at: Instant::now(),
            done: done_tx,
        };
        self.tx
            .send(ClientMessage::Submit(staged))
            .await
            .map_err(|_| TransportError::TransportClosed)?;
        done_rx.await.map_err(|_| TransportError::TransportClosed)?
    }
}

impl Drop for CommandClient {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

struct Worker {
    transport: Box<dyn Transport>,
    lanes: [VecDeque<Staged>; 3],
    next_counter: u16,
}

async fn run_worker(transport: Box<dyn Transport>, mut rx: mpsc::Receiver<ClientMessage>) {
    let mut worker = Worker {
        transport,
        lanes: Default::default(),
        next_counter: 0,
    };
    loop {
        // Pull in everything that arrived while the wire was busy, so lane
        // priority is judged over the full backlog.
        loop {
            match rx.try_recv() {
                Ok(message) => worker.accept(message).await,
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    worker.shutdown().await;
                    return;
                }
            }
        }
        if let Some(staged) = worker.pop_next() {
            worker.dispatch(staged).await;
            continue;
        }
        match rx.recv().await {
            Some(message) => worker.accept(message).await,
            None => {
                worker.shutdown().await;
                return;
            }
        }
    }
}

impl Worker {
    async fn accept(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::Submit(staged) => {
                let lane = staged.request.lane;
                self.lanes[lane_index(lane)].push_back(staged);
            }
            ClientMessage::Open(done) => {
                let _ = done.send(self.transport.open().await);
            }
            ClientMessage::Close(done) => {
                self.fail_queued(|| TransportError::TransportClosed);
                let _ = done.send(self.transport.close().await);
            }
        }
    }

    fn pop_next(&mut self) -> Option<Staged> {
        self.lanes.iter_mut().find_map(VecDeque::pop_front)
    }

    fn fail_queued(&mut self, error: impl Fn() -> TransportError) {
        for lane in &mut self.lanes {
            for staged in lane.drain(..) {
                let _ = staged.done.send(Err(error()));
            }
        }
    }

    fn assign_counter(&mut self, request: &CommandRequest) -> u16 {
        match request.expected_message_counter {
            Some(counter) => counter,
            None => {
                let counter = self.next_counter;
                self.next_counter = self.next_counter.wrapping_add(1);
                counter
            }
        }
    }

    async fn dispatch(&mut self, staged: Staged) {
        let Staged {
            request,
            enqueued_at,
            done,
        } = staged;

        if request.cancel.is_cancelled() {
            let _ = done.send(Err(TransportError::Aborted));
            return;
        }

        let counter = self.assign_counter(&request);
        let command = Packet::new(counter, request.packet_type, request.payload.clone());
        let opts = SendOptions {
            timeout: request.timeout,
            cancel: request.cancel.clone(),
            expected_message_counter: Some(counter),
        };
        let started_at = Instant::now();
        debug!("dispatching {} with counter {counter}", request.id);

        // The transport enforces the request timeout itself; the outer
        // window only trips when the adapter is wedged, and then the
        // adapter is closed so the next caller sees NotOpen.
        let outcome =
            tokio::time::timeout(request.timeout + TIMEOUT_GRACE, self.transport.send(&command, &opts))
                .await;
        let result = match outcome {
            Err(_) => {
                warn!(
                    "transport did not resolve {} within the grace window, closing it",
                    request.id
                );
                let _ = self.transport.close().await;
                Err(TransportError::Timeout)
            }
            Ok(Err(err)) => Err(err),
            Ok(Ok(reply)) => check_reply(&request, counter, reply).map(|reply| {
                let finished_at = Instant::now();
                CommandResult {
                    request_id: request.id.clone(),
                    message_counter: counter,
                    reply,
                    enqueued_at,
                    started_at,
                    finished_at,
                    duration: finished_at.duration_since(started_at),
                }
            }),
        };
        let _ = done.send(result);
    }

    async fn shutdown(&mut self) {
        self.fail_queued(|| TransportError::TransportClosed);
        let _ = self.transport.close().await;
    }
}

fn lane_index(lane: Lane) -> usize {
    match lane {
        Lane::High => 0,
        Lane::Normal => 1,
        Lane::Low => 2,
    }
}

fn check_reply(
    request: &CommandRequest,
    counter: u16,
    reply: Option<Packet>,
) -> Result<Option<Packet>, TransportError> {
    let Some(reply) = reply else {
        return Ok(None);
    };
    if reply.message_counter != counter {
        return Err(TransportError::ProtocolMismatch(format!(
            "reply counter {} does not match request counter {counter}",
            reply.message_counter
        )));
    }
    if !packet::reply_matches_command(request.packet_type, reply.packet_type) {
        return Err(TransportError::ProtocolMismatch(format!(
            "reply type {:#04x} does not answer command type {:#04x}",
            reply.packet_type, request.packet_type
        )));
    }
    Ok(Some(reply))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lanes_order_high_first() {
        assert!(lane_index(Lane::High) < lane_index(Lane::Normal));
        assert!(lane_index(Lane::Normal) < lane_index(Lane::Low));
    }

    #[test]
    fn reply_family_is_checked() {
        let request = CommandRequest::new("x", packet::DIRECT_COMMAND_REPLY, vec![]);
        let wrong_family = Packet::new(3, packet::SYSTEM_REPLY, vec![]);
        assert!(matches!(
            check_reply(&request, 3, Some(wrong_family)),
            Err(TransportError::ProtocolMismatch(_))
        ));
        let wrong_counter = Packet::new(4, packet::DIRECT_REPLY, vec![]);
        assert!(matches!(
            check_reply(&request, 3, Some(wrong_counter)),
            Err(TransportError::ProtocolMismatch(_))
        ));
        let ok = Packet::new(3, packet::DIRECT_REPLY, vec![]);
        assert!(check_reply(&request, 3, Some(ok)).is_ok());
    }
}

//! Reply correlation shared by the byte-stream adapters: the single
//! pending-reply slot, the background reader task feeding raw chunks, and
//! the loop that frames chunks and filters them by message counter.

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::TransportError;
use crate::protocol::{FramerConfig, Packet, extract_frames};
use crate::transport::SendOptions;

const READ_CHUNK: usize = 4096;
const CHUNK_QUEUE: usize = 64;

/// The one slot a transport has for an outstanding request.
#[derive(Debug, Default)]
pub(crate) enum ReplySlot {
    #[default]
    Idle,
    Waiting {
        expected_counter: Option<u16>,
    },
}

impl ReplySlot {
    /// Claims the slot for a request, failing if one is already pending.
    pub(crate) fn begin(&mut self, expected_counter: Option<u16>) -> Result<(), TransportError> {
        match self {
            Self::Idle => {
                *self = Self::Waiting { expected_counter };
                Ok(())
            }
            Self::Waiting { .. } => Err(TransportError::AlreadyInFlight),
        }
    }

    pub(crate) fn finish(&mut self) {
        *self = Self::Idle;
    }

    /// Whether a framed packet resolves the pending request or is stale.
    pub(crate) fn accepts(&self, packet: &Packet) -> bool {
        match self {
            Self::Idle => false,
            Self::Waiting { expected_counter } => {
                expected_counter.is_none_or(|counter| counter == packet.message_counter)
            }
        }
    }
}

/// Inbound half of an open byte-stream session. The reader task owns the
/// OS read handle; it forwards chunks until end-of-stream or an IO error,
/// then quietly goes away so late errors never crash the host.
pub(crate) struct Inbound {
    rx: mpsc::Receiver<Vec<u8>>,
    reader: JoinHandle<()>,
    pub(crate) buffer: Vec<u8>,
}

impl Inbound {
    pub(crate) fn from_parts(rx: mpsc::Receiver<Vec<u8>>, reader: JoinHandle<()>) -> Self {
        Self {
            rx,
            reader,
            buffer: Vec::new(),
        }
    }

    pub(crate) fn spawn<R>(source: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(CHUNK_QUEUE);
        let reader = tokio::spawn(pump(source, tx));
        Self::from_parts(rx, reader)
    }

    /// Drains every chunk the reader has queued. Returns `false` when the
    /// stream has ended (remote close, driver disconnect, IO error).
    pub(crate) fn drain(&mut self) -> bool {
        loop {
            match self.rx.try_recv() {
                Ok(chunk) => self.buffer.extend_from_slice(&chunk),
                Err(mpsc::error::TryRecvError::Empty) => return true,
                Err(mpsc::error::TryRecvError::Disconnected) => return false,
            }
        }
    }

    /// Frames buffered bytes and awaits further chunks until a packet
    /// passes `slot`'s counter filter, the request is cancelled, or the
    /// timeout elapses.
    pub(crate) async fn recv_matching(
        &mut self,
        config: &FramerConfig,
        slot: &ReplySlot,
        opts: &SendOptions,
    ) -> Result<Packet, TransportError> {
        let deadline = tokio::time::Instant::now() + opts.timeout;
        loop {
            for frame in extract_frames(&mut self.buffer, config) {
                match Packet::decode(&frame) {
                    Ok(packet) if slot.accepts(&packet) => return Ok(packet),
                    Ok(packet) => {
                        debug!(
                            "discarding stale packet with counter {}",
                            packet.message_counter
                        );
                    }
                    Err(err) => warn!("dropping undecodable frame: {err}"),
                }
            }
            tokio::select! {
                chunk = self.rx.recv() => match chunk {
                    Some(bytes) => self.buffer.extend_from_slice(&bytes),
                    None => return Err(TransportError::TransportClosed),
                },
                _ = opts.cancel.cancelled() => return Err(TransportError::Aborted),
                _ = tokio::time::sleep_until(deadline) => return Err(TransportError::Timeout),
            }
        }
    }
}

impl Drop for Inbound {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn pump<R>(mut source: R, tx: mpsc::Sender<Vec<u8>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match source.read(&mut buf).await {
            Ok(0) => {
                debug!("inbound stream ended");
                break;
            }
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                // Swallowed on purpose: a late write abort or unplug must
                // not take the host down, only end this session.
                debug!("inbound stream failed: {err}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelSource;
    use crate::protocol::packet::DIRECT_REPLY;
    use std::time::Duration;

    #[test]
    fn slot_rejects_a_second_claim() {
        let mut slot = ReplySlot::default();
        slot.begin(Some(1)).unwrap();
        assert!(matches!(
            slot.begin(Some(2)),
            Err(TransportError::AlreadyInFlight)
        ));
        slot.finish();
        slot.begin(None).unwrap();
    }

    #[test]
    fn slot_filters_by_counter() {
        let mut slot = ReplySlot::default();
        slot.begin(Some(7)).unwrap();
        let stale = Packet::new(6, DIRECT_REPLY, vec![]);
        let fresh = Packet::new(7, DIRECT_REPLY, vec![]);
        assert!(!slot.accepts(&stale));
        assert!(slot.accepts(&fresh));
        slot.begin(Some(9)).unwrap_err();
    }

    #[tokio::test]
    async fn recv_matching_skips_stale_counters() {
        let (tx, rx) = mpsc::channel(8);
        let reader = tokio::spawn(async {});
        let mut inbound = Inbound::from_parts(rx, reader);
        let mut slot = ReplySlot::default();
        slot.begin(Some(5)).unwrap();

        let stale = Packet::new(6, DIRECT_REPLY, vec![0xaa]).encode().unwrap();
        let fresh = Packet::new(5, DIRECT_REPLY, vec![0xbb]).encode().unwrap();
        tx.send(stale).await.unwrap();
        tx.send(fresh).await.unwrap();

        let opts = SendOptions::expecting(5);
        let packet = inbound
            .recv_matching(&FramerConfig::length_prefixed(), &slot, &opts)
            .await
            .unwrap();
        assert_eq!(packet.payload, vec![0xbb]);
    }

    #[tokio::test]
    async fn recv_matching_times_out() {
        let (_tx, rx) = mpsc::channel::<Vec<u8>>(1);
        let reader = tokio::spawn(async {});
        let mut inbound = Inbound::from_parts(rx, reader);
        let mut slot = ReplySlot::default();
        slot.begin(Some(1)).unwrap();

        let opts = SendOptions {
            timeout: Duration::from_millis(20),
            ..SendOptions::expecting(1)
        };
        let err = inbound
            .recv_matching(&FramerConfig::length_prefixed(), &slot, &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout));
    }

    #[tokio::test]
    async fn recv_matching_aborts_on_cancellation() {
        let (_tx, rx) = mpsc::channel::<Vec<u8>>(1);
        let reader = tokio::spawn(async {});
        let mut inbound = Inbound::from_parts(rx, reader);
        let mut slot = ReplySlot::default();
        slot.begin(None).unwrap();

        let source = CancelSource::new();
        let opts = SendOptions {
            timeout: Duration::from_secs(5),
            cancel: source.token(),
            expected_message_counter: None,
        };
        source.cancel();
        let err = inbound
            .recv_matching(&FramerConfig::length_prefixed(), &slot, &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Aborted));
    }

    #[tokio::test]
    async fn drain_reports_a_dead_stream() {
        let (tx, rx) = mpsc::channel(8);
        let reader = tokio::spawn(async {});
        let mut inbound = Inbound::from_parts(rx, reader);
        tx.send(vec![1, 2, 3]).await.unwrap();
        drop(tx);
        assert!(!inbound.drain());
        assert_eq!(inbound.buffer, vec![1, 2, 3]);
    }
}

//! Transport adapter backed by a [`Responder`] instead of hardware.
//!
//! Replies still pass through packet decode and the expected-counter
//! filter, so the scheduler sees the same behaviour it gets from a live
//! adapter, including hangs when the fault layer swallows a reply.

use std::sync::Arc;

use async_trait::async_trait;
use log::debug;

use crate::error::TransportError;
use crate::mock::responder::Responder;
use crate::protocol::{Packet, packet};
use crate::transport::reply::ReplySlot;
use crate::transport::{SendOptions, Transport};

pub struct MockTransport {
    responder: Arc<dyn Responder>,
    open: bool,
    slot: ReplySlot,
}

impl MockTransport {
    pub fn new(responder: Arc<dyn Responder>) -> Self {
        Self {
            responder,
            open: false,
            slot: ReplySlot::default(),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        self.open = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.open = false;
        self.slot.finish();
        Ok(())
    }

    async fn send(
        &mut self,
        packet: &Packet,
        opts: &SendOptions,
    ) -> Result<Option<Packet>, TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        self.slot.begin(opts.expected_message_counter)?;

        let result = async {
            let request = packet.encode()?;
            if !packet::expects_reply(packet.packet_type) {
                self.responder.handle(&request).await;
                return Ok(None);
            }

            let deadline = tokio::time::Instant::now() + opts.timeout;
            let reply_bytes = tokio::select! {
                reply = self.responder.handle(&request) => reply,
                _ = opts.cancel.cancelled() => return Err(TransportError::Aborted),
                _ = tokio::time::sleep_until(deadline) => return Err(TransportError::Timeout),
            };

            let accepted = reply_bytes
                .and_then(|bytes| Packet::decode(&bytes).ok())
                .filter(|reply| self.slot.accepts(reply));
            match accepted {
                Some(reply) => Ok(Some(reply)),
                None => {
                    // No reply (or a stale one): hold the line until the
                    // caller gives up, like a silent brick would.
                    debug!("mock responder produced no matching reply");
                    tokio::select! {
                        _ = opts.cancel.cancelled() => Err(TransportError::Aborted),
                        _ = tokio::time::sleep_until(deadline) => Err(TransportError::Timeout),
                    }
                }
            }
        }
        .await;

        self.slot.finish();
        result
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

//! Fault injection around a responder: latency, jitter, flipped error
//! replies and swallowed replies, for exercising timeout and retry paths
//! without hardware.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use crate::mock::responder::Responder;
use crate::protocol::packet::{DIRECT_REPLY, DIRECT_REPLY_ERROR, SYSTEM_REPLY, SYSTEM_REPLY_ERROR};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FaultConfig {
    /// Probability that a reply's type byte is flipped to its error twin.
    pub error_rate: f64,
    pub latency_ms: u64,
    /// Uniform jitter added to the latency, in `[-jitter_ms, +jitter_ms]`.
    pub jitter_ms: u64,
    /// Probability that a request is never answered at all, leaving the
    /// caller to its timeout.
    pub timeout_rate: f64,
}

impl FaultConfig {
    pub fn is_noop(&self) -> bool {
        self.error_rate <= 0.0
            && self.latency_ms == 0
            && self.jitter_ms == 0
            && self.timeout_rate <= 0.0
    }
}

pub struct FaultInjector {
    inner: Arc<dyn Responder>,
    config: FaultConfig,
}

impl FaultInjector {
    pub fn new(inner: Arc<dyn Responder>, config: FaultConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl Responder for FaultInjector {
    async fn handle(&self, request: &[u8]) -> Option<Vec<u8>> {
        let (timeout_roll, error_roll, jitter) = {
            let mut rng = rand::rng();
            let jitter_bound = self.config.jitter_ms as i64;
            let jitter = if jitter_bound > 0 {
                rng.random_range(-jitter_bound..=jitter_bound)
            } else {
                0
            };
            (rng.random::<f64>(), rng.random::<f64>(), jitter)
        };

        if timeout_roll < self.config.timeout_rate {
            debug!("fault injector swallowing a reply");
            return None;
        }

        let delay = (self.config.latency_ms as i64 + jitter).max(0) as u64;
        if delay > 0 {
            sleep(Duration::from_millis(delay)).await;
        }

        let mut reply = self.inner.handle(request).await?;
        if error_roll < self.config.error_rate
            && let Some(type_byte) = reply.get_mut(4)
        {
            let flipped = match *type_byte {
                DIRECT_REPLY => DIRECT_REPLY_ERROR,
                SYSTEM_REPLY => SYSTEM_REPLY_ERROR,
                other => other,
            };
            debug!("fault injector flipping reply type {:#04x} -> {flipped:#04x}", *type_byte);
            *type_byte = flipped;
        }
        Some(reply)
    }
}

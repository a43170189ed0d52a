//! Ordered fallback across transport families: try each candidate factory
//! in turn, keep the first one whose `open()` succeeds.

use std::sync::Arc;

use async_trait::async_trait;
use log::{info, warn};

use crate::error::TransportError;
use crate::protocol::Packet;
use crate::transport::{SendOptions, Transport};

type TransportFactoryFn = dyn Fn() -> Box<dyn Transport> + Send + Sync;

/// A named way of producing a transport. The factory runs only when the
/// walk reaches this candidate, so losing candidates cost nothing.
#[derive(Clone)]
pub struct TransportCandidate {
    pub name: String,
    pub build: Arc<TransportFactoryFn>,
}

impl TransportCandidate {
    pub fn new<F>(name: impl Into<String>, build: F) -> Self
    where
        F: Fn() -> Box<dyn Transport> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            build: Arc::new(build),
        }
    }
}

pub struct AutoTransport {
    candidates: Vec<TransportCandidate>,
    active: Option<(String, Box<dyn Transport>)>,
}

impl AutoTransport {
    pub fn new(candidates: Vec<TransportCandidate>) -> Self {
        Self {
            candidates,
            active: None,
        }
    }

    /// Name of the candidate currently carrying traffic.
    pub fn selected(&self) -> Option<&str> {
        self.active.as_ref().map(|(name, _)| name.as_str())
    }
}

#[async_trait]
impl Transport for AutoTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        if self.active.is_some() {
            return Ok(());
        }
        let mut failures = Vec::new();
        for candidate in &self.candidates {
            let mut transport = (candidate.build)();
            match transport.open().await {
                Ok(()) => {
                    info!("auto transport selected {}", candidate.name);
                    self.active = Some((candidate.name.clone(), transport));
                    return Ok(());
                }
                Err(err) => {
                    warn!("auto transport candidate {} failed: {err}", candidate.name);
                    let _ = transport.close().await;
                    failures.push(format!("{}: {err}", candidate.name));
                }
            }
        }
        Err(TransportError::AutoTransportFailed(failures.join("; ")))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some((name, mut transport)) = self.active.take() {
            info!("auto transport closing {name}");
            transport.close().await?;
        }
        Ok(())
    }

    async fn send(
        &mut self,
        packet: &Packet,
        opts: &SendOptions,
    ) -> Result<Option<Packet>, TransportError> {
        match self.active.as_mut() {
            Some((_, transport)) => transport.send(packet, opts).await,
            None => Err(TransportError::NotOpen),
        }
    }

    fn is_open(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|(_, transport)| transport.is_open())
    }
}

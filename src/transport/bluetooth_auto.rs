//! Bluetooth auto-port adapter: enumerate COM candidates, probe each one
//! until an EV3 answers, retry transient failures, re-enumerate when the
//! port roster looks unstable, and optionally repeat the whole dance with
//! the opposite DTR line state.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::time::sleep;

use crate::bluetooth::classify::{classify, summarize};
use crate::bluetooth::ports::{PlanStrategy, PortPlan, SerialCandidate, candidate_plans};
use crate::error::TransportError;
use crate::protocol::packet::{
    SYSTEM_COMMAND_REPLY, SYSTEM_REPLY, SYSTEM_REPLY_ERROR,
};
use crate::protocol::Packet;
use crate::transport::bluetooth_spp::{BluetoothSppConfig, BluetoothSppTransport};
use crate::transport::{SendOptions, Transport};

/// `LIST_OPEN_HANDLES`: the cheapest system command an EV3 always answers,
/// used as the liveness probe.
const PROBE_OPCODE: u8 = 0x9d;
const PROBE_COUNTER: u16 = 0;

type CandidateSourceFn =
    dyn Fn() -> Result<Vec<SerialCandidate>, TransportError> + Send + Sync;
type SppFactoryFn = dyn Fn(BluetoothSppConfig) -> Box<dyn Transport> + Send + Sync;

#[derive(Debug, Clone)]
pub struct BluetoothAutoPortConfig {
    pub preferred_port: Option<String>,
    pub preferred_serial: Option<String>,
    pub baud_rate: u32,
    pub dtr: bool,
    /// Also try the opposite DTR state after all ports failed with the
    /// configured one.
    pub auto_dtr_fallback: bool,
    pub probe_timeout: Duration,
    /// Attempts per port under the `ev3-priority` plan; the legacy plan
    /// always gets a single attempt per port.
    pub port_attempts: u32,
    pub retry_delay: Duration,
    /// Settle time between a successful serial open and the probe; RFCOMM
    /// links drop bytes written immediately after the port appears.
    pub post_open_delay: Duration,
    pub rediscovery_attempts: u32,
    pub rediscovery_delay: Duration,
}

impl Default for BluetoothAutoPortConfig {
    fn default() -> Self {
        Self {
            preferred_port: None,
            preferred_serial: None,
            baud_rate: crate::transport::bluetooth_spp::DEFAULT_BAUD_RATE,
            dtr: true,
            auto_dtr_fallback: true,
            probe_timeout: Duration::from_millis(2000),
            port_attempts: 2,
            retry_delay: Duration::from_millis(250),
            post_open_delay: Duration::from_millis(150),
            rediscovery_attempts: 1,
            rediscovery_delay: Duration::from_millis(750),
        }
    }
}

pub struct BluetoothAutoPortTransport {
    config: BluetoothAutoPortConfig,
    candidates: Arc<CandidateSourceFn>,
    spp_factory: Arc<SppFactoryFn>,
    active: Option<Box<dyn Transport>>,
    selected_port: Option<String>,
}

impl BluetoothAutoPortTransport {
    pub fn new(config: BluetoothAutoPortConfig) -> Self {
        Self {
            config,
            candidates: Arc::new(crate::bluetooth::ports::discover_candidates),
            spp_factory: Arc::new(|spp_config| {
                Box::new(BluetoothSppTransport::new(spp_config)) as Box<dyn Transport>
            }),
            active: None,
            selected_port: None,
        }
    }

    /// Replaces the OS port enumeration, for tests and odd setups.
    pub fn with_candidate_source<F>(mut self, source: F) -> Self
    where
        F: Fn() -> Result<Vec<SerialCandidate>, TransportError> + Send + Sync + 'static,
    {
        self.candidates = Arc::new(source);
        self
    }

    /// Replaces the serial adapter constructor, for tests.
    pub fn with_spp_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(BluetoothSppConfig) -> Box<dyn Transport> + Send + Sync + 'static,
    {
        self.spp_factory = Arc::new(factory);
        self
    }

    pub fn selected_port(&self) -> Option<&str> {
        self.selected_port.as_deref()
    }

    fn resolve_plans(&self, failures: &mut Vec<String>) -> Vec<PortPlan> {
        let candidates = match (self.candidates)() {
            Ok(candidates) => candidates,
            Err(err) => {
                failures.push(format!("Bluetooth could not enumerate serial ports: {err}"));
                return Vec::new();
            }
        };
        let plans = candidate_plans(
            self.config.preferred_port.as_deref(),
            &candidates,
            self.config.preferred_serial.as_deref(),
        );
        if plans.is_empty() {
            failures
                .push("Bluetooth transport could not resolve any serial COM candidates.".into());
        }
        plans
    }

    /// One open + settle + probe attempt against one port. The adapter is
    /// returned only when the probe saw a system reply; failures come back
    /// as the diagnostic text the classifier works on.
    async fn attempt_port(&self, port: &str, dtr: bool) -> Result<Box<dyn Transport>, String> {
        let mut transport = (self.spp_factory)(BluetoothSppConfig {
            port: port.to_string(),
            baud_rate: self.config.baud_rate,
            dtr,
        });
        if let Err(err) = transport.open().await {
            let _ = transport.close().await;
            return Err(err.to_string());
        }
        sleep(self.config.post_open_delay).await;

        let probe = Packet::new(PROBE_COUNTER, SYSTEM_COMMAND_REPLY, vec![PROBE_OPCODE]);
        let opts = SendOptions {
            timeout: self.config.probe_timeout,
            expected_message_counter: Some(PROBE_COUNTER),
            ..SendOptions::default()
        };
        let diagnostic = match transport.send(&probe, &opts).await {
            Ok(Some(reply)) => match reply.packet_type {
                SYSTEM_REPLY | SYSTEM_REPLY_ERROR => return Ok(transport),
                other => format!("Unexpected reply type {other:#x} during BT port probe."),
            },
            Ok(None) => "BT port probe produced no reply.".to_string(),
            Err(err) => format!("BT port probe on {port} failed: {err}"),
        };
        let _ = transport.close().await;
        Err(diagnostic)
    }

    /// Walks plans, ports and attempts for one DTR state. Ports already
    /// tried under an earlier plan in the same round are skipped.
    async fn try_plans(
        &mut self,
        plans: &[PortPlan],
        round: u32,
        dtr: bool,
        failures: &mut Vec<String>,
    ) -> bool {
        let mut tried: HashSet<String> = HashSet::new();
        for plan in plans {
            let attempts = match plan.strategy {
                PlanStrategy::Ev3Priority => self.config.port_attempts.max(1),
                PlanStrategy::LegacyOrder => 1,
            };
            for port in &plan.ports {
                if !tried.insert(port.clone()) {
                    continue;
                }
                for attempt in 1..=attempts {
                    debug!(
                        "BT auto-port round {round}: {port} via {} attempt {attempt}/{attempts} (dtr {dtr})",
                        plan.strategy.name()
                    );
                    match self.attempt_port(port, dtr).await {
                        Ok(transport) => {
                            info!("BT auto-port settled on {port} (dtr {dtr})");
                            self.active = Some(transport);
                            self.selected_port = Some(port.clone());
                            return true;
                        }
                        Err(message) => {
                            let classification = classify(&message, plan.strategy);
                            failures.push(format!(
                                "{port} ({}, dtr {dtr}, attempt {attempt}): {message}",
                                plan.strategy.name()
                            ));
                            if !classification.likely_transient {
                                debug!("{port}: not transient, moving on");
                                break;
                            }
                            if attempt < attempts {
                                sleep(self.config.retry_delay).await;
                            }
                        }
                    }
                }
            }
        }
        false
    }
}

#[async_trait]
impl Transport for BluetoothAutoPortTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        if self.active.is_some() {
            return Ok(());
        }
        let mut failures: Vec<String> = Vec::new();

        let dtr_profiles = if self.config.auto_dtr_fallback {
            vec![self.config.dtr, !self.config.dtr]
        } else {
            vec![self.config.dtr]
        };

        for dtr in dtr_profiles {
            for pass in 0..=self.config.rediscovery_attempts {
                let plans = self.resolve_plans(&mut failures);
                if !plans.is_empty() && self.try_plans(&plans, pass + 1, dtr, &mut failures).await {
                    return Ok(());
                }
                if pass == self.config.rediscovery_attempts {
                    break;
                }
                let last_is_dynamic = failures.last().is_some_and(|message| {
                    classify(message, PlanStrategy::Ev3Priority).likely_dynamic_availability
                });
                if !last_is_dynamic {
                    debug!("last failure does not look availability-related, no rediscovery");
                    break;
                }
                warn!(
                    "BT auto-port pass {} failed, re-enumerating in {:?}",
                    pass + 1,
                    self.config.rediscovery_delay
                );
                sleep(self.config.rediscovery_delay).await;
            }
        }

        let summary = summarize(&failures, PlanStrategy::Ev3Priority);
        Err(TransportError::BluetoothAutoPortFailed(format!(
            "{}; {}",
            summary.headline(),
            failures.join(" | ")
        )))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.selected_port = None;
        if let Some(mut transport) = self.active.take() {
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
            Some(transport) => transport.send(packet, opts).await,
            None => Err(TransportError::NotOpen),
        }
    }

    fn is_open(&self) -> bool {
        self.active.as_ref().is_some_and(|t| t.is_open())
    }
}

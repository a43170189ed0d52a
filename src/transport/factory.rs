//! Turns configuration into a transport composition.
//!
//! The settings source is injected, so the host can back it with
//! workspace files, environment, or a plain map; per-brick overrides
//! shadow the base source key by key. Numeric values are floored and
//! clamped to sane minima rather than rejected.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::warn;
use serde_json::Value;

use crate::error::TransportError;
use crate::mock::faults::{FaultConfig, FaultInjector};
use crate::mock::responder::{CommandResponder, Responder};
use crate::mock::world::MockWorldHandle;
use crate::transport::auto::{AutoTransport, TransportCandidate};
use crate::transport::bluetooth_auto::{BluetoothAutoPortConfig, BluetoothAutoPortTransport};
use crate::transport::bluetooth_spp::{BluetoothSppConfig, BluetoothSppTransport};
use crate::transport::mock::MockTransport;
use crate::transport::tcp::{TcpConfig, TcpTransport};
use crate::transport::usb_hid::{UsbHidConfig, UsbHidTransport};
use crate::transport::Transport;

/// Anything that can answer dotted setting keys like
/// `transport.bluetooth.baudRate`.
pub trait SettingsSource: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
}

/// Settings backed by a plain map; also the shape override layers take.
#[derive(Debug, Clone, Default)]
pub struct MapSettings {
    values: HashMap<String, Value>,
}

impl MapSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }
}

impl SettingsSource for MapSettings {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).cloned()
    }
}

/// A base settings source plus call-time overrides (per-brick profile).
#[derive(Clone)]
pub struct TransportSettings {
    base: Arc<dyn SettingsSource>,
    overrides: HashMap<String, Value>,
}

impl TransportSettings {
    pub fn new(base: Arc<dyn SettingsSource>) -> Self {
        Self {
            base,
            overrides: HashMap::new(),
        }
    }

    pub fn from_map(map: MapSettings) -> Self {
        Self::new(Arc::new(map))
    }

    /// Adds overrides that shadow the base source.
    pub fn with_overrides(mut self, overrides: HashMap<String, Value>) -> Self {
        self.overrides.extend(overrides);
        self
    }

    pub fn set_override(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.overrides.insert(key.into(), value.into());
    }

    fn value(&self, key: &str) -> Option<Value> {
        self.overrides
            .get(key)
            .cloned()
            .or_else(|| self.base.get(key))
    }

    fn string(&self, key: &str) -> Option<String> {
        match self.value(key)? {
            Value::String(s) => Some(s),
            other => Some(other.to_string()),
        }
    }

    fn non_empty_string(&self, key: &str) -> Option<String> {
        self.string(key)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn bool_or(&self, key: &str, default: bool) -> bool {
        match self.value(key) {
            Some(Value::Bool(b)) => b,
            Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => true,
                "false" | "0" | "no" | "off" => false,
                _ => default,
            },
            _ => default,
        }
    }

    /// Floored and clamped numeric setting; strings parse too since some
    /// settings stores only hold text.
    fn u64_at_least(&self, key: &str, default: u64, min: u64) -> u64 {
        let raw = match self.value(key) {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        match raw {
            Some(value) if value.is_finite() => (value.floor().max(0.0) as u64).max(min),
            _ => default,
        }
    }

    fn rate(&self, key: &str) -> f64 {
        let raw = match self.value(key) {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        raw.unwrap_or(0.0).clamp(0.0, 1.0)
    }

    fn millis(&self, key: &str, default: u64, min: u64) -> Duration {
        Duration::from_millis(self.u64_at_least(key, default, min))
    }
}

fn usb_config(settings: &TransportSettings) -> UsbHidConfig {
    let defaults = UsbHidConfig::default();
    UsbHidConfig {
        path: settings.non_empty_string("transport.usb.path"),
        vendor_id: settings.u64_at_least("transport.usb.vendorId", defaults.vendor_id as u64, 0)
            as u16,
        product_id: settings.u64_at_least("transport.usb.productId", defaults.product_id as u64, 0)
            as u16,
        report_id: settings.u64_at_least("transport.usb.reportId", defaults.report_id as u64, 0)
            as u8,
        report_size: settings.u64_at_least(
            "transport.usb.reportSize",
            defaults.report_size as u64,
            64,
        ) as usize,
    }
}

fn spp_config(settings: &TransportSettings) -> BluetoothSppConfig {
    let defaults = BluetoothSppConfig::default();
    BluetoothSppConfig {
        port: settings
            .non_empty_string("transport.bluetooth.port")
            .unwrap_or_default(),
        baud_rate: settings.u64_at_least(
            "transport.bluetooth.baudRate",
            defaults.baud_rate as u64,
            1200,
        ) as u32,
        dtr: settings.bool_or("transport.bluetooth.dtr", defaults.dtr),
    }
}

fn bluetooth_auto_config(settings: &TransportSettings) -> BluetoothAutoPortConfig {
    let defaults = BluetoothAutoPortConfig::default();
    let spp = spp_config(settings);
    BluetoothAutoPortConfig {
        preferred_port: (!spp.port.is_empty()).then_some(spp.port),
        preferred_serial: settings.non_empty_string("transport.bluetooth.serialNumber"),
        baud_rate: spp.baud_rate,
        dtr: spp.dtr,
        auto_dtr_fallback: settings.bool_or(
            "transport.bluetooth.autoDtrFallback",
            defaults.auto_dtr_fallback,
        ),
        probe_timeout: settings.millis(
            "transport.bluetooth.portProbeTimeoutMs",
            defaults.probe_timeout.as_millis() as u64,
            100,
        ),
        port_attempts: settings.u64_at_least(
            "transport.bluetooth.portAttempts",
            defaults.port_attempts as u64,
            1,
        ) as u32,
        retry_delay: settings.millis(
            "transport.bluetooth.retryDelayMs",
            defaults.retry_delay.as_millis() as u64,
            0,
        ),
        post_open_delay: settings.millis(
            "transport.bluetooth.postOpenDelayMs",
            defaults.post_open_delay.as_millis() as u64,
            0,
        ),
        rediscovery_attempts: settings.u64_at_least(
            "transport.bluetooth.rediscoveryAttempts",
            defaults.rediscovery_attempts as u64,
            0,
        ) as u32,
        rediscovery_delay: settings.millis(
            "transport.bluetooth.rediscoveryDelayMs",
            defaults.rediscovery_delay.as_millis() as u64,
            0,
        ),
    }
}

fn tcp_config(settings: &TransportSettings) -> Result<TcpConfig, TransportError> {
    let defaults = TcpConfig::default();
    let host = settings.non_empty_string("transport.tcp.host");
    let use_discovery = settings.bool_or("transport.tcp.useDiscovery", defaults.use_discovery);
    if host.is_none() && !use_discovery {
        return Err(TransportError::InvalidConfig(
            "transport.tcp.host is empty and discovery is disabled".into(),
        ));
    }
    Ok(TcpConfig {
        host,
        port: settings.u64_at_least("transport.tcp.port", defaults.port as u64, 1) as u16,
        use_discovery,
        discovery_port: settings.u64_at_least(
            "transport.tcp.discoveryPort",
            defaults.discovery_port as u64,
            1,
        ) as u16,
        discovery_timeout: settings.millis(
            "transport.tcp.discoveryTimeoutMs",
            defaults.discovery_timeout.as_millis() as u64,
            100,
        ),
        serial_number: settings.non_empty_string("transport.tcp.serialNumber"),
        handshake_timeout: settings.millis(
            "transport.tcp.handshakeTimeoutMs",
            defaults.handshake_timeout.as_millis() as u64,
            100,
        ),
    })
}

/// Builds the mock responder stack: seeded world, command responder, and
/// the fault layer when any fault setting is active.
pub fn build_mock_responder(settings: &TransportSettings) -> Arc<dyn Responder> {
    let seed = settings.u64_at_least("transport.mock.seed", 1, 0);
    let world = MockWorldHandle::new(seed);
    let responder: Arc<dyn Responder> = Arc::new(CommandResponder::new(world));
    let faults = FaultConfig {
        error_rate: settings.rate("transport.mock.errorRate"),
        latency_ms: settings.u64_at_least("transport.mock.latencyMs", 0, 0),
        jitter_ms: settings.u64_at_least("transport.mock.jitterMs", 0, 0),
        timeout_rate: settings.rate("transport.mock.timeoutRate"),
    };
    if faults.is_noop() {
        responder
    } else {
        Arc::new(FaultInjector::new(responder, faults))
    }
}

/// The modes whose construction cannot fail; `tcp` validates its config
/// separately.
fn build_simple(settings: &TransportSettings, mode: &str) -> Box<dyn Transport> {
    match mode {
        "bt" => {
            if settings.bool_or("transport.bluetooth.autoPortFallback", true) {
                Box::new(BluetoothAutoPortTransport::new(bluetooth_auto_config(
                    settings,
                )))
            } else {
                // Without the fallback an explicit port is required; the
                // adapter reports the gap when opened.
                Box::new(BluetoothSppTransport::new(spp_config(settings)))
            }
        }
        "mock" => Box::new(MockTransport::new(build_mock_responder(settings))),
        "usb" => Box::new(UsbHidTransport::new(usb_config(settings))),
        other => {
            warn!("unknown transport.mode {other:?}, falling back to usb");
            Box::new(UsbHidTransport::new(usb_config(settings)))
        }
    }
}

/// Builds the adapter the configuration asks for. Unknown modes fall back
/// to USB.
pub fn build_transport(
    settings: &TransportSettings,
) -> Result<Box<dyn Transport>, TransportError> {
    let mode = settings
        .string("transport.mode")
        .unwrap_or_else(|| "usb".to_string())
        .trim()
        .to_ascii_lowercase();
    match mode.as_str() {
        "tcp" => Ok(Box::new(TcpTransport::new(tcp_config(settings)?))),
        other => Ok(build_simple(settings, other)),
    }
}

/// An ordered multi-family composition, e.g. `["usb", "bt", "tcp"]`. Each
/// candidate builds lazily when the walk reaches it; the TCP config is
/// validated up front so a broken one fails here, not mid-walk.
pub fn build_auto_transport(
    settings: &TransportSettings,
    order: &[&str],
) -> Result<AutoTransport, TransportError> {
    let mut candidates = Vec::with_capacity(order.len());
    for name in order {
        let name = name.trim().to_ascii_lowercase();
        if name == "tcp" {
            let config = tcp_config(settings)?;
            candidates.push(TransportCandidate::new(name, move || {
                Box::new(TcpTransport::new(config.clone())) as Box<dyn Transport>
            }));
        } else {
            let settings = settings.clone();
            let mode = name.clone();
            candidates.push(TransportCandidate::new(name, move || {
                build_simple(&settings, &mode)
            }));
        }
    }
    Ok(AutoTransport::new(candidates))
}

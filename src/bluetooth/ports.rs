//! Ranking of serial COM candidates for the Bluetooth auto-port walk.
//!
//! Windows enumerates every RFCOMM channel as a COM port; the PnP id is
//! the only hint which of them is an EV3. Two plans come out: a ranked
//! `ev3-priority` plan and the raw `legacy-order` fallback.

use regex::Regex;
use std::sync::LazyLock;

use crate::error::TransportError;

static COM_PORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^COM\d+$").expect("static pattern"));
// LEGO's Bluetooth radio manufacturer id as it shows up in PnP ids.
static EV3_HINT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)[_&]005D").expect("static pattern"));

/// One enumerated serial device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialCandidate {
    pub path: String,
    pub pnp_id: Option<String>,
}

impl SerialCandidate {
    pub fn new(path: impl Into<String>, pnp_id: Option<&str>) -> Self {
        Self {
            path: path.into(),
            pnp_id: pnp_id.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlanStrategy {
    Ev3Priority,
    LegacyOrder,
}

impl PlanStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ev3Priority => "ev3-priority",
            Self::LegacyOrder => "legacy-order",
        }
    }
}

/// An ordered list of COM ports to try under one strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortPlan {
    pub strategy: PlanStrategy,
    pub ports: Vec<String>,
}

fn valid_com_port(path: &str) -> Option<String> {
    let trimmed = path.trim();
    COM_PORT
        .is_match(trimmed)
        .then(|| trimmed.to_ascii_uppercase())
}

fn com_index(port: &str) -> u32 {
    port[3..].parse().unwrap_or(u32::MAX)
}

fn push_unique(ports: &mut Vec<String>, port: String) {
    if !ports.contains(&port) {
        ports.push(port);
    }
}

/// Builds up to two candidate plans.
///
/// `ev3-priority` ranks by (preferred-serial match, EV3 PnP hint, COM
/// index, path), matches sorting first; `legacy-order` keeps the raw
/// enumeration order. A configured preferred port goes first in both.
/// Empty plans are omitted, and `legacy-order` is suppressed when it would
/// repeat `ev3-priority` exactly.
pub fn candidate_plans(
    preferred_port: Option<&str>,
    candidates: &[SerialCandidate],
    preferred_serial: Option<&str>,
) -> Vec<PortPlan> {
    let preferred = preferred_port.and_then(valid_com_port);

    let mut ranked: Vec<(bool, bool, u32, String)> = Vec::new();
    for candidate in candidates {
        let Some(port) = valid_com_port(&candidate.path) else {
            continue;
        };
        let pnp_upper = candidate
            .pnp_id
            .as_deref()
            .unwrap_or_default()
            .to_ascii_uppercase();
        let serial_mismatch = match preferred_serial {
            Some(serial) if !serial.is_empty() => {
                !pnp_upper.contains(&serial.to_ascii_uppercase())
            }
            _ => true,
        };
        let no_ev3_hint = !EV3_HINT.is_match(&pnp_upper);
        ranked.push((serial_mismatch, no_ev3_hint, com_index(&port), port));
    }
    ranked.sort();

    let mut priority_ports = Vec::new();
    if let Some(port) = &preferred {
        priority_ports.push(port.clone());
    }
    for (_, _, _, port) in ranked {
        push_unique(&mut priority_ports, port);
    }

    let mut legacy_ports = Vec::new();
    if let Some(port) = &preferred {
        legacy_ports.push(port.clone());
    }
    for candidate in candidates {
        if let Some(port) = valid_com_port(&candidate.path) {
            push_unique(&mut legacy_ports, port);
        }
    }

    let mut plans = Vec::new();
    if !priority_ports.is_empty() {
        plans.push(PortPlan {
            strategy: PlanStrategy::Ev3Priority,
            ports: priority_ports,
        });
    }
    if !legacy_ports.is_empty()
        && plans
            .first()
            .is_none_or(|priority| priority.ports != legacy_ports)
    {
        plans.push(PortPlan {
            strategy: PlanStrategy::LegacyOrder,
            ports: legacy_ports,
        });
    }
    plans
}

/// Enumerates serial devices through the OS, shaped for ranking. The PnP
/// id is assembled from whatever identity the enumeration exposes.
pub fn discover_candidates() -> Result<Vec<SerialCandidate>, TransportError> {
    let ports = serialport::available_ports()
        .map_err(|err| TransportError::Serial(format!("listing serial ports: {err}")))?;
    Ok(ports
        .into_iter()
        .map(|info| {
            let pnp_id = match &info.port_type {
                serialport::SerialPortType::UsbPort(usb) => {
                    let mut id = format!("USB\\VID_{:04X}&PID_{:04X}", usb.vid, usb.pid);
                    if let Some(serial) = &usb.serial_number {
                        id.push('_');
                        id.push_str(serial);
                    }
                    if let Some(product) = &usb.product {
                        id.push('_');
                        id.push_str(product);
                    }
                    Some(id)
                }
                serialport::SerialPortType::BluetoothPort => Some("BTHENUM".to_string()),
                serialport::SerialPortType::PciPort | serialport::SerialPortType::Unknown => None,
            };
            SerialCandidate {
                path: info.port_name,
                pnp_id,
            }
        })
        .collect())
}

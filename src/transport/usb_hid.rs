//! USB HID transport.
//!
//! hidapi is blocking, and a HID device handle wants all its traffic on
//! one thread, so the adapter runs a dedicated blocking event loop that
//! owns the device: write commands come in over a channel, raw input
//! reports stream back over another. The async side only ever touches the
//! channels.

use std::ffi::CString;
use std::sync::mpsc as std_mpsc;

use async_trait::async_trait;
use hidapi::{HidApi, HidDevice};
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};

use crate::error::TransportError;
use crate::protocol::{FramerConfig, Packet, packet};
use crate::transport::reply::{Inbound, ReplySlot};
use crate::transport::{SendOptions, Transport};

pub const DEFAULT_VENDOR_ID: u16 = 0x0694;
pub const DEFAULT_PRODUCT_ID: u16 = 0x0005;
pub const DEFAULT_REPORT_ID: u8 = 0x00;
pub const DEFAULT_REPORT_SIZE: usize = 1025;

/// How long one blocking read waits before the loop polls for commands.
const READ_POLL: i32 = 20;
const CHUNK_QUEUE: usize = 64;

#[derive(Debug, Clone)]
pub struct UsbHidConfig {
    /// Explicit HID device path; when unset the first vendor/product match
    /// is taken.
    pub path: Option<String>,
    pub vendor_id: u16,
    pub product_id: u16,
    pub report_id: u8,
    pub report_size: usize,
}

impl Default for UsbHidConfig {
    fn default() -> Self {
        Self {
            path: None,
            vendor_id: DEFAULT_VENDOR_ID,
            product_id: DEFAULT_PRODUCT_ID,
            report_id: DEFAULT_REPORT_ID,
            report_size: DEFAULT_REPORT_SIZE,
        }
    }
}

enum HidCommand {
    Write {
        report: Vec<u8>,
        done: oneshot::Sender<Result<(), String>>,
    },
    Shutdown,
}

struct HidSession {
    commands: std_mpsc::Sender<HidCommand>,
    inbound: Inbound,
}

pub struct UsbHidTransport {
    config: UsbHidConfig,
    session: Option<HidSession>,
    slot: ReplySlot,
}

impl UsbHidTransport {
    pub fn new(config: UsbHidConfig) -> Self {
        Self {
            config,
            session: None,
            slot: ReplySlot::default(),
        }
    }

    fn framer(&self) -> FramerConfig {
        FramerConfig::hid(self.config.report_id, self.config.report_size)
    }

    fn drop_session(&mut self) {
        if let Some(session) = self.session.take() {
            let _ = session.commands.send(HidCommand::Shutdown);
        }
        self.slot.finish();
    }
}

/// Opens the device and runs the blocking read/write loop until shutdown
/// or a device error. Runs on a `spawn_blocking` thread.
fn device_loop(
    config: UsbHidConfig,
    ready: oneshot::Sender<Result<String, TransportError>>,
    commands: std_mpsc::Receiver<HidCommand>,
    chunks: mpsc::Sender<Vec<u8>>,
) {
    let opened = open_device(&config);
    let device = match opened {
        Ok((device, label)) => {
            if ready.send(Ok(label)).is_err() {
                return; // open() was dropped
            }
            device
        }
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };

    let mut buf = vec![0u8; config.report_size];
    loop {
        match commands.try_recv() {
            Ok(HidCommand::Write { report, done }) => {
                let outcome = device
                    .write(&report)
                    .map(|_| ())
                    .map_err(|err| err.to_string());
                let failed = outcome.is_err();
                let _ = done.send(outcome);
                if failed {
                    break;
                }
            }
            Ok(HidCommand::Shutdown) | Err(std_mpsc::TryRecvError::Disconnected) => break,
            Err(std_mpsc::TryRecvError::Empty) => {}
        }
        match device.read_timeout(&mut buf, READ_POLL) {
            Ok(0) => {}
            Ok(n) => {
                if chunks.blocking_send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(err) => {
                debug!("HID read failed: {err}");
                break;
            }
        }
    }
    // Dropping `chunks` here is what tells the async side the session died.
}

fn open_device(config: &UsbHidConfig) -> Result<(HidDevice, String), TransportError> {
    let api = HidApi::new()?;
    match &config.path {
        Some(path) => {
            let cpath = CString::new(path.as_str())
                .map_err(|_| TransportError::Hid(format!("device path {path:?} contains NUL")))?;
            Ok((api.open_path(&cpath)?, path.clone()))
        }
        None => {
            let device = api.open(config.vendor_id, config.product_id)?;
            Ok((
                device,
                format!("{:04x}:{:04x}", config.vendor_id, config.product_id),
            ))
        }
    }
}

#[async_trait]
impl Transport for UsbHidTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        if self.session.is_some() {
            return Ok(());
        }
        let (ready_tx, ready_rx) = oneshot::channel();
        let (cmd_tx, cmd_rx) = std_mpsc::channel();
        let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_QUEUE);
        let config = self.config.clone();
        let worker =
            tokio::task::spawn_blocking(move || device_loop(config, ready_tx, cmd_rx, chunk_tx));

        let label = match ready_rx.await {
            Ok(Ok(label)) => label,
            Ok(Err(err)) => return Err(err),
            Err(_) => return Err(TransportError::Hid("HID worker died during open".into())),
        };
        // The worker outlives the session struct; shutdown is signalled
        // through the command channel.
        drop(worker);
        self.session = Some(HidSession {
            commands: cmd_tx,
            inbound: Inbound::from_parts(chunk_rx, tokio::spawn(async {})),
        });
        info!("USB HID open on {label}");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.drop_session();
        Ok(())
    }

    async fn send(
        &mut self,
        packet: &Packet,
        opts: &SendOptions,
    ) -> Result<Option<Packet>, TransportError> {
        let framer = self.framer();
        let report_size = self.config.report_size;
        let report_id = self.config.report_id;
        let Some(session) = self.session.as_mut() else {
            return Err(TransportError::NotOpen);
        };
        if !session.inbound.drain() {
            warn!("USB HID device went away");
            self.drop_session();
            return Err(TransportError::NotOpen);
        }

        let bytes = packet.encode()?;
        if bytes.len() > report_size - 1 {
            return Err(TransportError::PayloadTooLarge {
                len: bytes.len(),
                report_size,
            });
        }

        self.slot.begin(opts.expected_message_counter)?;
        let slot = &self.slot;
        let result = async {
            let mut report = vec![0u8; report_size];
            report[0] = report_id;
            report[1..1 + bytes.len()].copy_from_slice(&bytes);

            let (done_tx, done_rx) = oneshot::channel();
            session
                .commands
                .send(HidCommand::Write {
                    report,
                    done: done_tx,
                })
                .map_err(|_| TransportError::TransportClosed)?;
            match done_rx.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(TransportError::Hid(err)),
                Err(_) => return Err(TransportError::TransportClosed),
            }

            if !packet::expects_reply(packet.packet_type) {
                return Ok(None);
            }
            session.inbound.recv_matching(&framer, slot, opts).await.map(Some)
        }
        .await;
        self.slot.finish();

        if matches!(
            result,
            Err(TransportError::TransportClosed) | Err(TransportError::Hid(_))
        ) {
            self.drop_session();
        }
        result
    }

    fn is_open(&self) -> bool {
        self.session.is_some()
    }
}

impl Drop for UsbHidTransport {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            let _ = session.commands.send(HidCommand::Shutdown);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_before_open_is_rejected() {
        let mut transport = UsbHidTransport::new(UsbHidConfig::default());
        let packet = Packet::new(0, packet::DIRECT_COMMAND_REPLY, vec![]);
        let err = transport
            .send(&packet, &SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotOpen));
    }

    #[tokio::test]
    async fn oversize_packets_are_rejected_not_truncated() {
        let mut transport = UsbHidTransport::new(UsbHidConfig {
            report_size: 16,
            ..UsbHidConfig::default()
        });
        // Fabricate an open session; the payload check runs before any
        // report reaches the device.
        let (cmd_tx, _cmd_rx) = std_mpsc::channel();
        let (_chunk_tx, chunk_rx) = mpsc::channel(1);
        transport.session = Some(HidSession {
            commands: cmd_tx,
            inbound: Inbound::from_parts(chunk_rx, tokio::spawn(async {})),
        });

        // 11-byte payload -> 16 wire bytes, one more than the 15 that fit.
        let packet = Packet::new(1, packet::DIRECT_COMMAND_NO_REPLY, vec![0u8; 11]);
        let err = transport
            .send(&packet, &SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::PayloadTooLarge { .. }));
    }
}

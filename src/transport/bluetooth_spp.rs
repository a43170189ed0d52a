//! Bluetooth SPP transport: the brick's RFCOMM channel surfaces as a COM
//! serial port carrying length-prefixed frames back to back, no padding.

use async_trait::async_trait;
use log::{debug, info};
use tokio::io::{AsyncWriteExt, WriteHalf, split};
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};

use crate::error::TransportError;
use crate::protocol::{FramerConfig, Packet, packet};
use crate::transport::reply::{Inbound, ReplySlot};
use crate::transport::{SendOptions, Transport};

pub const DEFAULT_BAUD_RATE: u32 = 115_200;

#[derive(Debug, Clone)]
pub struct BluetoothSppConfig {
    /// COM port id, e.g. `COM4`.
    pub port: String,
    pub baud_rate: u32,
    /// DTR line state asserted right after open. Some RFCOMM drivers only
    /// start forwarding once DTR is raised.
    pub dtr: bool,
}

impl Default for BluetoothSppConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            dtr: true,
        }
    }
}

struct SppSession {
    writer: WriteHalf<SerialStream>,
    inbound: Inbound,
}

pub struct BluetoothSppTransport {
    config: BluetoothSppConfig,
    session: Option<SppSession>,
    slot: ReplySlot,
}

impl BluetoothSppTransport {
    pub fn new(config: BluetoothSppConfig) -> Self {
        Self {
            config,
            session: None,
            slot: ReplySlot::default(),
        }
    }

    pub fn port(&self) -> &str {
        &self.config.port
    }

    fn drop_session(&mut self) {
        self.session = None;
        self.slot.finish();
    }
}

#[async_trait]
impl Transport for BluetoothSppTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        if self.session.is_some() {
            return Ok(());
        }
        if self.config.port.is_empty() {
            return Err(TransportError::InvalidConfig(
                "no Bluetooth COM port configured".into(),
            ));
        }
        let mut stream = tokio_serial::new(&self.config.port, self.config.baud_rate)
            .open_native_async()
            .map_err(|err| {
                TransportError::Serial(format!("Opening {}: {}", self.config.port, err))
            })?;
        stream
            .write_data_terminal_ready(self.config.dtr)
            .map_err(|err| {
                TransportError::Serial(format!("Opening {}: DTR: {}", self.config.port, err))
            })?;
        let (reader, writer) = split(stream);
        self.session = Some(SppSession {
            writer,
            inbound: Inbound::spawn(reader),
        });
        info!(
            "Bluetooth SPP open on {} at {} baud (dtr {})",
            self.config.port,
            self.config.baud_rate,
            if self.config.dtr { "on" } else { "off" }
        );
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut session) = self.session.take() {
            // Shutdown failures at this point are a property of an already
            // dying link; the reader task has its own quiet exit.
            let _ = session.writer.shutdown().await;
            debug!("Bluetooth SPP closed on {}", self.config.port);
        }
        self.slot.finish();
        Ok(())
    }

    async fn send(
        &mut self,
        packet: &Packet,
        opts: &SendOptions,
    ) -> Result<Option<Packet>, TransportError> {
        let Some(session) = self.session.as_mut() else {
            return Err(TransportError::NotOpen);
        };
        if !session.inbound.drain() {
            // The OS serial layer reported close or error since the last
            // send; surface it before touching the wire.
            self.drop_session();
            return Err(TransportError::NotOpen);
        }

        self.slot.begin(opts.expected_message_counter)?;
        let slot = &self.slot;
        let result = async {
            let bytes = packet.encode()?;
            session.writer.write_all(&bytes).await?;
            session.writer.flush().await?;
            if !packet::expects_reply(packet.packet_type) {
                return Ok(None);
            }
            session
                .inbound
                .recv_matching(&FramerConfig::length_prefixed(), slot, opts)
                .await
                .map(Some)
        }
        .await;
        self.slot.finish();

        if matches!(
            result,
            Err(TransportError::TransportClosed) | Err(TransportError::Io(_))
        ) {
            self.drop_session();
        }
        result
    }

    fn is_open(&self) -> bool {
        self.session.is_some()
    }
}

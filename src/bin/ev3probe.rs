use std::process::exit;
use std::time::{Duration, Instant};

use clap::Parser;
use ev3_cockpit::protocol::Packet;
use ev3_cockpit::protocol::packet::SYSTEM_COMMAND_REPLY;
use ev3_cockpit::transport::{
    MapSettings, SendOptions, Transport, TransportSettings, build_transport,
};

/// Open a transport, fire the one-byte system probe, report the
/// round-trip. Exits non-zero when the brick is unreachable, which makes
/// it usable as a skip gate in smoke scripts.
#[derive(Debug, Parser)]
#[command(name = "ev3probe")]
#[command(about = "Probe an EV3 brick over usb, bt, tcp or mock transport")]
struct Args {
    /// Transport mode: usb, bt, tcp or mock
    #[arg(short = 'm', long = "mode", default_value = "usb")]
    mode: String,

    /// Bluetooth COM port (disables the auto-port walk)
    #[arg(short = 'c', long = "com-port")]
    com_port: Option<String>,

    /// TCP host (disables UDP discovery)
    #[arg(long = "host")]
    host: Option<String>,

    /// Probe timeout in milliseconds
    #[arg(short = 't', long = "timeout-ms", default_value_t = 3000)]
    timeout_ms: u64,
}

const PROBE_OPCODE: u8 = 0x9d;

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    let mut map = MapSettings::new().with("transport.mode", args.mode.clone());
    if let Some(port) = &args.com_port {
        map.set("transport.bluetooth.port", port.clone());
        map.set("transport.bluetooth.autoPortFallback", false);
    }
    if let Some(host) = &args.host {
        map.set("transport.tcp.host", host.clone());
        map.set("transport.tcp.useDiscovery", false);
    }
    let settings = TransportSettings::from_map(map);

    let mut transport = match build_transport(&settings) {
        Ok(transport) => transport,
        Err(err) => {
            eprintln!("configuration rejected: {err}");
            exit(2);
        }
    };

    if let Err(err) = transport.open().await {
        eprintln!("open failed: {err}");
        exit(1);
    }

    let probe = Packet::new(0, SYSTEM_COMMAND_REPLY, vec![PROBE_OPCODE]);
    let opts = SendOptions {
        timeout: Duration::from_millis(args.timeout_ms),
        ..SendOptions::expecting(0)
    };
    let started = Instant::now();
    match transport.send(&probe, &opts).await {
        Ok(Some(reply)) => {
            println!(
                "reply type {:#04x} in {} ms",
                reply.packet_type,
                started.elapsed().as_millis()
            );
            let _ = transport.close().await;
        }
        Ok(None) => {
            eprintln!("probe produced no reply");
            let _ = transport.close().await;
            exit(1);
        }
        Err(err) => {
            eprintln!("probe failed: {err}");
            let _ = transport.close().await;
            exit(1);
        }
    }
}

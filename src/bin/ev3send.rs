use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use ev3_cockpit::scheduler::{CommandClient, CommandRequest, Lane};
use ev3_cockpit::transport::{MapSettings, TransportSettings, build_transport};

/// Send one raw EV3 command and print the reply as hex.
///
/// The payload is given as hex bytes, e.g. `ev3send -m mock 01 9d` sends
/// a system LIST_OPEN_HANDLES probe.
#[derive(Debug, Parser)]
#[command(name = "ev3send")]
#[command(about = "Send a single direct/system command to an EV3 brick")]
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

    /// Reply timeout in milliseconds
    #[arg(short = 't', long = "timeout-ms", default_value_t = 5000)]
    timeout_ms: u64,

    /// Run the command on the high priority lane
    #[arg(long = "urgent")]
    urgent: bool,

    /// Command type byte followed by payload bytes, all hex
    #[arg(required = true, value_name = "HEX", num_args = 1..)]
    bytes: Vec<String>,
}

fn parse_hex_bytes(words: &[String]) -> anyhow::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    for word in words {
        let cleaned = word.trim_start_matches("0x");
        if cleaned.len() % 2 != 0 {
            bail!("odd-length hex group {word:?}");
        }
        for index in (0..cleaned.len()).step_by(2) {
            let byte = u8::from_str_radix(&cleaned[index..index + 2], 16)
                .with_context(|| format!("bad hex byte in {word:?}"))?;
            bytes.push(byte);
        }
    }
    Ok(bytes)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let bytes = parse_hex_bytes(&args.bytes)?;
    let Some((&packet_type, payload)) = bytes.split_first() else {
        bail!("need at least the command type byte");
    };

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

    let transport = build_transport(&settings).context("building transport")?;
    let client = CommandClient::new(transport);
    client.open().await.context("opening transport")?;

    let request = CommandRequest::new("ev3send", packet_type, payload.to_vec())
        .with_timeout(Duration::from_millis(args.timeout_ms))
        .with_lane(if args.urgent { Lane::High } else { Lane::Normal });
    let outcome = client.send(request).await;
    client.close().await.ok();

    let result = outcome.context("command failed")?;
    match result.reply {
        Some(reply) => {
            let hex: String = reply
                .payload
                .iter()
                .map(|byte| format!("{byte:02x}"))
                .collect::<Vec<_>>()
                .join(" ");
            println!(
                "counter={} type={:#04x} payload=[{}] ({} ms)",
                reply.message_counter,
                reply.packet_type,
                hex,
                result.duration.as_millis()
            );
        }
        None => println!("sent, no reply solicited ({} ms)", result.duration.as_millis()),
    }
    Ok(())
}

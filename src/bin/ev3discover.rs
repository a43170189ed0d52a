use anyhow::Context;
use clap::Parser;
use ev3_cockpit::transport::tcp::{DEFAULT_DISCOVERY_PORT, parse_beacon};
use tokio::net::UdpSocket;
use tokio::time::{Duration, timeout};

/// Listen for EV3 Wi-Fi beacons and print every brick that announces
/// itself.
#[derive(Debug, Parser)]
#[command(name = "ev3discover")]
#[command(about = "Discover EV3 bricks announcing themselves over UDP")]
struct Args {
    /// UDP port the bricks broadcast on
    #[arg(short = 'p', long = "port", default_value_t = DEFAULT_DISCOVERY_PORT)]
    port: u16,

    /// Stop after the first beacon instead of listening forever
    #[arg(long = "first")]
    first: bool,

    /// Give up after this many milliseconds without any beacon
    #[arg(short = 't', long = "timeout-ms")]
    timeout_ms: Option<u64>,

    /// Print beacons as JSON objects, one per line
    #[arg(long = "json")]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let socket = UdpSocket::bind(("0.0.0.0", args.port))
        .await
        .with_context(|| format!("binding UDP port {}", args.port))?;
    eprintln!("Listening for EV3 beacons on UDP {} ...", args.port);

    let mut buf = [0u8; 1024];
    loop {
        let received = match args.timeout_ms {
            Some(ms) => match timeout(Duration::from_millis(ms), socket.recv_from(&mut buf)).await
            {
                Ok(received) => received?,
                Err(_) => anyhow::bail!("no beacon within {ms} ms"),
            },
            None => socket.recv_from(&mut buf).await?,
        };
        let (len, source) = received;
        let Some(mut beacon) = parse_beacon(&buf[..len]) else {
            continue;
        };
        beacon.ip = Some(source.ip());
        if args.json {
            println!("{}", serde_json::to_string(&beacon)?);
        } else {
            println!(
                "{}\t{}:{}\tname={}\tprotocol={}",
                beacon.serial,
                source.ip(),
                beacon.port,
                if beacon.name.is_empty() { "-" } else { &beacon.name },
                beacon.protocol
            );
        }
        if args.first {
            return Ok(());
        }
    }
}

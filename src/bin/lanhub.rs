//! Hub server binary
//!
//! Run with: cargo run --bin lanhub [OPTIONS]
//!
//! Options:
//!   --bind ADDR          interface to bind (default 0.0.0.0)
//!   --control-port PORT  reliable control/chat/file port (default 8888)
//!   --video-port PORT    video datagram port (default 8889)
//!   --audio-port PORT    audio datagram port (default 8890)
//!   --spool DIR          shared-file directory (default uploads/)
//!   --name NAME          host display name (default Host)
//!
//! The hub runs until Ctrl+C, then broadcasts `server_shutdown` and exits.

use lanhub::{ControlBody, HubConfig, HubServer};

use tracing::info;
use tracing_subscriber::EnvFilter;

fn print_usage() {
    eprintln!("Usage: lanhub [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --bind ADDR          interface to bind (default 0.0.0.0)");
    eprintln!("  --control-port PORT  control/chat/file port (default 8888)");
    eprintln!("  --video-port PORT    video datagram port (default 8889)");
    eprintln!("  --audio-port PORT    audio datagram port (default 8890)");
    eprintln!("  --spool DIR          shared-file directory (default uploads/)");
    eprintln!("  --name NAME          host display name (default Host)");
}

fn parse_args(args: &[String]) -> Result<HubConfig, String> {
    let mut config = HubConfig::default();

    let mut iter = args.iter();
    while let Some(flag) = iter.next() {
        let mut value = |flag: &str| {
            iter.next()
                .cloned()
                .ok_or_else(|| format!("{} requires a value", flag))
        };
        match flag.as_str() {
            "--bind" => {
                let raw = value("--bind")?;
                let addr = raw
                    .parse()
                    .map_err(|_| format!("invalid bind address: '{}'", raw))?;
                config = config.bind(addr);
            }
            "--control-port" => {
                config.control_port = parse_port("--control-port", &value("--control-port")?)?;
            }
            "--video-port" => {
                config.video_port = parse_port("--video-port", &value("--video-port")?)?;
            }
            "--audio-port" => {
                config.audio_port = parse_port("--audio-port", &value("--audio-port")?)?;
            }
            "--spool" => {
                config = config.spool_dir(value("--spool")?);
            }
            "--name" => {
                config = config.host_name(value("--name")?);
            }
            other => return Err(format!("unknown option: '{}'", other)),
        }
    }

    Ok(config)
}

fn parse_port(flag: &str, raw: &str) -> Result<u16, String> {
    raw.parse()
        .map_err(|_| format!("{}: invalid port '{}'", flag, raw))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,lanhub=debug")),
        )
        .init();

    let config = match parse_args(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    };

    info!("Starting lanhub v{}", env!("CARGO_PKG_VERSION"));

    let server = HubServer::bind(config).await?;
    println!("Control channel : {}", server.control_addr()?);
    println!("Video datagrams : {}", server.video_addr()?);
    println!("Audio datagrams : {}", server.audio_addr()?);
    println!("Press Ctrl+C to stop");

    // Mirror what reaches the local host participant into the log; a real
    // host console would render these instead.
    let mut host_events = server.host_events();
    tokio::spawn(async move {
        while let Some(env) = host_events.recv().await {
            match env.body {
                ControlBody::Chat {
                    text,
                    sender_name: Some(name),
                    ..
                } => info!(from = %name, "chat: {}", text),
                ControlBody::UserJoined { id, name } => info!(id, name = %name, "joined"),
                ControlBody::UserLeft { id, name, reason } => {
                    info!(id, name = %name, ?reason, "left")
                }
                ControlBody::FileAvailable { fid, filename, .. } => {
                    info!(fid = %fid, file = %filename, "file shared")
                }
                _ => {}
            }
        }
    });

    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!("Hub stopped");
    Ok(())
}

use std::error::Error;

use clap::{Parser, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use tweaksync::{
    Bounds, Config, ParameterSet, SyncEvent, TweakDescriptor, TweakKey, TweakSync, TweakValue,
};

#[derive(Parser)]
#[command(name = "tweaksync", about = "Remote control for live tweak parameters")]
struct Args {
    /// host = expose tweaks, controller = discover a host and edit them
    #[arg(long, value_enum, default_value_t = RoleArg::Controller)]
    role: RoleArg,
    /// Friendly name other devices see (defaults to the system hostname)
    #[arg(long)]
    name: Option<String>,
    /// UDP port for the QUIC endpoint (0 = ephemeral)
    #[arg(long, default_value_t = 0)]
    port: u16,
}

#[derive(ValueEnum, Clone, Copy)]
enum RoleArg {
    Host,
    Controller,
}

/// Tweaks a host exposes when run from the CLI; a real app registers its own.
fn demo_tweaks() -> ParameterSet {
    ParameterSet::from_descriptors([
        TweakDescriptor::new(
            TweakKey::new("UI", "Colors", "bgAlpha"),
            TweakValue::Double(1.0),
            Some(Bounds {
                default: 1.0,
                min: 0.0,
                max: 1.0,
                step: 0.05,
            }),
        ),
        TweakDescriptor::new(
            TweakKey::new("UI", "Colors", "darkMode"),
            TweakValue::Bool(false),
            None,
        ),
        TweakDescriptor::new(
            TweakKey::new("Physics", "Spring", "iterations"),
            TweakValue::Int(4),
            Some(Bounds {
                default: 4.0,
                min: 0.0,
                max: 10.0,
                step: 1.0,
            }),
        ),
    ])
    .expect("demo tweak keys are unique")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = Config {
        display_name: args.name,
        port: args.port,
    };

    let service = match args.role {
        RoleArg::Host => TweakSync::start_host(config, demo_tweaks())?,
        RoleArg::Controller => TweakSync::start_controller(config)?,
    };
    println!("local peer: {}", service.local_peer().id);

    let mut events = service.subscribe();
    let event_service = service.clone();
    let is_controller = matches!(args.role, RoleArg::Controller);
    tokio::spawn(async move {
        let mut connected = false;
        while let Ok(event) = events.recv().await {
            match event {
                SyncEvent::PeersChanged(peers) => {
                    println!("visible hosts: {:?}", peers.iter().map(|p| p.title()).collect::<Vec<_>>());
                    // like the original browser, just invite the first host we see
                    if is_controller && !connected {
                        if let Some(record) = peers.first() {
                            connected = true;
                            let id = record.peer.id.clone();
                            if let Err(e) = event_service.connect(id).await {
                                eprintln!("connect failed: {e}");
                                connected = false;
                            }
                        }
                    }
                }
                SyncEvent::SeedReceived(set) => {
                    println!("seeded with {} tweaks:", set.len());
                    for tweak in set.iter() {
                        println!("  {} = {:?}", tweak.key, tweak.value);
                    }
                }
                SyncEvent::ValuesUpdated(keys) => println!("peer updated: {keys:?}"),
                SyncEvent::ValueChanged(key) => println!("edited: {key}"),
                SyncEvent::ConnectedPeerLost(id) => println!("connected peer {id} disappeared"),
                SyncEvent::ConnectionFailed(reason) => {
                    println!("connection failed: {reason}");
                    connected = false;
                }
                SyncEvent::Closed => {
                    println!("session closed");
                    connected = false;
                }
                SyncEvent::ProtocolError(e) => println!("protocol error (session kept): {e}"),
            }
        }
    });

    // tiny REPL: `set <collection>/<group>/<name> <value>`, `quit`
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line == "quit" {
            break;
        }
        let Some(rest) = line.strip_prefix("set ") else {
            if !line.is_empty() {
                println!("commands: set <collection>/<group>/<name> <value> | quit");
            }
            continue;
        };
        let Some((path, raw)) = rest.rsplit_once(' ') else {
            println!("usage: set <collection>/<group>/<name> <value>");
            continue;
        };
        let parts: Vec<&str> = path.split('/').collect();
        let (collection, group, name) = match parts.as_slice() {
            [c, g, n] => (*c, *g, *n),
            _ => {
                println!("usage: set <collection>/<group>/<name> <value>");
                continue;
            }
        };
        let key = TweakKey::new(collection, group, name);
        let value = parse_value(raw);
        if let Err(e) = service.set_value(key, value).await {
            println!("rejected: {e}");
        }
    }

    service.dismiss().await?;
    Ok(())
}

fn parse_value(raw: &str) -> TweakValue {
    if raw == "true" || raw == "false" {
        TweakValue::Bool(raw == "true")
    } else if let Ok(v) = raw.parse::<i64>() {
        TweakValue::Int(v)
    } else if let Ok(v) = raw.parse::<f64>() {
        TweakValue::Double(v)
    } else {
        TweakValue::String(raw.to_owned())
    }
}

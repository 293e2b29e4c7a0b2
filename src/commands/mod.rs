pub mod demo;

use crate::config::AppConfig;
use crate::report::ReportLog;
use crate::rtc::ice::preflight;
use crate::utils::random_room_id;
use demo::{render_text, run_demo, DemoOptions, Transport};
use std::error::Error;
use std::time::Duration;

pub const USAGE: &str = "Usage: salang <command> [args]

Commands:
  demo [room-id] [seconds] [--json] [--preflight] [--rtc | --vnet]
                                                    run two sessions against each other
                                                    (in-process hub, or webrtc over the
                                                    host or a virtual network)
  room-id                                           print a fresh test room id
  preflight [--json]                                check the configured ICE servers";

const DEFAULT_DEMO_SECONDS: u64 = 10;
const DEMO_LATENCY: Duration = Duration::from_millis(35);

pub async fn dispatch(args: &[String]) -> Result<(), Box<dyn Error>> {
    let Some(command) = args.get(1) else {
        eprintln!("{USAGE}");
        return Err("missing command".into());
    };
    let json = args.iter().any(|a| a == "--json");

    match command.as_str() {
        "room-id" => {
            println!("{}", random_room_id());
            Ok(())
        }
        "preflight" => {
            let config = AppConfig::load()?;
            let log = cmd_preflight(&config).await;
            print_log(&log, json)
        }
        "demo" => cmd_demo(args, json).await,
        other => {
            eprintln!("Unknown command: {other}\n{USAGE}");
            Err(format!("unknown command {other}").into())
        }
    }
}

async fn cmd_preflight(config: &AppConfig) -> ReportLog {
    let mut log = ReportLog::new();
    let servers = config.normalized_ice_servers();
    let reachable = preflight(&servers, &mut log).await;
    log::info!("{reachable}/{} ICE servers reachable", servers.len());
    log
}

fn print_log(log: &ReportLog, json: bool) -> Result<(), Box<dyn Error>> {
    if json {
        println!("{}", log.to_json()?);
    } else {
        print!("{log}");
    }
    Ok(())
}

async fn cmd_demo(args: &[String], json: bool) -> Result<(), Box<dyn Error>> {
    // demo [room-id] [seconds], flags anywhere
    let positional: Vec<&String> = args[2..].iter().filter(|a| !a.starts_with("--")).collect();
    let room_id = positional
        .first()
        .map(|s| s.to_string())
        .unwrap_or_else(random_room_id);
    let seconds = match positional.get(1) {
        Some(raw) => raw
            .parse::<u64>()
            .map_err(|e| format!("invalid duration '{raw}': {e}"))?,
        None => DEFAULT_DEMO_SECONDS,
    };

    let transport = if args.iter().any(|a| a == "--vnet") {
        Transport::VirtualRtc
    } else if args.iter().any(|a| a == "--rtc") {
        Transport::Rtc
    } else {
        Transport::Memory
    };

    let config = AppConfig::load()?;
    if args.iter().any(|a| a == "--preflight") {
        let log = cmd_preflight(&config).await;
        print_log(&log, json)?;
    }

    let sides = run_demo(
        config,
        DemoOptions {
            room_id,
            duration: Duration::from_secs(seconds),
            latency: DEMO_LATENCY,
            transport,
        },
    )
    .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&sides)?);
    } else {
        print!("{}", render_text(&sides));
    }
    Ok(())
}

use color_eyre::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

use irrigation_sync::config::SyncConfig;
use irrigation_sync::transport::SimulatedFactory;
use irrigation_sync::util::database::{Database, EndpointStore};
use irrigation_sync::util::log;
use irrigation_sync::{log_info, log_warn};
use irrigation_sync::{DeviceCommand, DeviceMode, DeviceSyncClient, SyncEvent};

const HELP: &str = "commands: status | refresh | start | stop | pump | auto | manual | mode | endpoint <addr> | poll <ms> | nopoll | help | quit";

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let config = SyncConfig::load()?;
    log::init(&config)?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let simulate = args.iter().any(|a| a == "--simulate");
    let store: Arc<dyn EndpointStore> = Arc::new(Database::open(&config.database_path)?);

    let client = if simulate {
        log_info!("Running against a simulated controller");
        DeviceSyncClient::new(config.clone(), Arc::new(SimulatedFactory::new()), store)
    } else {
        DeviceSyncClient::with_default_transports(config.clone(), store)
    };

    let mut events = client.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(&event);
        }
    });

    if let Some(endpoint) = args.iter().find(|a| !a.starts_with("--")) {
        client.configure(endpoint).await?;
    } else if let Err(e) = client.restore().await {
        log_warn!("Saved endpoint could not be restored: {}", e);
    }

    client.start_polling(config.poll_interval())?;
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        if !handle_line(&client, line.trim()).await {
            break;
        }
    }

    client.shutdown().await;
    Ok(())
}

/// Returns `false` when the user asked to quit.
async fn handle_line(client: &DeviceSyncClient, line: &str) -> bool {
    let mut parts = line.split_whitespace();
    let Some(word) = parts.next() else {
        return true;
    };

    let result = match word {
        "quit" | "exit" => return false,
        "help" => {
            println!("{}", HELP);
            Ok(())
        }
        "status" => {
            print_snapshot(client);
            Ok(())
        }
        "refresh" => client.refresh().await.map(|_| ()),
        "start" => client.dispatch_command(DeviceCommand::StartPump).await.map(|_| ()),
        "stop" => client.dispatch_command(DeviceCommand::StopPump).await.map(|_| ()),
        "pump" => client.toggle_pump().await.map(|_| ()),
        "auto" => client
            .dispatch_command(DeviceCommand::SetMode(DeviceMode::Auto))
            .await
            .map(|_| ()),
        "manual" => client
            .dispatch_command(DeviceCommand::SetMode(DeviceMode::Manual))
            .await
            .map(|_| ()),
        "mode" => client.toggle_mode().await.map(|_| ()),
        "endpoint" => match parts.next() {
            Some(endpoint) => client.configure(endpoint).await,
            None => {
                println!("usage: endpoint <ipv4 | mqtt://host[:port]>");
                Ok(())
            }
        },
        "poll" => match parts.next().and_then(|ms| ms.parse::<u64>().ok()) {
            Some(ms) => client.start_polling(Duration::from_millis(ms)),
            None => {
                println!("usage: poll <milliseconds>");
                Ok(())
            }
        },
        "nopoll" => {
            client.stop_polling();
            Ok(())
        }
        other => {
            println!("unknown command '{}'; {}", other, HELP);
            Ok(())
        }
    };

    if let Err(e) = result {
        println!("error: {}", e);
    }
    true
}

fn print_snapshot(client: &DeviceSyncClient) {
    let snapshot = client.snapshot();
    println!(
        "endpoint: {}",
        snapshot.endpoint.as_deref().unwrap_or("<none>")
    );
    println!(
        "connection: {}{}",
        snapshot.connection,
        if snapshot.connection_lost { " (lost)" } else { "" }
    );
    match (snapshot.status, snapshot.moisture_band) {
        (Some(status), Some(band)) => {
            println!("moisture: {} ({})", status.moisture_level, band);
            println!("pump: {}", if status.pump_running { "Running" } else { "Stopped" });
            println!("mode: {}", if status.auto_mode_enabled { "Automatic" } else { "Manual" });
        }
        _ => println!("no status yet"),
    }
    println!("history: {:?}", snapshot.history);
    if let Some(elapsed) = client.time_since_last_sync() {
        println!("last sync: {}s ago", elapsed.as_secs());
    }
}

fn print_event(event: &SyncEvent) {
    match event {
        SyncEvent::StatusUpdated { status, band, .. } => println!(
            "[status] moisture={} ({}) pump={} auto={}",
            status.moisture_level, band, status.pump_running, status.auto_mode_enabled
        ),
        SyncEvent::ConnectionChanged { from, to, attempts } => {
            println!("[connection] {} -> {} (attempts {})", from, to, attempts)
        }
        SyncEvent::ConnectionLost { message } => println!("[connection] {}", message),
        SyncEvent::RetryScheduled { attempt, delay } => {
            println!("[connection] retry {} in {}s", attempt, delay.as_secs())
        }
        SyncEvent::EndpointChanged(endpoint) => println!("[endpoint] {}", endpoint),
        SyncEvent::ModePending(mode) => println!("[mode] switching to {}...", mode.as_wire()),
        SyncEvent::CommandSent(command) => println!("[command] {} sent", command),
        SyncEvent::CommandFailed { command, error } => println!("[command] {} failed: {}", command, error),
    }
}

use crate::client::TelemetryClient;
use crate::config::Config;
use crate::model::{Command, Snapshot};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    if let Some(command) = args.next() {
        if command == "config-init" {
            return handle_config_init();
        }
        let config = Config::load()?;
        if command == "send" {
            let name = args.next().ok_or("missing command (usage: send <COMMAND>)")?;
            return handle_send(&config, &name).await;
        }
        if command == "watch" {
            return handle_watch(&config).await;
        }
        return Err(format!("unknown subcommand: {command}").into());
    }

    let config = Config::load()?;
    let client = Arc::new(TelemetryClient::new(&config.remote));
    tracing::info!(url = %config.remote.url, "starting telemetry link");
    client.start();

    let result = if config.bridge.enabled {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let addr = SocketAddr::from(([127, 0, 0, 1], config.bridge.port));
        tokio::select! {
            res = crate::server::start(addr, client.clone(), shutdown_rx) => res,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown: ctrl-c");
                let _ = shutdown_tx.send(true);
                Ok(())
            }
        }
    } else {
        tokio::signal::ctrl_c().await?;
        tracing::info!("shutdown: ctrl-c");
        Ok(())
    };

    client.stop().await;
    result
}

fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

async fn handle_send(config: &Config, name: &str) -> Result<(), Box<dyn std::error::Error>> {
    let command: Command = name.parse()?;

    let client = TelemetryClient::new(&config.remote);
    client.start();
    let connected = client.wait_connected(config.remote.send_timeout()).await;
    let sent: Result<(), Box<dyn std::error::Error>> = if connected {
        client.send_command(command).map_err(Into::into)
    } else {
        Err(format!(
            "remote controller at {} not reachable within {} ms",
            config.remote.url, config.remote.send_timeout_ms
        )
        .into())
    };
    client.stop().await;

    sent?;
    println!("sent {command}");
    Ok(())
}

async fn handle_watch(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let client = TelemetryClient::new(&config.remote);
    let _subscription = client.subscribe(|snapshot| println!("{}", summarize(snapshot)));
    let mut link = client.watch_link();
    client.start();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            changed = link.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *link.borrow_and_update();
                println!("link: {state:?}");
            }
            _ = &mut ctrl_c => break,
        }
    }

    client.stop().await;
    println!("{}", serde_json::to_string_pretty(&client.diagnostics())?);
    Ok(())
}

fn summarize(s: &Snapshot) -> String {
    let frame = match s.frame_jpeg() {
        Some(Ok(jpeg)) => format!("{} byte frame", jpeg.len()),
        Some(Err(_)) => "bad frame".to_string(),
        None => "no frame".to_string(),
    };
    format!(
        "A={} B={} green={} ({} queued, {:.0}s left) | cpu {:.0}% gpu {:.0}% fps {:.1} | {} vehicles | {}",
        s.road_a,
        s.road_b,
        s.current_signal,
        s.lane_count(s.current_signal),
        s.time_left,
        s.cpu_usage,
        s.gpu_usage,
        s.fps,
        s.vehicle_types.total(),
        frame
    )
}

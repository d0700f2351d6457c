use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use client_core::{DeviceDirectory, LeaseManager, RemoteStore};
use shared::domain::DeviceId;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "http://127.0.0.1:8443")]
    server_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List devices, seeding the defaults into an empty directory.
    List,
    /// Write the default devices that are missing.
    Seed,
    /// Print one device record.
    Show { device_id: String },
    /// Clear a device's controller regardless of who holds it.
    ForceRelease { device_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("warn").init();
    let cli = Cli::parse();
    let store = Arc::new(RemoteStore::new(&cli.server_url)?);
    let directory = DeviceDirectory::new(store.clone());

    match cli.command {
        Command::List => {
            for device in directory.list_devices().await? {
                println!("{device}");
            }
        }
        Command::Seed => {
            let written = directory.seed_defaults().await?;
            println!("seeded {written} device(s)");
        }
        Command::Show { device_id } => {
            let device_id = parse_device(&device_id)?;
            let Some(record) = directory.device_record(&device_id).await? else {
                bail!("no device named {device_id}");
            };
            println!("{}", serde_json::to_string_pretty(&record)?);
            if let Some(stamp) = record.last_activity {
                println!("last activity: {}", format_millis(stamp));
            }
        }
        Command::ForceRelease { device_id } => {
            let device_id = parse_device(&device_id)?;
            let leases = LeaseManager::new(store);
            match leases.current_holder(&device_id).await? {
                Some(holder) => {
                    leases.force_release(&device_id).await?;
                    println!("released {device_id} from {holder}");
                }
                None => println!("{device_id} has no controller"),
            }
        }
    }

    Ok(())
}

fn parse_device(raw: &str) -> Result<DeviceId> {
    DeviceId::parse(raw).with_context(|| format!("invalid device id {raw:?}"))
}

fn format_millis(stamp: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(stamp)
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| stamp.to_string())
}

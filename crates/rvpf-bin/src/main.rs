// RVPF | Source Available BUSL-1.1 | Copyright (c) 2025 Estimatedstocks AB
use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use rvpf_cip::ServerProxy;
use rvpf_core::config::{load_config, FieldConfig};
use rvpf_core::{DateTime, Point, PointExchange, PointValue, Value};
use rvpf_dnp3::Dnp3Master;

#[derive(Parser, Debug)]
#[command(name = "rvpf-field", version, about = "Field protocol agent for point-value exchange")]
struct Cli {
    /// Optional path to configuration file (TOML). Also read from `RVPF_CONFIG`.
    #[arg(long, env = "RVPF_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, env = "RVPF_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Default daemon mode: poll every configured device on an interval.
    Daemon,
    /// One-shot read of named points (all configured points when empty).
    Read {
        points: Vec<String>,
    },
    /// One-shot write of one point.
    Write {
        point: String,
        value: String,
    },
    /// Dump the effective configuration as JSON.
    Config,
}

fn init_tracing(config: &FieldConfig, cli_level: Option<&str>) {
    let level = cli_level
        .map(str::to_string)
        .unwrap_or_else(|| config.log_level.as_tracing().to_string().to_lowercase());
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("rvpf={level},rvpf_field={level}")));
    fmt().with_env_filter(filter).init();
}

fn build_clients(config: &FieldConfig) -> Result<HashMap<String, Box<dyn PointExchange>>> {
    let mut clients: HashMap<String, Box<dyn PointExchange>> = HashMap::new();
    for device in &config.devices {
        let client: Box<dyn PointExchange> = match device.protocol.as_str() {
            "dnp3" => Box::new(
                Dnp3Master::from_device(device)
                    .with_context(|| format!("device {}", device.id))?,
            ),
            "cip" => Box::new(
                ServerProxy::from_device(device)
                    .with_context(|| format!("device {}", device.id))?,
            ),
            other => bail!("device {}: unsupported protocol {other}", device.id),
        };
        clients.insert(device.id.clone(), client);
    }
    Ok(clients)
}

fn points_for(config: &FieldConfig, device_id: &str) -> Vec<Point> {
    config
        .points
        .iter()
        .filter(|point| point.origin == device_id)
        .map(|point| point.to_point())
        .collect()
}

async fn poll_once(
    config: &FieldConfig,
    clients: &mut HashMap<String, Box<dyn PointExchange>>,
) {
    for (device_id, client) in clients.iter_mut() {
        let points = points_for(config, device_id);
        if points.is_empty() {
            continue;
        }
        let values = client.fetch_point_values(&points).await;
        for (point, value) in points.iter().zip(values) {
            match value {
                Some(value) => info!(
                    "{} {} = {:?} at {}",
                    device_id,
                    point.name,
                    value.value,
                    value.stamp
                ),
                None => warn!("{} {}: no value", device_id, point.name),
            }
        }
    }
}

async fn run_daemon(config: FieldConfig) -> Result<()> {
    let mut clients = build_clients(&config)?;
    if clients.is_empty() {
        bail!("no devices configured");
    }
    info!(
        "polling {} device(s) every {:?}",
        clients.len(),
        config.poll_interval
    );

    let mut ticker = tokio::time::interval(config.poll_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => poll_once(&config, &mut clients).await,
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                for client in clients.values_mut() {
                    let _ = client.disconnect().await;
                }
                return Ok(());
            }
        }
    }
}

async fn run_read(config: FieldConfig, names: Vec<String>) -> Result<()> {
    let mut clients = build_clients(&config)?;
    for (device_id, client) in clients.iter_mut() {
        let points: Vec<Point> = points_for(&config, device_id)
            .into_iter()
            .filter(|point| names.is_empty() || names.contains(&point.name))
            .collect();
        if points.is_empty() {
            continue;
        }
        for point in &points {
            client.request_read(point.clone());
        }
        for result in client.commit_reads().await {
            match result.outcome {
                Ok(value) => println!("{} = {:?} at {}", result.point.name, value.value, value.stamp),
                Err(e) => println!("{}: {e}", result.point.name),
            }
        }
        let _ = client.disconnect().await;
    }
    Ok(())
}

fn parse_value(raw: &str) -> Value {
    if let Ok(b) = raw.parse::<bool>() {
        return Value::Bool(b);
    }
    if let Ok(n) = raw.parse::<i64>() {
        return Value::Long(n);
    }
    if let Ok(d) = raw.parse::<f64>() {
        return Value::Double(d);
    }
    Value::Text(raw.to_string())
}

async fn run_write(config: FieldConfig, name: String, raw: String) -> Result<()> {
    let point_config = config
        .points
        .iter()
        .find(|point| point.name == name)
        .with_context(|| format!("unknown point {name}"))?;
    let point = point_config.to_point();
    let mut clients = build_clients(&config)?;
    let client = clients
        .get_mut(&point.origin)
        .with_context(|| format!("no device {} for point {name}", point.origin))?;

    let value = PointValue::new(&point, DateTime::now(), parse_value(&raw));
    let errors = client.update_point_values(&[(value, point)]).await;
    match &errors[0] {
        None => println!("{name} written"),
        Some(e) => bail!("{name}: {e}"),
    }
    let _ = client.disconnect().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.clone()).context("failed to load configuration")?;
    init_tracing(&config, cli.log_level.as_deref());

    match cli.command.unwrap_or(Command::Daemon) {
        Command::Daemon => run_daemon(config).await,
        Command::Read { points } => run_read(config, points).await,
        Command::Write { point, value } => run_write(config, point, value).await,
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_parsing_prefers_narrowest_type() {
        assert_eq!(parse_value("true"), Value::Bool(true));
        assert_eq!(parse_value("42"), Value::Long(42));
        assert_eq!(parse_value("2.5"), Value::Double(2.5));
        assert_eq!(parse_value("open"), Value::Text("open".to_string()));
    }

    #[test]
    fn unknown_protocol_is_rejected() {
        let mut config = FieldConfig::default();
        config.devices.push(rvpf_core::DeviceConfig {
            protocol: "modbus".to_string(),
            id: "m-1".to_string(),
            target: "127.0.0.1:502".to_string(),
            params: HashMap::new(),
        });
        assert!(build_clients(&config).is_err());
    }
}

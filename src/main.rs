use anyhow::Context;
use clap::{Parser, Subcommand};
use kamstrup_rs::logging::init_logger_with_default;
use kamstrup_rs::{
    heat_energy_to_gas, log_info, read_registers, Measurement, MeterConfig, MeterCoordinator,
    MeterModel, RegisterKey, ResultsCache, SerialTransport, Transport,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "kamstrup-cli")]
#[command(about = "CLI tool for Kamstrup meters (KMP over an optical eye)")]
struct Cli {
    /// More logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Link settings shared by the commands that talk to a meter.
#[derive(clap::Args)]
struct LinkArgs {
    /// JSON configuration file; the flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(short, long)]
    port: Option<String>,
    #[arg(short, long)]
    baudrate: Option<u32>,
    #[arg(short, long)]
    model: Option<MeterModel>,
}

impl LinkArgs {
    fn load(&self) -> anyhow::Result<MeterConfig> {
        let mut config = match &self.config {
            Some(path) => MeterConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => MeterConfig::default(),
        };
        if let Some(port) = &self.port {
            config.port = port.clone();
        }
        if let Some(baudrate) = self.baudrate {
            config.baudrate = baudrate;
        }
        if let Some(model) = self.model {
            config.model = model;
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Read registers once and print them as JSON
    Read {
        #[command(flatten)]
        link: LinkArgs,
        /// Register ids (decimal or 0x hex); the model's defaults if omitted
        keys: Vec<RegisterKey>,
    },
    /// Poll the model's default registers until interrupted
    Poll {
        #[command(flatten)]
        link: LinkArgs,
        /// Poll interval in seconds
        #[arg(short, long)]
        interval: Option<u64>,
    },
    /// List the register catalogue of a model
    Registers {
        #[arg(short, long, default_value = "403")]
        model: MeterModel,
    },
}

fn measurement_json(model: MeterModel, measurement: &Measurement) -> Value {
    let name = model.register(measurement.key).map(|info| info.name);
    let mut value = json!({
        "register": measurement.key,
        "name": name,
        "value": measurement.value,
        "unit": measurement.unit,
    });
    if model.is_date_register(measurement.key) {
        if let Ok(date) = measurement.as_date() {
            value["date"] = json!(date.date_naive().to_string());
        }
    }
    value
}

fn cache_json(model: MeterModel, cache: &ResultsCache) -> Value {
    let mut values: Vec<Value> = cache.iter().map(|m| measurement_json(model, m)).collect();
    if model == MeterModel::Kamstrup403 {
        if let Some(gas) = heat_energy_to_gas(cache) {
            let mut gas = measurement_json(model, &gas);
            gas["name"] = json!("Gas");
            values.push(gas);
        }
    }
    Value::Array(values)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logger_with_default(match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    });

    match cli.command {
        Commands::Read { link, keys } => {
            let config = link.load()?;
            let keys = if keys.is_empty() {
                config.model.default_keys()
            } else {
                keys
            };

            let mut transport = SerialTransport::new(config.serial_config());
            let result = read_registers(&mut transport, &keys, config.timeout()).await;
            transport.close().await;

            let cache: ResultsCache = result.context("reading registers")?.into_iter().collect();
            println!("{}", serde_json::to_string_pretty(&cache_json(config.model, &cache))?);
        }
        Commands::Poll { link, interval } => {
            let mut config = link.load()?;
            if let Some(interval) = interval {
                config.scan_interval_secs = interval;
                config.max_backoff_secs = config.max_backoff_secs.max(interval);
            }
            config.validate()?;

            let model = config.model;
            let coordinator = Arc::new(MeterCoordinator::new(
                config.coordinator_config(),
                model,
                SerialTransport::new(config.serial_config()),
            ));
            for key in model.default_keys() {
                coordinator.attach(key);
            }
            coordinator.on_update(move |cache| match serde_json::to_string(&cache_json(model, cache)) {
                Ok(line) => println!("{line}"),
                Err(e) => log::error!("Failed to serialize results: {e}"),
            });

            log_info(&format!("Polling {} (Kamstrup {model})", config.port));
            let task = coordinator.spawn();
            tokio::signal::ctrl_c()
                .await
                .context("waiting for Ctrl-C")?;
            coordinator.stop();
            task.await.context("poll task panicked")?;
        }
        Commands::Registers { model } => {
            let registers: Vec<Value> = model
                .registers()
                .iter()
                .map(serde_json::to_value)
                .collect::<Result<_, _>>()?;
            println!("{}", serde_json::to_string_pretty(&registers)?);
        }
    }

    Ok(())
}

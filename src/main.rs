//! Taskhub CLI - run a hub, publish tasks and watch their lifecycles.

use clap::Parser;
use colored::*;
use eyre::{Context, Result, eyre};
use log::info;
use serde_json::Value;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use taskhub::{Client, ClientConfig, ClientTask, EventKind, Hub, HubConfig};

mod cli;

use cli::{Cli, Command, ConnectArgs, Format};

fn setup_logging() -> Result<()> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("taskhub")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("taskhub.log");

    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

fn format_event(kind: EventKind) -> ColoredString {
    match kind {
        EventKind::Init => "init".cyan(),
        EventKind::Start => "start".blue(),
        EventKind::Update => "update".yellow(),
        EventKind::Drop => "drop".magenta(),
        EventKind::Success => "success".green(),
        EventKind::Fail => "fail".red(),
        EventKind::End => "end".dimmed(),
    }
}

fn parse_payload(raw: &str, format: Format) -> Result<Value> {
    match format {
        Format::Json => serde_json::from_str(raw).context("Payload is not valid JSON"),
        Format::Yaml => serde_yaml::from_str(raw).context("Payload is not valid YAML"),
        Format::Plain => Ok(Value::String(raw.to_string())),
    }
}

fn render(value: &Value, format: Format) -> Result<String> {
    match (format, value) {
        (Format::Plain, Value::String(s)) => Ok(s.clone()),
        (Format::Yaml, _) => Ok(serde_yaml::to_string(value)?.trim_end().to_string()),
        _ => Ok(serde_json::to_string_pretty(value)?),
    }
}

fn client_config(connect: &ConnectArgs) -> ClientConfig {
    ClientConfig::new(&connect.url, &connect.identity, &connect.key)
        .with_timeout(Duration::from_millis(connect.timeout))
}

fn parse_credential(raw: &str) -> Result<(&str, &str)> {
    raw.split_once(':')
        .filter(|(identity, _)| !identity.is_empty())
        .ok_or_else(|| eyre!("Credential must be IDENTITY:KEY, got '{}'", raw))
}

fn print_event(task: &ClientTask) {
    let detail = match task.event() {
        EventKind::Init => task.payload(),
        EventKind::Update => task.update_value().cloned().unwrap_or(Value::Null),
        _ => Value::Null,
    };
    let detail = if detail.is_null() { String::new() } else { detail.to_string() };
    println!(
        "{} {} {} {}",
        format_event(task.event()),
        task.id().cyan(),
        task.action(),
        detail.dimmed()
    );
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Hub {
            port,
            bind,
            credentials,
        } => {
            let ip = bind.parse().with_context(|| format!("Invalid bind address: {}", bind))?;
            let mut hub = Hub::new(HubConfig::new(SocketAddr::new(ip, port)));
            for raw in &credentials {
                let (identity, key) = parse_credential(raw)?;
                hub.add_credential(identity, key);
            }
            if credentials.is_empty() {
                println!("{} No credentials given, every connection will be refused", "!".yellow());
            }

            let addr = hub.start().await.context("Failed to start hub")?;
            println!("{} Hub listening on ws://{}", "→".blue(), addr);

            tokio::signal::ctrl_c().await.context("Failed to wait for Ctrl-C")?;
            hub.stop().await;
            println!("{} Hub stopped", "✓".green());
        }

        Command::Pub {
            action,
            payload,
            format,
            wait,
            connect,
        } => {
            let payload = parse_payload(&payload, format)?;
            let client = Client::create(client_config(&connect))
                .await
                .context("Failed to connect to hub")?;

            let task = client
                .publish(&action, payload)
                .await
                .context("Failed to publish task")?;
            println!("{} Published: {} {}", "✓".green(), task.id().cyan(), action);

            if wait {
                let result = task.result(None).await.context("Task did not succeed")?;
                println!("{}", render(&result, format)?);
            }
            client.close().await;
        }

        Command::Sub { action, connect } => {
            let client = Client::create(client_config(&connect))
                .await
                .context("Failed to connect to hub")?;

            client
                .subscribe(&action, |task| print_event(&task))
                .await
                .context("Failed to subscribe")?;
            println!("{} Subscribed to {}", "→".blue(), action.cyan());

            tokio::signal::ctrl_c().await.context("Failed to wait for Ctrl-C")?;
            client.close().await;
        }
    }

    Ok(())
}

fn main() -> Result<()> {
    setup_logging().context("Failed to setup logging")?;

    let cli = Cli::parse();
    info!("Command: {:?}", std::env::args().collect::<Vec<_>>());

    let rt = tokio::runtime::Runtime::new().context("Failed to create runtime")?;
    if let Err(e) = rt.block_on(run(cli)) {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }

    Ok(())
}

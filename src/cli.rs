//! CLI argument parsing for Taskhub.

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(
    name = "th",
    about = "Publish, subscribe to and route tasks through a task hub",
    version = env!("CARGO_PKG_VERSION"),
    after_help = "Logs are written to: ~/.local/share/taskhub/logs/taskhub.log"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// How to connect to a running hub.
#[derive(Args, Debug, Clone)]
pub struct ConnectArgs {
    /// Hub URL
    #[arg(short, long, default_value = "ws://127.0.0.1:8080", env = "TASKHUB_URL")]
    pub url: String,

    /// Identity to authenticate as
    #[arg(short, long, env = "TASKHUB_IDENTITY")]
    pub identity: String,

    /// Secret key of the identity
    #[arg(short, long, env = "TASKHUB_KEY", hide_env_values = true)]
    pub key: String,

    /// How long to retry connecting, in milliseconds
    #[arg(short, long, default_value = "5000")]
    pub timeout: u64,
}

/// Payload encodings accepted on the command line.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Json,
    Yaml,
    /// Treat the payload as a plain string
    Plain,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a hub in the foreground
    Hub {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,

        /// Address to bind
        #[arg(short, long, default_value = "127.0.0.1")]
        bind: String,

        /// Credential allowed to connect, as identity:key (repeatable)
        #[arg(short, long = "credential", value_name = "IDENTITY:KEY")]
        credentials: Vec<String>,
    },

    /// Publish a task
    Pub {
        /// Action name
        action: String,

        /// Task payload
        payload: String,

        /// Payload encoding
        #[arg(short, long, value_enum, default_value = "json")]
        format: Format,

        /// Wait for the task's result and print it
        #[arg(short, long)]
        wait: bool,

        #[command(flatten)]
        connect: ConnectArgs,
    },

    /// Print every event of tasks published under an action
    Sub {
        /// Action name
        action: String,

        #[command(flatten)]
        connect: ConnectArgs,
    },
}

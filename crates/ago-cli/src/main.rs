mod client;
mod output;

use ago_core::{Payload, Request, Response, Status};
use ago_daemon::{AgoHome, Daemon};
use anyhow::bail;
use clap::{Parser, Subcommand};
use client::DaemonClient;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ago", about = "Run and orchestrate AI agents like containers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Materialise a template's runtime file (does not spawn)
    Create { template: String },
    /// Spawn an agent from a template and print its instance ID
    Run { template: String },
    /// List running agent instances
    Ps,
    /// Show one instance's full record
    Inspect { agent: String },
    /// Send one chat turn to an agent and stream its reasoning
    Chat { agent: String, message: String },
    /// Queue an inter-agent message (returns immediately)
    Send {
        from: String,
        to: String,
        message: String,
    },
    /// Show an agent's conversation log
    Logs {
        agent: String,
        /// Only the last N entries
        #[arg(long)]
        tail: Option<usize>,
        /// Keep streaming new entries
        #[arg(long, short = 'f')]
        follow: bool,
    },
    /// Stop one instance, or all of them
    Stop {
        agent: Option<String>,
        #[arg(long)]
        all: bool,
    },
    /// Show message queue depths and recent traffic
    Queues {
        #[arg(long, short = 'f')]
        follow: bool,
    },
    /// List templates across all layers
    Templates,
    /// Pull a template from a configured registry (registry:template)
    Pull { reference: String },
    /// Read or write configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Manage template registries
    Registry {
        #[command(subcommand)]
        action: RegistryAction,
    },
    /// Control the resident daemon
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Get { key: String },
    Set {
        key: String,
        value: String,
        /// Write to <cwd>/.ago/config.yaml instead of the global file
        #[arg(long)]
        project: bool,
    },
    Show,
}

#[derive(Subcommand)]
enum RegistryAction {
    Add {
        name: String,
        url: String,
        #[arg(long, default_value = "http")]
        kind: String,
        #[arg(long)]
        token: Option<String>,
        #[arg(long, default_value_t = 100)]
        priority: u32,
    },
    List,
    Remove { name: String },
}

#[derive(Subcommand)]
enum DaemonAction {
    /// Start the daemon in the background
    Start,
    /// Ask a running daemon to shut down
    Stop,
    /// Check whether the daemon is up
    Status,
    /// Run the daemon in the foreground (what `start` spawns)
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let home = AgoHome::resolve()?;
    let client = DaemonClient::new(home.daemon_socket());

    match cli.command {
        Commands::Create { template } => {
            finish(client.request(Request::Create { template }).await?)
        }
        Commands::Run { template } => finish(client.request(Request::Run { template }).await?),
        Commands::Ps => finish(client.request(Request::Ps).await?),
        Commands::Inspect { agent } => finish(client.request(Request::Inspect { agent }).await?),

        Commands::Chat { agent, message } => {
            let response = client
                .stream(Request::Chat { agent, message }, output::print_event)
                .await?;
            // The final text was already streamed as a turn-complete event.
            match response.status {
                Status::Ok => Ok(()),
                Status::Error => finish(response),
            }
        }

        Commands::Send { from, to, message } => {
            finish(client.request(Request::Send { from, to, message }).await?)
        }

        Commands::Logs {
            agent,
            tail,
            follow,
        } => {
            let request = Request::Logs {
                agent,
                tail,
                follow,
            };
            if follow {
                finish(client.stream(request, output::print_event).await?)
            } else {
                finish(client.request(request).await?)
            }
        }

        Commands::Stop { agent, all } => {
            if agent.is_none() && !all {
                bail!("stop needs an agent name or --all");
            }
            finish(client.request(Request::Stop { agent, all }).await?)
        }

        Commands::Queues { follow } => {
            let request = Request::Queues { follow };
            if follow {
                finish(client.stream(request, output::print_event).await?)
            } else {
                finish(client.request(request).await?)
            }
        }

        Commands::Templates => finish(client.request(Request::Templates).await?),
        Commands::Pull { reference } => finish(client.request(Request::Pull { reference }).await?),

        Commands::Config { action } => {
            let request = match action {
                ConfigAction::Get { key } => Request::ConfigGet { key },
                ConfigAction::Set {
                    key,
                    value,
                    project,
                } => Request::ConfigSet {
                    key,
                    value,
                    project,
                },
                ConfigAction::Show => Request::ConfigShow,
            };
            finish(client.request(request).await?)
        }

        Commands::Registry { action } => {
            let request = match action {
                RegistryAction::Add {
                    name,
                    url,
                    kind,
                    token,
                    priority,
                } => Request::RegistryAdd {
                    name,
                    url,
                    kind,
                    token,
                    priority,
                },
                RegistryAction::List => Request::RegistryList,
                RegistryAction::Remove { name } => Request::RegistryRemove { name },
            };
            finish(client.request(request).await?)
        }

        Commands::Daemon { action } => match action {
            DaemonAction::Run => {
                Daemon::new(home).run().await?;
                Ok(())
            }
            DaemonAction::Start => daemon_start(&home, &client).await,
            DaemonAction::Stop => finish(client.request(Request::Shutdown).await?),
            DaemonAction::Status => match client.request(Request::Ping).await {
                Ok(Response {
                    status: Status::Ok, ..
                }) => {
                    println!("daemon is running ({})", home.daemon_socket().display());
                    Ok(())
                }
                _ => {
                    println!("daemon is not running");
                    std::process::exit(1);
                }
            },
        },
    }
}

/// Render a terminal response and map errors to a non-zero exit.
fn finish(response: Response) -> anyhow::Result<()> {
    match response.status {
        Status::Ok => {
            output::print_payload(&response.payload);
            Ok(())
        }
        Status::Error => match response.payload {
            Payload::Error { kind, message } => bail!("{kind}: {message}"),
            other => bail!("daemon error: {other:?}"),
        },
    }
}

async fn daemon_start(home: &AgoHome, client: &DaemonClient) -> anyhow::Result<()> {
    if client.request(Request::Ping).await.is_ok() {
        println!("daemon already running");
        return Ok(());
    }

    let exe = std::env::current_exe()?;
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(home.daemon_log())?;
    let log_err = log.try_clone()?;

    let child = std::process::Command::new(exe)
        .args(["daemon", "run"])
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::from(log))
        .stderr(std::process::Stdio::from(log_err))
        .spawn()?;

    // Wait for the control socket to come up.
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if client.request(Request::Ping).await.is_ok() {
            println!("daemon started (pid {})", child.id());
            return Ok(());
        }
    }
    bail!(
        "daemon did not come up, see {}",
        home.daemon_log().display()
    );
}

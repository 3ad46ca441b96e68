//! runcmd CLI
//!
//! Runs a command locally or on a configured SSH host

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use eyre::WrapErr;
use runcmd::{LocalRunner, Remote, RunError, Runner};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "runcmd")]
#[command(about = "Run commands locally or over SSH", long_about = None)]
struct Cli {
    /// Config file (defaults to $RUNCMD_CONFIG, ./runcmd.toml, then the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured hosts
    #[command(name = "hosts")]
    Hosts,

    /// Run a command and print its combined output line by line
    Run {
        /// Configured host to run on (local when omitted)
        #[arg(long)]
        host: Option<String>,

        /// Command and arguments
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Run a command and print stdout and stderr separately
    Output {
        /// Configured host to run on (local when omitted)
        #[arg(long)]
        host: Option<String>,

        /// Print a JSON object instead of raw streams
        #[arg(long)]
        json: bool,

        /// Command and arguments
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

fn init_tracing(config: &Config, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(config.log_level.as_deref().unwrap_or("warn"))
        })
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Where commands run
enum Target {
    Local(LocalRunner),
    Remote(Remote),
}

impl Target {
    /// Target for `host`, local when no host is given
    async fn connect(config: &Config, host: Option<&str>) -> Result<Self> {
        let Some(name) = host else {
            return Ok(Target::Local(LocalRunner::new()));
        };

        let host = config.find_host(name)?;
        let remote = Remote::connect(host.connection_info()?, host.credential()?, host.timeouts)
            .await
            .wrap_err_with(|| format!("connecting to `{name}`"))?;
        Ok(Target::Remote(remote))
    }

    fn runner(&self) -> &dyn Runner {
        match self {
            Target::Local(runner) => runner,
            Target::Remote(remote) => remote,
        }
    }

    /// Disconnect a remote target; a failure here only gets logged
    async fn close(self) {
        if let Target::Remote(remote) = self {
            if let Err(e) = remote.close_connection().await {
                warn!(error = %e, "failed to disconnect");
            }
        }
    }
}

fn split_command(command: &[String]) -> (&str, Vec<&str>) {
    let (name, args) = command.split_first().map_or(("", &[][..]), |(n, a)| (n.as_str(), a));
    (name, args.iter().map(String::as_str).collect())
}

/// Exit with the command's own status when it ran and failed
fn exit_on_failure(err: RunError) -> eyre::Report {
    if let Some(code) = err.exit_code() {
        eprintln!("Error: {err}");
        std::process::exit(code);
    }
    eyre::Report::new(err)
}

/// Run `command` on `target`, then disconnect it
async fn run_lines(target: Target, command: &[String]) -> Result<Vec<String>, RunError> {
    let (name, args) = split_command(command);
    debug!(runner = target.runner().runner_type(), command = %command.join(" "), "running");

    let result = match target.runner().command(name, &args) {
        Ok(mut worker) => worker.run().await,
        Err(e) => Err(e),
    };
    target.close().await;
    result
}

async fn run(config: &Config, host: Option<&str>, command: &[String]) -> Result<()> {
    let target = Target::connect(config, host).await?;
    let lines = run_lines(target, command).await.map_err(exit_on_failure)?;

    for line in lines {
        println!("{line}");
    }
    Ok(())
}

async fn output(config: &Config, host: Option<&str>, json: bool, command: &[String]) -> Result<()> {
    let target = Target::connect(config, host).await?;
    let (name, args) = split_command(command);
    debug!(runner = target.runner().runner_type(), command = %command.join(" "), "capturing output");

    let result = match target.runner().command(name, &args) {
        Ok(mut worker) => worker.output().await,
        Err(e) => Err(e),
    };
    target.close().await;
    let output = result.map_err(exit_on_failure)?;

    if json {
        let value = serde_json::json!({
            "stdout": output.stdout_lossy(),
            "stderr": output.stderr_lossy(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    let mut stdout = tokio::io::stdout();
    stdout.write_all(&output.stdout).await?;
    stdout.flush().await?;

    let mut stderr = tokio::io::stderr();
    stderr.write_all(&output.stderr).await?;
    stderr.flush().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let config = Config::load_default(cli.config.as_deref())?;
    init_tracing(&config, cli.verbose);

    match cli.command {
        Commands::Hosts => {
            if config.host.is_empty() {
                println!("No hosts configured");
            }
            for host in &config.host {
                let info = host.connection_info()?;
                println!("{} {}@{}", host.name, info.user, info.address());
            }
        }
        Commands::Run { host, command } => {
            run(&config, host.as_deref(), &command).await?;
        }
        Commands::Output {
            host,
            json,
            command,
        } => {
            output(&config, host.as_deref(), json, &command).await?;
        }
    }

    Ok(())
}

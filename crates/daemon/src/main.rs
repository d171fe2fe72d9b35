//! Shellmux daemon binary.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use daemon::client::GatewayClient;
use daemon::config::Config;
use daemon::orchestrator::{DaemonOrchestrator, OrchestratorEvent};
use daemon::protocol::{Frame, SessionStatus};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// How often `run` and `attach` poll the session for exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "shellmux")]
#[command(about = "Terminal sessions shared over WebSocket", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway in the foreground
    Start {
        /// Address to listen on, overrides the config file
        #[arg(short, long)]
        listen: Option<String>,
    },
    /// Launch a command in a new session and stream its output
    Run {
        /// Shell command line to run
        command: String,

        /// Gateway URL
        #[arg(long, default_value = "ws://127.0.0.1:8765")]
        url: String,

        /// Terminal width
        #[arg(long)]
        cols: Option<u16>,

        /// Terminal height
        #[arg(long)]
        rows: Option<u16>,

        /// Working directory for the command
        #[arg(long)]
        cwd: Option<String>,
    },
    /// Join a running session
    Attach {
        /// Session to join
        session_id: String,

        /// Gateway URL
        #[arg(long, default_value = "ws://127.0.0.1:8765")]
        url: String,
    },
    /// Show the status of a session
    Status {
        /// Session to inspect
        session_id: String,

        /// Gateway URL
        #[arg(long, default_value = "ws://127.0.0.1:8765")]
        url: String,

        /// Print the raw status as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };
    config.apply_env_overrides();

    if let Commands::Start {
        listen: Some(listen),
    } = &cli.command
    {
        config.server.listen_addr = listen.clone();
    }

    config.validate()?;

    let _log_guard = init_tracing(&config, cli.verbose)?;

    match cli.command {
        Commands::Start { .. } => {
            tracing::info!("Shellmux daemon starting...");
            let mut orchestrator = DaemonOrchestrator::new(config)?;
            run_headless(&mut orchestrator).await?;
        }
        Commands::Run {
            command,
            url,
            cols,
            rows,
            cwd,
        } => {
            let mut client = GatewayClient::connect(&url).await?;
            let ack = client
                .new_session(
                    &command,
                    cols.unwrap_or(config.session.default_cols),
                    rows.unwrap_or(config.session.default_rows),
                    cwd,
                )
                .await?;
            eprintln!("Session {}", ack.session_id);

            let code = stream_session(client).await?;
            std::process::exit(code.unwrap_or(0));
        }
        Commands::Attach { session_id, url } => {
            let mut client = GatewayClient::connect(&url).await?;
            let ack = client.attach(&session_id).await?;
            eprintln!(
                "Attached to {} ({} clients)",
                ack.session_id, ack.status.client_count
            );

            let code = stream_session(client).await?;
            std::process::exit(code.unwrap_or(0));
        }
        Commands::Status {
            session_id,
            url,
            json,
        } => {
            let mut client = GatewayClient::connect(&url).await?;
            client.attach(&session_id).await?;
            let status = client.status().await?;
            client.close().await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
        }
    }

    Ok(())
}

/// Installs the global subscriber.
///
/// Logs go to stderr unless a log file is configured. The returned guard
/// must outlive the program so buffered lines reach the file.
fn init_tracing(config: &Config, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose {
        "debug"
    } else {
        config.server.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match &config.server.log_file {
        Some(path) => {
            let dir = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                _ => PathBuf::from("."),
            };
            let file_name = path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("Invalid log file path: {}", path.display()))?;
            std::fs::create_dir_all(&dir)?;

            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}

/// Run the daemon in the foreground until a signal arrives or the gateway fails.
async fn run_headless(orchestrator: &mut DaemonOrchestrator) -> anyhow::Result<()> {
    let mut events = orchestrator.subscribe();
    orchestrator.start().await?;

    if let Some(addr) = orchestrator.local_addr() {
        println!("Listening on ws://{}", addr);
    }

    let failed = async move {
        loop {
            match events.recv().await {
                Ok(OrchestratorEvent::StateChanged(state)) => {
                    tracing::info!("Orchestrator state: {:?}", state);
                }
                Ok(OrchestratorEvent::Listening { addr }) => {
                    tracing::debug!(addr = %addr, "Gateway bound");
                }
                Ok(OrchestratorEvent::Error { message }) => {
                    tracing::error!("Orchestrator error: {}", message);
                    return;
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    std::future::pending::<()>().await
                }
            }
        }
    };

    tokio::select! {
        result = wait_for_shutdown_signal() => {
            result?;
            tracing::info!("Received shutdown signal");
        }
        _ = failed => {
            tracing::warn!("Gateway failed, shutting down");
        }
    }

    orchestrator.stop().await?;
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

/// Copies session output to stdout and stdin lines to the session.
///
/// Returns the session's exit code once it has exited, or `None` if the
/// server went away first.
async fn stream_session(mut client: GatewayClient) -> anyhow::Result<Option<i32>> {
    let mut stdout = tokio::io::stdout();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut poll = tokio::time::interval(EXIT_POLL_INTERVAL);

    loop {
        tokio::select! {
            frame = client.next_frame() => match frame? {
                Some(Frame::Output(output)) => {
                    stdout.write_all(output.data.as_bytes()).await?;
                    stdout.flush().await?;
                }
                Some(Frame::Error(err)) => eprintln!("Error: {}", err.message),
                Some(_) => {}
                None => return Ok(None),
            },
            line = stdin.next_line(), if stdin_open => match line? {
                Some(line) => client.send_input(&format!("{}\n", line)).await?,
                None => stdin_open = false,
            },
            _ = poll.tick() => {
                let status = client.status().await?;
                if !status.process_running {
                    // Output still queued behind the status reply.
                    while let Some(frame) = drain_backlog(&mut client).await? {
                        if let Frame::Output(output) = frame {
                            stdout.write_all(output.data.as_bytes()).await?;
                        }
                    }
                    stdout.flush().await?;
                    client.close().await?;
                    return Ok(status.exit_code);
                }
            }
        }
    }
}

/// Returns the next buffered frame without waiting on the socket for long.
async fn drain_backlog(client: &mut GatewayClient) -> anyhow::Result<Option<Frame>> {
    match client.next_frame_timeout(Duration::from_millis(50)).await {
        Ok(frame) => Ok(frame),
        Err(daemon::client::ClientError::Timeout) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn print_status(status: &SessionStatus) {
    println!("Session:    {}", status.session_id);
    println!("Command:    {}", status.command);
    println!(
        "State:      {}",
        if status.process_running {
            "running"
        } else {
            "exited"
        }
    );
    if let Some(code) = status.exit_code {
        println!("Exit code:  {}", code);
    }
    println!("Uptime:     {}", format_uptime(status.uptime_secs()));
    println!("Size:       {}x{}", status.cols, status.rows);
    println!("Clients:    {}", status.client_count);
    println!("Buffered:   {}", status.buffer_size);
}

/// Format a duration in seconds as a human-readable string.
fn format_uptime(secs: f64) -> String {
    let secs = secs.max(0.0) as u64;
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_start_command() {
        let cli = Cli::try_parse_from(["shellmux", "start"]).unwrap();
        match cli.command {
            Commands::Start { listen } => assert!(listen.is_none()),
            _ => panic!("Expected Start command"),
        }
    }

    #[test]
    fn test_start_with_listen() {
        let cli = Cli::try_parse_from(["shellmux", "start", "--listen", "0.0.0.0:9000"]).unwrap();
        match cli.command {
            Commands::Start { listen } => assert_eq!(listen.as_deref(), Some("0.0.0.0:9000")),
            _ => panic!("Expected Start command"),
        }
    }

    #[test]
    fn test_run_command_defaults() {
        let cli = Cli::try_parse_from(["shellmux", "run", "htop"]).unwrap();
        match cli.command {
            Commands::Run {
                command,
                url,
                cols,
                rows,
                cwd,
            } => {
                assert_eq!(command, "htop");
                assert_eq!(url, "ws://127.0.0.1:8765");
                assert!(cols.is_none());
                assert!(rows.is_none());
                assert!(cwd.is_none());
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_run_command_with_geometry() {
        let cli = Cli::try_parse_from([
            "shellmux", "run", "ls -la", "--cols", "120", "--rows", "40", "--cwd", "/tmp",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                command,
                cols,
                rows,
                cwd,
                ..
            } => {
                assert_eq!(command, "ls -la");
                assert_eq!(cols, Some(120));
                assert_eq!(rows, Some(40));
                assert_eq!(cwd.as_deref(), Some("/tmp"));
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_run_requires_command() {
        assert!(Cli::try_parse_from(["shellmux", "run"]).is_err());
    }

    #[test]
    fn test_attach_command() {
        let cli =
            Cli::try_parse_from(["shellmux", "attach", "abc", "--url", "ws://host:1"]).unwrap();
        match cli.command {
            Commands::Attach { session_id, url } => {
                assert_eq!(session_id, "abc");
                assert_eq!(url, "ws://host:1");
            }
            _ => panic!("Expected Attach command"),
        }
    }

    #[test]
    fn test_status_json() {
        let cli = Cli::try_parse_from(["shellmux", "status", "abc", "--json"]).unwrap();
        match cli.command {
            Commands::Status {
                session_id, json, ..
            } => {
                assert_eq!(session_id, "abc");
                assert!(json);
            }
            _ => panic!("Expected Status command"),
        }
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::try_parse_from(["shellmux", "start", "-v", "-c", "/etc/shellmux.toml"])
            .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/shellmux.toml")));
    }

    #[test]
    fn test_unknown_command_fails() {
        assert!(Cli::try_parse_from(["shellmux", "frobnicate"]).is_err());
    }

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(5.4), "5s");
        assert_eq!(format_uptime(125.0), "2m 5s");
        assert_eq!(format_uptime(3725.0), "1h 2m 5s");
        assert_eq!(format_uptime(-1.0), "0s");
    }
}

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use courier::config::Tuning;
use courier::events::{init_logging, EventEmitter, SessionEvent};
use courier::protocol::{ControlFrame, OutFrame};
use courier::pty::PtyController;
use courier::scheduler::HumanActivityState;
use courier::session::{run_session, SessionCommand};

#[derive(Debug, Parser)]
#[command(name = "agent-courier")]
#[command(about = "Wraps a terminal agent in a PTY and verifies message delivery")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Interactive passthrough: the real terminal talks to the wrapped
    /// program while broker frames arrive over a Unix control socket.
    Wrap(WrapCommand),
    /// Headless worker: control frames on stdin, events on stdout.
    Worker(WorkerCommand),
}

#[derive(Debug, Args)]
struct WrapCommand {
    /// The program to wrap, e.g. "claude" or "codex --full-auto".
    command: String,

    #[arg(last = true)]
    args: Vec<String>,

    #[arg(long)]
    agent_name: Option<String>,

    /// Unix socket for broker control frames; without it the session runs
    /// standalone and reports events on stderr.
    #[arg(long)]
    control_socket: Option<PathBuf>,

    #[command(flatten)]
    tuning: Tuning,
}

#[derive(Debug, Args)]
struct WorkerCommand {
    command: String,

    #[arg(last = true)]
    args: Vec<String>,

    #[arg(long)]
    agent_name: Option<String>,

    #[command(flatten)]
    tuning: Tuning,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Wrap(cmd) => {
            init_logging(&cmd.tuning.log_level)?;
            run_wrap(cmd).await
        }
        Commands::Worker(cmd) => {
            init_logging(&cmd.tuning.log_level)?;
            run_worker(cmd).await
        }
    }
}

fn split_command(command: &str, extra: &[String]) -> Result<(String, Vec<String>)> {
    let mut parts =
        shlex::split(command).with_context(|| format!("invalid command '{command}'"))?;
    if parts.is_empty() {
        anyhow::bail!("empty wrapped command");
    }
    let program = parts.remove(0);
    parts.extend(extra.iter().cloned());
    Ok((program, parts))
}

fn agent_name_or(explicit: &Option<String>, program: &str) -> String {
    explicit.clone().unwrap_or_else(|| {
        program
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(program)
            .to_string()
    })
}

struct RawModeGuard {
    active: bool,
}

impl RawModeGuard {
    fn enable_if_tty() -> Self {
        use crossterm::tty::IsTty;
        if std::io::stdin().is_tty() {
            match crossterm::terminal::enable_raw_mode() {
                Ok(()) => return Self { active: true },
                Err(error) => {
                    tracing::warn!(target = "courier::wrap", %error, "failed to enable raw mode")
                }
            }
        }
        Self { active: false }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.active {
            let _ = crossterm::terminal::disable_raw_mode();
        }
    }
}

async fn run_wrap(cmd: WrapCommand) -> Result<()> {
    let (program, args) = split_command(&cmd.command, &cmd.args)?;
    let agent_name = agent_name_or(&cmd.agent_name, &program);
    let cfg = cmd.tuning.session_config(agent_name, program.clone());

    let (cols, rows) = crossterm::terminal::size().unwrap_or((80, 24));
    let (pty, pty_rx) = PtyController::spawn(&program, &args, rows, cols)?;
    let writer = pty.writer();
    let human = Arc::new(HumanActivityState::new());

    let raw_guard = RawModeGuard::enable_if_tty();

    // P0 passthrough: keystrokes go straight to the child, unbuffered; the
    // timestamp is the only thing the injection path ever sees of them.
    let keystrokes = human.clone();
    tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = [0u8; 1024];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    keystrokes.record_keystroke(Instant::now());
                    if writer.write_raw(&buf[..n]).is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Mirror child output onto the real terminal.
    let (stream_tx, mut stream_rx) = mpsc::channel::<Vec<u8>>(256);
    tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(chunk) = stream_rx.recv().await {
            if stdout.write_all(&chunk).await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let (cmd_tx, cmd_rx) = mpsc::channel(256);
    let (event_tx, event_rx) = mpsc::channel(1024);

    // Forward terminal resizes to the PTY.
    let resize_tx = cmd_tx.clone();
    tokio::spawn(async move {
        let mut sigwinch = match tokio::signal::unix::signal(
            tokio::signal::unix::SignalKind::window_change(),
        ) {
            Ok(signal) => signal,
            Err(_) => return,
        };
        while sigwinch.recv().await.is_some() {
            if let Ok((cols, rows)) = crossterm::terminal::size() {
                if resize_tx
                    .send(SessionCommand::Resize { rows, cols })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    });

    match cmd.control_socket {
        Some(path) => {
            tokio::spawn(serve_control_socket(path, cmd_tx.clone(), event_rx));
        }
        None => {
            let emitter = EventEmitter::stderr();
            let mut event_rx = event_rx;
            tokio::spawn(async move {
                while let Some(event) = event_rx.recv().await {
                    emitter.emit(&event);
                }
            });
        }
    }

    let result = run_session(cfg, pty, pty_rx, cmd_rx, event_tx, Some(stream_tx), human).await;
    drop(raw_guard);
    result
}

async fn serve_control_socket(
    path: PathBuf,
    commands: mpsc::Sender<SessionCommand>,
    mut events: mpsc::Receiver<SessionEvent>,
) {
    let _ = std::fs::remove_file(&path);
    let listener = match tokio::net::UnixListener::bind(&path) {
        Ok(listener) => listener,
        Err(error) => {
            tracing::error!(
                target = "courier::control",
                socket = %path.display(),
                %error,
                "failed to bind control socket"
            );
            // Keep draining so the session never blocks on its event channel.
            while events.recv().await.is_some() {}
            return;
        }
    };
    tracing::info!(
        target = "courier::control",
        socket = %path.display(),
        "control socket ready"
    );

    let mut client: Option<tokio::net::unix::OwnedWriteHalf> = None;
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let Ok((stream, _addr)) = accepted else { break };
                let (read_half, write_half) = stream.into_split();
                client = Some(write_half);
                let commands = commands.clone();
                tokio::spawn(async move {
                    let mut lines = BufReader::new(read_half).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        match serde_json::from_str::<ControlFrame>(&line) {
                            Ok(frame) => {
                                let cmd = match frame {
                                    ControlFrame::Deliver(event) => SessionCommand::Deliver(event),
                                    ControlFrame::McpAck { delivery_id, status } => {
                                        SessionCommand::McpAck { delivery_id, status }
                                    }
                                    ControlFrame::Shutdown { reason } => {
                                        SessionCommand::Shutdown { reason }
                                    }
                                    ControlFrame::Ping { .. } => continue,
                                };
                                if commands.send(cmd).await.is_err() {
                                    break;
                                }
                            }
                            Err(error) => tracing::warn!(
                                target = "courier::control",
                                %error,
                                "invalid control frame"
                            ),
                        }
                    }
                });
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match client.as_mut() {
                    Some(writer) => {
                        if let Ok(line) = serde_json::to_string(&OutFrame::event(&event)) {
                            if writer.write_all(line.as_bytes()).await.is_err()
                                || writer.write_all(b"\n").await.is_err()
                            {
                                client = None;
                            }
                        }
                    }
                    None => tracing::debug!(
                        target = "courier::control",
                        ?event,
                        "event with no control client attached"
                    ),
                }
            }
        }
    }
}

async fn run_worker(cmd: WorkerCommand) -> Result<()> {
    let (program, args) = split_command(&cmd.command, &cmd.args)?;
    let agent_name = agent_name_or(&cmd.agent_name, &program);
    let cfg = cmd.tuning.session_config(agent_name, program.clone());

    let (pty, pty_rx) = PtyController::spawn(&program, &args, 24, 80)?;
    let (cmd_tx, cmd_rx) = mpsc::channel(256);
    let (event_tx, mut event_rx) = mpsc::channel::<SessionEvent>(1024);
    let (stream_tx, mut stream_rx) = mpsc::channel::<Vec<u8>>(256);
    let (frame_tx, mut frame_rx) = mpsc::channel::<OutFrame>(1024);

    tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(frame) = frame_rx.recv().await {
            if let Ok(line) = serde_json::to_string(&frame) {
                if stdout.write_all(line.as_bytes()).await.is_err()
                    || stdout.write_all(b"\n").await.is_err()
                {
                    break;
                }
                let _ = stdout.flush().await;
            }
        }
    });

    let frames = frame_tx.clone();
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let _ = frames.send(OutFrame::event(&event)).await;
        }
    });

    let frames = frame_tx.clone();
    tokio::spawn(async move {
        while let Some(chunk) = stream_rx.recv().await {
            let chunk = String::from_utf8_lossy(&chunk).into_owned();
            let _ = frames.send(OutFrame::Stream { chunk }).await;
        }
    });

    let frames = frame_tx;
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match serde_json::from_str::<ControlFrame>(&line) {
                Ok(ControlFrame::Deliver(event)) => {
                    if cmd_tx.send(SessionCommand::Deliver(event)).await.is_err() {
                        break;
                    }
                }
                Ok(ControlFrame::McpAck {
                    delivery_id,
                    status,
                }) => {
                    if cmd_tx
                        .send(SessionCommand::McpAck {
                            delivery_id,
                            status,
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(ControlFrame::Ping { ts_ms }) => {
                    let _ = frames.send(OutFrame::Pong { ts_ms }).await;
                }
                Ok(ControlFrame::Shutdown { reason }) => {
                    let _ = cmd_tx.send(SessionCommand::Shutdown { reason }).await;
                }
                Err(error) => {
                    let _ = frames
                        .send(OutFrame::Error {
                            code: "invalid_frame".to_string(),
                            message: error.to_string(),
                            retryable: false,
                        })
                        .await;
                }
            }
        }
    });

    let human = Arc::new(HumanActivityState::new());
    run_session(cfg, pty, pty_rx, cmd_rx, event_tx, Some(stream_tx), human).await
}

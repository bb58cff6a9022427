use std::env;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    /// The child is gone. Non-retryable; the delivery fails as pty_closed.
    #[error("pty closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// Write handle for the P0 passthrough path. Cloneable; the mutex
/// serializes raw keystrokes against injected blocks so a block written in
/// one call is never interleaved with human input.
#[derive(Clone)]
pub struct PtyWriter {
    writer: SharedWriter,
}

impl PtyWriter {
    pub fn write_raw(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut guard = self.writer.lock();
        guard.write_all(bytes)?;
        guard.flush()
    }
}

/// Owns the pseudo-terminal and the wrapped child. Output arrives over the
/// mpsc receiver returned by `spawn`; all input goes through `write_all`
/// (injection) or a `PtyWriter` (passthrough).
pub struct PtyController {
    master: Box<dyn portable_pty::MasterPty>,
    writer: SharedWriter,
    child: Arc<Mutex<Box<dyn portable_pty::Child + Send>>>,
    child_pid: Option<u32>,
    reaped: Arc<AtomicBool>,
}

impl PtyController {
    pub fn spawn(
        command: &str,
        args: &[String],
        rows: u16,
        cols: u16,
    ) -> Result<(Self, mpsc::Receiver<Vec<u8>>)> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to open pty")?;

        let resolved = resolve_program(command);
        let mut builder = CommandBuilder::new(&resolved);
        builder.cwd(std::env::current_dir().context("failed to get current directory")?);
        for arg in args {
            builder.arg(arg);
        }

        let child = pair
            .slave
            .spawn_command(builder)
            .with_context(|| format!("failed to spawn wrapped program '{resolved}'"))?;
        let child_pid = child.process_id();

        let mut reader = pair
            .master
            .try_clone_reader()
            .context("failed to clone pty reader")?;
        let writer = pair.master.take_writer().context("failed to take pty writer")?;

        let (tx, rx) = mpsc::channel(256);
        thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok((
            Self {
                master: pair.master,
                writer: Arc::new(Mutex::new(writer)),
                child: Arc::new(Mutex::new(child)),
                child_pid,
                reaped: Arc::new(AtomicBool::new(false)),
            },
            rx,
        ))
    }

    /// Injection entry point. The whole buffer goes out in one call under
    /// the writer lock, so blocks never interleave with passthrough bytes.
    pub fn write_all(&self, bytes: &[u8]) -> Result<(), WriteError> {
        if self.has_exited() {
            return Err(WriteError::Closed);
        }
        let mut guard = self.writer.lock();
        guard.write_all(bytes)?;
        guard.flush()?;
        Ok(())
    }

    pub fn writer(&self) -> PtyWriter {
        PtyWriter {
            writer: self.writer.clone(),
        }
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to resize pty")
    }

    /// Non-blocking liveness check. Uses waitpid(WNOHANG) first, then
    /// kill(pid, 0) on Unix for the case where something else reaped the
    /// child already.
    pub fn has_exited(&self) -> bool {
        if self.reaped.load(Ordering::Relaxed) {
            return true;
        }

        {
            let mut child = self.child.lock();
            match child.try_wait() {
                Ok(Some(_status)) => {
                    self.reaped.store(true, Ordering::Relaxed);
                    return true;
                }
                Ok(None) => {}
                Err(error) => {
                    // ECHILD: reaped elsewhere (shutdown or signal handler).
                    tracing::debug!(
                        target = "courier::pty",
                        pid = ?self.child_pid,
                        %error,
                        "try_wait failed; treating child as exited"
                    );
                    self.reaped.store(true, Ordering::Relaxed);
                    return true;
                }
            }
        }

        #[cfg(unix)]
        if let Some(pid) = self.child_pid {
            // SAFETY: signal 0 performs no delivery, only an existence check.
            if unsafe { libc::kill(pid as libc::pid_t, 0) } == -1 {
                let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
                if errno == libc::ESRCH {
                    self.reaped.store(true, Ordering::Relaxed);
                    return true;
                }
            }
        }

        false
    }

    pub fn shutdown(&self) -> Result<()> {
        let mut child = self.child.lock();
        let _ = child.kill();
        let _ = child.wait();
        self.reaped.store(true, Ordering::Relaxed);
        Ok(())
    }
}

fn canonical_display(path: &Path) -> String {
    std::fs::canonicalize(path)
        .ok()
        .and_then(|resolved| resolved.to_str().map(ToOwned::to_owned))
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// Resolve a bare program name against PATH so CommandBuilder gets an
/// unambiguous target; explicit paths only get symlink resolution.
fn resolve_program(command: &str) -> String {
    if command.contains('/') || command.contains('\\') || command.starts_with('.') {
        return canonical_display(Path::new(command));
    }

    if let Some(path_env) = env::var_os("PATH").filter(|v| !v.is_empty()) {
        for dir in env::split_paths(&path_env) {
            let candidate = dir.join(command);
            if candidate.is_file() {
                return canonical_display(&candidate);
            }
        }
    }
    command.to_string()
}

/// Answers terminal status queries on behalf of the real terminal. Wrapped
/// CLIs often probe cursor position at startup and stall waiting for the
/// reply, which never comes through the broker path.
#[derive(Debug, Default)]
pub struct StatusQueryResponder {
    state: QueryState,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum QueryState {
    #[default]
    Ground,
    Escape,
    Csi,
    CsiPrivate,
    CsiSix,
    CsiPrivateSix,
}

impl StatusQueryResponder {
    /// Scan an output chunk; returns the replies to write back for every
    /// complete `ESC[6n` / `ESC[?6n` query found.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<&'static [u8]> {
        let mut replies = Vec::new();
        for &byte in chunk {
            self.state = match (self.state, byte) {
                (_, 0x1b) => QueryState::Escape,
                (QueryState::Escape, b'[') => QueryState::Csi,
                (QueryState::Csi, b'?') => QueryState::CsiPrivate,
                (QueryState::Csi, b'6') => QueryState::CsiSix,
                (QueryState::CsiPrivate, b'6') => QueryState::CsiPrivateSix,
                (QueryState::CsiSix, b'n') => {
                    replies.push(b"\x1b[1;1R".as_slice());
                    QueryState::Ground
                }
                (QueryState::CsiPrivateSix, b'n') => {
                    replies.push(b"\x1b[?1;1R".as_slice());
                    QueryState::Ground
                }
                _ => QueryState::Ground,
            };
        }
        replies
    }
}

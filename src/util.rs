use std::fmt;
use std::io::Error as IoError;
use std::process::{Output, Stdio};
use std::sync::OnceLock;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command as TokioCommand;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

#[derive(Debug)]
pub enum CommandError {
    Io(IoError),
    Timeout,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Io(e) => write!(f, "Command execution error: {}", e),
            CommandError::Timeout => write!(f, "Command timed out"),
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommandError::Io(e) => Some(e),
            CommandError::Timeout => None,
        }
    }
}

pub fn parse_timeout(timeout_str: Option<&str>, default_timeout: Option<&str>) -> Option<Duration> {
    let timeout_to_parse = timeout_str.or(default_timeout)?;

    if timeout_to_parse == "0" || timeout_to_parse.is_empty() {
        return None;
    }

    match timeout_to_parse.parse::<humantime::Duration>() {
        Ok(duration) => Some(duration.into()),
        Err(e) => {
            eprintln!(
                "Warning: Invalid timeout format '{}': {}",
                timeout_to_parse, e
            );
            eprintln!("Use duration format like '5m', '30s', '1h30m'");
            None
        }
    }
}

fn shell_command(command: &str) -> TokioCommand {
    if cfg!(target_os = "windows") {
        let mut cmd = TokioCommand::new("cmd");
        cmd.args(["/C", command]);
        cmd
    } else {
        let mut cmd = TokioCommand::new("sh");
        cmd.args(["-c", command]);
        cmd
    }
}

fn spawn_pump<R, W>(
    pipe: Option<R>,
    mut echo_to: W,
    echo: bool,
) -> JoinHandle<Result<Vec<u8>, CommandError>>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut collected: Vec<u8> = Vec::new();
        let Some(mut pipe) = pipe else {
            return Ok(collected);
        };

        let mut buf = [0u8; 8192];
        loop {
            let n = pipe.read(&mut buf).await.map_err(CommandError::Io)?;
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&buf[..n]);
            if echo {
                echo_to
                    .write_all(&buf[..n])
                    .await
                    .map_err(CommandError::Io)?;
            }
        }
        if echo {
            echo_to.flush().await.map_err(CommandError::Io)?;
        }

        Ok(collected)
    })
}

/// Runs a command through the platform shell, optionally killing it after a
/// timeout. When `stdout_file` is given the child's standard output goes
/// straight to that file (the captured stdout is then empty); otherwise
/// stdout is captured and, with `stream_output`, echoed live. Stderr is
/// always captured for diagnostics.
pub async fn run_command_with_timeout(
    command: &str,
    timeout: Option<Duration>,
    stdout_file: Option<std::fs::File>,
    stream_output: bool,
) -> Result<Output, CommandError> {
    let mut cmd = shell_command(command);

    match stdout_file {
        Some(file) => {
            cmd.stdout(Stdio::from(file));
        }
        None => {
            cmd.stdout(Stdio::piped());
        }
    }
    cmd.stderr(Stdio::piped()).stdin(Stdio::null());

    let mut child = cmd.spawn().map_err(CommandError::Io)?;

    let stdout_handle = spawn_pump(child.stdout.take(), tokio::io::stdout(), stream_output);
    let stderr_handle = spawn_pump(child.stderr.take(), tokio::io::stderr(), stream_output);

    let status = match timeout {
        Some(duration) => {
            tokio::select! {
                result = child.wait() => result.map_err(CommandError::Io)?,
                _ = tokio::time::sleep(duration) => {
                    if let Err(kill_err) = child.kill().await {
                        eprintln!("Warning: Failed to kill timed-out process: {}", kill_err);
                    }
                    let _ = child.wait().await;
                    return Err(CommandError::Timeout);
                }
            }
        }
        None => child.wait().await.map_err(CommandError::Io)?,
    };

    let stdout = match stdout_handle.await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => return Err(e),
        Err(e) => return Err(CommandError::Io(IoError::other(e))),
    };

    let stderr = match stderr_handle.await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => return Err(e),
        Err(e) => return Err(CommandError::Io(IoError::other(e))),
    };

    Ok(Output {
        status,
        stdout,
        stderr,
    })
}

static OUTPUT_PRINT_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

pub fn output_print_lock() -> &'static Mutex<()> {
    OUTPUT_PRINT_LOCK.get_or_init(|| Mutex::new(()))
}

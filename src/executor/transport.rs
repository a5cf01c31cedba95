// Transport layer: running a command on a host with timeout and cancellation

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::process::Command as ProcessCommand;
use tokio::sync::watch;
use tracing::debug;

use crate::config::Config;
use crate::output::errors::CuminError;

/// Callback invoked with each chunk of remote output
pub type OutputFn = Box<dyn Fn(&[u8]) + Send + Sync>;

/// Cancellation signal shared across a run
pub type CancelWatch = watch::Receiver<bool>;

/// How a command execution ended on one host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    /// The command ran to completion with this exit code
    Completed(i32),
    /// The per-command timeout expired and the command was killed
    TimedOut,
    /// The run was cancelled while the command was in flight
    Cancelled,
}

/// Collected output of a completed command
#[derive(Debug, Clone, Default)]
pub struct CommandResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// How commands reach hosts.
///
/// Implementations enforce the per-command timeout and react to the
/// cancellation watch; output bytes are delivered losslessly, each chunk to
/// exactly one callback invocation.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn exec_streaming(
        &self,
        host: &str,
        command: &str,
        timeout: Option<Duration>,
        cancel: CancelWatch,
        on_stdout: OutputFn,
        on_stderr: OutputFn,
    ) -> Result<ExecStatus, CuminError>;

    /// Convenience wrapper collecting the output into buffers
    async fn exec(
        &self,
        host: &str,
        command: &str,
        timeout: Option<Duration>,
        cancel: CancelWatch,
    ) -> Result<(ExecStatus, CommandResult), CuminError> {
        let stdout = Arc::new(Mutex::new(Vec::new()));
        let stderr = Arc::new(Mutex::new(Vec::new()));

        let out = stdout.clone();
        let err = stderr.clone();
        let status = self
            .exec_streaming(
                host,
                command,
                timeout,
                cancel,
                Box::new(move |bytes| out.lock().extend_from_slice(bytes)),
                Box::new(move |bytes| err.lock().extend_from_slice(bytes)),
            )
            .await?;

        let result = CommandResult {
            stdout: std::mem::take(&mut *stdout.lock()),
            stderr: std::mem::take(&mut *stderr.lock()),
        };
        Ok((status, result))
    }
}

/// Build the transport selected by the configuration
pub fn new_transport(config: &Config) -> Result<Arc<dyn Transport>, CuminError> {
    match config.transport.as_deref() {
        None | Some("clustershell") => Ok(Arc::new(SshTransport::new(config))),
        Some(other) => Err(CuminError::Config {
            message: format!("unknown transport '{}', expected 'clustershell'", other),
            path: None,
        }),
    }
}

/// Production transport driving the system SSH client.
///
/// Remote hosts get `ssh [options] host command`; localhost targets run
/// `sh -c command` directly. The child is killed on timeout or cancellation
/// and its pipes are drained before returning, so partial output is kept.
pub struct SshTransport {
    ssh_args: Vec<String>,
    environment: HashMap<String, String>,
}

impl SshTransport {
    pub fn new(config: &Config) -> Self {
        // Each configured option may carry its own arguments
        let ssh_args = config
            .clustershell
            .ssh_options
            .iter()
            .flat_map(|option| option.split_whitespace().map(String::from))
            .collect();

        SshTransport {
            ssh_args,
            environment: config.environment.clone(),
        }
    }

    fn build_command(&self, host: &str, command: &str) -> ProcessCommand {
        let mut process = if is_local(host) {
            let mut process = ProcessCommand::new("sh");
            process.arg("-c").arg(command);
            process
        } else {
            let mut process = ProcessCommand::new("ssh");
            process.args(&self.ssh_args).arg(host).arg(command);
            process
        };

        process
            .envs(&self.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        process
    }
}

fn is_local(host: &str) -> bool {
    host == "localhost" || host == "127.0.0.1" || host == "::1"
}

/// Wait until the cancellation flag is raised; never resolves otherwise
pub(crate) async fn wait_cancelled(mut cancel: CancelWatch) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            // Sender gone, cancellation can no longer happen
            std::future::pending::<()>().await;
        }
    }
}

async fn pump<R>(mut reader: R, sink: OutputFn)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buffer = [0u8; 4096];
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(n) => sink(&buffer[..n]),
        }
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn exec_streaming(
        &self,
        host: &str,
        command: &str,
        timeout: Option<Duration>,
        cancel: CancelWatch,
        on_stdout: OutputFn,
        on_stderr: OutputFn,
    ) -> Result<ExecStatus, CuminError> {
        debug!(host, command, "launching command");

        let mut child = self
            .build_command(host, command)
            .spawn()
            .map_err(|e| CuminError::Transport {
                host: host.to_string(),
                message: format!("unable to launch the command: {}", e),
                suggestion: Some("check that the ssh client is installed".to_string()),
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_task = stdout.map(|reader| tokio::spawn(pump(reader, on_stdout)));
        let err_task = stderr.map(|reader| tokio::spawn(pump(reader, on_stderr)));

        let expiry = async {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };

        enum Waited {
            Done(std::io::Result<std::process::ExitStatus>),
            TimedOut,
            Cancelled,
        }

        let waited = {
            let wait = child.wait();
            tokio::pin!(wait);
            tokio::select! {
                exit = &mut wait => Waited::Done(exit),
                _ = expiry => Waited::TimedOut,
                _ = wait_cancelled(cancel) => Waited::Cancelled,
            }
        };

        let status = match waited {
            Waited::Done(Ok(status)) => ExecStatus::Completed(status.code().unwrap_or(-1)),
            Waited::Done(Err(e)) => {
                return Err(CuminError::Transport {
                    host: host.to_string(),
                    message: format!("unable to wait for the command: {}", e),
                    suggestion: None,
                });
            }
            Waited::TimedOut => {
                debug!(host, command, "command timed out, killing");
                child.kill().await.ok();
                ExecStatus::TimedOut
            }
            Waited::Cancelled => {
                debug!(host, command, "run cancelled, killing");
                child.kill().await.ok();
                ExecStatus::Cancelled
            }
        };

        // Drain whatever is left in the pipes before returning
        if let Some(task) = out_task {
            let _ = task.await;
        }
        if let Some(task) = err_task {
            let _ = task.await;
        }

        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> SshTransport {
        SshTransport::new(&Config::default())
    }

    fn no_cancel() -> CancelWatch {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive for the duration of the test process
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn test_local_exec_collects_output() {
        let (status, result) = transport()
            .exec("localhost", "printf 'a b'; printf 'err' >&2", None, no_cancel())
            .await
            .unwrap();

        assert_eq!(status, ExecStatus::Completed(0));
        assert_eq!(result.stdout, b"a b");
        assert_eq!(result.stderr, b"err");
    }

    #[tokio::test]
    async fn test_local_exit_code() {
        let (status, _) = transport()
            .exec("localhost", "exit 42", None, no_cancel())
            .await
            .unwrap();
        assert_eq!(status, ExecStatus::Completed(42));
    }

    #[tokio::test]
    async fn test_timeout_kills_command() {
        let started = std::time::Instant::now();
        let (status, _) = transport()
            .exec(
                "localhost",
                "sleep 5",
                Some(Duration::from_millis(100)),
                no_cancel(),
            )
            .await
            .unwrap();

        assert_eq!(status, ExecStatus::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_cancellation_kills_command() {
        let (tx, rx) = watch::channel(false);
        let transport = transport();

        let handle = tokio::spawn(async move {
            transport.exec("localhost", "sleep 5", None, rx).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let (status, _) = handle.await.unwrap().unwrap();
        assert_eq!(status, ExecStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_partial_output_kept_on_timeout() {
        let (status, result) = transport()
            .exec(
                "localhost",
                "printf 'early'; sleep 5",
                Some(Duration::from_millis(200)),
                no_cancel(),
            )
            .await
            .unwrap();

        assert_eq!(status, ExecStatus::TimedOut);
        assert_eq!(result.stdout, b"early");
    }

    #[test]
    fn test_ssh_options_split() {
        let mut config = Config::default();
        config
            .clustershell
            .ssh_options
            .push("-o StrictHostKeyChecking=no".to_string());
        config.clustershell.ssh_options.push("-q".to_string());

        let transport = SshTransport::new(&config);
        assert_eq!(
            transport.ssh_args,
            vec!["-o", "StrictHostKeyChecking=no", "-q"]
        );
    }
}

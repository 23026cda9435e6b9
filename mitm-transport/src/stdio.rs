//! Newline-delimited JSON over stdio, in both directions the core needs:
//! spawning a server subprocess, and speaking the host's own stdin/stdout
//! for the client side.

use std::process::Stdio;

use async_trait::async_trait;
use mitm_core::{Envelope, ProxyError, Result, TransportAdapter};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter, Stdin, Stdout};
use tokio::process::{Child, ChildStdin, ChildStdout};

async fn read_line_as_envelope<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> Result<Envelope> {
    loop {
        let mut line = String::new();
        let bytes_read = reader
            .read_line(&mut line)
            .await
            .map_err(|e| ProxyError::Transport(format!("stdio read failed: {e}")))?;

        if bytes_read == 0 {
            return Err(ProxyError::Transport("stdio closed (eof)".to_string()));
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        return serde_json::from_str(trimmed)
            .map_err(|e| ProxyError::Decode(format!("invalid json-rpc envelope: {e}")));
    }
}

async fn write_envelope<W: AsyncWriteExt + Unpin>(writer: &mut W, envelope: &Envelope) -> Result<()> {
    let mut json = serde_json::to_vec(envelope)
        .map_err(|e| ProxyError::Transport(format!("encode envelope failed: {e}")))?;
    json.push(b'\n');
    writer
        .write_all(&json)
        .await
        .map_err(|e| ProxyError::Transport(format!("stdio write failed: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| ProxyError::Transport(format!("stdio flush failed: {e}")))
}

/// Server-facing adapter that spawns `command` via a shell and speaks
/// newline-delimited JSON over its piped stdio.
pub struct ProcessAdapter {
    child: Child,
    stdin: BufWriter<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

impl ProcessAdapter {
    pub async fn spawn(command: &str) -> Result<Self> {
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| ProxyError::Transport(format!("failed to spawn '{command}': {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProxyError::Transport("child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProxyError::Transport("child stdout unavailable".to_string()))?;

        Ok(Self {
            child,
            stdin: BufWriter::new(stdin),
            stdout: BufReader::new(stdout),
        })
    }
}

#[async_trait]
impl TransportAdapter for ProcessAdapter {
    async fn read(&mut self) -> Result<Envelope> {
        read_line_as_envelope(&mut self.stdout).await
    }

    async fn write(&mut self, envelope: Envelope) -> Result<()> {
        write_envelope(&mut self.stdin, &envelope).await
    }

    async fn close(&mut self) -> Result<()> {
        let _ = self.stdin.flush().await;
        if let Err(e) = self.child.kill().await {
            tracing::warn!(error = %e, "failed to kill child process on close");
        }
        Ok(())
    }
}

/// Client-facing adapter over the host process's own stdin/stdout.
pub struct HostStdioAdapter {
    stdin: BufReader<Stdin>,
    stdout: BufWriter<Stdout>,
}

impl Default for HostStdioAdapter {
    fn default() -> Self {
        Self {
            stdin: BufReader::new(tokio::io::stdin()),
            stdout: BufWriter::new(tokio::io::stdout()),
        }
    }
}

#[async_trait]
impl TransportAdapter for HostStdioAdapter {
    async fn read(&mut self) -> Result<Envelope> {
        read_line_as_envelope(&mut self.stdin).await
    }

    async fn write(&mut self, envelope: Envelope) -> Result<()> {
        write_envelope(&mut self.stdout, &envelope).await
    }

    async fn close(&mut self) -> Result<()> {
        let _ = self.stdout.flush().await;
        Ok(())
    }
}

//! Streaming sessions: exec, attach, and port-forward plumbing.
//!
//! The facade only *prepares* a session: it validates the request, parks it
//! in the registry, and returns a URL for the client to open against the
//! streaming HTTP server. When the client arrives, the wire layer claims
//! the parked session by token and drives the copy loops below.
//!
//! Every session is one future: dropping it cancels the resize task and the
//! copy loops together, which is what makes teardown deterministic. The
//! detach sequence (`0x04`, Ctrl-D at the start of input) ends an attach
//! cleanly; it is a sentinel, not an error.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::debug;

use crate::cri::{AttachRequest, ExecRequest, PortForwardRequest};
use crate::error::{Error, Result};
use crate::launcher::control_message;

/// Byte that detaches an interactive session.
const DETACH_SEQUENCE: u8 = 0x04;

/// A terminal size update from the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub height: u16,
    pub width: u16,
}

/// A parked session, waiting for its client to open the URL.
#[derive(Debug, Clone)]
pub enum Session {
    Exec(ExecRequest),
    Attach(AttachRequest),
    PortForward(PortForwardRequest),
}

/// Registry of prepared sessions keyed by opaque token.
#[derive(Debug)]
pub struct StreamingServer {
    base_url: String,
    sessions: Mutex<HashMap<String, Session>>,
    counter: AtomicU64,
}

impl StreamingServer {
    pub fn new(address: &str) -> Self {
        let base_url = if address.contains("://") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", address.trim_end_matches('/'))
        };
        StreamingServer {
            base_url,
            sessions: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
        }
    }

    /// Park an exec session and return its URL.
    pub fn prepare_exec(&self, request: ExecRequest) -> Result<String> {
        if request.tty && request.stderr {
            return Err(Error::InvalidConfig(
                "tty exec merges stderr into stdout".into(),
            ));
        }
        if !request.stdin && !request.stdout && !request.stderr {
            return Err(Error::InvalidConfig(
                "exec needs at least one of stdin, stdout, stderr".into(),
            ));
        }
        if request.cmd.is_empty() {
            return Err(Error::InvalidConfig("exec needs a command".into()));
        }
        let id = request.container_id.clone();
        Ok(self.park("exec", &id, Session::Exec(request)))
    }

    /// Park an attach session and return its URL.
    pub fn prepare_attach(&self, request: AttachRequest) -> Result<String> {
        if !request.stdin && !request.stdout && !request.stderr {
            return Err(Error::InvalidConfig(
                "attach needs at least one of stdin, stdout, stderr".into(),
            ));
        }
        let id = request.container_id.clone();
        Ok(self.park("attach", &id, Session::Attach(request)))
    }

    /// Park a port-forward session and return its URL. The data path is the
    /// streaming library's business; the caller has already verified the pod.
    pub fn prepare_port_forward(&self, request: PortForwardRequest) -> Result<String> {
        let id = request.pod_sandbox_id.clone();
        Ok(self.park("portforward", &id, Session::PortForward(request)))
    }

    /// Claim a parked session; each token is good for one client.
    pub fn take(&self, token: &str) -> Option<Session> {
        self.sessions.lock().unwrap().remove(token)
    }

    fn park(&self, kind: &str, id: &str, session: Session) -> String {
        let serial = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut hasher = Sha256::new();
        hasher.update(serial.to_le_bytes());
        hasher.update(id.as_bytes());
        let token = hex::encode(&hasher.finalize()[..16]);
        self.sessions
            .lock()
            .unwrap()
            .insert(token.clone(), session);
        debug!(kind, id, token = %token, "streaming session prepared");
        format!("{}/{kind}/{token}", self.base_url)
    }
}

/// Outcome of a stdin copy that watches for the detach sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdinOutcome {
    /// The client typed the detach sequence; the session ends cleanly.
    Detached,
    /// The client closed its end.
    Eof,
}

/// Copy client stdin into the container, stopping cleanly at the detach
/// byte. Bytes before the sequence are delivered.
pub async fn copy_stdin_detachable(
    mut reader: impl AsyncRead + Unpin,
    mut writer: impl AsyncWrite + Unpin,
) -> Result<StdinOutcome> {
    let mut buffer = [0u8; 4096];
    loop {
        let n = match reader.read(&mut buffer).await {
            Ok(0) => return Ok(StdinOutcome::Eof),
            Ok(n) => n,
            Err(e) => return Err(e.into()),
        };
        if let Some(at) = buffer[..n].iter().position(|byte| *byte == DETACH_SEQUENCE) {
            if at > 0 {
                writer.write_all(&buffer[..at]).await?;
            }
            return Ok(StdinOutcome::Detached);
        }
        writer.write_all(&buffer[..n]).await?;
    }
}

/// Run an exec command on a PTY, copying between the client and the master
/// side and applying resize events. Container stderr merges into stdout by
/// construction. Returns the command's exit code.
pub async fn exec_with_tty<'a>(
    mut command: Command,
    client_stdin: Option<Box<dyn AsyncRead + Send + Unpin + 'a>>,
    client_stdout: Option<Box<dyn AsyncWrite + Send + Unpin + 'a>>,
    mut resize: mpsc::Receiver<TerminalSize>,
) -> Result<i32> {
    let pty = nix::pty::openpty(None, None)?;
    let master = pty.master;
    let slave = pty.slave;

    command
        .stdin(Stdio::from(slave.try_clone()?))
        .stdout(Stdio::from(slave.try_clone()?))
        .stderr(Stdio::from(slave));
    let mut child = command
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::transient(format!("spawning exec: {e}")))?;

    let master_read = fd_file(master.try_clone()?)?;
    let master_write = fd_file(master.try_clone()?)?;

    let resize_fd = master.as_raw_fd();
    // Input and resize never "complete": they are cancelled when the main
    // branch (process exit + output drain) resolves.
    let resize_task = async move {
        while let Some(size) = resize.recv().await {
            apply_window_size(resize_fd, size);
        }
        std::future::pending::<()>().await
    };
    let input_task = async {
        if let Some(stdin) = client_stdin {
            let _ = copy_stdin_detachable(stdin, master_write).await;
        }
        std::future::pending::<()>().await
    };
    // Output drains to completion: the master reads EOF once the child is
    // gone and our slave copies have been dropped into its stdio.
    let output_task = async {
        if let Some(mut stdout) = client_stdout {
            let mut master_read = master_read;
            let _ = tokio::io::copy(&mut master_read, &mut stdout).await;
        }
    };

    let status = tokio::select! {
        (status, ()) = async { tokio::join!(child.wait(), output_task) } => {
            status.map_err(|e| Error::transient(format!("exec wait: {e}")))?
        }
        _ = resize_task => unreachable!("resize task never completes"),
        _ = input_task => unreachable!("input task never completes"),
    };
    Ok(status.code().unwrap_or(-1))
}

/// Run an exec command with directly wired pipes (no TTY). Returns the
/// command's exit code.
pub async fn exec_with_streams<'a>(
    mut command: Command,
    client_stdin: Option<Box<dyn AsyncRead + Send + Unpin + 'a>>,
    client_stdout: Option<Box<dyn AsyncWrite + Send + Unpin + 'a>>,
    client_stderr: Option<Box<dyn AsyncWrite + Send + Unpin + 'a>>,
) -> Result<i32> {
    command
        .stdin(if client_stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(if client_stdout.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stderr(if client_stderr.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
    let mut child = command
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::transient(format!("spawning exec: {e}")))?;

    let child_stdin = child.stdin.take();
    let child_stdout = child.stdout.take();
    let child_stderr = child.stderr.take();

    // Stdin may outlive the process; it is cancelled, not awaited.
    let input_task = async {
        if let (Some(reader), Some(writer)) = (client_stdin, child_stdin) {
            let _ = copy_stdin_detachable(reader, writer).await;
        }
        std::future::pending::<()>().await
    };
    let outputs = async {
        if let (Some(mut writer), Some(mut reader)) = (client_stdout, child_stdout) {
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
        }
        if let (Some(mut writer), Some(mut reader)) = (client_stderr, child_stderr) {
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
        }
    };

    let status = tokio::select! {
        (status, ()) = async { tokio::join!(child.wait(), outputs) } => {
            status.map_err(|e| Error::transient(format!("exec wait: {e}")))?
        }
        _ = input_task => unreachable!("input task never completes"),
    };
    Ok(status.code().unwrap_or(-1))
}

/// Attach to a running container's stdio socket.
///
/// Output is copied from the attach socket to the client; input is copied
/// in with the detach watcher. Resize events become `consoleSize` control
/// messages to the launcher. Detach returns `Ok`, not an error.
pub async fn attach<'a>(
    attach_socket: &Path,
    control_socket: Option<PathBuf>,
    client_stdin: Option<Box<dyn AsyncRead + Send + Unpin + 'a>>,
    client_stdout: Option<Box<dyn AsyncWrite + Send + Unpin + 'a>>,
    mut resize: mpsc::Receiver<TerminalSize>,
) -> Result<()> {
    let stream = UnixStream::connect(attach_socket)
        .await
        .map_err(|e| Error::transient(format!("attach socket: {e}")))?;
    let (mut socket_read, socket_write) = stream.into_split();

    let resize_task = async move {
        if let Some(control) = control_socket {
            while let Some(size) = resize.recv().await {
                let message = serde_json::json!({
                    "consoleSize": {"h": size.height, "w": size.width},
                });
                if control_message(&control, &message).await.is_err() {
                    break;
                }
            }
        }
        std::future::pending::<()>().await
    };

    let output_task = async {
        if let Some(mut stdout) = client_stdout {
            let _ = tokio::io::copy(&mut socket_read, &mut stdout).await;
        } else {
            std::future::pending::<()>().await;
        }
    };
    let input_task = async {
        match client_stdin {
            Some(stdin) => copy_stdin_detachable(stdin, socket_write).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = output_task => Ok(()),
        outcome = input_task => outcome.map(|_| ()),
        _ = resize_task => unreachable!("resize task never completes"),
    }
}

/// Apply a window-size update to a PTY master.
fn apply_window_size(fd: i32, size: TerminalSize) {
    let winsize = libc::winsize {
        ws_row: size.height,
        ws_col: size.width,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: TIOCSWINSZ reads a valid winsize struct from our stack.
    unsafe {
        libc::ioctl(fd, libc::TIOCSWINSZ, &winsize);
    }
}

fn fd_file(fd: OwnedFd) -> Result<tokio::fs::File> {
    Ok(tokio::fs::File::from_std(std::fs::File::from(fd)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec_request(tty: bool, stdin: bool, stdout: bool, stderr: bool) -> ExecRequest {
        ExecRequest {
            container_id: "c1".into(),
            cmd: vec!["/bin/true".into()],
            tty,
            stdin,
            stdout,
            stderr,
        }
    }

    #[test]
    fn exec_validation_rejects_bad_stream_combinations() {
        let server = StreamingServer::new("127.0.0.1:10010");
        // TTY merges stderr: requesting it is invalid.
        assert!(server.prepare_exec(exec_request(true, true, true, true)).is_err());
        // Some stream must be requested.
        assert!(server.prepare_exec(exec_request(false, false, false, false)).is_err());

        let url = server.prepare_exec(exec_request(false, false, true, true)).unwrap();
        assert!(url.starts_with("http://127.0.0.1:10010/exec/"));
    }

    #[test]
    fn tokens_are_single_use_and_unique() {
        let server = StreamingServer::new("http://node:10010");
        let first = server.prepare_exec(exec_request(false, true, true, false)).unwrap();
        let second = server.prepare_exec(exec_request(false, true, true, false)).unwrap();
        assert_ne!(first, second);

        let token = first.rsplit('/').next().unwrap();
        assert!(matches!(server.take(token), Some(Session::Exec(_))));
        assert!(server.take(token).is_none());
    }

    #[test]
    fn attach_and_port_forward_park_sessions() {
        let server = StreamingServer::new("node:10010");
        let url = server
            .prepare_attach(AttachRequest {
                container_id: "c1".into(),
                stdin: true,
                stdout: true,
                ..AttachRequest::default()
            })
            .unwrap();
        assert!(url.contains("/attach/"));

        let url = server
            .prepare_port_forward(PortForwardRequest {
                pod_sandbox_id: "p1".into(),
                ports: vec![8080],
            })
            .unwrap();
        let token = url.rsplit('/').next().unwrap();
        assert!(matches!(
            server.take(token),
            Some(Session::PortForward(_))
        ));
    }

    #[tokio::test]
    async fn detach_sequence_stops_the_copy_cleanly() {
        let (mut client, ours) = tokio::io::duplex(64);
        let mut sink = Vec::new();
        let copy = async {
            let (reader, _keep_alive) = tokio::io::split(ours);
            copy_stdin_detachable(reader, &mut sink).await
        };
        let feed = async {
            client.write_all(b"before").await.unwrap();
            client.write_all(&[DETACH_SEQUENCE]).await.unwrap();
            client.write_all(b"after").await.unwrap();
        };
        let (outcome, ()) = tokio::join!(copy, feed);
        assert_eq!(outcome.unwrap(), StdinOutcome::Detached);
        assert_eq!(sink, b"before");
    }

    #[tokio::test]
    async fn closed_stdin_reports_eof() {
        let (client, ours) = tokio::io::duplex(64);
        drop(client);
        let (reader, _keep_alive) = tokio::io::split(ours);
        let mut sink = Vec::new();
        let outcome = copy_stdin_detachable(reader, &mut sink).await.unwrap();
        assert_eq!(outcome, StdinOutcome::Eof);
    }

    #[tokio::test]
    async fn exec_with_streams_captures_output() {
        let mut out: Vec<u8> = Vec::new();
        let code = {
            let mut command = Command::new("/bin/sh");
            command.arg("-c").arg("printf hello");
            exec_with_streams(command, None, Some(Box::new(&mut out)), None)
                .await
                .unwrap()
        };
        assert_eq!(code, 0);
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn exec_with_streams_surfaces_the_exit_code() {
        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg("exit 3");
        let code = exec_with_streams(command, None, None, None).await.unwrap();
        assert_eq!(code, 3);
    }
}

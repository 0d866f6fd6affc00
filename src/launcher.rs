//! The external launcher subprocess and its control protocol.
//!
//! Each container is created and run by one launcher invocation:
//!
//! ```text
//! launcher <instance-id>
//! ```
//!
//! with the environment carrying the bundle path, a pipe fd over which the
//! serialized OCI spec is delivered, a socketpair fd for control, and the
//! path of the instance-info file the launcher maintains. After validating
//! the bundle the launcher writes one status byte on the control socket:
//! `0x01` means created, anything else is followed by up to 1024 bytes of
//! ASCII failure reason. The runtime starts the container by writing `0x01`
//! back and closing the socket; the launcher then daemonizes, runs the
//! entrypoint, and keeps the instance-info file current (pid, timestamps,
//! exit code, attach/control socket paths).
//!
//! [`LauncherHandle`] owns the child process and the control socket. The
//! child is spawned with kill-on-drop so every error path, including panics
//! between spawn and handshake, releases the process.

use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::signal::{kill, Signal};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::cri::{ContainerState, ExecSyncResult};
use crate::error::{Error, Result};

/// Environment names of the launcher invocation contract.
const ENV_BUNDLE: &str = "SYCRI_BUNDLE_PATH";
const ENV_SPEC_FD: &str = "SYCRI_SPEC_FD";
const ENV_CONTROL_FD: &str = "SYCRI_CONTROL_FD";
const ENV_INSTANCE_INFO: &str = "SYCRI_INSTANCE_INFO";

/// Status byte meaning "created".
const STATUS_CREATED: u8 = 0x01;
/// Longest failure reason the launcher may follow a bad status with.
const MAX_REASON: usize = 1024;

/// How long the launcher gets from spawn to the created byte.
const CREATE_TIMEOUT: Duration = Duration::from_secs(60);
/// How long the launcher gets to daemonize after release.
const START_TIMEOUT: Duration = Duration::from_secs(10);

/// Factory for launcher invocations; owns the binary path and the
/// instance-info directory.
#[derive(Debug, Clone)]
pub struct Launcher {
    binary: PathBuf,
    instances_dir: PathBuf,
}

/// State file the launcher keeps per running instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub pid: i32,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub started_at: i64,
    #[serde(default)]
    pub finished_at: i64,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub exit_desc: String,
    #[serde(default)]
    pub attach_socket: PathBuf,
    #[serde(default)]
    pub control_socket: PathBuf,
    #[serde(default)]
    pub log_file: PathBuf,
}

impl InstanceInfo {
    /// Lifecycle phase implied by the timestamp tuple.
    pub fn container_state(&self) -> ContainerState {
        if self.finished_at > 0 {
            ContainerState::Exited
        } else if self.started_at > 0 {
            ContainerState::Running
        } else if self.created_at > 0 {
            ContainerState::Created
        } else {
            ContainerState::Unknown
        }
    }
}

/// A spawned launcher: the child process plus the created/start socket.
#[derive(Debug)]
pub struct LauncherHandle {
    instance_id: String,
    child: Child,
    control: Option<UnixStream>,
}

impl Launcher {
    pub fn new(binary: impl Into<PathBuf>, instances_dir: impl Into<PathBuf>) -> Self {
        Launcher {
            binary: binary.into(),
            instances_dir: instances_dir.into(),
        }
    }

    /// Probe the launcher's version string, once, at runtime construction.
    pub async fn version(&self) -> Result<String> {
        let output = Command::new(&self.binary)
            .arg("version")
            .output()
            .await
            .map_err(|e| Error::transient(format!("probing launcher version: {e}")))?;
        if !output.status.success() {
            return Err(Error::transient(format!(
                "launcher version probe: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub fn instance_info_path(&self, instance_id: &str) -> PathBuf {
        self.instances_dir.join(format!("{instance_id}.json"))
    }

    /// Read the instance file; an absent file is `None`, not an error.
    pub fn read_instance_info(&self, instance_id: &str) -> Result<Option<InstanceInfo>> {
        let raw = match std::fs::read_to_string(self.instance_info_path(instance_id)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| Error::Corrupt(format!("instance info for {instance_id}: {e}")))
    }

    /// Remove the instance file after the container is gone.
    pub fn clean_instance(&self, instance_id: &str) -> Result<()> {
        match std::fs::remove_file(self.instance_info_path(instance_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Spawn a launcher for one container bundle and wait for its created
    /// byte. On failure the child is killed and reaped before returning.
    pub async fn create(
        &self,
        instance_id: &str,
        bundle: &Path,
        spec_json: Vec<u8>,
    ) -> Result<LauncherHandle> {
        std::fs::create_dir_all(&self.instances_dir)?;

        // The child-side fds are created inheritable on purpose: the child
        // finds them at the numbers passed through the environment. The
        // parent-side ends must NOT leak into the child, or it would never
        // observe EOF on either channel.
        let (control_parent, control_child) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )?;
        let (spec_read, spec_write) = nix::unistd::pipe()?;
        fcntl(control_parent.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
        fcntl(spec_write.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;

        let child = Command::new(&self.binary)
            .arg(instance_id)
            .env(ENV_BUNDLE, bundle)
            .env(ENV_SPEC_FD, spec_read.as_raw_fd().to_string())
            .env(ENV_CONTROL_FD, control_child.as_raw_fd().to_string())
            .env(ENV_INSTANCE_INFO, self.instance_info_path(instance_id))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::transient(format!("spawning launcher: {e}")))?;

        // The child holds its own copies now.
        drop(control_child);
        drop(spec_read);

        let control = into_stream(control_parent)?;
        let mut handle = LauncherHandle {
            instance_id: instance_id.to_string(),
            child,
            control: Some(control),
        };

        // Deliver the spec, then wait for the verdict. A launcher that
        // never drains its pipe is treated the same as one that never
        // answers: killed at the deadline.
        match tokio::time::timeout(CREATE_TIMEOUT, write_spec(spec_write, spec_json)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                handle.kill_and_wait().await;
                return Err(e);
            }
            Err(_) => {
                handle.kill_and_wait().await;
                return Err(Error::Canceled);
            }
        }
        match handle.await_created().await {
            Ok(()) => Ok(handle),
            Err(e) => {
                handle.kill_and_wait().await;
                Err(e)
            }
        }
    }

    /// Run a command inside a created instance, no TTY, with a deadline.
    pub async fn exec_sync(
        &self,
        instance_id: &str,
        cmd: &[String],
        timeout: Duration,
    ) -> Result<ExecSyncResult> {
        let mut command = Command::new(&self.binary);
        command
            .arg("exec")
            .arg(instance_id)
            .arg("--")
            .args(cmd)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let run = command.output();
        let output = if timeout.is_zero() {
            run.await
        } else {
            tokio::time::timeout(timeout, run).await?
        }
        .map_err(|e| Error::transient(format!("exec in {instance_id}: {e}")))?;

        Ok(ExecSyncResult {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    /// Instruct a running launcher to reopen its log file.
    pub async fn reopen_log(&self, info: &InstanceInfo) -> Result<()> {
        control_message(&info.control_socket, &json!({"reopenLog": true})).await
    }

    /// The exec invocation for a created instance; stdio wiring is the
    /// caller's concern.
    pub fn exec_command(&self, instance_id: &str, cmd: &[String]) -> Command {
        let mut command = Command::new(&self.binary);
        command.arg("exec").arg(instance_id).arg("--").args(cmd);
        command
    }
}

impl LauncherHandle {
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// The launcher's own pid (not the container process).
    pub fn pid(&self) -> Option<i32> {
        self.child.id().map(|pid| pid as i32)
    }

    async fn await_created(&mut self) -> Result<()> {
        let control = self
            .control
            .as_mut()
            .ok_or_else(|| Error::PreconditionFailed("control socket already closed".into()))?;
        tokio::time::timeout(CREATE_TIMEOUT, read_created_status(control)).await?
    }

    /// Release the launcher to run the entrypoint: one byte, then close.
    /// The launcher daemonizes, so the spawned child exits promptly.
    pub async fn release(&mut self) -> Result<()> {
        let mut control = self
            .control
            .take()
            .ok_or_else(|| Error::PreconditionFailed("container already started".into()))?;
        control.write_all(&[STATUS_CREATED]).await?;
        control.shutdown().await?;
        drop(control);

        let status = tokio::time::timeout(START_TIMEOUT, self.child.wait())
            .await?
            .map_err(|e| Error::transient(format!("waiting for launcher: {e}")))?;
        if !status.success() {
            return Err(Error::transient(format!(
                "launcher exited with {status} while starting {}",
                self.instance_id
            )));
        }
        debug!(instance = %self.instance_id, "launcher released");
        Ok(())
    }

    /// Forcible teardown for error paths: SIGKILL and reap.
    pub async fn kill_and_wait(&mut self) {
        if let Err(e) = self.child.start_kill() {
            // Already gone is the expected benign case.
            if e.kind() != std::io::ErrorKind::InvalidInput {
                warn!(instance = %self.instance_id, error = %e, "launcher kill failed");
            }
        }
        let _ = self.child.wait().await;
        self.control.take();
    }
}

/// Read the one-byte create status and, on failure, the trailing reason.
async fn read_created_status(control: &mut UnixStream) -> Result<()> {
    let mut status = [0u8; 1];
    if let Err(e) = control.read_exact(&mut status).await {
        return Err(Error::transient(format!("launcher closed control socket: {e}")));
    }
    if status[0] == STATUS_CREATED {
        return Ok(());
    }
    let mut reason = vec![0u8; MAX_REASON];
    let n = control.read(&mut reason).await.unwrap_or(0);
    reason.truncate(n);
    Err(Error::transient(format!(
        "launcher rejected bundle: {}",
        String::from_utf8_lossy(&reason).trim()
    )))
}

/// Send a JSON control message to a running launcher's control socket.
pub async fn control_message(socket: &Path, message: &Value) -> Result<()> {
    let mut stream = UnixStream::connect(socket)
        .await
        .map_err(|e| Error::transient(format!("launcher control socket: {e}")))?;
    let mut line = message.to_string().into_bytes();
    line.push(b'\n');
    stream.write_all(&line).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Signal a launcher instance by pid. A vanished process is not an error:
/// stop paths are idempotent.
pub fn signal_instance(pid: i32, signal: Signal) -> Result<()> {
    match kill(Pid::from_raw(pid), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(errno.into()),
    }
}

fn into_stream(fd: OwnedFd) -> Result<UnixStream> {
    let stream = std::os::unix::net::UnixStream::from(fd);
    stream.set_nonblocking(true)?;
    Ok(UnixStream::from_std(stream)?)
}

/// Deliver the spec over the pipe and close it so the launcher sees EOF.
async fn write_spec(fd: OwnedFd, spec_json: Vec<u8>) -> Result<()> {
    let file = std::fs::File::from(fd);
    tokio::task::spawn_blocking(move || {
        use std::io::Write;
        let mut file = file;
        file.write_all(&spec_json)
    })
    .await
    .map_err(|e| Error::transient(format!("spec delivery task: {e}")))??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_state_follows_the_timestamp_tuple() {
        let mut info = InstanceInfo::default();
        assert_eq!(info.container_state(), ContainerState::Unknown);
        info.created_at = 100;
        assert_eq!(info.container_state(), ContainerState::Created);
        info.started_at = 200;
        assert_eq!(info.container_state(), ContainerState::Running);
        info.finished_at = 300;
        info.exit_code = Some(0);
        assert_eq!(info.container_state(), ContainerState::Exited);
    }

    #[tokio::test]
    async fn created_status_accepts_the_magic_byte() {
        let (mut ours, mut theirs) = UnixStream::pair().unwrap();
        theirs.write_all(&[STATUS_CREATED]).await.unwrap();
        read_created_status(&mut ours).await.unwrap();
    }

    #[tokio::test]
    async fn bad_status_carries_the_reason() {
        let (mut ours, mut theirs) = UnixStream::pair().unwrap();
        theirs.write_all(&[0x00]).await.unwrap();
        theirs.write_all(b"bundle validation failed").await.unwrap();
        theirs.shutdown().await.unwrap();

        let err = read_created_status(&mut ours).await.unwrap_err();
        assert!(err.to_string().contains("bundle validation failed"));
    }

    #[tokio::test]
    async fn closed_control_socket_is_transient() {
        let (mut ours, theirs) = UnixStream::pair().unwrap();
        drop(theirs);
        assert!(matches!(
            read_created_status(&mut ours).await,
            Err(Error::Transient(_))
        ));
    }

    #[test]
    fn missing_instance_info_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Launcher::new("singularity", dir.path());
        assert!(launcher.read_instance_info("absent").unwrap().is_none());

        std::fs::write(launcher.instance_info_path("broken"), "{oops").unwrap();
        assert!(matches!(
            launcher.read_instance_info("broken"),
            Err(Error::Corrupt(_))
        ));
        launcher.clean_instance("broken").unwrap();
        launcher.clean_instance("broken").unwrap();
    }

    #[tokio::test]
    async fn control_messages_arrive_newline_terminated() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("control.sock");
        let listener = tokio::net::UnixListener::bind(&socket).unwrap();

        let payload = json!({"reopenLog": true});
        let sender = control_message(&socket, &payload);
        let receiver = async {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut received = String::new();
            stream.read_to_string(&mut received).await.unwrap();
            received
        };
        let (sent, received) = tokio::join!(sender, receiver);
        sent.unwrap();
        assert_eq!(received, "{\"reopenLog\":true}\n");
    }
}

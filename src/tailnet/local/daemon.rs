//! The managed `tailscaled` child process.

use super::api::LocalClient;
use super::NodeError;
use crate::config::NodeOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// How often the LocalAPI socket is polled while tailscaled starts.
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A running tailscaled. The process is killed when this is dropped.
pub struct Daemon {
    child: Child,
    state_dir: PathBuf,
    socket: PathBuf,
}

impl Daemon {
    /// Start tailscaled in userspace-networking mode with its own state
    /// directory and LocalAPI socket.
    pub fn spawn(opts: &NodeOptions) -> Result<Self, NodeError> {
        let state_dir = state_dir(opts)?;
        std::fs::create_dir_all(&state_dir).map_err(|source| NodeError::StateDir {
            path: state_dir.clone(),
            source,
        })?;

        let socket = state_dir.join("tailscaled.sock");
        // A socket left behind by a crashed run would make us talk to nobody
        if socket.exists() {
            debug!(socket = %socket.display(), "Removing stale LocalAPI socket");
            if let Err(e) = std::fs::remove_file(&socket) {
                warn!(socket = %socket.display(), error = %e, "Could not remove stale LocalAPI socket");
            }
        }

        let mut cmd = Command::new(&opts.tailscaled_path);
        cmd.arg("--tun=userspace-networking")
            .arg(format!("--statedir={}", state_dir.display()))
            .arg(format!("--socket={}", socket.display()));
        if opts.ephemeral {
            cmd.arg("--state=mem:");
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| NodeError::Spawn {
            program: opts.tailscaled_path.clone(),
            source,
        })?;
        let pid = child.id().unwrap_or(0);
        info!(
            pid,
            state_dir = %state_dir.display(),
            ephemeral = opts.ephemeral,
            "tailscaled spawned"
        );

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr));
        }

        Ok(Self {
            child,
            state_dir,
            socket,
        })
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Poll until the LocalAPI answers. Fails if tailscaled exits first.
    pub async fn wait_ready(&mut self, client: &LocalClient) -> Result<(), NodeError> {
        loop {
            if let Some(status) = self.child.try_wait().map_err(NodeError::Wait)? {
                return Err(NodeError::Exited(status));
            }
            match client.status().await {
                Ok(status) => {
                    debug!(backend_state = %status.backend_state, "LocalAPI is up");
                    return Ok(());
                }
                Err(e) => debug!(error = %e, "Waiting for LocalAPI"),
            }
            tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
        }
    }

    /// Run `tailscale up` against this daemon.
    pub async fn up(&self, opts: &NodeOptions, authkey: Option<&AuthKey>) -> Result<(), NodeError> {
        // Held until tailscale has read it
        let staged = authkey
            .map(|key| stage_authkey(&self.state_dir, key))
            .transpose()?;

        let mut cmd = Command::new(&opts.tailscale_path);
        cmd.args(up_args(&self.socket, opts, staged.as_ref()));
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);

        info!(hostname = %opts.hostname, authkey = staged.is_some(), "Bringing node up");
        let output = cmd.output().await.map_err(|source| NodeError::Spawn {
            program: opts.tailscale_path.clone(),
            source,
        })?;

        if !output.status.success() {
            return Err(NodeError::Up {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Where `tailscale up` reads the auth key from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthKey {
    /// A file holding the key
    File(PathBuf),
    /// The key itself, from `TS_AUTHKEY`
    Value(String),
}

/// The `--auth-key` argument. It only ever names a file, so the key stays
/// out of the process list. A key given by value is written to a private
/// file that lives as long as this.
struct StagedKey {
    arg: String,
    _file: Option<NamedTempFile>,
}

fn stage_authkey(dir: &Path, key: &AuthKey) -> Result<StagedKey, NodeError> {
    match key {
        AuthKey::File(path) => Ok(StagedKey {
            arg: format!("--auth-key=file:{}", path.display()),
            _file: None,
        }),
        AuthKey::Value(value) => {
            // Created with mode 0600
            let mut file = tempfile::Builder::new()
                .prefix(".authkey")
                .tempfile_in(dir)
                .map_err(NodeError::AuthKey)?;
            file.write_all(value.as_bytes())
                .and_then(|()| file.flush())
                .map_err(NodeError::AuthKey)?;
            Ok(StagedKey {
                arg: format!("--auth-key=file:{}", file.path().display()),
                _file: Some(file),
            })
        }
    }
}

fn up_args(socket: &Path, opts: &NodeOptions, authkey: Option<&StagedKey>) -> Vec<String> {
    let mut args = vec![
        format!("--socket={}", socket.display()),
        "up".to_string(),
        format!("--hostname={}", opts.hostname),
    ];
    if let Some(key) = authkey {
        args.push(key.arg.clone());
    }
    if let Some(url) = &opts.control_url {
        args.push(format!("--login-server={}", url));
    }
    args
}

fn state_dir(opts: &NodeOptions) -> Result<PathBuf, NodeError> {
    if let Some(dir) = &opts.state_dir {
        return Ok(dir.clone());
    }
    let config_dir = dirs_next::config_dir().ok_or(NodeError::NoConfigDir)?;
    Ok(config_dir.join(format!("tsnsrv-{}", opts.hostname)))
}

async fn forward_output<R: AsyncRead + Unpin>(stream: R) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(target: "tsnsrv::tailscaled", "{}", line),
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Lost tailscaled output");
                break;
            }
        }
    }
}

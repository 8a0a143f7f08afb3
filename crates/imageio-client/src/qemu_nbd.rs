//! qemu-nbd subprocess wrapper.
//!
//! Runs a local qemu-nbd exporting an image over a private unix socket,
//! giving the transfer engine format-agnostic block access to qcow2 and
//! raw images alike. The process is killed when the guard drops.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tracing::debug;

use imageio_nbd::{NbdAddress, NbdUrl};
use imageio_proto::{Error, ImageResult};

/// How long we wait for qemu-nbd to create its socket.
const START_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Server {
    child: Child,
    socket: PathBuf,
    // Owns the socket directory for the lifetime of the server.
    _dir: tempfile::TempDir,
}

impl Server {
    /// Start qemu-nbd exporting `image`.
    ///
    /// `shared` must cover every connection the transfer engine opens,
    /// or qemu-nbd starts refusing connections mid-transfer.
    pub async fn start(
        image: &Path,
        format: &str,
        read_only: bool,
        shared: u32,
    ) -> ImageResult<Server> {
        let dir = tempfile::Builder::new()
            .prefix("imageio-nbd-")
            .tempdir()
            .map_err(Error::Io)?;
        let socket = dir.path().join("sock");

        let mut command = Command::new("qemu-nbd");
        command
            .arg("--socket")
            .arg(&socket)
            .args(["--format", format])
            .args(["--shared", &shared.to_string()])
            .args(["--cache", "none", "--aio", "native"])
            .arg("--persistent");
        if read_only {
            command.arg("--read-only");
        }
        command.arg(image);
        command.kill_on_drop(true);

        debug!("starting qemu-nbd for {:?} on {:?}", image, socket);
        let child = command
            .spawn()
            .map_err(|e| Error::Internal(format!("cannot run qemu-nbd: {e}")))?;

        let server = Server {
            child,
            socket,
            _dir: dir,
        };
        server.wait_for_socket().await?;
        Ok(server)
    }

    pub fn url(&self) -> NbdUrl {
        NbdUrl {
            address: NbdAddress::Unix(self.socket.clone()),
            export: String::new(),
        }
    }

    /// Stop the server, waiting for the process to exit.
    pub async fn stop(mut self) -> ImageResult<()> {
        debug!("stopping qemu-nbd on {:?}", self.socket);
        self.child.start_kill().ok();
        self.child
            .wait()
            .await
            .map_err(|e| Error::Internal(format!("qemu-nbd did not exit: {e}")))?;
        Ok(())
    }

    async fn wait_for_socket(&self) -> ImageResult<()> {
        let deadline = tokio::time::Instant::now() + START_TIMEOUT;
        loop {
            if UnixStream::connect(&self.socket).await.is_ok() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Internal(format!(
                    "qemu-nbd did not create socket {:?} in {:?}",
                    self.socket, START_TIMEOUT
                )));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

//! Bundled SSH port-forwarder child process.
//!
//! The agent does not implement SSH; it launches the configured forwarder
//! with the SOCKS port in argv and terminates it when the session closes.

use std::path::Path;

use tokio::process::{Child, Command};
use tracing::{info, warn};

pub struct SshForwarder {
    child: Child,
}

impl SshForwarder {
    /// Launch the forwarder. The SOCKS port is its single argument.
    pub fn spawn(command: &Path, socks_port: u16) -> std::io::Result<Self> {
        let child = Command::new(command)
            .arg(socks_port.to_string())
            .kill_on_drop(true)
            .spawn()?;
        info!(
            command = %command.display(),
            socks_port,
            pid = child.id(),
            "SSH forwarder started"
        );
        Ok(Self { child })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Kill and reap the child. Called at session teardown.
    pub async fn shutdown(mut self) {
        if let Err(e) = self.child.kill().await {
            warn!(error = %e, "failed to kill SSH forwarder");
            return;
        }
        info!("SSH forwarder stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_and_shutdown() {
        // `sleep <port>` stands in for the forwarder binary: it accepts the
        // port argument and runs until killed.
        let forwarder = SshForwarder::spawn(Path::new("sleep"), 1080).unwrap();
        assert!(forwarder.pid().is_some());
        forwarder.shutdown().await;
    }

    #[test]
    fn missing_binary_is_an_error() {
        let result = SshForwarder::spawn(Path::new("/no/such/forwarder"), 1080);
        assert!(result.is_err());
    }
}

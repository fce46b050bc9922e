//! phored process supervision.

use log::{debug, info, warn};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use super::rpc::NodeRpc;
use crate::config::WalletConfig;
use crate::error::{Error, Result};

const DEFAULT_SOCKS_PORT: u16 = 9050;

/// Grace period after asking a running daemon to stop.
pub const STOP_GRACE: Duration = Duration::from_secs(5);

pub struct Daemon {
    binary: String,
    trusted_peer: Option<String>,
    use_tor: bool,
    tor_control_port: u16,
    notify_port: u16,
    testnet: bool,
    child: Mutex<Option<Child>>,
}

impl Daemon {
    pub fn from_config(cfg: &WalletConfig) -> Self {
        Self {
            binary: cfg.binary.clone(),
            trusted_peer: cfg.trusted_peer.clone().filter(|p| !p.is_empty()),
            use_tor: cfg.use_tor,
            tor_control_port: cfg.tor_control_port,
            notify_port: cfg.notify_port,
            testnet: cfg.testnet,
            child: Mutex::new(None),
        }
    }

    /// Command line for phored.
    pub fn arguments(&self, rescan: bool) -> Vec<String> {
        let mut args = vec![
            format!("-walletnotify=curl -d %s http://localhost:{}/", self.notify_port),
            "-server".to_string(),
        ];
        if rescan {
            args.push("-rescan".into());
        }
        if self.testnet {
            args.push("-testnet".into());
        }
        args.push(format!("-torcontrol=127.0.0.1:{}", self.tor_control_port));
        if let Some(peer) = &self.trusted_peer {
            args.push(format!("-connect={}", peer));
        }
        if self.use_tor {
            args.push("-listen".into());
            args.push(format!("-proxy:127.0.0.1:{}", socks_port(self.tor_control_port)));
            args.push("-onlynet=onion".into());
        }
        args
    }

    pub async fn spawn(&self, rescan: bool) -> Result<()> {
        let args = self.arguments(rescan);
        debug!("starting {} {:?}", self.binary, args);
        let child = Command::new(&self.binary)
            .args(&args)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Daemon(format!("failed to start {}: {}", self.binary, e)))?;
        info!("spawned {} (pid {:?})", self.binary, child.id());
        *self.child.lock().await = Some(child);
        Ok(())
    }

    /// Ask the daemon to stop, then kill the child if it is still around.
    pub async fn shutdown(&self, rpc: &dyn NodeRpc) {
        if let Err(e) = rpc.stop().await {
            debug!("stop rpc failed: {}", e);
        }
        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };
        match tokio::time::timeout(STOP_GRACE, child.wait()).await {
            Ok(Ok(status)) => info!("{} exited with {}", self.binary, status),
            _ => {
                warn!("{} did not exit in time, killing it", self.binary);
                if let Err(e) = child.kill().await {
                    warn!("failed to kill {}: {}", self.binary, e);
                }
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        self.child.lock().await.is_some()
    }
}

/// Tor SOCKS port paired with a control port. 9051 and 9151 are the
/// system and browser bundle defaults; anything else gets 9050.
pub fn socks_port(control_port: u16) -> u16 {
    match control_port {
        9051 | 9151 => control_port - 1,
        _ => DEFAULT_SOCKS_PORT,
    }
}

/// Best-effort stop of a daemon left over from a previous run.
pub async fn stop_existing(rpc: &dyn NodeRpc, grace: Duration) {
    match rpc.stop().await {
        Ok(()) => info!("stopped running phored"),
        Err(e) => debug!("no running phored to stop: {}", e),
    }
    tokio::time::sleep(grace).await;
}

/// Poll `getblockcount` every `poll` until it answers. Fails with
/// `Timeout` once `deadline` passes.
pub async fn wait_until_ready(rpc: &dyn NodeRpc, poll: Duration, deadline: Duration) -> Result<i64> {
    let attempt = async {
        loop {
            match rpc.get_block_count().await {
                Ok(height) => return height,
                Err(e) => debug!("phored not ready: {}", e),
            }
            tokio::time::sleep(poll).await;
        }
    };
    tokio::time::timeout(deadline, attempt)
        .await
        .map_err(|_| Error::Timeout(format!("phored did not answer within {:?}", deadline)))
}

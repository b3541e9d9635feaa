//! Handle Owner Task
//!
//! Only one task owns the target's `Handle<TargetClientHandler>`. The inbound
//! server handler and the connection task talk to it through
//! [`HandleController`], which sends commands over an mpsc channel. This keeps
//! `Arc<Mutex<Handle>>` and locks held across `.await` out of the bridge.
//!
//! ```ignore
//! let controller = spawn_handle_owner_task(handle, closed_rx, hostname);
//! let channel = controller.open_session_channel().await?;
//! let bound_port = controller.tcpip_forward("0.0.0.0", 8080).await?;
//! ```

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::TargetClientHandler;
use super::error::SshError;

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a session channel (shell, exec, subsystem)
    ChannelOpenSession {
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Open a direct-tcpip channel on behalf of the local client
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Request remote forward (tcpip-forward)
    TcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<u32, russh::Error>>,
    },

    /// Cancel remote forward
    CancelTcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<(), russh::Error>>,
    },

    /// Disconnect the target connection
    Disconnect { reason: String },
}

/// Controller for sending commands to the Handle Owner Task
///
/// Cloning is cheap (copies the senders). Any holder has full control of the
/// target connection, so it stays inside the bridge.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    /// Fires once when the owner task stops
    disconnect_tx: broadcast::Sender<()>,
}

impl HandleController {
    /// Controller over a bare command channel, without an owner task
    pub fn new(cmd_tx: mpsc::Sender<HandleCommand>) -> Self {
        let (disconnect_tx, _) = broadcast::channel(1);
        Self {
            cmd_tx,
            disconnect_tx,
        }
    }

    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    /// Resolves once the owner task has stopped, including when it already has.
    pub async fn closed(&self) {
        let mut rx = self.subscribe_disconnect();
        // The owner closes its command queue before broadcasting, so either the
        // check sees it closed or the broadcast reaches `rx`.
        if !self.is_connected() {
            return;
        }
        let _ = rx.recv().await;
    }

    /// Open a session channel on the target
    pub async fn open_session_channel(&self) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenSession { reply_tx })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    /// Open a direct-tcpip channel on the target
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    /// Request remote port forward (tcpip-forward)
    ///
    /// Returns the actual bound port (may differ if requested port was 0)
    pub async fn tcpip_forward(&self, address: &str, port: u32) -> Result<u32, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::TcpipForward {
                address: address.to_string(),
                port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ConnectionFailed(e.to_string()))
    }

    /// Cancel a remote port forward
    pub async fn cancel_tcpip_forward(&self, address: &str, port: u32) -> Result<(), SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::CancelTcpipForward {
                address: address.to_string(),
                port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ConnectionFailed(e.to_string()))
    }

    /// Disconnect the target connection
    pub async fn disconnect(&self, reason: &str) {
        let _ = self
            .cmd_tx
            .send(HandleCommand::Disconnect {
                reason: reason.to_string(),
            })
            .await;
    }

    /// Check if the Handle Owner Task is still running
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Spawn the Handle Owner Task
///
/// Takes ownership of the handle. The task stops when a `Disconnect` command
/// arrives, when every controller is dropped, or when `closed_rx` fires because
/// the target session ended.
pub fn spawn_handle_owner_task(
    handle: Handle<TargetClientHandler>,
    closed_rx: oneshot::Receiver<()>,
    hostname: String,
) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let (disconnect_tx, _) = broadcast::channel::<()>(1);
    let disconnect_tx_clone = disconnect_tx.clone();

    tokio::spawn(async move {
        let mut handle = handle; // Sole owner from here on
        let mut closed_rx = closed_rx;
        let mut reason = String::from("Session closed");

        debug!("Handle owner task started for {}", hostname);

        loop {
            let cmd = tokio::select! {
                cmd = cmd_rx.recv() => cmd,
                _ = &mut closed_rx => {
                    info!("Target SSH session ended for {}", hostname);
                    break;
                }
            };

            match cmd {
                Some(HandleCommand::ChannelOpenSession { reply_tx }) => {
                    let result = handle.channel_open_session().await;
                    if reply_tx.send(result).is_err() {
                        warn!("Caller dropped before receiving channel_open_session result");
                    }
                }

                Some(HandleCommand::ChannelOpenDirectTcpip {
                    host,
                    port,
                    originator_host,
                    originator_port,
                    reply_tx,
                }) => {
                    let result = handle
                        .channel_open_direct_tcpip(&host, port, &originator_host, originator_port)
                        .await;
                    if reply_tx.send(result).is_err() {
                        warn!("Caller dropped before receiving direct_tcpip result");
                    }
                }

                Some(HandleCommand::TcpipForward {
                    address,
                    port,
                    reply_tx,
                }) => {
                    let result = handle.tcpip_forward(&address, port).await;
                    match &result {
                        Ok(bound_port) => {
                            let bound_port = *bound_port;
                            if reply_tx.send(result).is_err() {
                                // Nobody will relay this forward, don't leave it bound on the target
                                warn!(
                                    "Caller dropped after tcpip_forward succeeded. \
                                     Cancelling orphaned forward {}:{}",
                                    address, bound_port
                                );
                                let _ = handle.cancel_tcpip_forward(&address, bound_port).await;
                            }
                        }
                        Err(_) => {
                            let _ = reply_tx.send(result);
                        }
                    }
                }

                Some(HandleCommand::CancelTcpipForward {
                    address,
                    port,
                    reply_tx,
                }) => {
                    let result = handle.cancel_tcpip_forward(&address, port).await;
                    if reply_tx.send(result).is_err() {
                        warn!("Caller dropped before receiving cancel_tcpip_forward result");
                    }
                }

                Some(HandleCommand::Disconnect { reason: why }) => {
                    debug!("Disconnect requested for {}: {}", hostname, why);
                    reason = why;
                    break;
                }

                None => {
                    debug!("All controllers dropped for {}", hostname);
                    break;
                }
            }
        }

        // Close the queue before notifying, `HandleController::closed` relies on this order
        drain_pending_commands(&mut cmd_rx);
        let _ = disconnect_tx_clone.send(());

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, &reason, "en")
            .await;
        debug!("Handle owner task terminated for {}", hostname);
    });

    HandleController {
        cmd_tx,
        disconnect_tx,
    }
}

/// Drain all pending commands, returning Disconnected error to each
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenSession { reply_tx } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::TcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::CancelTcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Disconnect { .. } => {}
        }
    }
}

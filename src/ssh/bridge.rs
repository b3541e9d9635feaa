//! Per-channel relay between the inbound SSH session and the target session
//!
//! Each bridged channel gets one pump task. The pump owns both channel halves,
//! so data, EOF and close travel in order within the channel. Channel requests
//! arrive through the inbound server handler's callbacks, so the handler looks
//! the pump up in a shared [`ChannelRegistry`] and hands them over.

use std::sync::Arc;

use dashmap::DashMap;
use russh::{client, server, Channel, ChannelId, ChannelMsg, Pty, Sig};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// A channel request from the local client, to be replayed on the target channel
#[derive(Debug, Clone)]
pub enum ChannelRequest {
    Pty {
        term: String,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: Vec<(Pty, u32)>,
    },
    Shell,
    Exec(Vec<u8>),
    Subsystem(String),
    Env {
        name: String,
        value: String,
    },
    WindowChange {
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    },
    Signal(Sig),
}

/// Inbound channel id -> its pump's request queue
pub type ChannelRegistry = Arc<DashMap<ChannelId, mpsc::UnboundedSender<ChannelRequest>>>;

pub fn new_channel_registry() -> ChannelRegistry {
    Arc::new(DashMap::new())
}

/// Start relaying between `inbound` and `target`.
///
/// The channel is registered before this returns, so requests for it that
/// arrive right after the open are not lost.
pub fn spawn_channel_bridge(
    inbound: Channel<server::Msg>,
    target: Channel<client::Msg>,
    server_handle: server::Handle,
    registry: ChannelRegistry,
) -> JoinHandle<()> {
    let id = inbound.id();
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    registry.insert(id, request_tx);

    tokio::spawn(async move {
        pump(inbound, target, server_handle, request_rx).await;
        registry.remove(&id);
        debug!(channel = ?id, "Channel bridge finished");
    })
}

async fn pump(
    mut inbound: Channel<server::Msg>,
    mut target: Channel<client::Msg>,
    server_handle: server::Handle,
    mut request_rx: mpsc::UnboundedReceiver<ChannelRequest>,
) {
    let id = inbound.id();

    loop {
        tokio::select! {
            msg = target.wait() => {
                match msg {
                    Some(ChannelMsg::Data { data }) => {
                        if let Err(e) = inbound.data(&data[..]).await {
                            debug!(channel = ?id, "Inbound write failed: {}", e);
                            let _ = target.close().await;
                            break;
                        }
                    }
                    Some(ChannelMsg::ExtendedData { data, ext }) => {
                        if let Err(e) = inbound.extended_data(ext, &data[..]).await {
                            debug!(channel = ?id, "Inbound write failed: {}", e);
                            let _ = target.close().await;
                            break;
                        }
                    }
                    Some(ChannelMsg::Eof) => {
                        let _ = inbound.eof().await;
                    }
                    Some(ChannelMsg::Success) => {
                        let _ = server_handle.channel_success(id).await;
                    }
                    Some(ChannelMsg::Failure) => {
                        let _ = server_handle.channel_failure(id).await;
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        let _ = server_handle.exit_status_request(id, exit_status).await;
                    }
                    Some(ChannelMsg::ExitSignal {
                        signal_name,
                        core_dumped,
                        error_message,
                        lang_tag,
                    }) => {
                        let _ = server_handle
                            .exit_signal_request(id, signal_name, core_dumped, error_message, lang_tag)
                            .await;
                    }
                    Some(ChannelMsg::Close) | None => {
                        trace!(channel = ?id, "Target closed channel");
                        let _ = inbound.close().await;
                        break;
                    }
                    Some(other) => {
                        trace!(channel = ?id, "Ignoring target channel message {:?}", other);
                    }
                }
            }

            msg = inbound.wait() => {
                match msg {
                    Some(ChannelMsg::Data { data }) => {
                        if let Err(e) = target.data(&data[..]).await {
                            debug!(channel = ?id, "Target write failed: {}", e);
                            let _ = inbound.close().await;
                            break;
                        }
                    }
                    Some(ChannelMsg::ExtendedData { data, ext }) => {
                        if let Err(e) = target.extended_data(ext, &data[..]).await {
                            debug!(channel = ?id, "Target write failed: {}", e);
                            let _ = inbound.close().await;
                            break;
                        }
                    }
                    Some(ChannelMsg::Eof) => {
                        let _ = target.eof().await;
                    }
                    Some(ChannelMsg::Close) | None => {
                        trace!(channel = ?id, "Local client closed channel");
                        let _ = target.close().await;
                        break;
                    }
                    // Requests are delivered through the handler callbacks instead
                    Some(_) => {}
                }
            }

            Some(request) = request_rx.recv() => {
                if let Err(e) = forward_request(&target, request).await {
                    warn!(channel = ?id, "Failed to forward channel request: {}", e);
                    let _ = server_handle.channel_failure(id).await;
                }
            }
        }
    }
}

/// Replay one request on the target channel. Requests that carry a reply ask
/// the target for one, and the pump relays it back.
async fn forward_request(
    target: &Channel<client::Msg>,
    request: ChannelRequest,
) -> Result<(), russh::Error> {
    match request {
        ChannelRequest::Pty {
            term,
            col_width,
            row_height,
            pix_width,
            pix_height,
            modes,
        } => {
            target
                .request_pty(true, &term, col_width, row_height, pix_width, pix_height, &modes)
                .await
        }
        ChannelRequest::Shell => target.request_shell(true).await,
        ChannelRequest::Exec(command) => target.exec(true, command).await,
        ChannelRequest::Subsystem(name) => target.request_subsystem(true, name.as_str()).await,
        ChannelRequest::Env { name, value } => {
            target.set_env(false, name.as_str(), value.as_str()).await
        }
        ChannelRequest::WindowChange {
            col_width,
            row_height,
            pix_width,
            pix_height,
        } => {
            target
                .window_change(col_width, row_height, pix_width, pix_height)
                .await
        }
        ChannelRequest::Signal(sig) => target.signal(sig).await,
    }
}

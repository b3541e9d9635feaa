//! SSH module - protocol plumbing for the VNet bridge
//!
//! Built on russh, used on both sides of the bridge.
//!
//! # Features
//! - Outbound certificate-authenticated client to the target node
//! - Handle owner task serialising access to the target client handle
//! - Inbound server handler that authenticates by dialing the target
//! - Per-channel relay of data, EOF, close, exit status and channel requests
//! - Remote port forwarding relayed in both directions

mod bridge;
mod client;
mod error;
mod handle_owner;
mod server;

pub use bridge::{new_channel_registry, spawn_channel_bridge, ChannelRegistry, ChannelRequest};
pub use client::{
    connect_target, target_client_config, ForwardedChannel, TargetClientHandler, TargetConnection,
};
pub use error::SshError;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController};
pub use server::{InboundEvent, InboundHandler, TargetConnector};

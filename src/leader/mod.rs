//! The control-plane leader service.
//!
//! Provides:
//! - RPC framing and the `cplane-config-leader-v1` envelope
//! - Per-peer connection state machines over the non-blocking socket
//! - Follower handles with lazily opened rings and FIFO outboxes
//! - The leader core tying configuration, graph, and fan-out together

pub mod core;
pub mod follower;
pub mod ipc;
pub mod peer;

pub use self::core::{Leader, LeaderError, LeaderOptions, SetupError, SetupFn};
pub use follower::{Follower, MAX_OUTBOX_FRAMES};
pub use ipc::{
    decode_request, encode_response, frame, ErrorPayload, Request, Response, ResponsePayload,
    RpcError, MAX_PAYLOAD_LEN, PROTOCOL,
};
pub use peer::{Peer, PeerState, Progress};

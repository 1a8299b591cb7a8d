//! Packet-oriented messaging over an unreliable datagram transport.
//!
//! The runtime ferries small self-describing packets between endpoints. Each
//! packet carries a metadata map and an opaque body; on the server, the
//! `_tgt` metadata key selects a *target* - a named queue of callbacks that
//! compose the response. A built-in `relay` target forwards packets between
//! clients through the server.
//!
//! Processing is organized as a two-stage pipeline:
//! * [`pipeline::DataPipeline`] - ordered byte-level transforms, run on raw
//!   datagrams. Two chains are standard: `_in_` (wire bytes -> decodable
//!   bytes) and `_out_` (encoded bytes -> wire bytes). This is where
//!   transport encryption plugs in.
//! * [`pipeline::PacketPipeline`] - per-target callback queues, run on
//!   decoded packets.
//!
//! Data flow for one incoming datagram on the server:
//!
//! ```ascii
//! throttle.read -> `_in_` transforms -> packet decode -> target callbacks
//!     -> response writer -> `_out_` transforms -> throttle.write
//! ```
//!
//! Outgoing client packets only run `_out_` before the throttled write. All
//! socket I/O goes through a [`throttle::Throttle`], which paces reads and
//! writes to a configured packet rate.
//!
//! The [`crypto::Crypto`] extension installs ECDH (NIST P-256) key exchange
//! targets and AES-256-GCM transforms into these seams, providing transport
//! encryption between endpoints sharing a key and end-to-end encryption for
//! relayed client-to-client traffic.
//!
//! Delivery is at-most-once with no ordering guarantees; reliability,
//! congestion control and authentication beyond key continuity are out of
//! scope.

pub mod client;
pub mod crypto;
pub mod packet;
pub mod pipeline;
pub mod server;
pub mod throttle;

mod util;

pub use client::{Client, ClientConfig, UdpClient};
pub use crypto::{Crypto, KEY_NO_CRYPTO, TARGET_KEX_CLIENT, TARGET_KEX_SERVER};
pub use packet::{
    JsonPacket, JsonPacketCreator, Packet, PacketCreator, PacketWriter, KEY_MSG, KEY_REF,
    KEY_STATUS, KEY_TARGET,
};
pub use pipeline::{
    DataPipeline, PacketPipeline, Processor, Status, TargetCtx, TransformContext, PIPELINE_IN,
    PIPELINE_OUT,
};
pub use server::{
    Server, ServerConfig, TcpServer, UdpServer, KEY_RELAY_FROM, KEY_RELAY_TO, TARGET_RELAY,
};
pub use throttle::{Rate, Throttle, UdpThrottle, RATE_100, RATE_100K, RATE_10K, RATE_1K};

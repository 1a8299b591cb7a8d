mod tcp_server;
mod udp_server;

pub use tcp_server::TcpServer;
pub use udp_server::{ServerConfig, UdpServer};

use async_trait::async_trait;

use crate::pipeline::Processor;

/// Name of the built-in target that forwards packets between clients.
pub const TARGET_RELAY: &str = "relay";

/// Metadata key naming the address a relayed packet is forwarded to.
pub const KEY_RELAY_TO: &str = "_relay_to";

/// Metadata key the server sets on forwarded packets, naming the original
/// sender.
pub const KEY_RELAY_FROM: &str = "_relay_from";

/// Dispatches incoming packets to target callback queues and responds.
///
/// Every decoded packet invokes the target named by its `_tgt` metadata
/// entry; the target's callbacks compose a response which the server returns
/// to the sender (or re-routes, for relays). Errors the sender can be told
/// about are answered with error packets; the server itself keeps serving.
///
/// Extensions hook in through the [`Processor`] seam: byte-level transforms
/// on the data pipelines and targets on the packet pipeline.
#[async_trait]
pub trait Server: Processor + Send + Sync {
    /// Runs the accept/dispatch/respond loops. Blocks until reading from the
    /// connection fails, which is the server's terminal condition; the error
    /// is returned after the outbound workers have been wound down.
    async fn serve(&self) -> anyhow::Result<()>;
}

mod udp_client;

pub use udp_client::{ClientConfig, UdpClient};

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::packet::Packet;
use crate::pipeline::Processor;

/// Issues requests to a server and demultiplexes the responses.
///
/// Each request carries a `_ref` fingerprint; the response bearing the same
/// fingerprint is delivered on the sink registered at send time. Incoming
/// packets without a pending fingerprint (server-relayed traffic) go to the
/// client's miscellaneous sink instead.
#[async_trait]
pub trait Client: Processor + Send + Sync {
    /// Sends `pkt` through the underlying connection, registering `resp` to
    /// receive the response.
    ///
    /// A missing `_ref` is generated. Returns once the packet is encoded and
    /// queued for writing; it does not wait for the response. Errors are
    /// local (encode failure, outbound pipeline reject) - remote errors
    /// arrive as packets on `resp` with `_stat` set to `-1`, so callers must
    /// inspect the status of whatever the sink yields.
    async fn send(
        &self,
        pkt: Box<dyn Packet>,
        resp: oneshot::Sender<Box<dyn Packet>>,
    ) -> anyhow::Result<()>;

    /// Stops the client's workers and releases its resources. The client
    /// must not be used afterwards.
    async fn cleanup(&self);
}

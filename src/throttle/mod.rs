mod udp_throttle;

pub use udp_throttle::{ThrottledSocket, UdpThrottle};

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::BytesMut;

/// Throttle throughput, measured in data packets per second.
pub type Rate = u64;

pub const RATE_100: Rate = 100;
pub const RATE_1K: Rate = 1_000;
pub const RATE_10K: Rate = 10_000;
pub const RATE_100K: Rate = 100_000;

/// Rate-paced, concurrency-safe packet I/O over a connection.
///
/// Every read and write operation takes at least `1/rate` seconds, where
/// `rate` is the current throughput. The owner can retune the throughput at
/// any time; operations already in flight finish at the old pace.
///
/// The throttle does not own the underlying connection; the creator of the
/// connection is responsible for closing it.
#[async_trait]
pub trait Throttle: Send + Sync + 'static {
    fn throughput(&self) -> Rate;

    fn set_throughput(&self, rate: Rate);

    /// Multiplies the current throughput by `f`.
    fn scale_throughput(&self, f: u32);

    /// Reads one packet from the underlying connection, returning the data
    /// and the sender address. Read failures on the connection surface here
    /// as errors; callers decide whether they are fatal.
    async fn read(&self) -> anyhow::Result<(BytesMut, SocketAddr)>;

    /// Writes `data` as one packet to `to`, returning the number of bytes
    /// written. Blocks while the internal send queue is full.
    async fn write(&self, data: Vec<u8>, to: SocketAddr) -> anyhow::Result<usize>;

    /// Posts a cancel token to each worker and releases the throttle's
    /// resources. Pending operations fail once the queues drain.
    async fn shutdown(&self);
}

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::BytesMut;
#[cfg(test)]
use mockall::automock;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, error};

use crate::throttle::{Rate, Throttle};

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Capacity of the internal read and write queues. Producers block when a
/// queue is full.
const QUEUE_CAPACITY: usize = 100;

/// Abstraction over the datagram socket behind a throttle, introduced to
/// facilitate mocking the I/O part away for testing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ThrottledSocket: Send + Sync + 'static {
    /// Receives one datagram into `buf`, returning the sender address.
    async fn recv_packet(&self, buf: &mut BytesMut) -> io::Result<SocketAddr>;

    /// Sends `data` as one datagram to `to`.
    async fn send_packet(&self, data: &[u8], to: SocketAddr) -> io::Result<usize>;
}

#[async_trait]
impl ThrottledSocket for UdpSocket {
    async fn recv_packet(&self, buf: &mut BytesMut) -> io::Result<SocketAddr> {
        self.recv_buf_from(buf).await.map(|(_, from)| from)
    }

    async fn send_packet(&self, data: &[u8], to: SocketAddr) -> io::Result<usize> {
        self.send_to(data, to).await
    }
}

/// rate and its derived time-per-operation, shared with the workers
struct Pacing {
    rate: AtomicU64,
    tpo_nanos: AtomicU64,
}

impl Pacing {
    fn new(rate: Rate) -> Pacing {
        let pacing = Pacing {
            rate: AtomicU64::new(0),
            tpo_nanos: AtomicU64::new(0),
        };
        pacing.set_rate(rate);
        pacing
    }

    fn set_rate(&self, rate: Rate) {
        let rate = rate.max(1);
        self.rate.store(rate, Ordering::Release);
        self.tpo_nanos.store(NANOS_PER_SEC / rate, Ordering::Release);
    }

    /// Sleeps out the remainder of the operation's time slot. The slot
    /// length is read per call, so retuning the rate only affects
    /// operations that start afterwards.
    async fn pace(&self, elapsed: Duration) {
        let tpo = Duration::from_nanos(self.tpo_nanos.load(Ordering::Acquire));
        if let Some(remaining) = tpo.checked_sub(elapsed) {
            tokio::time::sleep(remaining).await;
        }
    }
}

type ReadResult = anyhow::Result<(BytesMut, SocketAddr)>;

struct WriteRequest {
    data: Vec<u8>,
    to: SocketAddr,
    status: oneshot::Sender<io::Result<usize>>,
}

/// [`Throttle`] over a datagram socket.
///
/// Two workers run for the lifetime of the throttle: a reader filling a
/// bounded queue from the socket and a writer draining a bounded queue to
/// it. Each worker times its operation and sleeps out the remainder of
/// `1/rate` seconds, so reads and writes are paced independently. Waiting
/// for work counts toward an operation's time slot.
pub struct UdpThrottle {
    pacing: Arc<Pacing>,
    recv: Mutex<mpsc::Receiver<ReadResult>>,
    send: mpsc::Sender<WriteRequest>,
    cancel: Vec<mpsc::Sender<()>>,
}

impl UdpThrottle {
    /// Wraps `socket`, reading datagrams of up to `read_buf_size` bytes.
    pub fn new(rate: Rate, socket: Arc<dyn ThrottledSocket>, read_buf_size: usize) -> UdpThrottle {
        let pacing = Arc::new(Pacing::new(rate));
        let (read_tx, read_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (write_tx, write_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (read_cancel_tx, read_cancel_rx) = mpsc::channel(1);
        let (write_cancel_tx, write_cancel_rx) = mpsc::channel(1);

        tokio::spawn(read_loop(
            socket.clone(),
            pacing.clone(),
            read_tx,
            read_cancel_rx,
            read_buf_size,
        ));
        tokio::spawn(write_loop(socket, pacing.clone(), write_rx, write_cancel_rx));

        UdpThrottle {
            pacing,
            recv: Mutex::new(read_rx),
            send: write_tx,
            cancel: vec![read_cancel_tx, write_cancel_tx],
        }
    }
}

#[async_trait]
impl Throttle for UdpThrottle {
    fn throughput(&self) -> Rate {
        self.pacing.rate.load(Ordering::Acquire)
    }

    fn set_throughput(&self, rate: Rate) {
        self.pacing.set_rate(rate);
    }

    fn scale_throughput(&self, f: u32) {
        let rate = self.pacing.rate.load(Ordering::Acquire);
        self.pacing.set_rate(rate.saturating_mul(f as u64));
    }

    async fn read(&self) -> anyhow::Result<(BytesMut, SocketAddr)> {
        match self.recv.lock().await.recv().await {
            Some(result) => result,
            None => Err(anyhow!("throttle is shut down")),
        }
    }

    async fn write(&self, data: Vec<u8>, to: SocketAddr) -> anyhow::Result<usize> {
        let (status_tx, status_rx) = oneshot::channel();
        self.send
            .send(WriteRequest {
                data,
                to,
                status: status_tx,
            })
            .await
            .map_err(|_| anyhow!("throttle is shut down"))?;
        let written = status_rx
            .await
            .map_err(|_| anyhow!("throttle is shut down"))??;
        Ok(written)
    }

    async fn shutdown(&self) {
        for cancel in &self.cancel {
            let _ = cancel.send(()).await;
        }
    }
}

async fn read_loop(
    socket: Arc<dyn ThrottledSocket>,
    pacing: Arc<Pacing>,
    out: mpsc::Sender<ReadResult>,
    mut cancel: mpsc::Receiver<()>,
    read_buf_size: usize,
) {
    loop {
        let start = Instant::now();
        let mut buf = BytesMut::with_capacity(read_buf_size);
        let result = tokio::select! {
            _ = cancel.recv() => {
                debug!("read worker cancelled");
                return;
            }
            result = socket.recv_packet(&mut buf) => result,
        };
        let item = result
            .map(|from| (buf, from))
            .map_err(anyhow::Error::from);
        if out.send(item).await.is_err() {
            // throttle dropped
            return;
        }
        pacing.pace(start.elapsed()).await;
    }
}

async fn write_loop(
    socket: Arc<dyn ThrottledSocket>,
    pacing: Arc<Pacing>,
    mut input: mpsc::Receiver<WriteRequest>,
    mut cancel: mpsc::Receiver<()>,
) {
    loop {
        let start = Instant::now();
        let request = tokio::select! {
            _ = cancel.recv() => {
                debug!("write worker cancelled");
                return;
            }
            request = input.recv() => match request {
                Some(request) => request,
                None => return,
            },
        };
        let result = socket.send_packet(&request.data, request.to).await;
        if let Err(e) = &result {
            error!("error sending packet to {:?}: {}", request.to, e);
        }
        let _ = request.status.send(result);
        pacing.pace(start.elapsed()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::throttle::{RATE_100, RATE_100K, RATE_10K, RATE_1K};

    async fn loopback_throttle(rate: Rate) -> (UdpThrottle, SocketAddr) {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();
        (UdpThrottle::new(rate, socket, 4096), addr)
    }

    #[tokio::test]
    async fn test_write_then_read_roundtrip() {
        let (throttle, addr) = loopback_throttle(RATE_10K).await;

        let written = throttle.write(b"ping".to_vec(), addr).await.unwrap();
        assert_eq!(written, 4);

        let (data, from) = throttle.read().await.unwrap();
        assert_eq!(&data[..], b"ping");
        assert_eq!(from, addr);
    }

    #[tokio::test]
    async fn test_datagram_boundaries_preserved() {
        let (throttle, addr) = loopback_throttle(RATE_10K).await;

        throttle.write(b"one".to_vec(), addr).await.unwrap();
        throttle.write(b"two".to_vec(), addr).await.unwrap();

        let (first, _) = throttle.read().await.unwrap();
        let (second, _) = throttle.read().await.unwrap();
        assert_eq!(&first[..], b"one");
        assert_eq!(&second[..], b"two");
    }

    #[tokio::test]
    async fn test_pacing_lower_bound() {
        let (throttle, addr) = loopback_throttle(RATE_100).await;

        let start = std::time::Instant::now();
        for _ in 0..10 {
            throttle.write(b"x".to_vec(), addr).await.unwrap();
        }
        let elapsed = start.elapsed();
        // 10 operations at 100/s take at least 9 full slots
        assert!(elapsed >= Duration::from_millis(90), "took {:?}", elapsed);
        assert!(elapsed <= Duration::from_secs(1), "took {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_throughput_retuning() {
        let (throttle, _) = loopback_throttle(RATE_1K).await;
        assert_eq!(throttle.throughput(), RATE_1K);

        throttle.set_throughput(RATE_100K);
        assert_eq!(throttle.throughput(), RATE_100K);

        throttle.scale_throughput(10);
        assert_eq!(throttle.throughput(), RATE_100K * 10);
    }

    #[tokio::test]
    async fn test_write_error_returned_to_caller() {
        let mut socket = MockThrottledSocket::new();
        socket
            .expect_recv_packet()
            .returning(|_| Err(io::Error::other("socket closed")));
        socket
            .expect_send_packet()
            .returning(|_, _| Err(io::Error::other("send failed")));

        let throttle = UdpThrottle::new(RATE_100, Arc::new(socket), 4096);
        let to: SocketAddr = "127.0.0.1:16000".parse().unwrap();
        let err = throttle.write(b"x".to_vec(), to).await.unwrap_err();
        assert!(err.to_string().contains("send failed"));
    }

    #[tokio::test]
    async fn test_read_error_surfaces_as_value() {
        let mut socket = MockThrottledSocket::new();
        socket
            .expect_recv_packet()
            .returning(|_| Err(io::Error::other("socket closed")));

        let throttle = UdpThrottle::new(RATE_100, Arc::new(socket), 4096);
        let err = throttle.read().await.unwrap_err();
        assert!(err.to_string().contains("socket closed"));
    }

    #[tokio::test]
    async fn test_shutdown_stops_workers() {
        let (throttle, addr) = loopback_throttle(RATE_10K).await;
        throttle.shutdown().await;

        // queues drain, then operations fail
        let mut writes_failed = false;
        for _ in 0..3 {
            if throttle.write(b"x".to_vec(), addr).await.is_err() {
                writes_failed = true;
                break;
            }
        }
        assert!(writes_failed);
    }
}

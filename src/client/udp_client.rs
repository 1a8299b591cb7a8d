use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::BytesMut;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, trace};

use crate::client::Client;
use crate::packet::{Packet, PacketCreator, KEY_REF};
use crate::pipeline::{DataPipeline, PacketPipeline, Processor, Status, TransformContext};
use crate::throttle::{Rate, Throttle, UdpThrottle};
use crate::util::random::{gen_ref, REF_LEN};

const WRITE_QUEUE_CAPACITY: usize = 100;
const MISC_QUEUE_CAPACITY: usize = 100;

#[derive(Debug)]
pub struct ClientConfig {
    /// The server all packets are written to.
    pub server_addr: SocketAddr,

    /// Local bind address; defaults to an ephemeral port on all interfaces.
    pub listen_addr: Option<SocketAddr>,

    /// Size of the datagram receive buffer.
    pub read_buf_size: usize,

    /// Pace of the underlying socket, in packets per second.
    pub throttle_rate: Rate,
}

impl ClientConfig {
    pub fn new(server_addr: SocketAddr, throttle_rate: Rate) -> ClientConfig {
        ClientConfig {
            server_addr,
            listen_addr: None,
            read_buf_size: 4096,
            throttle_rate,
        }
    }
}

struct OutboundWrite {
    data: Vec<u8>,
    pkt_ref: String,
}

struct ClientShared {
    server_addr: SocketAddr,
    pc: Arc<dyn PacketCreator>,
    throttle: Arc<dyn Throttle>,
    data_pipeline: DataPipeline,
    packet_pipeline: PacketPipeline,
    requests: RwLock<FxHashMap<String, oneshot::Sender<Box<dyn Packet>>>>,
    misc_tx: mpsc::Sender<Box<dyn Packet>>,
}

/// [`Client`] over a UDP socket.
///
/// Two workers run for the lifetime of the client: a receive loop that
/// spawns a task per incoming datagram (a slow response sink never blocks
/// the demultiplexer) and a write loop draining the outbound queue through
/// the throttle.
pub struct UdpClient {
    shared: Arc<ClientShared>,
    write_tx: mpsc::Sender<OutboundWrite>,
    misc_rx: std::sync::Mutex<Option<mpsc::Receiver<Box<dyn Packet>>>>,
    cancel: Vec<mpsc::Sender<()>>,
    local_addr: SocketAddr,
}

impl UdpClient {
    pub async fn new(config: ClientConfig, pc: Arc<dyn PacketCreator>) -> anyhow::Result<UdpClient> {
        let listen_addr = config
            .listen_addr
            .unwrap_or_else(|| "0.0.0.0:0".parse().expect("valid bind address"));
        let socket = Arc::new(UdpSocket::bind(listen_addr).await?);
        let local_addr = socket.local_addr()?;
        let throttle: Arc<dyn Throttle> = Arc::new(UdpThrottle::new(
            config.throttle_rate,
            socket,
            config.read_buf_size,
        ));

        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
        let (misc_tx, misc_rx) = mpsc::channel(MISC_QUEUE_CAPACITY);
        let (recv_cancel_tx, recv_cancel_rx) = mpsc::channel(1);
        let (write_cancel_tx, write_cancel_rx) = mpsc::channel(1);

        let shared = Arc::new(ClientShared {
            server_addr: config.server_addr,
            pc,
            throttle,
            data_pipeline: DataPipeline::new(),
            packet_pipeline: PacketPipeline::new(),
            requests: RwLock::new(FxHashMap::default()),
            misc_tx,
        });

        tokio::spawn(recv_loop(shared.clone(), recv_cancel_rx));
        tokio::spawn(write_loop(shared.clone(), write_rx, write_cancel_rx));

        Ok(UdpClient {
            shared,
            write_tx,
            misc_rx: std::sync::Mutex::new(Some(misc_rx)),
            cancel: vec![recv_cancel_tx, write_cancel_tx],
            local_addr,
        })
    }

    /// The local address the client's socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The sink for incoming packets that match no pending request, e.g.
    /// packets relayed from other clients. May be taken once.
    pub fn misc(&self) -> Option<mpsc::Receiver<Box<dyn Packet>>> {
        self.misc_rx.lock().unwrap().take()
    }
}

impl Processor for UdpClient {
    fn data_processor(&self) -> &DataPipeline {
        &self.shared.data_pipeline
    }

    fn packet_processor(&self) -> &PacketPipeline {
        &self.shared.packet_pipeline
    }
}

#[async_trait]
impl Client for UdpClient {
    async fn send(
        &self,
        mut pkt: Box<dyn Packet>,
        resp: oneshot::Sender<Box<dyn Packet>>,
    ) -> anyhow::Result<()> {
        let pkt_ref = match pkt.meta(KEY_REF) {
            Some(existing) if !existing.is_empty() => existing.to_string(),
            _ => {
                let generated = gen_ref(REF_LEN);
                pkt.set_meta(KEY_REF, &generated);
                generated
            }
        };

        let bin = pkt.marshal()?;
        let mut ctx = TransformContext::outbound(pkt.as_ref());
        let bin = self
            .shared
            .data_pipeline
            .process(&mut ctx, BytesMut::from(&bin[..]))
            .map_err(|e| anyhow!("data pipeline error: {}", e))?;
        if ctx.stat == Status::StopNoop {
            bail!("data pipeline enforced noop");
        }

        // register before queueing so a fast response cannot miss its sink;
        // re-using an in-flight ref displaces the previous sink
        self.shared
            .requests
            .write()
            .await
            .insert(pkt_ref.clone(), resp);

        self.write_tx
            .send(OutboundWrite {
                data: bin.to_vec(),
                pkt_ref,
            })
            .await
            .map_err(|_| anyhow!("client is shut down"))?;
        Ok(())
    }

    async fn cleanup(&self) {
        for cancel in &self.cancel {
            let _ = cancel.send(()).await;
        }
        self.shared.throttle.shutdown().await;
    }
}

async fn recv_loop(shared: Arc<ClientShared>, mut cancel: mpsc::Receiver<()>) {
    loop {
        let result = tokio::select! {
            _ = cancel.recv() => return,
            result = shared.throttle.read() => result,
        };
        match result {
            Ok((data, from)) => {
                let shared = shared.clone();
                tokio::spawn(async move {
                    process_incoming(shared, data, from).await;
                });
            }
            Err(e) => {
                // read errors are not fatal for a client; the next datagram
                // may well be fine
                debug!("client read error: {}", e);
            }
        }
    }
}

async fn process_incoming(shared: Arc<ClientShared>, data: BytesMut, from: SocketAddr) {
    let mut ctx = TransformContext::inbound(from);
    let data = match shared.data_pipeline.process(&mut ctx, data) {
        Ok(data) => data,
        Err(e) => {
            trace!("dropping inbound datagram: {}", e);
            return;
        }
    };
    if ctx.stat == Status::StopNoop {
        return;
    }

    let mut pkt = shared.pc.new_pkt("", "");
    if let Err(e) = pkt.unmarshal(&data) {
        trace!("dropping undecodable datagram from {:?}: {}", from, e);
        shared.pc.put_back(pkt);
        return;
    }

    let pkt_ref = pkt.meta(KEY_REF).unwrap_or("").to_string();
    let sink = shared.requests.write().await.remove(&pkt_ref);
    match sink {
        Some(sink) => {
            if sink.send(pkt).is_err() {
                trace!("response sink for {:?} dropped by caller", pkt_ref);
            }
        }
        None => {
            // no pending request: hand the packet to the application's
            // miscellaneous sink (this is how relayed packets arrive)
            if shared.misc_tx.send(pkt).await.is_err() {
                trace!("misc sink closed - dropping packet");
            }
        }
    }
}

async fn write_loop(
    shared: Arc<ClientShared>,
    mut input: mpsc::Receiver<OutboundWrite>,
    mut cancel: mpsc::Receiver<()>,
) {
    loop {
        let request = tokio::select! {
            _ = cancel.recv() => return,
            request = input.recv() => match request {
                Some(request) => request,
                None => return,
            },
        };
        if let Err(e) = shared
            .throttle
            .write(request.data, shared.server_addr)
            .await
        {
            // deliver the failure through the registered response sink; the
            // locally synthesized error packet carries no ref
            let sink = shared.requests.write().await.remove(&request.pkt_ref);
            if let Some(sink) = sink {
                let err_pkt = shared
                    .pc
                    .new_err_pkt("", "", &format!("packet write error: {}", e));
                let _ = sink.send(err_pkt);
            }
        }
    }
}

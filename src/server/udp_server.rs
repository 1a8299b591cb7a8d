use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::BytesMut;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinSet;
use tracing::{debug, error, span, trace, warn, Instrument, Level};
use uuid::Uuid;

use crate::packet::{Packet, PacketCreator, PacketWriter, KEY_REF};
use crate::pipeline::{
    DataPipeline, PacketPipeline, Processor, Status, TargetCtx, TransformContext,
};
use crate::server::{Server, KEY_RELAY_FROM, KEY_RELAY_TO, TARGET_RELAY};
use crate::throttle::{Rate, Throttle, UdpThrottle};

/// Number of workers reading from the throttle concurrently.
const NUM_READERS: usize = 5;

/// Capacity of the send and write queues. When a queue is full new packets
/// are dropped (and logged) rather than displacing queued ones.
const QUEUE_CAPACITY: usize = 1024;

#[derive(Debug)]
pub struct ServerConfig {
    /// The address the receiving UDP socket is bound to.
    pub bind_addr: SocketAddr,

    /// Size of the datagram receive buffer.
    pub read_buf_size: usize,

    /// Pace of the underlying socket, in packets per second.
    pub throttle_rate: Rate,
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr, throttle_rate: Rate) -> ServerConfig {
        ServerConfig {
            bind_addr,
            read_buf_size: 4096,
            throttle_rate,
        }
    }
}

struct OutboundWrite {
    data: Vec<u8>,
    to: SocketAddr,
}

struct ServerShared {
    pc: Arc<dyn PacketCreator>,
    throttle: Arc<dyn Throttle>,
    data_pipeline: DataPipeline,
    packet_pipeline: PacketPipeline,
    send_tx: mpsc::Sender<Box<dyn Packet>>,
    write_tx: mpsc::Sender<OutboundWrite>,
}

impl ServerShared {
    /// Queues a composed packet for encoding and writing. Drops the packet
    /// (returning it to the pool) when the queue is full.
    fn enqueue_send(&self, pkt: Box<dyn Packet>) {
        match self.send_tx.try_send(pkt) {
            Ok(()) => {}
            Err(TrySendError::Full(pkt)) => {
                warn!("send queue full - dropping outbound packet");
                self.pc.put_back(pkt);
            }
            Err(TrySendError::Closed(pkt)) => {
                debug!("send queue closed - dropping outbound packet");
                self.pc.put_back(pkt);
            }
        }
    }

    fn enqueue_write(&self, data: Vec<u8>, to: SocketAddr) {
        if let Err(e) = self.write_tx.try_send(OutboundWrite { data, to }) {
            match e {
                TrySendError::Full(_) => warn!("write queue full - dropping outbound datagram"),
                TrySendError::Closed(_) => debug!("write queue closed - dropping outbound datagram"),
            }
        }
    }
}

/// [`Server`] over a UDP socket. Each incoming datagram is dispatched in its
/// own task, so per-datagram ordering is not preserved across the fan-out.
///
/// Outbound packets pass through two stages: the *send* queue holds composed
/// packets awaiting encoding and the `_out_` pipeline; the *write* queue
/// holds wire bytes awaiting the throttled socket.
pub struct UdpServer {
    shared: Arc<ServerShared>,
    send_rx: std::sync::Mutex<Option<mpsc::Receiver<Box<dyn Packet>>>>,
    write_rx: std::sync::Mutex<Option<mpsc::Receiver<OutboundWrite>>>,
    local_addr: SocketAddr,
}

impl UdpServer {
    pub async fn new(config: ServerConfig, pc: Arc<dyn PacketCreator>) -> anyhow::Result<UdpServer> {
        let socket = Arc::new(UdpSocket::bind(config.bind_addr).await?);
        let local_addr = socket.local_addr()?;
        debug!("bound receive socket to {:?}", local_addr);
        let throttle: Arc<dyn Throttle> = Arc::new(UdpThrottle::new(
            config.throttle_rate,
            socket,
            config.read_buf_size,
        ));

        let (send_tx, send_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (write_tx, write_rx) = mpsc::channel(QUEUE_CAPACITY);

        let packet_pipeline = PacketPipeline::new();
        register_relay_target(&packet_pipeline, pc.clone(), send_tx.clone());

        let shared = Arc::new(ServerShared {
            pc,
            throttle,
            data_pipeline: DataPipeline::new(),
            packet_pipeline,
            send_tx,
            write_tx,
        });

        Ok(UdpServer {
            shared,
            send_rx: std::sync::Mutex::new(Some(send_rx)),
            write_rx: std::sync::Mutex::new(Some(write_rx)),
            local_addr,
        })
    }

    /// The local address the server's socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Processor for UdpServer {
    fn data_processor(&self) -> &DataPipeline {
        &self.shared.data_pipeline
    }

    fn packet_processor(&self) -> &PacketPipeline {
        &self.shared.packet_pipeline
    }
}

#[async_trait]
impl Server for UdpServer {
    async fn serve(&self) -> anyhow::Result<()> {
        let send_rx = self
            .send_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow!("serve may only be called once"))?;
        let write_rx = self
            .write_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow!("serve may only be called once"))?;

        // configuration is done once serving starts
        self.shared.data_pipeline.lock();

        let (send_cancel_tx, send_cancel_rx) = mpsc::channel(1);
        let (write_cancel_tx, write_cancel_rx) = mpsc::channel(1);

        tokio::spawn(send_loop(
            self.shared.clone(),
            send_rx,
            send_cancel_rx,
            write_cancel_tx,
        ));
        tokio::spawn(write_loop(self.shared.clone(), write_rx, write_cancel_rx));

        let mut readers = JoinSet::new();
        for _ in 0..NUM_READERS {
            let shared = self.shared.clone();
            readers.spawn(read_loop(shared));
        }
        while readers.join_next().await.is_some() {}

        // reader failure is terminal: wind down the outbound workers (the
        // send worker forwards the signal to the write worker)
        let _ = send_cancel_tx.send(()).await;
        self.shared.throttle.shutdown().await;
        bail!("server error - read fail")
    }
}

fn register_relay_target(
    packet_pipeline: &PacketPipeline,
    pc: Arc<dyn PacketCreator>,
    send_tx: mpsc::Sender<Box<dyn Packet>>,
) {
    packet_pipeline.add_callback(TARGET_RELAY, move |ctx: &mut TargetCtx, _pw: &mut dyn PacketWriter| {
        let pkt_ref = ctx.pkt.meta(KEY_REF).unwrap_or("").to_string();
        let relay_to = ctx.pkt.meta(KEY_RELAY_TO).unwrap_or("").to_string();
        trace!("relaying packet from {:?} to {:?}", ctx.from, relay_to);

        let mut fwd = pc.new_pkt(&pkt_ref, &relay_to);
        fwd.set_meta(KEY_RELAY_FROM, &ctx.from.to_string());
        fwd.write(ctx.pkt.data());
        fwd.close();
        match send_tx.try_send(fwd) {
            Ok(()) => {}
            Err(TrySendError::Full(fwd)) => {
                warn!("send queue full - dropping relayed packet");
                pc.put_back(fwd);
            }
            Err(TrySendError::Closed(fwd)) => pc.put_back(fwd),
        }

        // the forwarded packet is the whole effect; no response goes back
        ctx.stat = Status::StopNoop;
        ctx.msg = Some("packet forwarded".to_string());
    });
}

async fn read_loop(shared: Arc<ServerShared>) {
    loop {
        match shared.throttle.read().await {
            Ok((data, from)) => {
                let correlation_id = Uuid::new_v4();
                let span = span!(Level::TRACE, "packet_received", ?correlation_id);
                tokio::spawn(dispatch(shared.clone(), data, from).instrument(span));
            }
            Err(e) => {
                error!("socket read error: {}", e);
                return;
            }
        }
    }
}

/// Runs one datagram through `_in_`, decodes it, executes its target's
/// callback queue and queues the response according to the terminal status.
async fn dispatch(shared: Arc<ServerShared>, data: BytesMut, from: SocketAddr) {
    trace!("received {} bytes from {:?}", data.len(), from);

    let mut ctx = TransformContext::inbound(from);
    let data = match shared.data_pipeline.process(&mut ctx, data) {
        Ok(data) => data,
        Err(e) => {
            shared.enqueue_send(shared.pc.new_err_pkt(
                "",
                &from.to_string(),
                &format!("data pipeline error: {}", e),
            ));
            return;
        }
    };
    if ctx.stat == Status::StopNoop {
        return;
    }

    let mut pkt = shared.pc.new_pkt("", "");
    if let Err(e) = pkt.unmarshal(&data) {
        debug!("received malformed packet from {:?}: {}", from, e);
        shared.pc.put_back(pkt);
        shared
            .enqueue_send(shared.pc.new_err_pkt("", &from.to_string(), "malformed packet"));
        return;
    }

    let pkt_ref = pkt.meta(KEY_REF).unwrap_or("").to_string();
    let target = pkt.target().to_string();
    let mut resp = shared.pc.new_pkt(&pkt_ref, &from.to_string());

    let mut ctx = TargetCtx {
        pkt,
        target,
        from,
        stat: Status::Continue,
        msg: None,
    };
    let result = shared.packet_pipeline.process(&mut ctx, resp.writer());
    let TargetCtx { pkt, stat, .. } = ctx;
    shared.pc.put_back(pkt);

    match result {
        Err(e) => {
            shared.pc.put_back(resp);
            shared
                .enqueue_send(shared.pc.new_err_pkt(&pkt_ref, &from.to_string(), &e.to_string()));
        }
        Ok(()) => match stat {
            Status::StopNoop => shared.pc.put_back(resp),
            Status::Relay => match resp.meta(KEY_RELAY_TO).map(str::to_string) {
                Some(relay_to) if !relay_to.is_empty() => {
                    resp.set_dest(&relay_to);
                    resp.close();
                    shared.enqueue_send(resp);
                }
                _ => {
                    // malformed relay request by the application
                    debug!("relay response without {:?} - dropping", KEY_RELAY_TO);
                    shared.pc.put_back(resp);
                }
            },
            _ => {
                resp.close();
                shared.enqueue_send(resp);
            }
        },
    }
}

/// Encodes a composed packet, runs `_out_` and hands the wire bytes to the
/// write queue.
async fn process_outgoing(shared: Arc<ServerShared>, pkt: Box<dyn Packet>) {
    let bin = match pkt.marshal() {
        Ok(bin) => bin,
        Err(e) => {
            warn!("dropping outbound packet - encode failure: {}", e);
            shared.pc.put_back(pkt);
            return;
        }
    };
    let to = match resolve_dest(pkt.dest()).await {
        Some(to) => to,
        None => {
            debug!("dropping outbound packet - unresolvable destination {:?}", pkt.dest());
            shared.pc.put_back(pkt);
            return;
        }
    };

    let mut ctx = TransformContext::outbound(pkt.as_ref());
    let result = shared.data_pipeline.process(&mut ctx, BytesMut::from(&bin[..]));
    let stat = ctx.stat;
    drop(ctx);

    match result {
        Err(e) => {
            let pkt_ref = pkt.meta(KEY_REF).unwrap_or("").to_string();
            let dest = pkt.dest().to_string();
            shared.enqueue_send(shared.pc.new_err_pkt(
                &pkt_ref,
                &dest,
                &format!("pipeline error: {}", e),
            ));
        }
        Ok(data) if stat != Status::StopNoop => shared.enqueue_write(data.to_vec(), to),
        Ok(_) => {}
    }
    shared.pc.put_back(pkt);
}

async fn resolve_dest(dest: &str) -> Option<SocketAddr> {
    match tokio::net::lookup_host(dest).await {
        Ok(mut addrs) => addrs.next(),
        Err(e) => {
            debug!("failed to resolve {:?}: {}", dest, e);
            None
        }
    }
}

async fn send_loop(
    shared: Arc<ServerShared>,
    mut input: mpsc::Receiver<Box<dyn Packet>>,
    mut cancel: mpsc::Receiver<()>,
    write_cancel: mpsc::Sender<()>,
) {
    loop {
        tokio::select! {
            _ = cancel.recv() => break,
            pkt = input.recv() => match pkt {
                Some(pkt) => {
                    let shared = shared.clone();
                    tokio::spawn(process_outgoing(shared, pkt));
                }
                None => break,
            },
        }
    }
    debug!("send worker stopping - closing write queue");
    let _ = write_cancel.send(()).await;
}

async fn write_loop(
    shared: Arc<ServerShared>,
    mut input: mpsc::Receiver<OutboundWrite>,
    mut cancel: mpsc::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = cancel.recv() => break,
            item = input.recv() => match item {
                Some(OutboundWrite { data, to }) => {
                    if let Err(e) = shared.throttle.write(data, to).await {
                        debug!("write to {:?} failed: {}", to, e);
                    }
                }
                None => break,
            },
        }
    }
    debug!("write worker stopped");
}

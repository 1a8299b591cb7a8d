use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, span, trace, warn, Instrument, Level};
use uuid::Uuid;

use crate::packet::{Packet, PacketCreator, KEY_REF};
use crate::pipeline::{
    DataPipeline, PacketPipeline, Processor, Status, TargetCtx, TransformContext,
};
use crate::server::Server;

/// Frames above this size poison the connection and close it.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const RESPONSE_QUEUE_CAPACITY: usize = 64;

struct TcpShared {
    pc: Arc<dyn PacketCreator>,
    data_pipeline: DataPipeline,
    packet_pipeline: PacketPipeline,
}

/// Stream variant of the [`Server`]: the same packet decoding and dispatch
/// as [`UdpServer`](crate::server::UdpServer), with packets framed by a
/// `u32` big-endian length prefix on a TCP stream.
///
/// Each accepted connection is served by its own task; responses go back
/// over the connection they arrived on, so the `relay` target is not
/// registered here. The stream path is not throttled.
pub struct TcpServer {
    shared: Arc<TcpShared>,
    listener: std::sync::Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
}

impl TcpServer {
    pub async fn new(bind_addr: SocketAddr, pc: Arc<dyn PacketCreator>) -> anyhow::Result<TcpServer> {
        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;
        debug!("bound stream listener to {:?}", local_addr);
        Ok(TcpServer {
            shared: Arc::new(TcpShared {
                pc,
                data_pipeline: DataPipeline::new(),
                packet_pipeline: PacketPipeline::new(),
            }),
            listener: std::sync::Mutex::new(Some(listener)),
            local_addr,
        })
    }

    /// The local address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Processor for TcpServer {
    fn data_processor(&self) -> &DataPipeline {
        &self.shared.data_pipeline
    }

    fn packet_processor(&self) -> &PacketPipeline {
        &self.shared.packet_pipeline
    }
}

#[async_trait]
impl Server for TcpServer {
    async fn serve(&self) -> anyhow::Result<()> {
        let listener = self
            .listener
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow!("serve may only be called once"))?;
        self.shared.data_pipeline.lock();

        loop {
            let (stream, peer) = listener.accept().await?;
            debug!("accepted connection from {:?}", peer);
            let shared = self.shared.clone();
            let span = span!(Level::DEBUG, "connection", ?peer);
            tokio::spawn(
                async move {
                    match serve_connection(shared, stream, peer).await {
                        Ok(()) => debug!("connection closed"),
                        Err(e) => warn!("connection from {:?} broke with an error: {}", peer, e),
                    }
                }
                .instrument(span),
            );
        }
    }
}

async fn serve_connection(
    shared: Arc<TcpShared>,
    stream: TcpStream,
    peer: SocketAddr,
) -> anyhow::Result<()> {
    let (mut reader, mut writer) = stream.into_split();

    let (frame_tx, mut frame_rx) = mpsc::channel::<Vec<u8>>(RESPONSE_QUEUE_CAPACITY);
    tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            let len = frame.len() as u32;
            if writer.write_all(&len.to_be_bytes()).await.is_err()
                || writer.write_all(&frame).await.is_err()
            {
                debug!("connection write failed - stopping response writer");
                return;
            }
        }
    });

    let mut len_buf = [0u8; 4];
    loop {
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        let frame_len = u32::from_be_bytes(len_buf) as usize;
        if frame_len > MAX_FRAME_LEN {
            bail!(
                "received a frame longer than the configured maximum ({}) - closing connection",
                frame_len
            );
        }

        let mut frame = vec![0u8; frame_len];
        reader.read_exact(&mut frame).await?;

        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "packet_received", ?correlation_id);
        tokio::spawn(
            dispatch_frame(
                shared.clone(),
                BytesMut::from(&frame[..]),
                peer,
                frame_tx.clone(),
            )
            .instrument(span),
        );
    }
}

async fn dispatch_frame(
    shared: Arc<TcpShared>,
    data: BytesMut,
    peer: SocketAddr,
    frame_tx: mpsc::Sender<Vec<u8>>,
) {
    trace!("received {} byte frame from {:?}", data.len(), peer);

    let mut ctx = TransformContext::inbound(peer);
    let data = match shared.data_pipeline.process(&mut ctx, data) {
        Ok(data) => data,
        Err(e) => {
            let err_pkt = shared.pc.new_err_pkt(
                "",
                &peer.to_string(),
                &format!("data pipeline error: {}", e),
            );
            respond(&shared, err_pkt, &frame_tx).await;
            return;
        }
    };
    if ctx.stat == Status::StopNoop {
        return;
    }

    let mut pkt = shared.pc.new_pkt("", "");
    if let Err(e) = pkt.unmarshal(&data) {
        debug!("received malformed packet from {:?}: {}", peer, e);
        shared.pc.put_back(pkt);
        let err_pkt = shared
            .pc
            .new_err_pkt("", &peer.to_string(), "malformed packet");
        respond(&shared, err_pkt, &frame_tx).await;
        return;
    }

    let pkt_ref = pkt.meta(KEY_REF).unwrap_or("").to_string();
    let target = pkt.target().to_string();
    let mut resp = shared.pc.new_pkt(&pkt_ref, &peer.to_string());

    let mut ctx = TargetCtx {
        pkt,
        target,
        from: peer,
        stat: Status::Continue,
        msg: None,
    };
    let result = shared.packet_pipeline.process(&mut ctx, resp.writer());
    let TargetCtx { pkt, stat, .. } = ctx;
    shared.pc.put_back(pkt);

    match result {
        Err(e) => {
            shared.pc.put_back(resp);
            let err_pkt = shared
                .pc
                .new_err_pkt(&pkt_ref, &peer.to_string(), &e.to_string());
            respond(&shared, err_pkt, &frame_tx).await;
        }
        Ok(()) => match stat {
            Status::StopNoop => shared.pc.put_back(resp),
            Status::Relay => {
                // responses can only go back over the originating stream
                debug!("relay status on stream listener - dropping response");
                shared.pc.put_back(resp);
            }
            _ => {
                resp.close();
                respond(&shared, resp, &frame_tx).await;
            }
        },
    }
}

/// Encodes a composed packet, runs `_out_` and queues the frame on the
/// connection's response writer.
async fn respond(shared: &Arc<TcpShared>, pkt: Box<dyn Packet>, frame_tx: &mpsc::Sender<Vec<u8>>) {
    let bin = match pkt.marshal() {
        Ok(bin) => bin,
        Err(e) => {
            warn!("dropping response - encode failure: {}", e);
            shared.pc.put_back(pkt);
            return;
        }
    };

    let mut ctx = TransformContext::outbound(pkt.as_ref());
    let result = shared.data_pipeline.process(&mut ctx, BytesMut::from(&bin[..]));
    let stat = ctx.stat;
    drop(ctx);

    match result {
        Ok(data) if stat != Status::StopNoop => {
            if frame_tx.send(data.to_vec()).await.is_err() {
                debug!("response writer gone - dropping response");
            }
        }
        Ok(_) => {}
        Err(e) => warn!("dropping response - pipeline error: {}", e),
    }
    shared.pc.put_back(pkt);
}

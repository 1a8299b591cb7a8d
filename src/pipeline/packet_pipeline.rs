use std::sync::{Arc, RwLock};

use anyhow::bail;
use rustc_hash::FxHashMap;

use crate::packet::PacketWriter;
use crate::pipeline::{Status, TargetCtx};

/// A handler bound to a target. Callbacks inspect the request through the
/// context and compose the response through the writer.
pub type TargetCallback = Arc<dyn Fn(&mut TargetCtx, &mut dyn PacketWriter) + Send + Sync>;

/// Maps target names to ordered callback queues. Every packet the server
/// decodes invokes the queue registered for its `_tgt` metadata entry.
pub struct PacketPipeline {
    callback_queues: RwLock<FxHashMap<String, Vec<TargetCallback>>>,
}

impl Default for PacketPipeline {
    fn default() -> Self {
        PacketPipeline::new()
    }
}

impl PacketPipeline {
    pub fn new() -> PacketPipeline {
        PacketPipeline {
            callback_queues: RwLock::new(FxHashMap::default()),
        }
    }

    /// Appends `callback` to the queue for `target_name`, creating the queue
    /// if needed.
    pub fn add_callback<F>(&self, target_name: &str, callback: F)
    where
        F: Fn(&mut TargetCtx, &mut dyn PacketWriter) + Send + Sync + 'static,
    {
        self.callback_queues
            .write()
            .unwrap()
            .entry(target_name.to_string())
            .or_default()
            .push(Arc::new(callback));
    }

    /// Executes the callback queue for `ctx.target` in insertion order,
    /// stopping at the first terminal status: [`Status::StopError`] returns
    /// the context message as an error, [`Status::StopNoop`],
    /// [`Status::StopCloseSend`] and [`Status::Relay`] return success (the
    /// caller decides the response disposition from the status). An
    /// unregistered target is an error.
    pub fn process(&self, ctx: &mut TargetCtx, pw: &mut dyn PacketWriter) -> anyhow::Result<()> {
        let queue: Vec<TargetCallback> = {
            let queues = self.callback_queues.read().unwrap();
            match queues.get(&ctx.target) {
                Some(queue) => queue.clone(),
                None => bail!("target not found"),
            }
        };
        for callback in &queue {
            callback(ctx, pw);
            match ctx.stat {
                Status::StopError => {
                    bail!("{}", ctx.msg.as_deref().unwrap_or("callback error"));
                }
                Status::StopNoop | Status::StopCloseSend | Status::Relay => return Ok(()),
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{JsonPacket, Packet};
    use std::net::SocketAddr;

    fn ctx_for(target: &str) -> TargetCtx {
        let from: SocketAddr = "127.0.0.1:16000".parse().unwrap();
        TargetCtx {
            pkt: Box::new(JsonPacket::new()),
            target: target.to_string(),
            from,
            stat: Status::Continue,
            msg: None,
        }
    }

    #[test]
    fn test_missing_target() {
        let pipeline = PacketPipeline::new();
        let mut resp = JsonPacket::new();
        let mut ctx = ctx_for("missing");
        let err = pipeline.process(&mut ctx, resp.writer()).unwrap_err();
        assert_eq!(err.to_string(), "target not found");
    }

    #[test]
    fn test_callbacks_run_in_insertion_order() {
        let pipeline = PacketPipeline::new();
        pipeline.add_callback("t", |_ctx: &mut TargetCtx, pw: &mut dyn PacketWriter| {
            pw.write(b"1");
        });
        pipeline.add_callback("t", |_ctx: &mut TargetCtx, pw: &mut dyn PacketWriter| {
            pw.write(b"2");
        });

        let mut resp = JsonPacket::new();
        let mut ctx = ctx_for("t");
        pipeline.process(&mut ctx, resp.writer()).unwrap();
        assert_eq!(resp.data(), b"12");
    }

    #[test]
    fn test_stop_error_surfaces_message() {
        let pipeline = PacketPipeline::new();
        pipeline.add_callback("t", |ctx: &mut TargetCtx, _pw: &mut dyn PacketWriter| {
            ctx.stat = Status::StopError;
            ctx.msg = Some("not authorized".to_string());
        });
        pipeline.add_callback("t", |_ctx: &mut TargetCtx, _pw: &mut dyn PacketWriter| {
            panic!("must not run after a terminal status");
        });

        let mut resp = JsonPacket::new();
        let mut ctx = ctx_for("t");
        let err = pipeline.process(&mut ctx, resp.writer()).unwrap_err();
        assert_eq!(err.to_string(), "not authorized");
    }

    #[test]
    fn test_terminal_status_stops_queue() {
        let pipeline = PacketPipeline::new();
        pipeline.add_callback("t", |ctx: &mut TargetCtx, pw: &mut dyn PacketWriter| {
            pw.write(b"first");
            ctx.stat = Status::StopCloseSend;
        });
        pipeline.add_callback("t", |_ctx: &mut TargetCtx, _pw: &mut dyn PacketWriter| {
            panic!("must not run after a terminal status");
        });

        let mut resp = JsonPacket::new();
        let mut ctx = ctx_for("t");
        pipeline.process(&mut ctx, resp.writer()).unwrap();
        assert_eq!(ctx.stat, Status::StopCloseSend);
        assert_eq!(resp.data(), b"first");
    }
}

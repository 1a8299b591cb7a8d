use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::bail;
use bytes::BytesMut;
use rustc_hash::FxHashMap;
use tracing::warn;

use crate::pipeline::{Status, TransformContext};

/// A function acting on a byte buffer, producing its replacement. An example
/// is a cryptographic transform decrypting the contents of an incoming
/// datagram.
pub type BufferTransform =
    Arc<dyn Fn(&mut TransformContext<'_>, BytesMut) -> BytesMut + Send + Sync>;

/// Ordered, named chains of buffer transforms, applied to binary data
/// immediately after it is read from and just before it is written to the
/// connection ([`PIPELINE_IN`](crate::pipeline::PIPELINE_IN) and
/// [`PIPELINE_OUT`](crate::pipeline::PIPELINE_OUT) respectively).
///
/// Configuration and processing may run concurrently: `process` snapshots
/// the chain under a read lock, so an `add_transform` racing a pass affects
/// the next pass, never the running one.
pub struct DataPipeline {
    locked: AtomicBool,
    chains: RwLock<FxHashMap<String, Vec<BufferTransform>>>,
}

impl Default for DataPipeline {
    fn default() -> Self {
        DataPipeline::new()
    }
}

impl DataPipeline {
    pub fn new() -> DataPipeline {
        DataPipeline {
            locked: AtomicBool::new(false),
            chains: RwLock::new(FxHashMap::default()),
        }
    }

    /// Closes the pipeline for configuration; subsequent `add_transform`
    /// calls are ignored.
    pub fn lock(&self) {
        self.locked.store(true, Ordering::Release);
    }

    /// Re-opens the pipeline for configuration.
    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// Appends `transform` to the chain named `pipeline_name`, creating the
    /// chain if needed. Ignored (with a warning) while the pipeline is
    /// locked.
    pub fn add_transform<F>(&self, pipeline_name: &str, transform: F)
    where
        F: Fn(&mut TransformContext<'_>, BytesMut) -> BytesMut + Send + Sync + 'static,
    {
        if self.locked.load(Ordering::Acquire) {
            warn!(
                "data pipeline is locked - ignoring transform for {:?}",
                pipeline_name
            );
            return;
        }
        self.chains
            .write()
            .unwrap()
            .entry(pipeline_name.to_string())
            .or_default()
            .push(Arc::new(transform));
    }

    /// Runs the chain named by `ctx.pipeline` over `data`, threading the
    /// evolving buffer through each transform in insertion order.
    ///
    /// After every transform the context status is inspected:
    /// [`Status::StopError`] aborts the pass with the context message,
    /// [`Status::StopNoop`] and [`Status::StopCloseSend`] end it successfully
    /// with the current bytes, anything else continues. A name with no chain
    /// is a no-op pass.
    pub fn process(
        &self,
        ctx: &mut TransformContext<'_>,
        mut data: BytesMut,
    ) -> anyhow::Result<BytesMut> {
        let chain: Vec<BufferTransform> = {
            let chains = self.chains.read().unwrap();
            chains.get(ctx.pipeline).cloned().unwrap_or_default()
        };
        for transform in &chain {
            data = transform(ctx, data);
            match ctx.stat {
                Status::StopError => {
                    bail!(
                        "pipeline terminated: {}",
                        ctx.msg.as_deref().unwrap_or("transform error")
                    );
                }
                Status::StopNoop | Status::StopCloseSend => return Ok(data),
                _ => {}
            }
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PIPELINE_IN;
    use std::net::SocketAddr;

    fn sender() -> SocketAddr {
        "127.0.0.1:16000".parse().unwrap()
    }

    #[test]
    fn test_transforms_run_in_insertion_order() {
        let pipeline = DataPipeline::new();
        pipeline.add_transform(PIPELINE_IN, |_ctx: &mut TransformContext<'_>, mut buf: BytesMut| {
            buf.extend_from_slice(b"a");
            buf
        });
        pipeline.add_transform(PIPELINE_IN, |_ctx: &mut TransformContext<'_>, mut buf: BytesMut| {
            buf.extend_from_slice(b"b");
            buf
        });

        let mut ctx = TransformContext::inbound(sender());
        let out = pipeline.process(&mut ctx, BytesMut::from(&b"x"[..])).unwrap();
        assert_eq!(&out[..], b"xab");
    }

    #[test]
    fn test_stop_error_aborts_with_message() {
        let pipeline = DataPipeline::new();
        pipeline.add_transform(PIPELINE_IN, |ctx: &mut TransformContext<'_>, buf: BytesMut| {
            ctx.stat = Status::StopError;
            ctx.msg = Some("bad".to_string());
            buf
        });
        pipeline.add_transform(PIPELINE_IN, |_ctx: &mut TransformContext<'_>, _buf: BytesMut| {
            panic!("must not run after a terminal status");
        });

        let mut ctx = TransformContext::inbound(sender());
        let err = pipeline
            .process(&mut ctx, BytesMut::from(&b"x"[..]))
            .unwrap_err();
        assert!(err.to_string().contains("bad"));
    }

    #[test]
    fn test_stop_noop_short_circuits_successfully() {
        let pipeline = DataPipeline::new();
        pipeline.add_transform(PIPELINE_IN, |ctx: &mut TransformContext<'_>, buf: BytesMut| {
            ctx.stat = Status::StopNoop;
            buf
        });
        pipeline.add_transform(PIPELINE_IN, |_ctx: &mut TransformContext<'_>, _buf: BytesMut| {
            panic!("must not run after a terminal status");
        });

        let mut ctx = TransformContext::inbound(sender());
        let out = pipeline.process(&mut ctx, BytesMut::from(&b"x"[..])).unwrap();
        assert_eq!(&out[..], b"x");
        assert_eq!(ctx.stat, Status::StopNoop);
    }

    #[test]
    fn test_unknown_chain_is_identity() {
        let pipeline = DataPipeline::new();
        let mut ctx = TransformContext::inbound(sender());
        let out = pipeline.process(&mut ctx, BytesMut::from(&b"x"[..])).unwrap();
        assert_eq!(&out[..], b"x");
    }

    #[test]
    fn test_lock_forbids_adds() {
        let pipeline = DataPipeline::new();
        pipeline.lock();
        pipeline.add_transform(PIPELINE_IN, |_ctx: &mut TransformContext<'_>, mut buf: BytesMut| {
            buf.extend_from_slice(b"a");
            buf
        });

        let mut ctx = TransformContext::inbound(sender());
        let out = pipeline.process(&mut ctx, BytesMut::from(&b"x"[..])).unwrap();
        assert_eq!(&out[..], b"x");

        pipeline.unlock();
        pipeline.add_transform(PIPELINE_IN, |_ctx: &mut TransformContext<'_>, mut buf: BytesMut| {
            buf.extend_from_slice(b"a");
            buf
        });
        let mut ctx = TransformContext::inbound(sender());
        let out = pipeline.process(&mut ctx, BytesMut::from(&b"x"[..])).unwrap();
        assert_eq!(&out[..], b"xa");
    }
}

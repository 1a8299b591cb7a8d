mod data_pipeline;
mod packet_pipeline;

pub use data_pipeline::{BufferTransform, DataPipeline};
pub use packet_pipeline::{PacketPipeline, TargetCallback};

use std::net::SocketAddr;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::packet::Packet;

/// Name of the inbound transform chain: wire bytes -> decodable bytes.
pub const PIPELINE_IN: &str = "_in_";

/// Name of the outbound transform chain: encoded bytes -> wire bytes.
pub const PIPELINE_OUT: &str = "_out_";

/// Shared signalling between pipeline stages. Transforms and callbacks set
/// the status on their context to steer the remainder of the pass.
#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(i8)]
pub enum Status {
    /// Stop; surface the context message to the sender as an error packet.
    StopError = -1,
    /// Proceed to the next stage.
    Continue = 0,
    /// Stop; close the writer and send the response immediately.
    StopCloseSend = 1,
    /// Stop; drop any pending response.
    StopNoop = 2,
    /// Stop; the server re-routes the composed response using `_relay_to`.
    Relay = 3,
}

/// Shared by all transforms of one [`DataPipeline`] pass. Lives for a single
/// pass.
///
/// Outbound passes carry the packet being encoded; inbound passes carry the
/// sender address instead (the bytes are not decoded yet).
pub struct TransformContext<'a> {
    pub pipeline: &'a str,
    pub pkt: Option<&'a dyn Packet>,
    pub from: Option<SocketAddr>,
    pub stat: Status,
    pub msg: Option<String>,
}

impl<'a> TransformContext<'a> {
    pub fn inbound(from: SocketAddr) -> TransformContext<'a> {
        TransformContext {
            pipeline: PIPELINE_IN,
            pkt: None,
            from: Some(from),
            stat: Status::Continue,
            msg: None,
        }
    }

    pub fn outbound(pkt: &'a dyn Packet) -> TransformContext<'a> {
        TransformContext {
            pipeline: PIPELINE_OUT,
            pkt: Some(pkt),
            from: None,
            stat: Status::Continue,
            msg: None,
        }
    }
}

/// Shared by all callbacks of one target dispatch. Lives for a single
/// dispatch.
///
/// Callbacks compose the response through the writer they are handed; the
/// context carries the request packet and steers queue execution via
/// [`Status`]. A callback failing the request sets [`Status::StopError`] and
/// a message, which the server returns to the sender as an error packet.
pub struct TargetCtx {
    pub pkt: Box<dyn Packet>,
    pub target: String,
    pub from: SocketAddr,
    pub stat: Status,
    pub msg: Option<String>,
}

/// Access to the two pipeline stages of a server or client, the seam through
/// which extensions install themselves.
pub trait Processor {
    fn data_processor(&self) -> &DataPipeline;
    fn packet_processor(&self) -> &PacketPipeline;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::stop_error(Status::StopError, -1)]
    #[case::cont(Status::Continue, 0)]
    #[case::stop_close_send(Status::StopCloseSend, 1)]
    #[case::stop_noop(Status::StopNoop, 2)]
    #[case::relay(Status::Relay, 3)]
    fn test_status_codes(#[case] status: Status, #[case] code: i8) {
        assert_eq!(i8::from(status), code);
        assert_eq!(Status::try_from(code).unwrap(), status);
    }
}

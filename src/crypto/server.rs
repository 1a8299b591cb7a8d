use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::crypto::{
    decode_public_key, encode_public_key, Crypto, KEY_NO_CRYPTO, TARGET_KEX_CLIENT,
    TARGET_KEX_SERVER,
};
use crate::packet::PacketWriter;
use crate::pipeline::{Processor, Status, TargetCtx};

/// Body of a client-client introduction request: the address of the peer
/// whose public key is wanted.
#[derive(Serialize, Deserialize)]
pub(crate) struct PeerLookup {
    pub ip: String,
}

impl Crypto {
    pub(crate) fn install_kex_targets(self: &Arc<Self>, target: &(impl Processor + ?Sized)) {
        let cr = self.clone();
        target.packet_processor().add_callback(
            TARGET_KEX_SERVER,
            move |ctx: &mut TargetCtx, pw: &mut dyn PacketWriter| {
                cr.key_exchange_server(ctx, pw);
            },
        );
        let cr = self.clone();
        target.packet_processor().add_callback(
            TARGET_KEX_CLIENT,
            move |ctx: &mut TargetCtx, pw: &mut dyn PacketWriter| {
                cr.key_exchange_client(ctx, pw);
            },
        );
    }

    /// `crypto.kex-cs`: stores the sender's public key and shared secret,
    /// then answers with our public key. The response is flagged
    /// `_no_crypto` - the peer cannot decrypt before processing it.
    fn key_exchange_server(&self, ctx: &mut TargetCtx, pw: &mut dyn PacketWriter) {
        let peer_key = match decode_public_key(ctx.pkt.data()) {
            Ok(peer_key) => peer_key,
            Err(e) => {
                debug!("key exchange from {:?} undecodable: {}", ctx.from, e);
                ctx.stat = Status::StopError;
                ctx.msg = Some("malformed packet".to_string());
                return;
            }
        };
        self.store_peer(&ctx.from.to_string(), peer_key, false);

        pw.set_meta(KEY_NO_CRYPTO, "true");
        pw.write(&self.public_wire);
        ctx.stat = Status::StopCloseSend;
    }

    /// `crypto.kex-cc`: answers with the public key of the client at the
    /// requested address, provided that client has exchanged keys with us.
    fn key_exchange_client(&self, ctx: &mut TargetCtx, pw: &mut dyn PacketWriter) {
        let lookup: PeerLookup = match serde_json::from_slice(ctx.pkt.data()) {
            Ok(lookup) => lookup,
            Err(_) => {
                ctx.stat = Status::StopError;
                ctx.msg = Some("malformed packet".to_string());
                return;
            }
        };
        match self.peer_public_key(&lookup.ip) {
            None => {
                ctx.stat = Status::StopError;
                ctx.msg = Some("client non-existent".to_string());
            }
            Some(peer_key) => match encode_public_key(&peer_key) {
                Ok(bin) => {
                    pw.set_meta(KEY_NO_CRYPTO, "true");
                    pw.write(&bin);
                }
                Err(_) => {
                    ctx.stat = Status::StopError;
                    ctx.msg = Some("key encode failure".to_string());
                }
            },
        }
    }
}

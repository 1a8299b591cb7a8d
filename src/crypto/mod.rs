mod aes;
mod client;
mod server;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use aead::{Key, KeyInit, OsRng};
use aes_gcm::Aes256Gcm;
use anyhow::{anyhow, bail, Context};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::BytesMut;
use hkdf::Hkdf;
use p256::elliptic_curve::generic_array::GenericArray;
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::{PublicKey, SecretKey};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::pipeline::{Processor, Status, TransformContext, PIPELINE_IN, PIPELINE_OUT};

/// Target performing a client-server key exchange.
pub const TARGET_KEX_SERVER: &str = "crypto.kex-cs";

/// Target introducing two clients: responds with the public key of another
/// client known to the server.
pub const TARGET_KEX_CLIENT: &str = "crypto.kex-cc";

/// Metadata key which, set to a truthy value ("true", "t", "yes", "y", "1"),
/// makes the encryption transform skip the packet. Key exchange responses
/// carry it: they must go out in the clear.
pub const KEY_NO_CRYPTO: &str = "_no_crypto";

/// Domain separation for deriving AES keys from ECDH shared secrets.
const KDF_INFO: &[u8] = b"parley aes256gcm key";

/// Wire form of a public key: a JSON object carrying the base64-encoded
/// 32-byte big-endian affine coordinates. The curve is fixed (NIST P-256)
/// and not negotiated.
#[derive(Serialize, Deserialize)]
struct WirePublicKey {
    x: String,
    y: String,
}

/// Per-peer key material. `key_sent` latches after the first outgoing packet
/// to the peer, which by protocol is the key exchange itself and must go out
/// unencrypted.
struct KeyEntry {
    key_sent: AtomicBool,
    public: PublicKey,
    cipher: Aes256Gcm,
}

/// Cryptographic extension for servers and clients: ECDH key agreement over
/// NIST P-256 and AES-256-GCM encryption, installed through the
/// [`Processor`] seam.
///
/// [`Crypto::install_server`] registers the key exchange targets and the
/// transport transforms; [`Crypto::install_client`] registers the transforms
/// only. Transport encryption covers the whole marshalled packet between
/// endpoints sharing a key; the end-to-end helpers
/// ([`Crypto::encrypt_e2e`], [`Crypto::decrypt_e2e`]) rewrite only a
/// packet's data field so it survives a server-side relay.
///
/// Transforms that cannot tell whether their input was encrypted pass it
/// through unchanged; this is what lets cleartext handshake packets coexist
/// with encrypted application traffic on the same socket.
pub struct Crypto {
    keys: RwLock<FxHashMap<String, Arc<KeyEntry>>>,
    secret: SecretKey,
    public_wire: Vec<u8>,
}

impl Crypto {
    /// Creates the extension around `secret`, generating a fresh key when
    /// none is given.
    pub fn new(secret: Option<SecretKey>) -> anyhow::Result<Crypto> {
        let secret = secret.unwrap_or_else(|| SecretKey::random(&mut OsRng));
        let public_wire = encode_public_key(&secret.public_key())?;
        Ok(Crypto {
            keys: RwLock::new(FxHashMap::default()),
            secret,
            public_wire,
        })
    }

    /// This extension's public key.
    pub fn public_key(&self) -> PublicKey {
        self.secret.public_key()
    }

    /// Whether a successful key exchange with `addr` has been performed.
    pub fn is_key_exchanged(&self, addr: &str) -> bool {
        self.keys.read().unwrap().contains_key(addr)
    }

    /// Installs the transport encryption transforms on a client.
    pub fn install_client(self: &Arc<Self>, target: &(impl Processor + ?Sized)) {
        self.install_transforms(target);
    }

    /// Installs the transport encryption transforms and the key exchange
    /// targets on a server.
    pub fn install_server(self: &Arc<Self>, target: &(impl Processor + ?Sized)) {
        self.install_transforms(target);
        self.install_kex_targets(target);
    }

    fn install_transforms(self: &Arc<Self>, target: &(impl Processor + ?Sized)) {
        let cr = self.clone();
        target.data_processor().add_transform(
            PIPELINE_OUT,
            move |ctx: &mut TransformContext<'_>, buf: BytesMut| cr.encrypt_transport(ctx, buf),
        );
        let cr = self.clone();
        target.data_processor().add_transform(
            PIPELINE_IN,
            move |ctx: &mut TransformContext<'_>, buf: BytesMut| cr.decrypt_transport(ctx, buf),
        );
    }

    /// Outbound transform: seals the marshalled packet for its destination.
    ///
    /// Pass-through cases, in order: the packet opts out via `_no_crypto`;
    /// no key is shared with the destination; the destination's `key_sent`
    /// latch is still open (the packet at hand is the key delivery itself,
    /// so the latch closes and the packet leaves in the clear).
    fn encrypt_transport(&self, ctx: &mut TransformContext<'_>, buf: BytesMut) -> BytesMut {
        let Some(pkt) = ctx.pkt else {
            return buf;
        };
        if is_truthy(pkt.meta(KEY_NO_CRYPTO)) {
            return buf;
        }
        let Some(entry) = self.entry(pkt.dest()) else {
            return buf;
        };
        if !entry.key_sent.swap(true, Ordering::AcqRel) {
            return buf;
        }
        match aes::encrypt(&entry.cipher, &buf) {
            Ok(ciphertext) => ciphertext,
            Err(e) => {
                ctx.stat = Status::StopError;
                ctx.msg = Some(format!("encryption error: {}", e));
                buf
            }
        }
    }

    /// Inbound transform: opens the datagram with the sender's shared key.
    /// Without a key for the sender, or when the payload does not
    /// authenticate (it may be cleartext during the initial exchange), the
    /// bytes pass through untouched.
    fn decrypt_transport(&self, ctx: &mut TransformContext<'_>, buf: BytesMut) -> BytesMut {
        let Some(from) = ctx.from else {
            return buf;
        };
        let Some(entry) = self.entry(&from.to_string()) else {
            return buf;
        };
        match aes::decrypt(&entry.cipher, &buf) {
            Ok(plaintext) => plaintext,
            Err(_) => buf,
        }
    }

    /// Derives the shared AES cipher with `peer` and records it for `addr`.
    fn store_peer(&self, addr: &str, peer: PublicKey, key_sent: bool) {
        let cipher = self.derive_cipher(&peer);
        let entry = Arc::new(KeyEntry {
            key_sent: AtomicBool::new(key_sent),
            public: peer,
            cipher,
        });
        self.keys.write().unwrap().insert(addr.to_string(), entry);
    }

    fn entry(&self, addr: &str) -> Option<Arc<KeyEntry>> {
        self.keys.read().unwrap().get(addr).cloned()
    }

    fn peer_public_key(&self, addr: &str) -> Option<PublicKey> {
        self.entry(addr).map(|entry| entry.public.clone())
    }

    /// ECDH, then HKDF-SHA256 over the X coordinate down to a 32-byte AES
    /// key. Both sides of an exchange derive the same cipher.
    fn derive_cipher(&self, peer: &PublicKey) -> Aes256Gcm {
        let shared = p256::ecdh::diffie_hellman(self.secret.to_nonzero_scalar(), peer.as_affine());
        let hk = Hkdf::<Sha256>::new(None, shared.raw_secret_bytes().as_slice());
        let mut key = [0u8; 32];
        hk.expand(KDF_INFO, &mut key)
            .expect("32 bytes is a valid HKDF-SHA256 output length");
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key))
    }
}

fn is_truthy(val: Option<&str>) -> bool {
    matches!(val, Some("true" | "t" | "yes" | "y" | "1"))
}

fn encode_public_key(public: &PublicKey) -> anyhow::Result<Vec<u8>> {
    let point = public.to_encoded_point(false);
    let (x, y) = match (point.x(), point.y()) {
        (Some(x), Some(y)) => (x, y),
        _ => bail!("public key is the identity point"),
    };
    let wire = WirePublicKey {
        x: BASE64.encode(x),
        y: BASE64.encode(y),
    };
    Ok(serde_json::to_vec(&wire)?)
}

fn decode_public_key(data: &[u8]) -> anyhow::Result<PublicKey> {
    let wire: WirePublicKey = serde_json::from_slice(data).context("malformed public key")?;
    let x = BASE64.decode(&wire.x).context("malformed public key")?;
    let y = BASE64.decode(&wire.y).context("malformed public key")?;
    if x.len() != 32 || y.len() != 32 {
        bail!("malformed public key coordinates");
    }
    let point = p256::EncodedPoint::from_affine_coordinates(
        GenericArray::from_slice(&x),
        GenericArray::from_slice(&y),
        false,
    );
    Option::<PublicKey>::from(PublicKey::from_encoded_point(&point))
        .ok_or_else(|| anyhow!("point is not on the P-256 curve"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{JsonPacket, Packet, PacketWriter};
    use crate::pipeline::{DataPipeline, PacketPipeline};
    use rstest::rstest;

    struct TestProcessor {
        data: DataPipeline,
        packet: PacketPipeline,
    }

    impl TestProcessor {
        fn new() -> TestProcessor {
            TestProcessor {
                data: DataPipeline::new(),
                packet: PacketPipeline::new(),
            }
        }
    }

    impl Processor for TestProcessor {
        fn data_processor(&self) -> &DataPipeline {
            &self.data
        }

        fn packet_processor(&self) -> &PacketPipeline {
            &self.packet
        }
    }

    #[rstest]
    #[case::word(Some("true"), true)]
    #[case::letter(Some("t"), true)]
    #[case::yes(Some("yes"), true)]
    #[case::y(Some("y"), true)]
    #[case::one(Some("1"), true)]
    #[case::falsy(Some("false"), false)]
    #[case::empty(Some(""), false)]
    #[case::absent(None, false)]
    fn test_is_truthy(#[case] val: Option<&str>, #[case] expected: bool) {
        assert_eq!(is_truthy(val), expected);
    }

    #[test]
    fn test_public_key_wire_roundtrip() {
        let cr = Crypto::new(None).unwrap();
        let decoded = decode_public_key(&cr.public_wire).unwrap();
        assert_eq!(decoded, cr.public_key());
    }

    #[rstest]
    #[case::garbage(b"not json".as_slice())]
    #[case::short_coords(br#"{"x":"AA==","y":"AA=="}"#.as_slice())]
    fn test_decode_rejects_malformed_keys(#[case] data: &[u8]) {
        assert!(decode_public_key(data).is_err());
    }

    #[test]
    fn test_decode_rejects_off_curve_point() {
        let wire = WirePublicKey {
            x: BASE64.encode([1u8; 32]),
            y: BASE64.encode([2u8; 32]),
        };
        let data = serde_json::to_vec(&wire).unwrap();
        assert!(decode_public_key(&data).is_err());
    }

    #[test]
    fn test_both_sides_derive_the_same_cipher() {
        let a = Crypto::new(None).unwrap();
        let b = Crypto::new(None).unwrap();
        a.store_peer("peer-b", b.public_key(), true);
        b.store_peer("peer-a", a.public_key(), true);

        let sealed = a.encrypt_for("peer-b", b"shared secret works").unwrap();
        let opened = b.decrypt_from("peer-a", &sealed).unwrap();
        assert_eq!(&opened[..], b"shared secret works");
    }

    #[test]
    fn test_key_exchanged_latches_for_lifetime() {
        let a = Crypto::new(None).unwrap();
        assert!(!a.is_key_exchanged("somewhere"));
        a.store_peer("somewhere", Crypto::new(None).unwrap().public_key(), true);
        assert!(a.is_key_exchanged("somewhere"));
        assert!(a.is_key_exchanged("somewhere"));
    }

    fn outbound_pkt(dest: &str, no_crypto: bool) -> JsonPacket {
        let mut pkt = JsonPacket::new();
        pkt.set_dest(dest);
        if no_crypto {
            pkt.set_meta(KEY_NO_CRYPTO, "true");
        }
        pkt.close();
        pkt
    }

    #[test]
    fn test_encrypt_transform_passthrough_without_key() {
        let cr = Arc::new(Crypto::new(None).unwrap());
        let pkt = outbound_pkt("1.2.3.4:5", false);
        let mut ctx = TransformContext::outbound(&pkt);
        let out = cr.encrypt_transport(&mut ctx, BytesMut::from(&b"payload"[..]));
        assert_eq!(&out[..], b"payload");
        assert_eq!(ctx.stat, Status::Continue);
    }

    #[test]
    fn test_encrypt_transform_honors_no_crypto() {
        let cr = Arc::new(Crypto::new(None).unwrap());
        let peer = Crypto::new(None).unwrap();
        cr.store_peer("1.2.3.4:5", peer.public_key(), true);

        let pkt = outbound_pkt("1.2.3.4:5", true);
        let mut ctx = TransformContext::outbound(&pkt);
        let out = cr.encrypt_transport(&mut ctx, BytesMut::from(&b"payload"[..]));
        assert_eq!(&out[..], b"payload");
    }

    #[test]
    fn test_encrypt_transform_first_packet_latch() {
        let cr = Arc::new(Crypto::new(None).unwrap());
        let peer = Crypto::new(None).unwrap();
        cr.store_peer("1.2.3.4:5", peer.public_key(), false);

        let pkt = outbound_pkt("1.2.3.4:5", false);

        // first packet after the exchange leaves in the clear
        let mut ctx = TransformContext::outbound(&pkt);
        let out = cr.encrypt_transport(&mut ctx, BytesMut::from(&b"payload"[..]));
        assert_eq!(&out[..], b"payload");

        // every following packet is sealed
        let mut ctx = TransformContext::outbound(&pkt);
        let out = cr.encrypt_transport(&mut ctx, BytesMut::from(&b"payload"[..]));
        assert_ne!(&out[..], b"payload");
        assert_eq!(out.len(), aes::NONCE_LEN + 7 + 16);
    }

    #[test]
    fn test_transport_transforms_are_inverses() {
        let a = Arc::new(Crypto::new(None).unwrap());
        let b = Arc::new(Crypto::new(None).unwrap());
        let b_addr: std::net::SocketAddr = "127.0.0.1:16001".parse().unwrap();
        let a_addr: std::net::SocketAddr = "127.0.0.1:16002".parse().unwrap();
        a.store_peer(&b_addr.to_string(), b.public_key(), true);
        b.store_peer(&a_addr.to_string(), a.public_key(), true);

        let pkt = outbound_pkt(&b_addr.to_string(), false);
        let mut out_ctx = TransformContext::outbound(&pkt);
        let wire = a.encrypt_transport(&mut out_ctx, BytesMut::from(&b"round and round"[..]));
        assert_ne!(&wire[..], b"round and round");

        let mut in_ctx = TransformContext::inbound(a_addr);
        let plain = b.decrypt_transport(&mut in_ctx, wire);
        assert_eq!(&plain[..], b"round and round");
    }

    #[test]
    fn test_decrypt_transform_passes_cleartext_through() {
        let cr = Arc::new(Crypto::new(None).unwrap());
        let peer = Crypto::new(None).unwrap();
        let from: std::net::SocketAddr = "127.0.0.1:16001".parse().unwrap();
        cr.store_peer(&from.to_string(), peer.public_key(), true);

        let mut ctx = TransformContext::inbound(from);
        let out = cr.decrypt_transport(&mut ctx, BytesMut::from(&b"never encrypted"[..]));
        assert_eq!(&out[..], b"never encrypted");
        assert_eq!(ctx.stat, Status::Continue);
    }

    #[test]
    fn test_install_client_registers_transforms_only() {
        let processor = TestProcessor::new();
        let cr = Arc::new(Crypto::new(None).unwrap());
        cr.install_client(&processor);

        let mut resp = JsonPacket::new();
        let mut ctx = crate::pipeline::TargetCtx {
            pkt: Box::new(JsonPacket::new()),
            target: TARGET_KEX_SERVER.to_string(),
            from: "127.0.0.1:16001".parse().unwrap(),
            stat: Status::Continue,
            msg: None,
        };
        let err = processor.packet.process(&mut ctx, resp.writer()).unwrap_err();
        assert_eq!(err.to_string(), "target not found");
    }
}

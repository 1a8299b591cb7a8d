use anyhow::Context;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::BytesMut;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::packet::{Packet, PacketWriter, KEY_TARGET};

/// The wire form: a single UTF-8 JSON object `{"m":{...},"d":"<base64>"}`.
/// `m` is the full metadata map, `d` the base64-encoded body (standard
/// alphabet, padded).
#[derive(Serialize)]
struct WireOut<'a> {
    m: &'a FxHashMap<String, String>,
    d: &'a str,
}

#[derive(Deserialize)]
struct WireIn {
    #[serde(default)]
    m: FxHashMap<String, String>,
    #[serde(default)]
    d: String,
}

/// JSON-encoded [`Packet`] implementation.
///
/// The body accumulates in a buffer through the writer view; `close` commits
/// it to the base64 string that goes on the wire. Metadata keys are unique
/// by construction (map semantics, last write wins).
#[derive(Default)]
pub struct JsonPacket {
    dest: String,
    meta: FxHashMap<String, String>,
    body: BytesMut,
    encoded: String,
}

impl JsonPacket {
    pub fn new() -> JsonPacket {
        JsonPacket::default()
    }
}

impl PacketWriter for JsonPacket {
    fn write(&mut self, data: &[u8]) {
        self.body.extend_from_slice(data);
    }

    fn set_meta(&mut self, key: &str, val: &str) {
        self.meta.insert(key.to_string(), val.to_string());
    }

    fn set_target(&mut self, target: &str) {
        self.set_meta(KEY_TARGET, target);
    }

    fn clear(&mut self) {
        self.body.clear();
    }

    fn close(&mut self) {
        self.encoded = BASE64.encode(&self.body);
    }
}

impl Packet for JsonPacket {
    fn dest(&self) -> &str {
        &self.dest
    }

    fn set_dest(&mut self, dest: &str) {
        self.dest = dest.to_string();
    }

    fn target(&self) -> &str {
        self.meta(KEY_TARGET).unwrap_or("")
    }

    fn meta(&self, key: &str) -> Option<&str> {
        self.meta.get(key).map(String::as_str)
    }

    fn data(&self) -> &[u8] {
        &self.body
    }

    fn marshal(&self) -> anyhow::Result<Vec<u8>> {
        let wire = WireOut {
            m: &self.meta,
            d: &self.encoded,
        };
        serde_json::to_vec(&wire).context("packet encode failure")
    }

    fn unmarshal(&mut self, bin: &[u8]) -> anyhow::Result<()> {
        let wire: WireIn = serde_json::from_slice(bin).context("malformed packet")?;
        let decoded = BASE64
            .decode(&wire.d)
            .context("malformed base64 packet body")?;
        self.meta = wire.m;
        self.body.clear();
        self.body.extend_from_slice(&decoded);
        self.encoded = wire.d;
        Ok(())
    }

    fn reset(&mut self) {
        self.dest.clear();
        self.meta.clear();
        self.body.clear();
        self.encoded.clear();
    }

    fn writer(&mut self) -> &mut dyn PacketWriter {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{KEY_MSG, KEY_REF};
    use rstest::rstest;

    #[test]
    fn test_marshal_unmarshal_roundtrip() {
        let mut pkt = JsonPacket::new();
        pkt.set_dest("127.0.0.1:9000");
        pkt.set_meta(KEY_REF, "abcde");
        pkt.set_target("app.echo");
        pkt.write(b"hello ");
        pkt.write(b"world");
        pkt.close();

        let bin = pkt.marshal().unwrap();

        let mut decoded = JsonPacket::new();
        decoded.unmarshal(&bin).unwrap();
        assert_eq!(decoded.meta(KEY_REF), Some("abcde"));
        assert_eq!(decoded.target(), "app.echo");
        assert_eq!(decoded.data(), b"hello world");
    }

    #[test]
    fn test_wire_shape() {
        let mut pkt = JsonPacket::new();
        pkt.set_meta(KEY_REF, "abcde");
        pkt.write(b"hi");
        pkt.close();

        let bin = pkt.marshal().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bin).unwrap();
        assert_eq!(value["m"][KEY_REF], "abcde");
        // standard alphabet, padding required
        assert_eq!(value["d"], "aGk=");
    }

    #[test]
    fn test_close_commits_body() {
        let mut pkt = JsonPacket::new();
        pkt.write(b"data");

        // not closed: the wire encoding carries no body yet
        let value: serde_json::Value = serde_json::from_slice(&pkt.marshal().unwrap()).unwrap();
        assert_eq!(value["d"], "");

        pkt.close();
        let value: serde_json::Value = serde_json::from_slice(&pkt.marshal().unwrap()).unwrap();
        assert_eq!(value["d"], BASE64.encode(b"data"));

        // re-closing without writes re-commits the same bytes
        pkt.close();
        let value: serde_json::Value = serde_json::from_slice(&pkt.marshal().unwrap()).unwrap();
        assert_eq!(value["d"], BASE64.encode(b"data"));
    }

    #[test]
    fn test_clear_resets_uncommitted_body() {
        let mut pkt = JsonPacket::new();
        pkt.write(b"scratch");
        pkt.clear();
        pkt.write(b"final");
        pkt.close();
        assert_eq!(pkt.data(), b"final");
    }

    #[test]
    fn test_meta_last_write_wins() {
        let mut pkt = JsonPacket::new();
        pkt.set_meta(KEY_MSG, "first");
        pkt.set_meta(KEY_MSG, "second");
        assert_eq!(pkt.meta(KEY_MSG), Some("second"));
    }

    #[rstest]
    #[case::not_json(b"not json".as_slice())]
    #[case::bad_base64(br#"{"m":{},"d":"!!!"}"#.as_slice())]
    fn test_unmarshal_rejects_malformed(#[case] bin: &[u8]) {
        let mut pkt = JsonPacket::new();
        assert!(pkt.unmarshal(bin).is_err());
    }

    #[test]
    fn test_unmarshal_tolerates_missing_fields() {
        let mut pkt = JsonPacket::new();
        pkt.unmarshal(b"{}").unwrap();
        assert_eq!(pkt.data(), b"");
        assert_eq!(pkt.target(), "");
    }
}

mod json_creator;
mod json_packet;

pub use json_creator::JsonPacketCreator;
pub use json_packet::JsonPacket;

/// Metadata key selecting the target callback queue on the server. Required
/// on requests.
pub const KEY_TARGET: &str = "_tgt";

/// Metadata key carrying the request fingerprint. Generated by the client if
/// absent, echoed verbatim on responses.
pub const KEY_REF: &str = "_ref";

/// Metadata key carrying the integer status of the server's processing,
/// string-encoded. `-1` marks an error packet.
pub const KEY_STATUS: &str = "_stat";

/// Metadata key carrying human-readable error text on error packets.
pub const KEY_MSG: &str = "_msg";

/// Composer view of a packet, used by target callbacks and extensions to
/// assemble a packet's metadata and body.
///
/// Body writes accumulate; [`PacketWriter::close`] commits the accumulated
/// bytes to the packet's wire encoding. A writer must be closed before the
/// packet is marshalled.
pub trait PacketWriter: Send {
    /// Appends `data` to the packet body.
    fn write(&mut self, data: &[u8]);

    /// Sets a metadata entry, last write wins.
    fn set_meta(&mut self, key: &str, val: &str);

    /// Sets the target invoked on the server (the `_tgt` metadata entry).
    fn set_target(&mut self, target: &str);

    /// Resets the packet body, discarding uncommitted writes.
    fn clear(&mut self);

    /// Commits the body to the packet's wire encoding. Closing again without
    /// intervening writes re-commits the same bytes.
    fn close(&mut self);
}

/// A self-describing unit of transfer: a destination address, a string
/// metadata map and an opaque data body.
///
/// The trait doubles as the packet's writer facade so that callbacks can
/// compose responses without knowing the concrete wire type.
pub trait Packet: PacketWriter + Send + Sync + 'static {
    /// The address this packet is destined to, resolvable via name lookup.
    fn dest(&self) -> &str;

    fn set_dest(&mut self, dest: &str);

    /// The target this packet invokes on the server (`_tgt`), or the empty
    /// string if unset.
    fn target(&self) -> &str;

    fn meta(&self, key: &str) -> Option<&str>;

    /// The decoded packet body.
    fn data(&self) -> &[u8];

    /// Encodes the packet to its wire representation.
    fn marshal(&self) -> anyhow::Result<Vec<u8>>;

    /// Decodes the wire representation into this packet, replacing metadata
    /// and body wholesale.
    fn unmarshal(&mut self, bin: &[u8]) -> anyhow::Result<()>;

    /// Zeroes the packet: metadata cleared, body and wire encoding reset,
    /// destination emptied. Used by creators recycling pooled packets.
    fn reset(&mut self);

    /// The writer view of this packet.
    fn writer(&mut self) -> &mut dyn PacketWriter;
}

/// Creates packets on behalf of servers and clients, keeping them agnostic
/// to the concrete wire type. Implementations may pool packets; every packet
/// handed out is freshly zeroed either way.
pub trait PacketCreator: Send + Sync + 'static {
    /// A zeroed packet with the given request fingerprint and destination.
    fn new_pkt(&self, pkt_ref: &str, dest: &str) -> Box<dyn Packet>;

    /// An error packet: `_stat` is `-1` and `_msg` carries the reason.
    fn new_err_pkt(&self, pkt_ref: &str, dest: &str, msg: &str) -> Box<dyn Packet>;

    /// Returns a packet to the creator once its response has been consumed
    /// or dropped. A packet must be returned at most once.
    fn put_back(&self, pkt: Box<dyn Packet>);
}

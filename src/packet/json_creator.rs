use std::sync::Mutex;

use tracing::{debug, trace};

use crate::packet::json_packet::JsonPacket;
use crate::packet::{Packet, PacketCreator, KEY_MSG, KEY_REF, KEY_STATUS};

/// [`PacketCreator`] for [`JsonPacket`], backed by a pool to amortize
/// allocations on busy servers.
///
/// Pooling is transparent: packets handed out are always zeroed, whether
/// they come from the pool or are freshly allocated.
pub struct JsonPacketCreator {
    pool: Mutex<Vec<Box<dyn Packet>>>,
}

impl JsonPacketCreator {
    /// Creates a creator with a pool of capacity `pool_size`, pre-filled
    /// with that many packets.
    pub fn new(pool_size: usize) -> JsonPacketCreator {
        let pc = JsonPacketCreator {
            pool: Mutex::new(Vec::with_capacity(pool_size)),
        };
        pc.warmup(pool_size);
        pc
    }

    /// Pre-fills the pool with up to `num_packets` packets.
    pub fn warmup(&self, num_packets: usize) {
        let mut pool = self.pool.lock().unwrap();
        while pool.capacity() > pool.len() && num_packets > pool.len() {
            pool.push(Box::new(JsonPacket::new()));
        }
    }

    fn get_from_pool(&self) -> Box<dyn Packet> {
        {
            let mut pool = self.pool.lock().unwrap();
            if let Some(pkt) = pool.pop() {
                trace!("returning packet from pool");
                return pkt;
            }
        }
        debug!("no packet in pool: allocating");
        Box::new(JsonPacket::new())
    }
}

impl PacketCreator for JsonPacketCreator {
    fn new_pkt(&self, pkt_ref: &str, dest: &str) -> Box<dyn Packet> {
        let mut pkt = self.get_from_pool();
        pkt.reset();
        pkt.set_dest(dest);
        pkt.set_meta(KEY_REF, pkt_ref);
        pkt
    }

    fn new_err_pkt(&self, pkt_ref: &str, dest: &str, msg: &str) -> Box<dyn Packet> {
        let mut pkt = self.new_pkt(pkt_ref, dest);
        pkt.set_meta(KEY_STATUS, "-1");
        pkt.set_meta(KEY_MSG, msg);
        pkt
    }

    fn put_back(&self, pkt: Box<dyn Packet>) {
        let mut pool = self.pool.lock().unwrap();
        if pool.capacity() > pool.len() {
            trace!("returning packet to pool");
            pool.push(pkt);
        } else {
            debug!("pool is full: discarding returned packet");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_pkt_is_zeroed_after_recycling() {
        let pc = JsonPacketCreator::new(4);

        let mut pkt = pc.new_pkt("aaaaa", "1.2.3.4:5");
        pkt.set_meta("junk", "value");
        pkt.write(b"leftover");
        pkt.close();
        pc.put_back(pkt);

        let pkt = pc.new_pkt("bbbbb", "5.6.7.8:9");
        assert_eq!(pkt.meta(KEY_REF), Some("bbbbb"));
        assert_eq!(pkt.meta("junk"), None);
        assert_eq!(pkt.dest(), "5.6.7.8:9");
        assert_eq!(pkt.data(), b"");
    }

    #[test]
    fn test_err_pkt_metadata() {
        let pc = JsonPacketCreator::new(1);
        let pkt = pc.new_err_pkt("abcde", "1.2.3.4:5", "target not found");
        assert_eq!(pkt.meta(KEY_STATUS), Some("-1"));
        assert_eq!(pkt.meta(KEY_MSG), Some("target not found"));
        assert_eq!(pkt.meta(KEY_REF), Some("abcde"));
    }

    #[test]
    fn test_pool_bounded() {
        let pc = JsonPacketCreator::new(1);
        // both returns succeed; the pool silently drops the overflow
        pc.put_back(Box::new(JsonPacket::new()));
        pc.put_back(Box::new(JsonPacket::new()));
        let _ = pc.new_pkt("", "");
    }
}

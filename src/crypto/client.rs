use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use tokio::sync::oneshot;

use crate::client::Client;
use crate::crypto::server::PeerLookup;
use crate::crypto::{aes, decode_public_key, Crypto, TARGET_KEX_CLIENT, TARGET_KEX_SERVER};
use crate::packet::{Packet, PacketWriter, KEY_MSG, KEY_STATUS};

impl Crypto {
    /// Writes the configuration (target, body) for a client-server key
    /// exchange to `pw`, discarding anything written before. The packet is
    /// ready to send afterwards; do not write to it again.
    pub fn configure_kex_server_pkt(&self, pw: &mut dyn PacketWriter) {
        pw.clear();
        pw.set_target(TARGET_KEX_SERVER);
        pw.write(&self.public_wire);
        pw.close();
    }

    /// Writes the configuration for a client-client key exchange with
    /// `addr` to `pw`, discarding anything written before.
    pub fn configure_kex_client_pkt(&self, addr: &str, pw: &mut dyn PacketWriter) {
        pw.clear();
        pw.set_target(TARGET_KEX_CLIENT);
        let lookup = serde_json::to_vec(&PeerLookup {
            ip: addr.to_string(),
        })
        .expect("peer lookup body is serializable");
        pw.write(&lookup);
        pw.close();
    }

    /// Processes the response to a key exchange with `addr`, storing the
    /// peer's public key and the derived shared cipher.
    pub fn process_kex_resp(&self, addr: &str, resp: &dyn Packet) -> anyhow::Result<()> {
        if resp.meta(KEY_STATUS) == Some("-1") {
            bail!(
                "key exchange rejected: {}",
                resp.meta(KEY_MSG).unwrap_or("unknown error")
            );
        }
        let peer_key = decode_public_key(resp.data()).context("key exchange response")?;
        self.store_peer(addr, peer_key, true);
        Ok(())
    }

    /// Performs a key exchange with the server at `server_addr`, consuming
    /// `pkt` as the request vehicle. On success packets between this client
    /// and the server can be transport-encrypted: the whole marshalled
    /// packet, metadata included.
    ///
    /// No other packet may be in flight to the server while the handshake
    /// runs; the first outgoing packet to a fresh peer must be the key
    /// delivery.
    pub async fn server_kex(
        &self,
        client: &dyn Client,
        server_addr: &str,
        mut pkt: Box<dyn Packet>,
    ) -> anyhow::Result<()> {
        self.configure_kex_server_pkt(pkt.writer());
        let (resp_tx, resp_rx) = oneshot::channel();
        client.send(pkt, resp_tx).await?;
        let resp = resp_rx
            .await
            .map_err(|_| anyhow!("handshake response channel closed"))?;
        self.process_kex_resp(server_addr, resp.as_ref())
            .context("handshake error")
    }

    /// Obtains the public key of the client at `peer_addr` through the
    /// server, consuming `pkt` as the request vehicle. On success the
    /// end-to-end helpers work for `peer_addr`.
    pub async fn client_kex(
        &self,
        client: &dyn Client,
        peer_addr: &str,
        mut pkt: Box<dyn Packet>,
    ) -> anyhow::Result<()> {
        self.configure_kex_client_pkt(peer_addr, pkt.writer());
        let (resp_tx, resp_rx) = oneshot::channel();
        client.send(pkt, resp_tx).await?;
        let resp = resp_rx
            .await
            .map_err(|_| anyhow!("handshake response channel closed"))?;
        self.process_kex_resp(peer_addr, resp.as_ref())
            .context("client key exchange error")
    }

    /// Encrypts `data` under the key shared with `addr`.
    pub fn encrypt_for(&self, addr: &str, data: &[u8]) -> anyhow::Result<Vec<u8>> {
        let entry = self
            .entry(addr)
            .ok_or_else(|| anyhow!("keys not exchanged"))?;
        Ok(aes::encrypt(&entry.cipher, data)?.to_vec())
    }

    /// Decrypts `data` under the key shared with `addr`.
    pub fn decrypt_from(&self, addr: &str, data: &[u8]) -> anyhow::Result<Vec<u8>> {
        let entry = self
            .entry(addr)
            .ok_or_else(|| anyhow!("keys not exchanged"))?;
        Ok(aes::decrypt(&entry.cipher, data)?.to_vec())
    }

    /// Rewrites the packet body with its encryption for `to`, leaving
    /// metadata in plain text. Used for packets relayed through the server
    /// to another client: the server can still route them, only the `to`
    /// client can read them.
    pub fn encrypt_e2e(&self, to: &str, pkt: &mut dyn Packet) -> anyhow::Result<()> {
        let sealed = self
            .encrypt_for(to, pkt.data())
            .context("e2e encrypt error")?;
        let writer = pkt.writer();
        writer.clear();
        writer.write(&sealed);
        writer.close();
        Ok(())
    }

    /// Rewrites the packet body with its decryption under the key shared
    /// with `from`, undoing [`Crypto::encrypt_e2e`] on the receiving side.
    pub fn decrypt_e2e(&self, from: &str, pkt: &mut dyn Packet) -> anyhow::Result<()> {
        let opened = self
            .decrypt_from(from, pkt.data())
            .context("e2e decrypt error")?;
        let writer = pkt.writer();
        writer.clear();
        writer.write(&opened);
        writer.close();
        Ok(())
    }

    /// Secures `client` against the server at `server_addr`: generates a
    /// key, performs the server key exchange (consuming `pkt`) and installs
    /// the transport transforms. Returns the extension for further key
    /// exchanges and end-to-end use.
    pub async fn configure_client(
        client: &dyn Client,
        server_addr: &str,
        pkt: Box<dyn Packet>,
    ) -> anyhow::Result<Arc<Crypto>> {
        let cr = Arc::new(Crypto::new(None)?);
        cr.server_kex(client, server_addr, pkt).await?;
        cr.install_client(client);
        Ok(cr)
    }
}

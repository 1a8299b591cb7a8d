use aead::{AeadCore, AeadInPlace, Nonce, OsRng};
use aes_gcm::Aes256Gcm;
use anyhow::{anyhow, bail};
use bytes::BytesMut;

/// Length of the GCM nonce prepended to every sealed message.
pub(crate) const NONCE_LEN: usize = 12;

/// Seals `plaintext` under `cipher`, producing `nonce || ciphertext || tag`
/// with a fresh random nonce.
pub(crate) fn encrypt(cipher: &Aes256Gcm, plaintext: &[u8]) -> anyhow::Result<BytesMut> {
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let mut buf = BytesMut::with_capacity(NONCE_LEN + plaintext.len() + 16);
    buf.extend_from_slice(nonce.as_slice());
    buf.extend_from_slice(plaintext);

    let mut body = buf.split_off(NONCE_LEN);
    cipher
        .encrypt_in_place(&nonce, b"", &mut body)
        .map_err(|_| anyhow!("encryption failure"))?;
    buf.unsplit(body);
    Ok(buf)
}

/// Opens a message produced by [`encrypt`]. Fails when the payload is too
/// short to carry a nonce or does not authenticate under `cipher`.
pub(crate) fn decrypt(cipher: &Aes256Gcm, data: &[u8]) -> anyhow::Result<BytesMut> {
    if data.len() < NONCE_LEN {
        bail!("payload too short");
    }
    let nonce = Nonce::<Aes256Gcm>::clone_from_slice(&data[..NONCE_LEN]);
    let mut buf = BytesMut::from(&data[NONCE_LEN..]);
    cipher
        .decrypt_in_place(&nonce, b"", &mut buf)
        .map_err(|_| anyhow!("decryption failure"))?;
    Ok(buf)
}

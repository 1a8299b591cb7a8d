use rand::Rng;

/// Characters a request fingerprint is drawn from.
const REF_CHARSET: &[u8] =
    br#"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789!@#$%^&*()_+{}[];':",./<>?\|"#;

/// Length of generated request fingerprints.
pub const REF_LEN: usize = 5;

/// Generates a random request fingerprint of `len` printable characters.
pub fn gen_ref(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| REF_CHARSET[rng.random_range(0..REF_CHARSET.len())] as char)
        .collect()
}

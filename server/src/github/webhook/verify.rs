use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_PREFIX: &str = "sha256=";

/// `sha256=<hex>` as GitHub sends it in `X-Hub-Signature-256`
pub fn sign(secret: &[u8], body: &[u8]) -> String {
    // HMAC accepts keys of any length
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC key of any size");
    mac.update(body);
    format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
}

/// Check a delivery against the shared webhook secret. Missing or malformed
/// headers never verify. The comparison runs in constant time.
pub fn verify(secret: &[u8], body: &[u8], signature_header: Option<&str>) -> bool {
    let Some(header) = signature_header else {
        return false;
    };
    if !header.starts_with(SIGNATURE_PREFIX) {
        return false;
    }

    let expected = sign(secret, body);
    if expected.len() != header.len() {
        return false;
    }

    expected.as_bytes().ct_eq(header.as_bytes()).into()
}

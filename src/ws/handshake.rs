//! Opening handshake keys

use rand::Rng;

/// GUID appended to the client key before hashing
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Protocol version this crate speaks
pub const WS_VERSION: &str = "13";

/// `Sec-WebSocket-Accept` for a `Sec-WebSocket-Key`
pub fn accept_key(key: &str) -> String {
    let mut input = String::with_capacity(key.len() + WS_GUID.len());
    input.push_str(key);
    input.push_str(WS_GUID);
    openssl::base64::encode_block(&openssl::sha::sha1(input.as_bytes()))
}

/// Fresh `Sec-WebSocket-Key`: 16 random bytes, Base64 encoded
pub fn generate_key() -> String {
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill(&mut nonce[..]);
    openssl::base64::encode_block(&nonce)
}

/// `Connection` values accepted on an upgrade
pub fn is_upgrade_connection(value: &str) -> bool {
    value.eq_ignore_ascii_case("Upgrade") || value.eq_ignore_ascii_case("keep-alive, Upgrade")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc6455_reference_accept() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_generated_keys() {
        let key = generate_key();
        assert_eq!(key.len(), 24);
        assert_eq!(openssl::base64::decode_block(&key).unwrap().len(), 16);
        assert_ne!(key, generate_key());
    }

    #[test]
    fn test_connection_values() {
        assert!(is_upgrade_connection("upgrade"));
        assert!(is_upgrade_connection("Keep-Alive, Upgrade"));
        assert!(!is_upgrade_connection("keep-alive"));
        assert!(!is_upgrade_connection("Upgrade, keep-alive"));
    }
}

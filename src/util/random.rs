use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use rand::RngCore;
#[cfg(test)] use std::sync::Mutex;

/// number of random bytes in a connection's unique id (12 characters in base64)
pub const UNIQUE_ID_LENGTH: usize = 9;
const WEBSOCKET_KEY_LENGTH: usize = 16;

#[cfg(test)]
/// automock expectations for static methods are global - hold this lock to avoid races
pub static MOCK_RANDOM_MUTEX: Mutex<()> = Mutex::new(());

#[cfg_attr(test, mockall::automock)]
pub trait Random {
    fn fill_bytes(buf: &mut [u8]);
}
pub struct RngRandom {}
impl Random for RngRandom {
    fn fill_bytes(buf: &mut [u8]) {
        rand::rng().fill_bytes(buf)
    }
}

/// A random id that is not taken yet. Ids are URL safe base64 strings.
pub fn unique_id<R: Random>(is_taken: impl Fn(&str) -> bool) -> String {
    loop {
        let mut raw = [0u8; UNIQUE_ID_LENGTH];
        R::fill_bytes(&mut raw);
        let id = URL_SAFE_NO_PAD.encode(raw);
        if !is_taken(&id) {
            return id;
        }
    }
}

/// a fresh `Sec-WebSocket-Key` value
pub fn websocket_key<R: Random>() -> String {
    let mut raw = [0u8; WEBSOCKET_KEY_LENGTH];
    R::fill_bytes(&mut raw);
    STANDARD.encode(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::Sequence;

    #[test]
    fn test_unique_id_format() {
        let id = unique_id::<RngRandom>(|_| false);
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_unique_id_retries_on_collision() {
        let _lock = MOCK_RANDOM_MUTEX.lock().unwrap_or_else(|e| e.into_inner());

        let mut seq = Sequence::new();
        let ctx = MockRandom::fill_bytes_context();
        ctx.expect()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|buf| buf.fill(0));
        ctx.expect()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|buf| buf.fill(0xff));

        let taken = URL_SAFE_NO_PAD.encode([0u8; UNIQUE_ID_LENGTH]);
        let id = unique_id::<MockRandom>(|id| id == taken);
        assert_eq!(id, "____________");
    }

    #[test]
    fn test_websocket_key() {
        let key = websocket_key::<RngRandom>();
        assert_eq!(STANDARD.decode(&key).unwrap().len(), 16);
        assert_ne!(key, websocket_key::<RngRandom>());
    }
}

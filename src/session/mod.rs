//! Cookie-backed sessions with flash data and auth helpers.
//!
//! The whole session rides in one opaque cookie: the serialized map is
//! authenticated with HMAC-SHA256 under the application key and
//! base64-encoded. A cookie that fails verification yields a fresh session.
//!
//! A `Session` is a shared handle: the kernel keeps one clone to re-seal
//! the cookie after the handler has consumed the request, so writes made
//! anywhere during the request all land in the response cookie.

use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde_json::{Map, Value};
use sha2::Sha256;
use std::sync::{Arc, Mutex};

type HmacSha256 = Hmac<Sha256>;

pub const SESSION_COOKIE: &str = "arbor_session";

const AUTH_KEY: &str = "auth_id";
const CSRF_KEY: &str = "csrf_token";

#[derive(Debug, Default)]
struct SessionState {
    data: Map<String, Value>,
    /// Flash values from the previous request; readable now, gone after.
    flash_in: Map<String, Value>,
    /// Flash values set now; serialized for exactly one next request.
    flash_out: Map<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct Session {
    inner: Arc<Mutex<SessionState>>,
}

impl Session {
    pub fn new() -> Session {
        Session::default()
    }

    /// Decode and verify a session cookie. Tampering, bad base64 or bad
    /// JSON all start over with an empty session.
    pub fn unseal(cookie_value: &str, key: &str) -> Session {
        let Some((payload_b64, mac_b64)) = cookie_value.rsplit_once('.') else {
            return Session::new();
        };
        let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let (Ok(payload), Ok(mac)) = (engine.decode(payload_b64), engine.decode(mac_b64)) else {
            return Session::new();
        };
        let Ok(mut verifier) = HmacSha256::new_from_slice(key.as_bytes()) else {
            return Session::new();
        };
        verifier.update(&payload);
        if verifier.verify_slice(&mac).is_err() {
            return Session::new();
        }
        let Ok(Value::Object(envelope)) = serde_json::from_slice::<Value>(&payload) else {
            return Session::new();
        };

        let mut state = SessionState::default();
        if let Some(Value::Object(data)) = envelope.get("data").cloned() {
            state.data = data;
        }
        if let Some(Value::Object(flash)) = envelope.get("flash").cloned() {
            state.flash_in = flash;
        }
        Session {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    /// Serialize and authenticate for the Set-Cookie header. Only flash set
    /// during this request survives into the envelope.
    pub fn seal(&self, key: &str) -> String {
        let state = self.inner.lock().unwrap();
        let envelope = serde_json::json!({
            "data": state.data,
            "flash": state.flash_out,
        });
        let payload = envelope.to_string().into_bytes();
        let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let mut signer =
            HmacSha256::new_from_slice(key.as_bytes()).expect("HMAC accepts any key length");
        signer.update(&payload);
        let mac = signer.finalize().into_bytes();
        format!("{}.{}", engine.encode(payload), engine.encode(mac))
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.lock().unwrap().data.get(key).cloned()
    }

    pub fn put<V: Into<Value>>(&self, key: &str, value: V) {
        self.inner
            .lock()
            .unwrap()
            .data
            .insert(key.to_string(), value.into());
    }

    pub fn forget(&self, key: &str) {
        self.inner.lock().unwrap().data.remove(key);
    }

    /// Read and remove in one step.
    pub fn pull(&self, key: &str) -> Option<Value> {
        self.inner.lock().unwrap().data.remove(key)
    }

    /// Stash a value for exactly the next request.
    pub fn flash<V: Into<Value>>(&self, key: &str, value: V) {
        self.inner
            .lock()
            .unwrap()
            .flash_out
            .insert(key.to_string(), value.into());
    }

    /// A value flashed by the previous request.
    pub fn flashed(&self, key: &str) -> Option<Value> {
        self.inner.lock().unwrap().flash_in.get(key).cloned()
    }

    /// Keep the previous request's flash alive for one more request.
    pub fn reflash(&self) {
        let mut state = self.inner.lock().unwrap();
        let carried = state.flash_in.clone();
        for (key, value) in carried {
            state.flash_out.insert(key, value);
        }
    }

    // Auth helpers. The framework stores only an opaque identifier; what it
    // names is up to the application.

    pub fn login<V: Into<Value>>(&self, id: V) {
        self.inner
            .lock()
            .unwrap()
            .data
            .insert(AUTH_KEY.to_string(), id.into());
    }

    pub fn logout(&self) {
        self.inner.lock().unwrap().data.remove(AUTH_KEY);
    }

    pub fn check(&self) -> bool {
        self.inner
            .lock()
            .unwrap()
            .data
            .get(AUTH_KEY)
            .map(|v| !v.is_null())
            .unwrap_or(false)
    }

    pub fn auth_id(&self) -> Option<Value> {
        self.inner.lock().unwrap().data.get(AUTH_KEY).cloned()
    }

    /// The session's CSRF token, minted on first use.
    pub fn csrf_token(&self) -> String {
        let mut state = self.inner.lock().unwrap();
        if let Some(Value::String(token)) = state.data.get(CSRF_KEY) {
            return token.clone();
        }
        let mut bytes = [0u8; 20];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
        state
            .data
            .insert(CSRF_KEY.to_string(), Value::String(token.clone()));
        token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "test-application-key";

    #[test]
    fn seal_unseal_round_trip() {
        let session = Session::new();
        session.put("user", "ada");
        session.flash("notice", "saved");
        let cookie = session.seal(KEY);

        let restored = Session::unseal(&cookie, KEY);
        assert_eq!(restored.get("user"), Some(Value::String("ada".into())));
        // Flash set last request is readable now...
        assert_eq!(
            restored.flashed("notice"),
            Some(Value::String("saved".into()))
        );
        // ...and not serialized again.
        let next = Session::unseal(&restored.seal(KEY), KEY);
        assert!(next.flashed("notice").is_none());
    }

    #[test]
    fn tampered_cookie_yields_fresh_session() {
        let session = Session::new();
        session.put("user", "ada");
        let cookie = session.seal(KEY);
        let mut tampered = cookie.clone();
        tampered.replace_range(0..2, "zz");
        assert!(Session::unseal(&tampered, KEY).get("user").is_none());
        // Wrong key too.
        assert!(Session::unseal(&cookie, "other-key").get("user").is_none());
    }

    #[test]
    fn clones_share_state() {
        let session = Session::new();
        let view = session.clone();
        session.put("user", 7);
        assert_eq!(view.get("user"), Some(Value::from(7)));
    }

    #[test]
    fn reflash_extends_flash_one_request() {
        let session = Session::new();
        session.flash("old", "kept");
        let second = Session::unseal(&session.seal(KEY), KEY);
        second.reflash();
        let third = Session::unseal(&second.seal(KEY), KEY);
        assert_eq!(third.flashed("old"), Some(Value::String("kept".into())));
    }

    #[test]
    fn auth_helpers() {
        let session = Session::new();
        assert!(!session.check());
        session.login(42);
        assert!(session.check());
        assert_eq!(session.auth_id(), Some(Value::from(42)));
        session.logout();
        assert!(!session.check());
    }

    #[test]
    fn csrf_token_is_stable_within_session() {
        let session = Session::new();
        let first = session.csrf_token();
        assert_eq!(first.len(), 40);
        assert_eq!(session.csrf_token(), first);
    }
}

use std::time::Duration;

/// Default relay host, used when the caller does not point the session at a
/// self-hosted relay.
pub const DEFAULT_HOST: &str = "0.peerjs.com";
pub const DEFAULT_PORT: u16 = 443;
pub const DEFAULT_KEY: &str = "peerjs";

/// Protocol revision appended to the signaling handshake query string.
pub const PROTOCOL_VERSION: &str = "1";

/// Payloads whose encoded size exceeds this are split into chunks. Chosen
/// below the smallest known transport-imposed message ceiling.
pub const CHUNK_THRESHOLD: usize = 16_300;

/// Outbound sends defer once the transport reports more than this many
/// buffered bytes.
pub const MAX_BUFFERED_AMOUNT: u64 = 8 * 1024 * 1024;

/// How long a deferred send path waits before retrying the queue.
pub const BUFFER_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Keepalive cadence on the signaling socket.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(5);

/// Relay endpoint parts plus the tunables of the transport discipline.
///
/// The websocket and HTTP endpoints are derived from these parts once, at
/// construction, never re-derived at runtime.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// `None` picks wss/https for the cloud host and plain schemes otherwise.
    pub secure: Option<bool>,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub key: String,
    pub ping_interval: Duration,
    pub chunk_threshold: usize,
    pub max_buffered_amount: u64,
    pub buffer_retry_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            secure: None,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            path: "/".to_string(),
            key: DEFAULT_KEY.to_string(),
            ping_interval: DEFAULT_PING_INTERVAL,
            chunk_threshold: CHUNK_THRESHOLD,
            max_buffered_amount: MAX_BUFFERED_AMOUNT,
            buffer_retry_delay: BUFFER_RETRY_DELAY,
        }
    }
}

impl SessionConfig {
    /// Config pointed at a self-hosted relay.
    pub fn with_endpoint(host: impl Into<String>, port: u16, path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            path: path.into(),
            secure: Some(false),
            ..Self::default()
        }
        .normalized()
    }

    /// Ensures the path leads and trails with `/` so endpoint assembly can
    /// concatenate blindly.
    pub fn normalized(mut self) -> Self {
        if !self.path.starts_with('/') {
            self.path.insert(0, '/');
        }
        if !self.path.ends_with('/') {
            self.path.push('/');
        }
        self
    }

    pub fn is_secure(&self) -> bool {
        match self.secure {
            Some(secure) => secure,
            None => self.host == DEFAULT_HOST,
        }
    }

    /// Base websocket endpoint; the socket appends identity, token, and
    /// protocol version when it starts.
    pub fn ws_endpoint(&self) -> String {
        let scheme = if self.is_secure() { "wss" } else { "ws" };
        format!(
            "{scheme}://{}:{}{}peerjs?key={}",
            self.host, self.port, self.path, self.key
        )
    }

    /// Base HTTP endpoint for the directory collaborator.
    pub fn http_endpoint(&self) -> String {
        let scheme = if self.is_secure() { "https" } else { "http" };
        format!(
            "{scheme}://{}:{}{}{}",
            self.host, self.port, self.path, self.key
        )
    }
}

/// Identities are alphanumeric runs optionally joined by single space,
/// underscore, or hyphen separators.
pub fn valid_identity(id: &str) -> bool {
    let mut expect_alnum = true;
    for c in id.chars() {
        if c.is_ascii_alphanumeric() {
            expect_alnum = false;
        } else if matches!(c, ' ' | '_' | '-') {
            if expect_alnum {
                return false;
            }
            expect_alnum = true;
        } else {
            return false;
        }
    }
    !expect_alnum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_derive_from_parts() {
        let config = SessionConfig::with_endpoint("relay.example", 9000, "broker");
        assert_eq!(
            config.ws_endpoint(),
            "ws://relay.example:9000/broker/peerjs?key=peerjs"
        );
        assert_eq!(
            config.http_endpoint(),
            "http://relay.example:9000/broker/peerjs"
        );
    }

    #[test]
    fn cloud_host_defaults_to_secure() {
        let config = SessionConfig::default();
        assert!(config.is_secure());
        assert!(config.ws_endpoint().starts_with("wss://"));
    }

    #[test]
    fn identity_validation() {
        assert!(valid_identity("p1"));
        assert!(valid_identity("alpha-beta_7 gamma"));
        assert!(!valid_identity(""));
        assert!(!valid_identity("-leading"));
        assert!(!valid_identity("trailing-"));
        assert!(!valid_identity("double--sep"));
        assert!(!valid_identity("bad!chars"));
    }
}

//! Configuration for client channels and length-prefixed server connections.
//!
//! Both configs have sensible defaults and can be tuned with fluent setters
//! or loaded from JSON:
//!
//! ```
//! use mh_stream::config::ServerConfig;
//!
//! let config = ServerConfig::from_json_str(r#"{ "max_entity_size": 4096 }"#).unwrap();
//! assert_eq!(config.max_entity_size, 4096);
//! ```

use serde::{Deserialize, Deserializer};

use crate::error::Result;
use crate::protocol::MAX_BODY_CHUNK;

/// Default size of a pooled receive buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// Default number of idle buffers a pool keeps around.
pub const DEFAULT_POOL_CAPACITY: usize = 64;

/// Default maximum entity size for length-prefixed requests (10 MB).
pub const DEFAULT_MAX_ENTITY_SIZE: usize = 10 * 1024 * 1024;

/// Default cap on bytes read while assembling a single request (10 MB).
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 10 * 1024 * 1024;

/// Configuration for a client channel.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Largest body payload carried by one outbound data packet.
    ///
    /// Clamped to `1..=MAX_BODY_CHUNK` when deserialized.
    #[serde(deserialize_with = "clamped_body_chunk")]
    pub max_body_chunk: usize,
    /// Body credit available before the backend requests any chunk.
    ///
    /// The backend expects the first body packet unsolicited, so this
    /// defaults to one full chunk.
    pub initial_body_credit: usize,
    /// Size of pooled receive buffers.
    pub buffer_size: usize,
    /// Idle buffers retained by the receive pool.
    pub pool_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_body_chunk: MAX_BODY_CHUNK,
            initial_body_credit: MAX_BODY_CHUNK,
            buffer_size: DEFAULT_BUFFER_SIZE,
            pool_capacity: DEFAULT_POOL_CAPACITY,
        }
    }
}

impl ChannelConfig {
    /// Load a config from JSON; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Set the largest body payload per data packet (clamped to the wire maximum).
    pub fn max_body_chunk(mut self, size: usize) -> Self {
        self.max_body_chunk = size.clamp(1, MAX_BODY_CHUNK);
        self
    }

    /// Set the body credit available before the first credit grant.
    pub fn initial_body_credit(mut self, credit: usize) -> Self {
        self.initial_body_credit = credit;
        self
    }

    /// Set the pooled receive buffer size.
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Set how many idle buffers the pool keeps.
    pub fn pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }
}

fn clamped_body_chunk<'de, D>(deserializer: D) -> std::result::Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(usize::deserialize(deserializer)?.clamp(1, MAX_BODY_CHUNK))
}

/// Configuration for a length-prefixed server connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Largest payload a length header may declare; also the scratch capacity.
    pub max_entity_size: usize,
    /// Largest number of bytes read while assembling one request.
    pub max_request_size: usize,
    /// Size of pooled read buffers.
    pub buffer_size: usize,
    /// Idle buffers retained by the read pool.
    pub pool_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_entity_size: DEFAULT_MAX_ENTITY_SIZE,
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            pool_capacity: DEFAULT_POOL_CAPACITY,
        }
    }
}

impl ServerConfig {
    /// Load a config from JSON; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Set the maximum entity size.
    pub fn max_entity_size(mut self, size: usize) -> Self {
        self.max_entity_size = size;
        self
    }

    /// Set the maximum number of bytes read per request.
    pub fn max_request_size(mut self, size: usize) -> Self {
        self.max_request_size = size;
        self
    }

    /// Set the pooled read buffer size.
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Set how many idle buffers the pool keeps.
    pub fn pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }
}

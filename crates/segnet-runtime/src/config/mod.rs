//! Runtime configuration
//!
//! Library defaults with environment overrides, like [`PoolConfig`].
//!
//! # Example
//!
//! ```rust,ignore
//! use segnet_runtime::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_env()
//!     .read_limit(16 * 1024)
//!     .tcp_nodelay(false);
//! config.validate()?;
//! ```

pub mod defaults;

use segnet_core::constants::PACKET_HEADER_SIZE;
use segnet_core::env::{env_get, env_get_bool};
use segnet_core::error::NetError;
use segnet_core::pool::PoolConfig;

use crate::async_socket::EncodeMode;

/// Configuration shared by every socket a `segnet::Runtime` creates.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Block pool sizing
    pub pool: PoolConfig,
    /// `listen(2)` backlog
    pub listen_backlog: i32,
    /// Bytes read per READ event
    pub read_limit: usize,
    /// Largest packet payload sent or accepted
    pub max_payload: usize,
    /// TCP_NODELAY on accepted and connected sockets
    pub tcp_nodelay: bool,
    /// Base64-encode flagged blocks on write
    pub encode_base64: bool,
    /// SO_REUSEADDR on listeners
    pub reuse_addr: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Defaults with environment overrides (all optional):
    /// - `SEGNET_POOL_MAX_BLOCKS` / `SEGNET_POOL_MAX_FREE` - see [`PoolConfig`]
    /// - `SEGNET_LISTEN_BACKLOG` - listen backlog
    /// - `SEGNET_READ_LIMIT` - bytes per READ event
    /// - `SEGNET_MAX_PAYLOAD` - packet payload limit
    /// - `SEGNET_TCP_NODELAY` - TCP_NODELAY (0/1)
    /// - `SEGNET_ENCODE_BASE64` - base64 for flagged blocks (0/1)
    /// - `SEGNET_REUSE_ADDR` - SO_REUSEADDR on listeners (0/1)
    pub fn from_env() -> Self {
        Self {
            pool: PoolConfig::from_env(),
            listen_backlog: env_get("SEGNET_LISTEN_BACKLOG", defaults::LISTEN_BACKLOG),
            read_limit: env_get("SEGNET_READ_LIMIT", defaults::READ_LIMIT),
            max_payload: env_get("SEGNET_MAX_PAYLOAD", defaults::MAX_PAYLOAD),
            tcp_nodelay: env_get_bool("SEGNET_TCP_NODELAY", defaults::TCP_NODELAY),
            encode_base64: env_get_bool("SEGNET_ENCODE_BASE64", defaults::ENCODE_BASE64),
            reuse_addr: env_get_bool("SEGNET_REUSE_ADDR", defaults::REUSE_ADDR),
        }
    }

    /// Library defaults, no environment lookups.
    pub fn new() -> Self {
        Self {
            pool: PoolConfig::new(),
            listen_backlog: defaults::LISTEN_BACKLOG,
            read_limit: defaults::READ_LIMIT,
            max_payload: defaults::MAX_PAYLOAD,
            tcp_nodelay: defaults::TCP_NODELAY,
            encode_base64: defaults::ENCODE_BASE64,
            reuse_addr: defaults::REUSE_ADDR,
        }
    }

    // Builder methods

    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn listen_backlog(mut self, n: i32) -> Self {
        self.listen_backlog = n;
        self
    }

    pub fn read_limit(mut self, n: usize) -> Self {
        self.read_limit = n;
        self
    }

    pub fn max_payload(mut self, n: usize) -> Self {
        self.max_payload = n;
        self
    }

    pub fn tcp_nodelay(mut self, enable: bool) -> Self {
        self.tcp_nodelay = enable;
        self
    }

    pub fn encode_base64(mut self, enable: bool) -> Self {
        self.encode_base64 = enable;
        self
    }

    pub fn reuse_addr(mut self, enable: bool) -> Self {
        self.reuse_addr = enable;
        self
    }

    pub fn encode_mode(&self) -> EncodeMode {
        if self.encode_base64 {
            EncodeMode::Base64
        } else {
            EncodeMode::None
        }
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_backlog <= 0 {
            return Err(ConfigError::InvalidValue("listen_backlog must be > 0"));
        }
        if self.read_limit == 0 {
            return Err(ConfigError::InvalidValue("read_limit must be > 0"));
        }
        if self.max_payload == 0 {
            return Err(ConfigError::InvalidValue("max_payload must be > 0"));
        }
        if self.max_payload > u32::MAX as usize - PACKET_HEADER_SIZE {
            return Err(ConfigError::InvalidValue("max_payload must fit the u32 length field"));
        }
        if self.pool.max_free == 0 {
            return Err(ConfigError::InvalidValue("pool.max_free must be > 0"));
        }
        Ok(())
    }

    /// Print configuration (for debugging)
    pub fn print(&self) {
        eprintln!("segnet configuration:");
        eprintln!("  pool.max_blocks:   {}", self.pool.max_blocks);
        eprintln!("  pool.max_free:     {}", self.pool.max_free);
        eprintln!("  listen_backlog:    {}", self.listen_backlog);
        eprintln!("  read_limit:        {}", self.read_limit);
        eprintln!("  max_payload:       {}", self.max_payload);
        eprintln!("  tcp_nodelay:       {}", self.tcp_nodelay);
        eprintln!("  encode_base64:     {}", self.encode_base64);
        eprintln!("  reuse_addr:        {}", self.reuse_addr);
    }
}

/// Configuration error
#[derive(Debug, Clone)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for NetError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::InvalidValue(msg) => NetError::InvalidConfig(msg),
        }
    }
}

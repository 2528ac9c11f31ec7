use thiserror::Error;

/// Main error type for the recache proxy.
///
/// Every variant is session-local: a failing session is torn down without
/// touching the dispatch queue or cache invariants.
#[derive(Error, Debug, Clone)]
pub enum ProxyError {
    /// Protocol errors: unsupported method, unparsable URI, over-length input
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Origin connect failures (unreachable host, resolution failure)
    #[error("Connect error: {host}:{port}: {message}")]
    Connect {
        host: String,
        port: u16,
        message: String,
    },

    /// Mid-stream socket failures to client or origin
    #[error("Transfer error: {message}")]
    Transfer { message: String },

    /// Persistence log read/append failures
    #[error("Persistence error: {message}")]
    Persistence { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Other IO errors
    #[error("IO error: {message}")]
    Io { message: String },
}

impl ProxyError {
    /// Create a protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a connect error
    pub fn connect<H: Into<String>, S: Into<String>>(host: H, port: u16, message: S) -> Self {
        Self::Connect {
            host: host.into(),
            port,
            message: message.into(),
        }
    }

    /// Create a transfer error
    pub fn transfer<S: Into<String>>(message: S) -> Self {
        Self::Transfer {
            message: message.into(),
        }
    }

    /// Create a persistence error
    pub fn persistence<S: Into<String>>(message: S) -> Self {
        Self::Persistence {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an IO error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Whether the session was rejected before any origin contact
    pub fn is_rejection(&self) -> bool {
        matches!(self, ProxyError::Protocol { .. })
    }
}

/// Result type alias for recache operations
pub type ProxyResult<T> = Result<T, ProxyError>;

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::io(err.to_string())
    }
}

impl From<toml::de::Error> for ProxyError {
    fn from(err: toml::de::Error) -> Self {
        ProxyError::config(format!("TOML parsing error: {}", err))
    }
}

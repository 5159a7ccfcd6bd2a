use crate::core::observability::ErrorClass;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures of the proxy core.
///
/// Every variant is terminal for a single connection or a single refresh
/// only; nothing here is meant to reach the accept loops.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed literal address, CIDR, SOCKS5 frame or HTTP head.
    #[error("address parse error: {0}")]
    AddressParse(String),

    /// Every resolver strategy came back empty.
    #[error("could not resolve {0}")]
    Resolution(String),

    #[error("dial {target} failed: {reason}")]
    Dial { target: String, reason: String },

    /// The relay answered the handshake with something other than 200.
    #[error("relay rejected tunnel with status {0}")]
    RelayRejected(u16),

    #[error("empty ip range feed")]
    EmptyFeed,

    #[error("ip range feed error: {0}")]
    FeedParse(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl Error {
    pub fn address(msg: impl Into<String>) -> Self {
        Error::AddressParse(msg.into())
    }

    pub fn dial(target: impl Into<String>, reason: impl ToString) -> Self {
        Error::Dial {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Coarse class used by the process-wide error counter.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::AddressParse(_) | Error::RelayRejected(_) => ErrorClass::PROTOCOL_VIOLATION,
            Error::Dial { .. } | Error::Io(_) | Error::Http(_) | Error::Tls(_) => {
                ErrorClass::TRANSPORT_IO
            }
            Error::Resolution(_) => ErrorClass::RESOLUTION,
            Error::EmptyFeed | Error::FeedParse(_) | Error::Config(_) => ErrorClass::INTERNAL_ASSERT,
        }
    }
}

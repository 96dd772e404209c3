use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Policy document or process settings missing or malformed.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Venue connect failed for strategy '{strategy}': {reason}")]
    VenueConnect { strategy: String, reason: String },

    #[error("Market data unavailable for {symbol}: {reason}")]
    MarketData { symbol: String, reason: String },

    #[error("Venue rejected request (retcode {retcode}): {comment}")]
    OrderRejected { retcode: u32, comment: String },

    #[error("Reversal on {symbol} incomplete: closed {closed} of {total} opposite positions")]
    PartialReversal {
        symbol: String,
        closed: usize,
        total: usize,
    },

    /// Transport-level venue failure (timeout, dropped session).
    #[error("Venue error: {0}")]
    Venue(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cancelled by shutdown")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the same request may succeed if repeated later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::VenueConnect { .. }
                | Error::Venue(_)
                | Error::Http(_)
                | Error::OrderRejected { .. }
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

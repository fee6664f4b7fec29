use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or empty AOI file, or an unusable input value.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Tile index resolution gave up; the tile set would be incomplete.
    #[error("Catalog query failed after {attempts} attempt(s): {reason}")]
    CatalogQuery { attempts: u32, reason: String },

    #[error("Transient transport error: {0}")]
    TransientTransport(String),

    #[error("Non-retryable fetch error: {0}")]
    NonRetryableFetch(String),

    #[error("Credentials error: {0}")]
    Credentials(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Only transport-level hiccups are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientTransport(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
            return Error::TransientTransport(e.to_string());
        }
        if let Some(status) = e.status() {
            if status.is_server_error() || status.as_u16() == 429 {
                return Error::TransientTransport(e.to_string());
            }
        }
        Error::NonRetryableFetch(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Error::TransientTransport(format!("request timed out: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transport_errors_are_transient() {
        assert!(Error::TransientTransport("reset".into()).is_transient());
        assert!(!Error::NonRetryableFetch("bad json".into()).is_transient());
        assert!(!Error::InvalidInput("empty".into()).is_transient());
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow disk");
        assert!(!Error::from(io).is_transient());
    }

    #[tokio::test]
    async fn test_elapsed_is_transient() {
        let elapsed = tokio::time::timeout(
            std::time::Duration::from_millis(1),
            tokio::time::sleep(std::time::Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
        assert!(Error::from(elapsed).is_transient());
    }
}

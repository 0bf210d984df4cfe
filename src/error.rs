/// Failure of an outbound call to the language-model or price service.
///
/// These never reach the user: the flow engine and the message router replace
/// them with a fixed fallback text and log the cause.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("unexpected HTTP status: {0}")]
    HttpStatus(reqwest::StatusCode),

    #[error("response contained no usable content")]
    EmptyResponse,
}

impl ServiceError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ServiceError::Request(e) if e.is_timeout())
    }
}

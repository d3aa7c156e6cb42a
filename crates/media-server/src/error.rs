//! Request failures and their HTTP mapping.

use actix_web::HttpResponse;
use audio_pipeline::fragment::FragmentError;

/// Why a media request could not be served.
#[derive(Debug)]
pub(crate) enum StreamError {
    /// Invalid parameter or malformed fragment descriptor.
    BadRequest(String),
    /// The item does not exist or cannot be opened.
    NotFound(String),
    /// Pipeline setup or encoding failed.
    Internal(String),
}

impl StreamError {
    pub(crate) fn bad_request(message: impl Into<String>) -> Self {
        StreamError::BadRequest(message.into())
    }

    pub(crate) fn internal(context: &str, error: &anyhow::Error) -> Self {
        StreamError::Internal(format!("{context}: {error:#}"))
    }

    pub(crate) fn into_response(self) -> HttpResponse {
        match self {
            StreamError::BadRequest(message) => {
                tracing::warn!(error = %message, "rejecting request");
                HttpResponse::BadRequest().body(message)
            }
            StreamError::NotFound(message) => {
                tracing::warn!(error = %message, "not found");
                HttpResponse::NotFound().body(message)
            }
            StreamError::Internal(message) => {
                tracing::error!(error = %message, "request failed");
                HttpResponse::InternalServerError().body(message)
            }
        }
    }
}

impl From<FragmentError> for StreamError {
    fn from(err: FragmentError) -> Self {
        match err {
            FragmentError::Invalid(_) => StreamError::BadRequest(err.to_string()),
            FragmentError::Open(_) => StreamError::NotFound(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use actix_web::http::StatusCode;

    use super::*;

    #[test]
    fn fragment_errors_map_to_client_statuses() {
        let invalid: StreamError = FragmentError::Invalid(anyhow::anyhow!("start >= end")).into();
        assert_eq!(invalid.into_response().status(), StatusCode::BAD_REQUEST);

        let missing: StreamError = FragmentError::Open(anyhow::anyhow!("no such file")).into();
        assert_eq!(missing.into_response().status(), StatusCode::NOT_FOUND);

        let failed = StreamError::internal("create sink", &anyhow::anyhow!("boom"));
        assert_eq!(failed.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}

use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde::Serialize;
use thiserror::Error;

#[derive(Serialize)]
struct ErrorBody<'a> {
    success: bool,
    message: &'a str,
}

fn json_error(status: StatusCode, message: &str) -> HttpResponse {
    HttpResponse::build(status).json(ErrorBody {
        success: false,
        message,
    })
}

/// Failures on the frame upload path. Detector problems are not errors here:
/// they degrade to an empty detection instead.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("No image data")]
    EmptyPayload,
    #[error("Image payload exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("No image file provided")]
    MissingImageField,
    #[error("Invalid multipart body: {0}")]
    Multipart(String),
    #[error("Failed to read request body: {0}")]
    Payload(String),
    #[error("Cannot decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("Frame processing failed: {0}")]
    Internal(String),
}

impl ResponseError for IngestError {
    fn status_code(&self) -> StatusCode {
        match self {
            IngestError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            IngestError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    fn error_response(&self) -> HttpResponse {
        json_error(self.status_code(), &self.to_string())
    }
}

/// Failures on the query, location, and archive endpoints.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Internal(String),
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        json_error(self.status_code(), &self.to_string())
    }
}

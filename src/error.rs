//! Taxonomía de errores del divisor de CSV y su traducción a respuestas HTTP.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

#[derive(Debug, Error)]
pub enum ChunkError {
    /// Nombre de fichero inseguro, CSV demasiado corto o tamaño de chunk no válido.
    #[error("Entrada no válida: {0}")]
    InvalidInput(String),

    #[error("Chunk no encontrado: {0}")]
    NotFound(String),

    #[error("Error de E/S: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV mal formado: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, ChunkError>;

impl ChunkError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// `true` para los errores que son responsabilidad del cliente (4xx).
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidInput(_) | Self::NotFound(_))
    }

    /// Los errores del cliente se registran como aviso; el resto, como error.
    pub fn log(&self) {
        if self.is_client_error() {
            warn!("Petición rechazada ({}): {}", self.status_code(), self);
        } else {
            error!("Error interno del divisor de CSV: {}", self);
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Io(_) | Self::Parse(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<csv::Error> for ChunkError {
    fn from(err: csv::Error) -> Self {
        if err.is_io_error() {
            match err.into_kind() {
                csv::ErrorKind::Io(io)
                    if io
                        .get_ref()
                        .is_some_and(|inner| inner.is::<crate::codec::UnterminatedQuote>()) =>
                {
                    Self::Parse(io.to_string())
                }
                csv::ErrorKind::Io(io) => Self::Io(io),
                other => Self::Parse(format!("{other:?}")),
            }
        } else {
            Self::Parse(err.to_string())
        }
    }
}

impl IntoResponse for ChunkError {
    fn into_response(self) -> Response {
        self.log();
        (self.status_code(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

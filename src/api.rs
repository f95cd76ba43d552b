use std::io::{BufReader, Seek, SeekFrom, Write};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Json, Multipart, Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde_json::json;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::{
    access::CallerNamespace,
    app_state::AppState,
    error::{ChunkError, Result},
    models::{ChunkContent, ChunkMetadata, SplitResult},
};

const UPLOAD_FIELD: &str = "file";
const ROWS_FIELD: &str = "rows_per_chunk";

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    let max_upload = app_state.config.max_upload_bytes;
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/csv-splitter/split", post(split_handler))
        .route("/api/csv-splitter/chunks", get(list_chunks_handler))
        .route(
            "/api/csv-splitter/chunk/:filename",
            get(read_chunk_handler).delete(delete_chunk_handler),
        )
        .route("/api/csv-splitter/download/:filename", get(download_chunk_handler))
        .layer(DefaultBodyLimit::max(max_upload))
        .with_state(app_state)
}

// --- Handlers ---

#[axum::debug_handler]
async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Activa el flag de cancelación si el handler se descarta antes de tiempo
/// (el cliente cortó la conexión).
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

struct Upload {
    original_filename: String,
    file: std::fs::File,
    rows_per_chunk: Option<usize>,
}

#[axum::debug_handler]
async fn split_handler(
    State(state): State<AppState>,
    CallerNamespace(ns): CallerNamespace,
    multipart: Multipart,
) -> (StatusCode, Json<SplitResult>) {
    let upload = match read_upload(multipart).await {
        Ok(upload) => upload,
        Err(e) => {
            e.log();
            return (e.status_code(), Json(SplitResult::failed("", &e)));
        }
    };

    let original_filename = upload.original_filename.clone();
    let rows_per_chunk = upload
        .rows_per_chunk
        .unwrap_or(state.config.default_rows_per_chunk);
    info!(
        "Dividiendo '{}' en chunks de {} filas para '{}'...",
        original_filename,
        rows_per_chunk,
        ns.as_str()
    );

    let cancel = Arc::new(AtomicBool::new(false));
    let _cancel_guard = CancelOnDrop(cancel.clone());
    let store = state.store.clone();
    let name = original_filename.clone();

    let outcome = tokio::task::spawn_blocking(move || {
        store.split_and_store(
            &ns,
            BufReader::new(upload.file),
            &name,
            rows_per_chunk,
            Some(cancel),
            |p| {
                debug!(
                    "'{}': {} filas procesadas, {} chunks sellados.",
                    name, p.rows_processed, p.chunks_sealed
                )
            },
        )
    })
    .await
    .unwrap_or_else(|e| Err(std::io::Error::other(format!("tarea de división fallida: {e}")).into()));

    match outcome {
        Ok(result) => (StatusCode::OK, Json(result)),
        Err(e) => {
            e.log();
            (e.status_code(), Json(SplitResult::failed(&original_filename, &e)))
        }
    }
}

/// Vuelca el campo `file` a un fichero temporal y lee `rows_per_chunk`.
async fn read_upload(mut multipart: Multipart) -> Result<Upload> {
    let mut upload_file: Option<(String, std::fs::File)> = None;
    let mut rows_per_chunk = None;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ChunkError::invalid(format!("multipart no válido: {e}")))?
    {
        let field_name = field.name().map(str::to_string);
        match field_name.as_deref() {
            Some(UPLOAD_FIELD) => {
                let original = field
                    .file_name()
                    .map(str::to_string)
                    .unwrap_or_else(|| "upload.csv".to_string());
                let mut spool = tempfile::tempfile()?;
                while let Some(bytes) = field
                    .chunk()
                    .await
                    .map_err(|e| ChunkError::invalid(format!("subida interrumpida: {e}")))?
                {
                    spool.write_all(&bytes)?;
                }
                spool.seek(SeekFrom::Start(0))?;
                upload_file = Some((original, spool));
            }
            Some(ROWS_FIELD) => {
                let raw = field
                    .text()
                    .await
                    .map_err(|e| ChunkError::invalid(format!("campo {ROWS_FIELD} ilegible: {e}")))?;
                let value = raw.trim().parse::<usize>().map_err(|_| {
                    ChunkError::invalid(format!("{ROWS_FIELD} debe ser un entero positivo, no '{raw}'"))
                })?;
                rows_per_chunk = Some(value);
            }
            _ => {}
        }
    }

    let (original_filename, file) = upload_file
        .ok_or_else(|| ChunkError::invalid(format!("falta el campo '{UPLOAD_FIELD}' con el CSV")))?;
    Ok(Upload {
        original_filename,
        file,
        rows_per_chunk,
    })
}

#[axum::debug_handler]
async fn list_chunks_handler(
    State(state): State<AppState>,
    CallerNamespace(ns): CallerNamespace,
) -> Result<Json<Vec<ChunkMetadata>>> {
    Ok(Json(state.store.list(&ns)?))
}

#[axum::debug_handler]
async fn read_chunk_handler(
    State(state): State<AppState>,
    CallerNamespace(ns): CallerNamespace,
    Path(filename): Path<String>,
) -> Result<Json<ChunkContent>> {
    Ok(Json(state.store.read(&ns, &filename)?))
}

#[axum::debug_handler]
async fn delete_chunk_handler(
    State(state): State<AppState>,
    CallerNamespace(ns): CallerNamespace,
    Path(filename): Path<String>,
) -> Result<Json<serde_json::Value>> {
    state.store.delete(&ns, &filename)?;
    Ok(Json(json!({ "success": true })))
}

#[axum::debug_handler]
async fn download_chunk_handler(
    State(state): State<AppState>,
    CallerNamespace(ns): CallerNamespace,
    Path(filename): Path<String>,
) -> Result<Response> {
    let download = state.store.download(&ns, &filename)?;

    let disposition = HeaderValue::from_str(&format!(
        "attachment; filename=\"{}\"",
        download.filename
    ))
    .map_err(|_| ChunkError::invalid(format!("nombre de fichero no descargable: {filename}")))?;
    let content_type = HeaderValue::from_str(&download.content_type)
        .unwrap_or(HeaderValue::from_static("text/csv"));

    let file = tokio::fs::File::from_std(download.file);
    let body = Body::from_stream(ReaderStream::new(file));

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type),
            (header::CONTENT_DISPOSITION, disposition),
            (header::CONTENT_LENGTH, HeaderValue::from(download.len)),
        ],
        body,
    )
        .into_response())
}

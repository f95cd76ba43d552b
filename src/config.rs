//! Carga y gestión de configuración de la aplicación (servidor + almacén de chunks).

use std::env;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};

const DEFAULT_ROWS_PER_CHUNK: usize = 1000;
const DEFAULT_MAX_UPLOAD_MB: usize = 50;

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server_addr: String,
    pub storage_dir: PathBuf,
    pub default_rows_per_chunk: usize,
    pub max_upload_bytes: usize,
    /// Cabecera HTTP en la que el proveedor de identidad deja el id del usuario.
    pub namespace_header: String,
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        let server_addr =
            env::var("SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:3322".to_string());

        let storage_dir = env::var("CSV_STORAGE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_storage_dir());

        let default_rows_per_chunk = parse_positive("CSV_ROWS_PER_CHUNK", DEFAULT_ROWS_PER_CHUNK)?;
        let max_upload_mb = parse_positive("CSV_MAX_UPLOAD_MB", DEFAULT_MAX_UPLOAD_MB)?;

        let namespace_header = env::var("NAMESPACE_HEADER")
            .unwrap_or_else(|_| "x-user-id".to_string())
            .to_lowercase();
        axum::http::HeaderName::from_bytes(namespace_header.as_bytes())
            .with_context(|| format!("NAMESPACE_HEADER no es una cabecera válida: {namespace_header}"))?;

        Ok(Self {
            server_addr,
            storage_dir,
            default_rows_per_chunk,
            max_upload_bytes: max_upload_mb * 1024 * 1024,
            namespace_header,
        })
    }

    /// Configuración para tests: todo por defecto salvo el directorio.
    pub fn for_storage(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            server_addr: "127.0.0.1:0".to_string(),
            storage_dir: storage_dir.into(),
            default_rows_per_chunk: DEFAULT_ROWS_PER_CHUNK,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_MB * 1024 * 1024,
            namespace_header: "x-user-id".to_string(),
        }
    }
}

fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("csv-splitter"))
        .unwrap_or_else(|| PathBuf::from("storage"))
}

fn parse_positive(key: &str, default: usize) -> Result<usize> {
    match env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) => {
            let value: usize = raw
                .trim()
                .parse()
                .map_err(|_| anyhow!("{key} debe ser un entero positivo, no '{raw}'"))?;
            if value == 0 {
                return Err(anyhow!("{key} debe ser mayor que cero"));
            }
            Ok(value)
        }
    }
}

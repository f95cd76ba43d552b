//! Modelos de dominio: chunks, metadatos persistidos y resultados de división.

use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Una fila del CSV: secuencia ordenada de campos.
pub type Row = Vec<String>;

/// Las dos primeras filas del CSV de origen (cabecera legible y cabecera
/// técnica). Se copian tal cual en cada chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HeaderBlock(pub Vec<Row>);

impl HeaderBlock {
    pub const ROWS: usize = 2;

    pub fn rows(&self) -> &[Row] {
        &self.0
    }

    pub fn is_complete(&self) -> bool {
        self.0.len() == Self::ROWS
    }
}

/// Nombre generado para un chunk:
/// `<stem>_part<NNN>_<YYYYMMDDhhmmss>_<op>.csv`.
///
/// El nombre es la única fuente de la que se recuperan el origen, el número
/// de chunk y la fecha al listar; por eso se puede generar y volver a parsear.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkName {
    pub stem: String,
    pub chunk_number: usize,
    pub created_at: DateTime<Utc>,
    pub operation: String,
}

const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";
pub const CHUNK_EXTENSION: &str = "csv";

impl ChunkName {
    pub fn new(stem: &str, chunk_number: usize, created_at: DateTime<Utc>, operation: &str) -> Self {
        Self {
            stem: stem.to_string(),
            chunk_number,
            created_at: truncate_to_seconds(created_at),
            operation: operation.to_string(),
        }
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}_part{:03}_{}_{}.{}",
            self.stem,
            self.chunk_number,
            self.created_at.format(TIMESTAMP_FORMAT),
            self.operation,
            CHUNK_EXTENSION
        )
    }

    /// Nombre "original" que se muestra en los listados.
    pub fn original_filename(&self) -> String {
        format!("{}.{}", self.stem, CHUNK_EXTENSION)
    }

    pub fn parse(file_name: &str) -> Option<Self> {
        let base = file_name.strip_suffix(&format!(".{CHUNK_EXTENSION}"))?;
        // El stem puede contener '_', así que se parte desde la derecha.
        let mut parts = base.rsplitn(4, '_');
        let operation = parts.next()?;
        let timestamp = parts.next()?;
        let part = parts.next()?;
        let stem = parts.next()?;

        let chunk_number = part.strip_prefix("part")?.parse::<usize>().ok()?;
        let created_at = NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT)
            .ok()?
            .and_utc();

        if stem.is_empty() || operation.is_empty() {
            return None;
        }

        Some(Self {
            stem: stem.to_string(),
            chunk_number,
            created_at,
            operation: operation.to_string(),
        })
    }
}

pub fn truncate_to_seconds(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_nanosecond(0).unwrap_or(ts)
}

/// Chunk sellado por el divisor: cabecera + su porción de filas de datos.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub name: ChunkName,
    pub header: HeaderBlock,
    pub rows: Vec<Row>,
}

impl Chunk {
    pub fn chunk_number(&self) -> usize {
        self.name.chunk_number
    }

    /// Filas de datos (sin contar la cabecera).
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn file_name(&self) -> String {
        self.name.file_name()
    }
}

/// Vista de listado de un chunk persistido.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub filename: String,
    pub original_filename: String,
    pub chunk_number: usize,
    pub row_count: usize,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub path: String,
}

/// Contenido de un chunk tal y como lo devuelve la ruta de lectura.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkContent {
    pub filename: String,
    pub chunk_number: usize,
    pub header_block: HeaderBlock,
    pub data_rows: Vec<Row>,
    pub total_rows: usize,
}

/// Resumen de una operación de división. Inmutable una vez construido.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitResult {
    pub original_filename: String,
    pub chunks: Vec<ChunkMetadata>,
    pub total_rows: usize,
    pub total_chunks: usize,
    pub success: bool,
    pub error: Option<String>,
}

impl SplitResult {
    pub fn succeeded(original_filename: &str, chunks: Vec<ChunkMetadata>) -> Self {
        let total_rows = chunks.iter().map(|c| c.row_count).sum();
        Self {
            original_filename: original_filename.to_string(),
            total_chunks: chunks.len(),
            chunks,
            total_rows,
            success: true,
            error: None,
        }
    }

    pub fn failed(original_filename: &str, error: impl std::fmt::Display) -> Self {
        Self {
            original_filename: original_filename.to_string(),
            chunks: Vec::new(),
            total_rows: 0,
            total_chunks: 0,
            success: false,
            error: Some(error.to_string()),
        }
    }
}

/// Implementa cómo se mostrará el resumen como texto.
impl std::fmt::Display for SplitResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.error {
            None => write!(
                f,
                "Resumen: '{}' dividido en {} chunks con {} filas de datos.",
                self.original_filename, self.total_chunks, self.total_rows
            ),
            Some(err) => write!(f, "Fallo al dividir '{}': {}", self.original_filename, err),
        }
    }
}

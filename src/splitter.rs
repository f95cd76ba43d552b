//! Motor de división de CSV.
//!
//! Flujo:
//!   1. Se leen las filas de una en una (nunca se materializa el CSV entero).
//!   2. Las dos primeras filas se guardan como bloque de cabecera.
//!   3. El resto se acumula en un buffer; al llegar a `rows_per_chunk` se
//!      sella un chunk (cabecera + buffer) y se entrega al `ChunkSink`.
//!   4. Al agotar la entrada se sella el buffer pendiente, si no está vacío.
//!
//! Cualquier error de parseo aborta la operación completa; qué pasa con los
//! chunks ya entregados lo decide el sink (ver `store::SplitTransaction`).

use std::io::Read;

use chrono::{DateTime, Utc};
use csv::StringRecord;
use tracing::debug;
use uuid::Uuid;

use crate::{
    codec,
    error::{ChunkError, Result},
    filename_guard,
    models::{Chunk, ChunkMetadata, ChunkName, HeaderBlock, Row},
};

// El tamaño de chunk lo elige el cliente; no se reserva más que esto de golpe.
const MAX_PREALLOCATED_ROWS: usize = 4096;

/// Destino de los chunks sellados.
pub trait ChunkSink {
    fn accept(&mut self, chunk: Chunk) -> Result<ChunkMetadata>;
}

/// Sink en memoria, usado para la variante "buffered" y en tests.
impl ChunkSink for Vec<Chunk> {
    fn accept(&mut self, chunk: Chunk) -> Result<ChunkMetadata> {
        let size_bytes = codec::encode(&chunk.header, &chunk.rows)?.len() as u64;
        let metadata = ChunkMetadata {
            filename: chunk.file_name(),
            original_filename: chunk.name.original_filename(),
            chunk_number: chunk.chunk_number(),
            row_count: chunk.row_count(),
            size_bytes,
            created_at: chunk.name.created_at,
            path: String::new(),
        };
        self.push(chunk);
        Ok(metadata)
    }
}

/// Progreso acumulado tras cada chunk sellado.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SplitProgress {
    pub rows_processed: usize,
    pub chunks_sealed: usize,
}

/// Estado de una operación de división en curso.
#[derive(Debug)]
pub struct Splitter {
    rows_per_chunk: usize,
    stem: String,
    operation: String,
    started_at: DateTime<Utc>,
    header: Vec<Row>,
    buffer: Vec<Row>,
    progress: SplitProgress,
}

impl Splitter {
    pub fn new(original_filename: &str, rows_per_chunk: usize) -> Result<Self> {
        if rows_per_chunk == 0 {
            return Err(ChunkError::invalid(
                "rows_per_chunk debe ser un entero mayor que cero",
            ));
        }
        let operation = Uuid::new_v4().simple().to_string()[..8].to_string();
        Ok(Self {
            rows_per_chunk,
            stem: filename_guard::sanitize_stem(original_filename),
            operation,
            started_at: Utc::now(),
            header: Vec::with_capacity(HeaderBlock::ROWS),
            buffer: Vec::with_capacity(rows_per_chunk.min(MAX_PREALLOCATED_ROWS)),
            progress: SplitProgress::default(),
        })
    }

    pub fn progress(&self) -> SplitProgress {
        self.progress
    }

    /// Añade una fila. Devuelve un chunk si el buffer se llenó.
    pub fn push(&mut self, row: Row) -> Option<Chunk> {
        if self.header.len() < HeaderBlock::ROWS {
            self.header.push(row);
            return None;
        }

        self.buffer.push(row);
        if self.buffer.len() == self.rows_per_chunk {
            Some(self.seal())
        } else {
            None
        }
    }

    /// Cierra la operación. Falla si el origen no tenía cabecera completa.
    pub fn finish(&mut self) -> Result<Option<Chunk>> {
        if self.header.len() < HeaderBlock::ROWS {
            return Err(ChunkError::invalid(format!(
                "el CSV debe tener al menos {} filas de cabecera (tiene {})",
                HeaderBlock::ROWS,
                self.header.len()
            )));
        }
        if self.buffer.is_empty() {
            Ok(None)
        } else {
            Ok(Some(self.seal()))
        }
    }

    fn seal(&mut self) -> Chunk {
        let rows = std::mem::replace(
            &mut self.buffer,
            Vec::with_capacity(self.rows_per_chunk.min(MAX_PREALLOCATED_ROWS)),
        );
        self.progress.rows_processed += rows.len();
        self.progress.chunks_sealed += 1;

        Chunk {
            name: ChunkName::new(
                &self.stem,
                self.progress.chunks_sealed,
                self.started_at,
                &self.operation,
            ),
            header: HeaderBlock(self.header.clone()),
            rows,
        }
    }
}

/// Divide un origen CSV leído en streaming y entrega cada chunk al sink.
///
/// `on_progress` se invoca tras cada chunk sellado. Devuelve los metadatos de
/// todos los chunks, en orden.
pub fn split_stream<R, S, P>(
    source: R,
    original_filename: &str,
    rows_per_chunk: usize,
    sink: &mut S,
    mut on_progress: P,
) -> Result<Vec<ChunkMetadata>>
where
    R: Read,
    S: ChunkSink + ?Sized,
    P: FnMut(SplitProgress),
{
    let mut splitter = Splitter::new(original_filename, rows_per_chunk)?;
    let mut rdr = codec::reader(source);
    let mut record = StringRecord::new();
    let mut produced = Vec::new();

    while rdr.read_record(&mut record)? {
        if let Some(chunk) = splitter.push(codec::record_to_row(&record)) {
            produced.push(sink.accept(chunk)?);
            on_progress(splitter.progress());
        }
    }

    if let Some(chunk) = splitter.finish()? {
        produced.push(sink.accept(chunk)?);
        on_progress(splitter.progress());
    }

    debug!(
        "División de '{}' terminada: {} chunks.",
        original_filename,
        produced.len()
    );
    Ok(produced)
}

/// Variante para un CSV ya cargado en memoria: un stream finito más.
pub fn split_str(text: &str, original_filename: &str, rows_per_chunk: usize) -> Result<Vec<Chunk>> {
    let mut chunks = Vec::new();
    split_stream(text.as_bytes(), original_filename, rows_per_chunk, &mut chunks, |_| {})?;
    Ok(chunks)
}

//! Divisor de CSV con cabecera doble: parte un CSV subido en chunks de
//! tamaño acotado, los guarda por usuario y permite listarlos, leerlos,
//! descargarlos y borrarlos.

pub mod access;
pub mod api;
pub mod app_state;
pub mod codec;
pub mod config;
pub mod error;
pub mod filename_guard;
pub mod models;
pub mod splitter;
pub mod store;

pub use error::{ChunkError, Result};
pub use models::{Chunk, ChunkMetadata, SplitResult};
pub use store::{ChunkStore, Namespace};

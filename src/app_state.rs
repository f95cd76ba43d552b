use std::sync::Arc;

use crate::{config::AppConfig, store::ChunkStore};

/// Estado compartido por los handlers. No guarda nada por petición: cada
/// operación es independiente y sólo comparte el sistema de ficheros.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<ChunkStore>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let store = Arc::new(ChunkStore::new(config.storage_dir.clone()));
        Self { config, store }
    }
}

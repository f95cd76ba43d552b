//! Almacén de chunks en disco, con un directorio por namespace (usuario).
//!
//! Estructura:
//!   <root>/<namespace>/<chunk>.csv           chunks confirmados
//!   <root>/<namespace>/.staging/split-*/     chunks de una división en curso
//!
//! Toda ruta que llega del cliente pasa dos controles independientes: el
//! `filename_guard` sobre la cadena y, ya en disco, la comprobación de que la
//! ruta canónica cuelga directamente del directorio canónico del namespace.

use std::{
    fs::{self, File, OpenOptions},
    io::{ErrorKind, Read, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use csv::ByteRecord;
use tempfile::TempDir;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::{
    codec,
    error::{ChunkError, Result},
    filename_guard,
    models::{Chunk, ChunkContent, ChunkMetadata, ChunkName, HeaderBlock, SplitResult},
    splitter::{self, ChunkSink, SplitProgress},
};

const STAGING_DIR: &str = ".staging";
const CSV_CONTENT_TYPE: &str = "text/csv";

/// Token opaco que identifica al llamante. Lo proporciona la capa de acceso;
/// el almacén sólo exige que sea un componente de ruta seguro.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace(String);

impl Namespace {
    pub fn new(token: impl Into<String>) -> Result<Self> {
        let token = token.into();
        if !filename_guard::is_safe_component(&token) {
            return Err(ChunkError::invalid("identificador de usuario no válido"));
        }
        Ok(Self(token))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Fichero listo para descargar tal y como se escribió.
#[derive(Debug)]
pub struct ChunkDownload {
    pub filename: String,
    pub content_type: String,
    pub len: u64,
    pub file: File,
}

impl ChunkDownload {
    pub fn into_bytes(mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.len as usize);
        self.file.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

#[derive(Debug, Clone)]
pub struct ChunkStore {
    root: PathBuf,
}

impl ChunkStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn namespace_dir(&self, ns: &Namespace) -> PathBuf {
        self.root.join(ns.as_str())
    }

    /// Escribe un chunk suelto en el namespace. Nunca sobrescribe.
    pub fn write(&self, ns: &Namespace, chunk: &Chunk) -> Result<ChunkMetadata> {
        let dir = self.namespace_dir(ns);
        fs::create_dir_all(&dir)?;
        let size_bytes = write_new_file(&dir.join(chunk.file_name()), chunk)?;
        Ok(self.metadata_for(ns, &chunk.name, chunk.row_count(), size_bytes))
    }

    /// Lista los chunks del namespace, ordenados por fecha de creación,
    /// nombre de origen y número de chunk.
    pub fn list(&self, ns: &Namespace) -> Result<Vec<ChunkMetadata>> {
        let dir = self.namespace_dir(ns);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut chunks = Vec::new();
        for entry in WalkDir::new(&dir).min_depth(1).max_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("No se pudo leer una entrada de {}: {}", dir.display(), e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().and_then(ChunkName::parse) else {
                continue;
            };

            let size_bytes = match entry.metadata() {
                Ok(meta) => meta.len(),
                // Borrado entre el listado del directorio y la lectura.
                Err(_) => continue,
            };
            match count_data_rows(entry.path()) {
                Ok(row_count) => chunks.push(self.metadata_for(ns, &name, row_count, size_bytes)),
                Err(ChunkError::Io(e)) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => warn!("Saltando chunk ilegible {}: {}", entry.path().display(), e),
            }
        }

        chunks.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.original_filename.cmp(&b.original_filename))
                .then_with(|| a.chunk_number.cmp(&b.chunk_number))
                .then_with(|| a.filename.cmp(&b.filename))
        });
        Ok(chunks)
    }

    pub fn read(&self, ns: &Namespace, filename: &str) -> Result<ChunkContent> {
        let (path, name) = self.resolve(ns, filename)?;
        let raw = read_existing(&path, filename)?;
        let decoded = codec::decode(&raw)?;
        Ok(ChunkContent {
            filename: filename.to_string(),
            chunk_number: name.chunk_number,
            total_rows: decoded.rows.len(),
            header_block: decoded.header,
            data_rows: decoded.rows,
        })
    }

    /// Borra un chunk. Borrar algo que no existe es `NotFound`.
    pub fn delete(&self, ns: &Namespace, filename: &str) -> Result<()> {
        let (path, _) = self.resolve(ns, filename)?;
        fs::remove_file(&path).map_err(|e| not_found_or_io(e, filename))?;
        info!("Chunk '{}' borrado del namespace '{}'.", filename, ns.as_str());
        Ok(())
    }

    pub fn download(&self, ns: &Namespace, filename: &str) -> Result<ChunkDownload> {
        let (path, _) = self.resolve(ns, filename)?;
        let file = File::open(&path).map_err(|e| not_found_or_io(e, filename))?;
        let len = file.metadata()?.len();
        let content_type = mime_guess::from_path(&path)
            .first_raw()
            .unwrap_or(CSV_CONTENT_TYPE)
            .to_string();
        Ok(ChunkDownload {
            filename: filename.to_string(),
            content_type,
            len,
            file,
        })
    }

    /// Abre una transacción de división: los chunks se escriben en staging y
    /// sólo se hacen visibles con [`SplitTransaction::commit`].
    pub fn begin_split(&self, ns: &Namespace) -> Result<SplitTransaction> {
        let namespace_dir = self.namespace_dir(ns);
        let staging_root = namespace_dir.join(STAGING_DIR);
        fs::create_dir_all(&staging_root)?;
        let staging = tempfile::Builder::new()
            .prefix("split-")
            .tempdir_in(&staging_root)?;

        Ok(SplitTransaction {
            store: self.clone(),
            namespace: ns.clone(),
            namespace_dir,
            staging,
            staged: Vec::new(),
            cancel: None,
            committed: false,
        })
    }

    /// División completa: lee el origen en streaming, escribe en staging y
    /// confirma todo o nada.
    pub fn split_and_store<R, P>(
        &self,
        ns: &Namespace,
        source: R,
        original_filename: &str,
        rows_per_chunk: usize,
        cancel: Option<Arc<AtomicBool>>,
        on_progress: P,
    ) -> Result<SplitResult>
    where
        R: Read,
        P: FnMut(SplitProgress),
    {
        let mut tx = self.begin_split(ns)?;
        if let Some(flag) = cancel {
            tx = tx.with_cancel(flag);
        }
        // Si falla, `tx` se descarta aquí y el staging desaparece con él.
        splitter::split_stream(source, original_filename, rows_per_chunk, &mut tx, on_progress)?;
        let chunks = tx.commit()?;

        let result = SplitResult::succeeded(original_filename, chunks);
        info!("{} (namespace '{}')", result, ns.as_str());
        Ok(result)
    }

    /// Traduce un nombre de fichero del cliente a una ruta dentro del
    /// namespace, aplicando las dos defensas contra traversal.
    fn resolve(&self, ns: &Namespace, filename: &str) -> Result<(PathBuf, ChunkName)> {
        if !filename_guard::is_safe(filename) {
            return Err(ChunkError::invalid(format!(
                "nombre de fichero no permitido: {filename}"
            )));
        }
        let name = ChunkName::parse(filename).ok_or_else(|| ChunkError::not_found(filename))?;

        let dir = self.namespace_dir(ns);
        let dir_canonical = fs::canonicalize(&dir).map_err(|e| not_found_or_io(e, filename))?;
        let path = fs::canonicalize(dir.join(filename)).map_err(|e| not_found_or_io(e, filename))?;

        if path.parent() != Some(dir_canonical.as_path()) {
            return Err(ChunkError::invalid(format!(
                "la ruta de '{filename}' sale del directorio del usuario"
            )));
        }
        if !path.is_file() {
            return Err(ChunkError::not_found(filename));
        }
        Ok((path, name))
    }

    fn metadata_for(
        &self,
        ns: &Namespace,
        name: &ChunkName,
        row_count: usize,
        size_bytes: u64,
    ) -> ChunkMetadata {
        let filename = name.file_name();
        ChunkMetadata {
            path: format!("{}/{}", ns.as_str(), filename),
            original_filename: name.original_filename(),
            chunk_number: name.chunk_number,
            created_at: name.created_at,
            filename,
            row_count,
            size_bytes,
        }
    }
}

/// División en curso. Se comporta como un `ChunkSink` que escribe en un
/// directorio temporal; si se descarta sin `commit`, no queda nada.
pub struct SplitTransaction {
    store: ChunkStore,
    namespace: Namespace,
    namespace_dir: PathBuf,
    staging: TempDir,
    staged: Vec<(PathBuf, ChunkMetadata)>,
    cancel: Option<Arc<AtomicBool>>,
    committed: bool,
}

impl SplitTransaction {
    /// Con el flag activado, el siguiente chunk sellado aborta la división.
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    /// Mueve los chunks de staging al namespace.
    pub fn commit(mut self) -> Result<Vec<ChunkMetadata>> {
        let mut moved: Vec<PathBuf> = Vec::with_capacity(self.staged.len());
        for (staged_path, meta) in &self.staged {
            let target = self.namespace_dir.join(&meta.filename);
            let outcome = if target.exists() {
                Err(std::io::Error::new(
                    ErrorKind::AlreadyExists,
                    format!("ya existe un chunk llamado {}", meta.filename),
                ))
            } else {
                fs::rename(staged_path, &target)
            };

            if let Err(e) = outcome {
                for path in &moved {
                    if let Err(undo) = fs::remove_file(path) {
                        warn!("No se pudo deshacer {}: {}", path.display(), undo);
                    }
                }
                return Err(e.into());
            }
            moved.push(target);
        }

        self.committed = true;
        Ok(std::mem::take(&mut self.staged)
            .into_iter()
            .map(|(_, meta)| meta)
            .collect())
    }
}

impl ChunkSink for SplitTransaction {
    fn accept(&mut self, chunk: Chunk) -> Result<ChunkMetadata> {
        if self
            .cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
        {
            return Err(std::io::Error::new(
                ErrorKind::Interrupted,
                "división cancelada por el cliente",
            )
            .into());
        }

        let staged_path = self.staging.path().join(chunk.file_name());
        let size_bytes = write_new_file(&staged_path, &chunk)?;
        let meta = self
            .store
            .metadata_for(&self.namespace, &chunk.name, chunk.row_count(), size_bytes);
        self.staged.push((staged_path, meta.clone()));
        Ok(meta)
    }
}

impl Drop for SplitTransaction {
    fn drop(&mut self) {
        if !self.committed && !self.staged.is_empty() {
            warn!(
                "División abortada en '{}': se descartan {} chunks sin confirmar.",
                self.namespace.as_str(),
                self.staged.len()
            );
        }
    }
}

fn write_new_file(path: &Path, chunk: &Chunk) -> Result<u64> {
    let bytes = codec::encode(&chunk.header, &chunk.rows)?;
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    Ok(bytes.len() as u64)
}

fn read_existing(path: &Path, filename: &str) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| not_found_or_io(e, filename))
}

fn count_data_rows(path: &Path) -> Result<usize> {
    let mut rdr = codec::reader(File::open(path)?);
    let mut record = ByteRecord::new();
    let mut rows = 0usize;
    while rdr.read_byte_record(&mut record)? {
        rows += 1;
    }
    Ok(rows.saturating_sub(HeaderBlock::ROWS))
}

fn not_found_or_io(err: std::io::Error, filename: &str) -> ChunkError {
    match err.kind() {
        ErrorKind::NotFound => ChunkError::not_found(filename),
        // El sistema operativo rechazó el nombre en sí (p. ej. un byte nulo).
        ErrorKind::InvalidInput => {
            ChunkError::invalid(format!("nombre de fichero no permitido: {filename}"))
        }
        _ => ChunkError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tokio_test::{assert_err, assert_ok};

    const HEADER: &str = "Subject,Visit,Value\nsubject_id,visit,value\n";

    fn store() -> (TempDir, ChunkStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(dir.path());
        (dir, store)
    }

    fn ns(token: &str) -> Namespace {
        Namespace::new(token).unwrap()
    }

    fn source(data_rows: usize) -> String {
        let mut text = HEADER.to_string();
        for i in 0..data_rows {
            text.push_str(&format!("S-{i:03},V{i},{i}\n"));
        }
        text
    }

    fn split(store: &ChunkStore, ns: &Namespace, text: &str, k: usize) -> Result<SplitResult> {
        store.split_and_store(ns, text.as_bytes(), "visits.csv", k, None, |_| {})
    }

    #[test]
    fn namespace_rejects_unsafe_tokens() {
        assert_err!(Namespace::new("../other"));
        assert_err!(Namespace::new(""));
        assert_ok!(Namespace::new("user-1"));
    }

    #[test]
    fn split_persists_every_chunk() {
        let (_tmp, store) = store();
        let user = ns("alice");
        let result = assert_ok!(split(&store, &user, &source(5), 2));
        assert!(result.success);
        assert_eq!(result.total_rows, 5);
        assert_eq!(result.total_chunks, 3);

        let listed = store.list(&user).unwrap();
        assert_eq!(listed, result.chunks);
        let counts: Vec<usize> = listed.iter().map(|m| m.row_count).collect();
        assert_eq!(counts, vec![2, 2, 1]);
        assert!(listed.iter().all(|m| m.original_filename == "visits.csv"));
        assert!(listed[0].path.starts_with("alice/"));
    }

    #[test]
    fn read_returns_header_and_rows() {
        let (_tmp, store) = store();
        let user = ns("alice");
        let result = split(&store, &user, &source(3), 2).unwrap();

        let content = store.read(&user, &result.chunks[1].filename).unwrap();
        assert_eq!(content.chunk_number, 2);
        assert_eq!(content.total_rows, 1);
        assert_eq!(content.header_block.rows()[1], vec!["subject_id", "visit", "value"]);
        assert_eq!(content.data_rows, vec![vec!["S-002", "V2", "2"]]);
    }

    #[test]
    fn download_is_byte_identical() {
        let (_tmp, store) = store();
        let user = ns("alice");
        let result = split(&store, &user, &source(2), 5).unwrap();
        let download = store.download(&user, &result.chunks[0].filename).unwrap();
        assert_eq!(download.content_type, "text/csv");
        assert_eq!(download.len, result.chunks[0].size_bytes);
        assert_eq!(download.into_bytes().unwrap(), source(2).into_bytes());
    }

    #[test]
    fn traversal_is_rejected_before_touching_disk() {
        let (_tmp, store) = store();
        // El namespace ni siquiera existe: sólo el guard puede responder.
        let err = store.read(&ns("alice"), "../secret.csv").unwrap_err();
        assert!(matches!(err, ChunkError::InvalidInput(_)));
        let err = store.delete(&ns("alice"), "..\\secret.csv").unwrap_err();
        assert!(matches!(err, ChunkError::InvalidInput(_)));
    }

    #[test]
    fn nul_byte_in_filename_is_invalid_input() {
        let (_tmp, store) = store();
        let user = ns("alice");
        split(&store, &user, &source(1), 1).unwrap();
        let err = store
            .read(&user, "visits\0_part001_20240101000000_deadbeef.csv")
            .unwrap_err();
        assert!(matches!(err, ChunkError::InvalidInput(_)));

        let os_rejection = std::io::Error::new(ErrorKind::InvalidInput, "nul byte");
        assert!(matches!(
            not_found_or_io(os_rejection, "x.csv"),
            ChunkError::InvalidInput(_)
        ));
    }

    #[test]
    fn deleting_unknown_chunk_is_not_found() {
        let (_tmp, store) = store();
        let user = ns("alice");
        split(&store, &user, &source(1), 1).unwrap();
        let err = store
            .delete(&user, "visits_part009_20240101000000_deadbeef.csv")
            .unwrap_err();
        assert!(matches!(err, ChunkError::NotFound(_)));
    }

    #[test]
    fn delete_removes_chunk_once() {
        let (_tmp, store) = store();
        let user = ns("alice");
        let result = split(&store, &user, &source(2), 1).unwrap();
        let filename = &result.chunks[0].filename;
        assert_ok!(store.delete(&user, filename));
        assert!(matches!(store.delete(&user, filename), Err(ChunkError::NotFound(_))));
        assert_eq!(store.list(&user).unwrap().len(), 1);
    }

    #[test]
    fn namespaces_are_isolated() {
        let (_tmp, store) = store();
        let result = split(&store, &ns("alice"), &source(2), 2).unwrap();
        assert!(store.list(&ns("bob")).unwrap().is_empty());
        let err = store.read(&ns("bob"), &result.chunks[0].filename).unwrap_err();
        assert!(matches!(err, ChunkError::NotFound(_)));
    }

    #[test]
    fn parse_failure_commits_nothing() {
        let broken_tails: [&[u8]; 2] = [
            b"S-999,\"comilla sin cerrar\nS-1000,V,1\nS-1001,V,2\n",
            b"S-999,\xff\xfe,bad\n",
        ];
        for tail in broken_tails {
            let (_tmp, store) = store();
            let user = ns("alice");
            let mut bytes = source(4).into_bytes();
            bytes.extend_from_slice(tail);

            let mut tx = store.begin_split(&user).unwrap();
            let err = splitter::split_stream(bytes.as_slice(), "bad.csv", 2, &mut tx, |_| {})
                .unwrap_err();
            assert!(matches!(err, ChunkError::Parse(_)), "{err}");
            // Dos chunks sellados y en staging, pero no confirmados.
            assert_eq!(tx.staged_len(), 2);
            assert!(store.list(&user).unwrap().is_empty());
            drop(tx);

            assert!(store.list(&user).unwrap().is_empty());
            let staging = store.root().join("alice").join(STAGING_DIR);
            assert_eq!(fs::read_dir(staging).unwrap().count(), 0);
        }
    }

    #[test]
    fn unterminated_quote_fails_the_whole_split() {
        let (_tmp, store) = store();
        let user = ns("alice");
        let text = "A,B\na,b\n1,2\n3,4\n5,\"unterminated\n6,7\n8,9\n";
        let err = split(&store, &user, text, 2).unwrap_err();
        assert!(matches!(err, ChunkError::Parse(_)));
        assert!(store.list(&user).unwrap().is_empty());
    }

    #[test]
    fn cancelled_split_commits_nothing() {
        let (_tmp, store) = store();
        let user = ns("alice");
        let cancel = Arc::new(AtomicBool::new(true));
        let err = store
            .split_and_store(&user, source(4).as_bytes(), "v.csv", 2, Some(cancel), |_| {})
            .unwrap_err();
        assert!(matches!(err, ChunkError::Io(ref e) if e.kind() == ErrorKind::Interrupted));
        assert!(store.list(&user).unwrap().is_empty());
    }

    #[test]
    fn short_source_is_rejected_without_side_effects() {
        let (_tmp, store) = store();
        let user = ns("alice");
        let err = split(&store, &user, "solo cabecera\n", 2).unwrap_err();
        assert!(matches!(err, ChunkError::InvalidInput(_)));
        assert!(store.list(&user).unwrap().is_empty());
    }

    #[test]
    fn write_never_overwrites() {
        let (_tmp, store) = store();
        let user = ns("alice");
        let chunk = Chunk {
            name: ChunkName::new("manual", 1, Utc::now(), "00000001"),
            header: codec::decode(HEADER.as_bytes()).unwrap().header,
            rows: vec![vec!["S-1".into(), "V1".into(), "1".into()]],
        };
        let meta = store.write(&user, &chunk).unwrap();
        assert_eq!(meta.row_count, 1);
        let err = store.write(&user, &chunk).unwrap_err();
        assert!(matches!(err, ChunkError::Io(ref e) if e.kind() == ErrorKind::AlreadyExists));
    }

    #[test]
    fn list_ignores_foreign_files_and_staging() {
        let (_tmp, store) = store();
        let user = ns("alice");
        split(&store, &user, &source(1), 1).unwrap();
        let dir = store.root().join("alice");
        fs::write(dir.join("notes.txt"), "x").unwrap();
        fs::write(dir.join("plain.csv"), HEADER).unwrap();
        let _tx = store.begin_split(&user).unwrap();
        assert_eq!(store.list(&user).unwrap().len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_is_invalid_input() {
        let (tmp, store) = store();
        let user = ns("alice");
        split(&store, &user, &source(1), 1).unwrap();

        let outside = tmp.path().join("secret.csv");
        fs::write(&outside, HEADER).unwrap();
        let link = "visits_part001_20200101000000_evil0000.csv";
        std::os::unix::fs::symlink(&outside, store.root().join("alice").join(link)).unwrap();

        let err = store.read(&user, link).unwrap_err();
        assert!(matches!(err, ChunkError::InvalidInput(_)));
    }
}

//! Serialización de chunks: cabecera doble + filas de datos <-> texto CSV.
//!
//! Las mismas reglas de delimitado y comillas se usan en las dos
//! direcciones, así que `decode(encode(h, d)) == (h, d)` para cualquier
//! contenido, incluidos comas, comillas y saltos de línea en los campos.

use std::io::Read;

use csv::{ReaderBuilder, StringRecord, WriterBuilder};

use crate::error::{ChunkError, Result};
use crate::models::{HeaderBlock, Row};

/// Resultado de decodificar un chunk (o cualquier CSV con cabecera doble).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub header: HeaderBlock,
    pub rows: Vec<Row>,
}

/// Lector CSV configurado como lo necesita el divisor: sin cabecera
/// implícita y con filas de longitud variable.
///
/// El origen va envuelto en un [`QuoteGuard`], porque el lector de `csv`
/// cierra en silencio un campo entrecomillado que llega abierto al final.
pub fn reader<R: Read>(source: R) -> csv::Reader<QuoteGuard<R>> {
    ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(QuoteGuard::new(source))
}

/// Error de E/S con el que [`QuoteGuard`] señala un campo sin cerrar.
#[derive(Debug)]
pub struct UnterminatedQuote {
    pub line: u64,
}

impl std::fmt::Display for UnterminatedQuote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "campo entrecomillado sin cerrar (abierto en la línea {})",
            self.line
        )
    }
}

impl std::error::Error for UnterminatedQuote {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QuoteState {
    FieldStart,
    Unquoted,
    Quoted,
    // Comilla vista dentro de un campo entrecomillado: escape o cierre.
    QuoteInQuoted,
}

/// `Read` que sigue el estado de las comillas con las mismas reglas que el
/// lector de `csv` y falla al llegar a EOF con un campo entrecomillado abierto.
#[derive(Debug)]
pub struct QuoteGuard<R> {
    inner: R,
    state: QuoteState,
    line: u64,
    opened_at: u64,
}

impl<R: Read> QuoteGuard<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            state: QuoteState::FieldStart,
            line: 1,
            opened_at: 0,
        }
    }

    fn track(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.state = match (self.state, b) {
                (QuoteState::FieldStart, b'"') => {
                    self.opened_at = self.line;
                    QuoteState::Quoted
                }
                (QuoteState::Quoted, b'"') => QuoteState::QuoteInQuoted,
                (QuoteState::Quoted, _) => QuoteState::Quoted,
                (QuoteState::QuoteInQuoted, b'"') => QuoteState::Quoted,
                (_, b',' | b'\n' | b'\r') => QuoteState::FieldStart,
                _ => QuoteState::Unquoted,
            };
            if b == b'\n' {
                self.line += 1;
            }
        }
    }
}

impl<R: Read> Read for QuoteGuard<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 && !buf.is_empty() && self.state == QuoteState::Quoted {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                UnterminatedQuote {
                    line: self.opened_at,
                },
            ));
        }
        self.track(&buf[..n]);
        Ok(n)
    }
}

pub fn record_to_row(record: &StringRecord) -> Row {
    record.iter().map(str::to_string).collect()
}

/// Separa las filas en bloque de cabecera y filas de datos.
///
/// Las dos primeras filas son siempre la cabecera. Con menos de dos filas la
/// cabecera es lo que haya; quien exija una cabecera completa debe
/// comprobarlo con [`HeaderBlock::is_complete`].
pub fn split_rows(mut rows: Vec<Row>) -> Decoded {
    let data = if rows.len() > HeaderBlock::ROWS {
        rows.split_off(HeaderBlock::ROWS)
    } else {
        Vec::new()
    };
    Decoded {
        header: HeaderBlock(rows),
        rows: data,
    }
}

/// Decodifica texto CSV completo.
pub fn decode(raw: &[u8]) -> Result<Decoded> {
    let mut rdr = reader(raw);
    let mut rows = Vec::new();
    for record in rdr.records() {
        rows.push(record_to_row(&record?));
    }
    Ok(split_rows(rows))
}

/// Serializa la cabecera seguida de las filas de datos.
///
/// Una fila sin campos no tiene representación CSV propia (se leería como
/// un campo vacío), así que se rechaza.
pub fn encode(header: &HeaderBlock, rows: &[Row]) -> Result<Vec<u8>> {
    let mut wtr = WriterBuilder::new().flexible(true).from_writer(Vec::new());
    for row in header.rows().iter().chain(rows) {
        if row.is_empty() {
            return Err(ChunkError::invalid("no se puede serializar una fila sin campos"));
        }
        wtr.write_record(row)?;
    }
    wtr.into_inner()
        .map_err(|e| std::io::Error::other(e.to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(fields: &[&str]) -> Row {
        fields.iter().map(|f| f.to_string()).collect()
    }

    fn header() -> HeaderBlock {
        HeaderBlock(vec![
            row(&["Subject ID", "Visit Date", "Comment"]),
            row(&["subject_id", "visit_date", "comment"]),
        ])
    }

    #[test]
    fn encode_writes_header_then_rows() {
        let bytes = encode(&header(), &[row(&["S-001", "2024-01-02", "ok"])]).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            "Subject ID,Visit Date,Comment\nsubject_id,visit_date,comment\nS-001,2024-01-02,ok\n"
        );
    }

    #[test]
    fn decode_inverts_encode_with_quoting() {
        let rows = vec![
            row(&["S-002", "2024-01-03", "dolor, \"leve\""]),
            row(&["S-003", "", "línea 1\nlínea 2"]),
            row(&["S-004", "2024-02-01"]),
        ];
        let bytes = encode(&header(), &rows).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.header, header());
        assert_eq!(decoded.rows, rows);
    }

    #[test]
    fn short_input_keeps_whatever_header_exists() {
        let decoded = decode(b"only,one,row\n").unwrap();
        assert_eq!(decoded.header.rows().len(), 1);
        assert!(!decoded.header.is_complete());
        assert!(decoded.rows.is_empty());

        let empty = decode(b"").unwrap();
        assert!(empty.header.rows().is_empty());
    }

    #[test]
    fn unterminated_quote_is_a_parse_error() {
        let err = decode(b"a,b\nc,d\n1,\"abierto\n2,3\n").unwrap_err();
        assert!(matches!(err, ChunkError::Parse(ref msg) if msg.contains("línea 3")));
    }

    #[test]
    fn escaped_and_mid_field_quotes_are_not_unterminated() {
        let decoded = decode(b"a,b\nc,d\n\"x \"\"y\"\"\",z\"w\n\"fin\"\"\"\n").unwrap();
        assert_eq!(
            decoded.rows,
            vec![row(&["x \"y\"", "z\"w"]), row(&["fin\""])]
        );
    }

    #[test]
    fn empty_rows_cannot_be_encoded() {
        let err = encode(&header(), &[Vec::new()]).unwrap_err();
        assert!(matches!(err, ChunkError::InvalidInput(_)));
    }

    #[test]
    fn invalid_utf8_is_a_parse_error() {
        let err = decode(b"a,b\nc,d\n\xff\xfe,x\n").unwrap_err();
        assert!(matches!(err, ChunkError::Parse(_)));
    }
}

//! Validación de nombres de fichero que llegan desde el cliente.
//!
//! Es la primera barrera contra path traversal: rechaza cualquier nombre que
//! contenga `..`, `/`, `\` o un byte nulo. La comprobación de contención con rutas
//! canónicas vive en `store` y se repite siempre, pase lo que pase aquí.

/// Devuelve `true` si el nombre no contiene secuencias de path traversal.
pub fn is_safe(name: &str) -> bool {
    !name.contains("..") && !name.contains('/') && !name.contains('\\') && !name.contains('\0')
}

/// Igual que [`is_safe`], pero además exige un nombre no vacío y sin bytes
/// nulos. Se usa para los tokens de namespace, que acaban siendo directorios.
pub fn is_safe_component(name: &str) -> bool {
    !name.trim().is_empty() && name != "." && is_safe(name)
}

/// Reduce un nombre de fichero original a un "stem" apto para generar
/// nombres de chunk: sin extensión y con sólo `[A-Za-z0-9_-]`.
pub fn sanitize_stem(original: &str) -> String {
    let base = original
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or(original);
    let stem = match base.rsplit_once('.') {
        Some((stem, _ext)) if !stem.is_empty() => stem,
        _ => base,
    };

    let cleaned: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();

    if cleaned.trim_matches('_').is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_traversal_patterns() {
        for name in [
            "../secret.csv",
            "..",
            "a..b.csv",
            "dir/file.csv",
            "/etc/passwd",
            "dir\\file.csv",
            "..\\..\\boot.ini",
            "visits\0_part001_20240101000000_deadbeef.csv",
        ] {
            assert!(!is_safe(name), "debería rechazar {name:?}");
        }
    }

    #[test]
    fn accepts_typical_filenames() {
        for name in [
            "visits_part001_20240101120000_abcd1234.csv",
            "Adverse Events (v2).csv",
            "datos-2024.csv",
            ".hidden",
            "ñandú.csv",
        ] {
            assert!(is_safe(name), "debería aceptar {name:?}");
        }
    }

    #[test]
    fn component_rejects_empty_and_dot() {
        assert!(!is_safe_component(""));
        assert!(!is_safe_component("   "));
        assert!(!is_safe_component("."));
        assert!(!is_safe_component("user/1"));
        assert!(is_safe_component("user-42"));
    }

    #[test]
    fn stem_is_sanitized() {
        assert_eq!(sanitize_stem("Site Visits 2024.csv"), "Site_Visits_2024");
        assert_eq!(sanitize_stem("C:\\data\\sdv.csv"), "sdv");
        assert_eq!(sanitize_stem("noext"), "noext");
        assert_eq!(sanitize_stem(".csv"), "_csv");
        assert_eq!(sanitize_stem("***"), "upload");
        assert_eq!(sanitize_stem(""), "upload");
    }
}

//! Text extraction for source documents.
//!
//! Knowledge-base inputs are plain text, markdown, or PDF. Extraction is
//! extension-driven: text formats are read as UTF-8, PDFs go through
//! `pdf-extract`. Unsupported extensions yield empty text so the ingestion
//! layer can skip them without treating the file as an error.

use std::path::Path;

/// Extraction error. Callers skip the offending file and continue.
#[derive(Debug)]
pub enum ExtractError {
    Io(String),
    Pdf(String),
}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractError::Io(e) => write!(f, "read failed: {}", e),
            ExtractError::Pdf(e) => write!(f, "PDF extraction failed: {}", e),
        }
    }
}

impl std::error::Error for ExtractError {}

/// Extensions read directly as UTF-8 text.
const TEXT_EXTENSIONS: &[&str] = &["txt", "md", "markdown", "text"];

/// Extract plain text from a document file.
///
/// Returns an empty string for unsupported extensions.
pub fn extract_file(path: &Path) -> Result<String, ExtractError> {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    if TEXT_EXTENSIONS.contains(&ext.as_str()) {
        return std::fs::read_to_string(path).map_err(|e| ExtractError::Io(e.to_string()));
    }

    if ext == "pdf" {
        let bytes = std::fs::read(path).map_err(|e| ExtractError::Io(e.to_string()))?;
        return pdf_extract::extract_text_from_mem(&bytes)
            .map_err(|e| ExtractError::Pdf(e.to_string()));
    }

    Ok(String::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_extension_yields_empty_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.png");
        std::fs::write(&path, b"\x89PNG").unwrap();
        assert_eq!(extract_file(&path).unwrap(), "");
    }

    #[test]
    fn text_file_is_read_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.md");
        std::fs::write(&path, "# Heading\n\nBody.").unwrap();
        assert_eq!(extract_file(&path).unwrap(), "# Heading\n\nBody.");
    }

    #[test]
    fn missing_file_returns_io_error() {
        let err = extract_file(Path::new("/nonexistent/file.txt")).unwrap_err();
        assert!(matches!(err, ExtractError::Io(_)));
    }

    #[test]
    fn invalid_pdf_returns_pdf_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.pdf");
        std::fs::write(&path, b"not a pdf").unwrap();
        let err = extract_file(&path).unwrap_err();
        assert!(matches!(err, ExtractError::Pdf(_)));
    }
}

//! Plain-text extraction from source documents.
//!
//! [`DocumentSource`] is the seam the index builder reads documents
//! through. [`FileDocumentSource`] handles plain text and markdown (UTF-8,
//! lossy), PDF via `pdf-extract`, and DOCX via `zip` + `quick-xml`.
//! Extraction runs on a blocking worker thread.

use std::io::Read;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::{IndexError, IndexResult};
use crate::models::{Document, ExtractedText};

pub const MIME_TEXT: &str = "text/plain";
pub const MIME_MARKDOWN: &str = "text/markdown";
pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

/// Maximum decompressed bytes read from a single ZIP entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn extract(&self, document: &Document) -> IndexResult<ExtractedText>;
}

/// Reads documents straight from `Document::file_path`.
#[derive(Debug, Clone, Default)]
pub struct FileDocumentSource;

#[async_trait]
impl DocumentSource for FileDocumentSource {
    async fn extract(&self, document: &Document) -> IndexResult<ExtractedText> {
        let path = document.file_path.clone();
        let mime = document.mime_type.clone();
        tokio::task::spawn_blocking(move || extract_file(&path, &mime)).await?
    }
}

/// MIME type from the file extension; unknown extensions are treated as
/// plain text.
pub fn detect_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("pdf") => MIME_PDF,
        Some("docx") => MIME_DOCX,
        Some("md") | Some("markdown") => MIME_MARKDOWN,
        _ => MIME_TEXT,
    }
}

/// Hex SHA-256 of a file, streamed so large documents are never held in
/// memory whole.
pub fn content_hash(path: &Path) -> IndexResult<String> {
    let mut file = std::fs::File::open(path)
        .map_err(|e| IndexError::storage_io(format!("open {}", path.display()), e))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)
        .map_err(|e| IndexError::storage_io(format!("hash {}", path.display()), e))?;
    Ok(format!("{:x}", hasher.finalize()))
}

pub async fn content_hash_async(path: PathBuf) -> IndexResult<String> {
    tokio::task::spawn_blocking(move || content_hash(&path)).await?
}

pub fn extract_file(path: &Path, mime: &str) -> IndexResult<ExtractedText> {
    let bytes = std::fs::read(path)
        .map_err(|e| IndexError::storage_io(format!("read {}", path.display()), e))?;
    extract_bytes(&bytes, mime)
}

pub fn extract_bytes(bytes: &[u8], mime: &str) -> IndexResult<ExtractedText> {
    match mime {
        MIME_PDF => {
            let text = pdf_extract::extract_text_from_mem(bytes)
                .map_err(|e| IndexError::Processing(format!("PDF extraction failed: {}", e)))?;
            let pages = text.matches('\u{c}').count();
            Ok(ExtractedText::new(text, (pages > 0).then_some(pages)))
        }
        MIME_DOCX => Ok(ExtractedText::new(extract_docx(bytes)?, None)),
        _ => Ok(ExtractedText::new(
            String::from_utf8_lossy(bytes).into_owned(),
            None,
        )),
    }
}

fn ooxml_err(e: impl std::fmt::Display) -> IndexError {
    IndexError::Processing(format!("DOCX extraction failed: {}", e))
}

fn extract_docx(bytes: &[u8]) -> IndexResult<String> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(ooxml_err)?;
    let entry = archive.by_name("word/document.xml").map_err(ooxml_err)?;
    let mut xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut xml)
        .map_err(ooxml_err)?;
    if xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ooxml_err("word/document.xml exceeds size limit"));
    }
    docx_text(&xml)
}

/// Collect `<w:t>` runs, separating `<w:p>` paragraphs with a blank line.
fn docx_text(xml: &[u8]) -> IndexResult<String> {
    use quick_xml::events::Event;

    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::Text(t)) if in_text => {
                current.push_str(t.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    let para = current.trim();
                    if !para.is_empty() {
                        paragraphs.push(para.to_string());
                    }
                    current.clear();
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml_err(e)),
            _ => {}
        }
        buf.clear();
    }

    let tail = current.trim();
    if !tail.is_empty() {
        paragraphs.push(tail.to_string());
    }
    Ok(paragraphs.join("\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn docx_with(paragraphs: &[&str]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            zip.start_file("word/document.xml", zip::write::SimpleFileOptions::default())
                .unwrap();
            let body: String = paragraphs
                .iter()
                .map(|p| format!("<w:p><w:r><w:t>{}</w:t></w:r></w:p>", p))
                .collect();
            let xml = format!(
                "<?xml version=\"1.0\"?><w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\"><w:body>{}</w:body></w:document>",
                body
            );
            zip.write_all(xml.as_bytes()).unwrap();
            zip.finish().unwrap();
        }
        buf
    }

    #[test]
    fn test_detect_mime() {
        assert_eq!(detect_mime(&PathBuf::from("a/b.PDF")), MIME_PDF);
        assert_eq!(detect_mime(&PathBuf::from("notes.md")), MIME_MARKDOWN);
        assert_eq!(detect_mime(&PathBuf::from("report.docx")), MIME_DOCX);
        assert_eq!(detect_mime(&PathBuf::from("README")), MIME_TEXT);
    }

    #[test]
    fn test_docx_paragraphs_are_separated() {
        let extracted = extract_bytes(&docx_with(&["First line", "Second &amp; last"]), MIME_DOCX)
            .unwrap();
        assert_eq!(extracted.text, "First line\n\nSecond & last");
        assert_eq!(extracted.word_count, 5);
    }

    #[test]
    fn test_invalid_binary_formats_are_processing_errors() {
        assert!(matches!(
            extract_bytes(b"not a pdf", MIME_PDF),
            Err(IndexError::Processing(_))
        ));
        assert!(matches!(
            extract_bytes(b"not a zip", MIME_DOCX),
            Err(IndexError::Processing(_))
        ));
    }

    #[test]
    fn test_content_hash_matches_digest() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("doc.txt");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            content_hash(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(content_hash(&tmp.path().join("missing")).is_err());
    }

    #[test]
    fn test_text_is_read_lossily() {
        let extracted = extract_bytes(b"caf\xc3\xa9 \xff ok", MIME_TEXT).unwrap();
        assert!(extracted.text.starts_with("café"));
        assert_eq!(extracted.page_count, None);
    }
}

use crate::error::IngestError;
use base64::{engine::general_purpose::STANDARD, Engine};
use lopdf::{Document, Object};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{Cursor, Read};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

pub const PAGE_BREAK: char = '\u{000C}';
pub const DEFAULT_OCR_THRESHOLD: usize = 100;

const MAX_XML_ENTRY_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Pdf,
    Docx,
    Text,
}

impl DocumentKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        let extension = path.extension()?.to_str()?.to_ascii_lowercase();
        match extension.as_str() {
            "pdf" => Some(Self::Pdf),
            "docx" => Some(Self::Docx),
            "txt" | "md" | "markdown" => Some(Self::Text),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Docx => "docx",
            Self::Text => "text",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub kind: DocumentKind,
    pub pages: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedDocument {
    pub text: String,
    pub metadata: SourceMetadata,
}

/// Reads a source file into raw text plus source metadata.
///
/// Implementations are blocking; async callers run them on a blocking thread.
pub trait Extractor: Send + Sync {
    fn extract(&self, path: &Path) -> Result<ExtractedDocument, IngestError>;
}

fn extraction_failure(path: &Path, reason: impl fmt::Display) -> IngestError {
    IngestError::Extraction {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct PageText {
    pub number: u32,
    pub text: String,
}

fn join_pages(pages: &[PageText]) -> String {
    pages
        .iter()
        .map(|page| page.text.as_str())
        .collect::<Vec<_>>()
        .join(&PAGE_BREAK.to_string())
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LopdfExtractor;

impl LopdfExtractor {
    pub fn extract_pages(&self, document: &Document, path: &Path) -> Result<Vec<PageText>, IngestError> {
        let mut pages = Vec::new();
        for (page_no, _page_id) in document.get_pages() {
            let text = document
                .extract_text(&[page_no])
                .map_err(|error| IngestError::PdfParse(error.to_string()))?;

            if !text.trim().is_empty() {
                pages.push(PageText {
                    number: page_no,
                    text,
                });
            }
        }

        if pages.is_empty() {
            return Err(IngestError::PdfParse(format!(
                "pdf had no readable page text: {}",
                path.display()
            )));
        }

        Ok(pages)
    }
}

impl Extractor for LopdfExtractor {
    fn extract(&self, path: &Path) -> Result<ExtractedDocument, IngestError> {
        let document =
            Document::load(path).map_err(|error| IngestError::PdfParse(error.to_string()))?;
        let pages = self.extract_pages(&document, path)?;

        Ok(ExtractedDocument {
            text: join_pages(&pages),
            metadata: SourceMetadata {
                title: info_field(&document, b"Title"),
                author: info_field(&document, b"Author"),
                kind: DocumentKind::Pdf,
                pages: document.get_pages().len(),
            },
        })
    }
}

fn info_field(document: &Document, key: &[u8]) -> Option<String> {
    let info = document.trailer.get(b"Info").ok()?;
    let (_, info) = document.dereference(info).ok()?;
    let value = info.as_dict().ok()?.get(key).ok()?;
    let (_, value) = document.dereference(value).ok()?;
    match value {
        Object::String(bytes, _) => decode_pdf_string(bytes),
        _ => None,
    }
}

/// PDF text strings are UTF-16BE with a byte-order mark, or PDFDocEncoding,
/// which is read here as Latin-1.
fn decode_pdf_string(bytes: &[u8]) -> Option<String> {
    let decoded = match bytes {
        [0xFE, 0xFF, rest @ ..] => {
            let units = rest
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect::<Vec<_>>();
            String::from_utf16_lossy(&units)
        }
        _ => bytes.iter().map(|byte| char::from(*byte)).collect(),
    };

    let trimmed = decoded.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DocxExtractor;

impl Extractor for DocxExtractor {
    fn extract(&self, path: &Path) -> Result<ExtractedDocument, IngestError> {
        let bytes = fs::read(path).map_err(|error| extraction_failure(path, error))?;
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes.as_slice()))
            .map_err(|error| IngestError::Docx(error.to_string()))?;

        let body = read_zip_entry(&mut archive, "word/document.xml")?
            .ok_or_else(|| IngestError::Docx("word/document.xml not found".to_string()))?;
        let text = docx_body_text(&body)?;

        let (title, author) = match read_zip_entry(&mut archive, "docProps/core.xml")? {
            Some(core) => (
                xml_element_text(&core, b"title")?,
                xml_element_text(&core, b"creator")?,
            ),
            None => (None, None),
        };

        Ok(ExtractedDocument {
            text,
            metadata: SourceMetadata {
                title,
                author,
                kind: DocumentKind::Docx,
                pages: 1,
            },
        })
    }
}

fn read_zip_entry(
    archive: &mut zip::ZipArchive<Cursor<&[u8]>>,
    name: &str,
) -> Result<Option<Vec<u8>>, IngestError> {
    let entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(error) => return Err(IngestError::Docx(error.to_string())),
    };

    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|error| IngestError::Docx(error.to_string()))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(IngestError::Docx(format!("{name} exceeds size limit")));
    }
    Ok(Some(out))
}

/// Text of `w:t` runs; each `w:p` becomes a paragraph separated by a blank line.
fn docx_body_text(xml: &[u8]) -> Result<String, IngestError> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut paragraphs = Vec::new();
    let mut current = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(element)) if element.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::Text(text)) if in_text => {
                let text = text
                    .unescape()
                    .map_err(|error| IngestError::Docx(error.to_string()))?;
                current.push_str(&text);
            }
            Ok(Event::End(element)) => match element.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    let paragraph = current.trim();
                    if !paragraph.is_empty() {
                        paragraphs.push(paragraph.to_string());
                    }
                    current.clear();
                }
                _ => {}
            },
            Ok(Event::Empty(element)) => match element.local_name().as_ref() {
                b"br" | b"cr" => current.push('\n'),
                b"tab" => current.push('\t'),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(error) => return Err(IngestError::Docx(error.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(paragraphs.join("\n\n"))
}

fn xml_element_text(xml: &[u8], local_name: &[u8]) -> Result<Option<String>, IngestError> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut inside = false;
    let mut value = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(element)) if element.local_name().as_ref() == local_name => {
                inside = true;
            }
            Ok(Event::Text(text)) if inside => {
                let text = text
                    .unescape()
                    .map_err(|error| IngestError::Docx(error.to_string()))?;
                value.push_str(&text);
            }
            Ok(Event::End(element)) if element.local_name().as_ref() == local_name => break,
            Ok(Event::Eof) => break,
            Err(error) => return Err(IngestError::Docx(error.to_string())),
            _ => {}
        }
        buf.clear();
    }

    let value = value.trim();
    Ok((!value.is_empty()).then(|| value.to_string()))
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTextExtractor;

impl Extractor for PlainTextExtractor {
    fn extract(&self, path: &Path) -> Result<ExtractedDocument, IngestError> {
        let bytes = fs::read(path).map_err(|error| extraction_failure(path, error))?;
        let text = String::from_utf8_lossy(&bytes).into_owned();
        let pages = text.matches(PAGE_BREAK).count() + 1;

        Ok(ExtractedDocument {
            text,
            metadata: SourceMetadata {
                title: None,
                author: None,
                kind: DocumentKind::Text,
                pages,
            },
        })
    }
}

#[derive(Debug, Clone, Serialize)]
struct LlmOcrRequest {
    pdf_base64: String,
    source_path: String,
}

#[derive(Debug, Clone, Deserialize)]
struct LlmOcrResponse {
    pages: Option<Vec<LlmOcrPage>>,
    text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct LlmOcrPage {
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OcrEndpointConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub threshold: usize,
    pub timeout: Duration,
}

/// Multimodal OCR endpoint receiving the whole PDF as base64.
#[derive(Debug, Clone)]
pub struct OcrClient {
    config: OcrEndpointConfig,
}

impl OcrClient {
    pub fn new(config: OcrEndpointConfig) -> Self {
        Self { config }
    }

    pub fn recognize(&self, path: &Path) -> Result<Vec<PageText>, IngestError> {
        let pdf = fs::read(path)?;
        let payload = LlmOcrRequest {
            pdf_base64: STANDARD.encode(pdf),
            source_path: path.to_string_lossy().to_string(),
        };

        // Built per call: a blocking client must not live on an async worker.
        let client = Client::builder().timeout(self.config.timeout).build()?;
        let mut request = client
            .post(&self.config.endpoint)
            .header("content-type", "application/json")
            .json(&payload);

        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send()?;

        if !response.status().is_success() {
            return Err(IngestError::OcrFailed(format!(
                "multimodal OCR request to {} returned {}",
                self.config.endpoint,
                response.status()
            )));
        }

        let payload: LlmOcrResponse = response.json()?;
        payload_to_pages(&payload, path)
    }
}

fn payload_to_pages(payload: &LlmOcrResponse, path: &Path) -> Result<Vec<PageText>, IngestError> {
    if let Some(listed) = &payload.pages {
        let listed = listed
            .iter()
            .filter_map(|page| {
                let text = page.text.as_deref().map(str::trim).unwrap_or_default();
                (!text.is_empty()).then(|| PageText {
                    number: page.page.unwrap_or(1),
                    text: text.to_string(),
                })
            })
            .collect::<Vec<_>>();

        if !listed.is_empty() {
            return Ok(listed);
        }
    }

    if let Some(raw_text) = &payload.text {
        let pages = raw_text
            .split(PAGE_BREAK)
            .enumerate()
            .filter_map(|(index, chunk)| {
                let text = chunk.trim();
                (!text.is_empty()).then(|| PageText {
                    number: (index + 1) as u32,
                    text: text.to_string(),
                })
            })
            .collect::<Vec<_>>();

        if !pages.is_empty() {
            return Ok(pages);
        }
    }

    Err(IngestError::OcrFailed(format!(
        "multimodal OCR response was empty for {}",
        path.display()
    )))
}

fn meaningful_chars(text: &str) -> usize {
    text.chars().filter(|ch| !ch.is_whitespace()).count()
}

/// lopdf first; OCR when the PDF yields no text or fewer than `threshold`
/// non-whitespace characters.
pub struct OcrFallbackExtractor {
    primary: LopdfExtractor,
    ocr: OcrClient,
    threshold: usize,
}

impl OcrFallbackExtractor {
    pub fn new(config: OcrEndpointConfig) -> Self {
        Self {
            primary: LopdfExtractor,
            threshold: config.threshold,
            ocr: OcrClient::new(config),
        }
    }

    fn needs_ocr(&self, text: &str) -> bool {
        meaningful_chars(text) < self.threshold
    }
}

impl Extractor for OcrFallbackExtractor {
    fn extract(&self, path: &Path) -> Result<ExtractedDocument, IngestError> {
        let primary = match self.primary.extract(path) {
            Ok(document) if !self.needs_ocr(&document.text) => return Ok(document),
            Ok(document) => Some(document),
            Err(IngestError::PdfParse(reason)) => {
                debug!(path = %path.display(), %reason, "lopdf produced no text");
                None
            }
            Err(error) => return Err(error),
        };

        match (self.ocr.recognize(path), primary) {
            (Ok(pages), primary) => {
                let metadata = match primary {
                    Some(document) => document.metadata,
                    None => SourceMetadata {
                        title: None,
                        author: None,
                        kind: DocumentKind::Pdf,
                        pages: pages.len(),
                    },
                };
                Ok(ExtractedDocument {
                    text: join_pages(&pages),
                    metadata,
                })
            }
            (Err(error), Some(document)) => {
                warn!(path = %path.display(), %error, "OCR failed, keeping sparse pdf text");
                Ok(document)
            }
            (Err(error), None) => Err(error),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExtractionStrategy {
    /// Pick by file extension.
    #[default]
    Auto,
    Lopdf,
    Ocr,
    Docx,
    PlainText,
}

impl FromStr for ExtractionStrategy {
    type Err = IngestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "lopdf" | "pdf" => Ok(Self::Lopdf),
            "ocr" => Ok(Self::Ocr),
            "docx" => Ok(Self::Docx),
            "plain-text" | "text" | "txt" => Ok(Self::PlainText),
            other => Err(IngestError::InvalidArgument(format!(
                "unknown extraction strategy: {other}"
            ))),
        }
    }
}

/// Dispatches on file extension.
pub struct AutoExtractor {
    pdf: Box<dyn Extractor>,
    docx: DocxExtractor,
    text: PlainTextExtractor,
}

impl AutoExtractor {
    pub fn new(ocr: Option<OcrEndpointConfig>) -> Self {
        let pdf: Box<dyn Extractor> = match ocr {
            Some(config) => Box::new(OcrFallbackExtractor::new(config)),
            None => Box::new(LopdfExtractor),
        };
        Self {
            pdf,
            docx: DocxExtractor,
            text: PlainTextExtractor,
        }
    }
}

impl Extractor for AutoExtractor {
    fn extract(&self, path: &Path) -> Result<ExtractedDocument, IngestError> {
        match DocumentKind::from_path(path) {
            Some(DocumentKind::Pdf) => self.pdf.extract(path),
            Some(DocumentKind::Docx) => self.docx.extract(path),
            Some(DocumentKind::Text) => self.text.extract(path),
            None => Err(IngestError::UnsupportedDocument(path.display().to_string())),
        }
    }
}

pub fn build_extractor(
    strategy: ExtractionStrategy,
    ocr: Option<OcrEndpointConfig>,
) -> Result<Box<dyn Extractor>, IngestError> {
    let extractor: Box<dyn Extractor> = match strategy {
        ExtractionStrategy::Auto => Box::new(AutoExtractor::new(ocr)),
        ExtractionStrategy::Lopdf => Box::new(LopdfExtractor),
        ExtractionStrategy::Ocr => {
            let config = ocr.ok_or_else(|| {
                IngestError::InvalidArgument(
                    "ocr strategy requires an OCR endpoint".to_string(),
                )
            })?;
            Box::new(OcrFallbackExtractor::new(config))
        }
        ExtractionStrategy::Docx => Box::new(DocxExtractor),
        ExtractionStrategy::PlainText => Box::new(PlainTextExtractor),
    };
    Ok(extractor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;
    use zip::write::SimpleFileOptions;

    fn write_docx(path: &Path, body: &str, core: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
        let mut writer = zip::ZipWriter::new(fs::File::create(path)?);
        writer.start_file("word/document.xml", SimpleFileOptions::default())?;
        writer.write_all(body.as_bytes())?;
        if let Some(core) = core {
            writer.start_file("docProps/core.xml", SimpleFileOptions::default())?;
            writer.write_all(core.as_bytes())?;
        }
        writer.finish()?;
        Ok(())
    }

    #[test]
    fn ocr_payload_with_pages_converts_only_nonempty_text() -> Result<(), IngestError> {
        let response = LlmOcrResponse {
            pages: Some(vec![
                LlmOcrPage {
                    page: Some(2),
                    text: Some("  ".to_string()),
                },
                LlmOcrPage {
                    page: Some(3),
                    text: Some("Page 3".to_string()),
                },
            ]),
            text: None,
        };

        let pages = payload_to_pages(&response, Path::new("x.pdf"))?;

        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].number, 3);
        assert_eq!(pages[0].text, "Page 3");
        Ok(())
    }

    #[test]
    fn ocr_payload_fallback_text_split_by_form_feed() -> Result<(), IngestError> {
        let response = LlmOcrResponse {
            pages: None,
            text: Some("First\u{000C}Second\n".to_string()),
        };

        let pages = payload_to_pages(&response, Path::new("x.pdf"))?;

        assert_eq!(pages.len(), 2);
        assert_eq!(pages[1].number, 2);
        assert_eq!(join_pages(&pages), "First\u{000C}Second");
        Ok(())
    }

    #[test]
    fn empty_ocr_payload_is_an_ocr_failure() {
        let response = LlmOcrResponse {
            pages: Some(Vec::new()),
            text: Some(" \u{000C} ".to_string()),
        };
        let result = payload_to_pages(&response, Path::new("x.pdf"));
        assert!(matches!(result, Err(IngestError::OcrFailed(_))));
    }

    #[test]
    fn docx_paragraphs_and_core_properties() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("manual.docx");
        let body = r#"<?xml version="1.0" encoding="UTF-8"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>
<w:p><w:r><w:t>1 Scope</w:t></w:r></w:p>
<w:p><w:r><w:t xml:space="preserve">Pumps &amp; valves </w:t></w:r><w:r><w:t>are covered.</w:t></w:r></w:p>
<w:p></w:p>
</w:body></w:document>"#;
        let core = r#"<?xml version="1.0" encoding="UTF-8"?>
<cp:coreProperties xmlns:cp="http://schemas.openxmlformats.org/package/2006/metadata/core-properties" xmlns:dc="http://purl.org/dc/elements/1.1/">
<dc:title>Maintenance Manual</dc:title><dc:creator>Plant Engineering</dc:creator>
</cp:coreProperties>"#;
        write_docx(&path, body, Some(core))?;

        let document = DocxExtractor.extract(&path)?;

        assert_eq!(document.text, "1 Scope\n\nPumps & valves are covered.");
        assert_eq!(document.metadata.title.as_deref(), Some("Maintenance Manual"));
        assert_eq!(document.metadata.author.as_deref(), Some("Plant Engineering"));
        assert_eq!(document.metadata.kind, DocumentKind::Docx);
        Ok(())
    }

    #[test]
    fn docx_without_body_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("empty.docx");
        let mut writer = zip::ZipWriter::new(fs::File::create(&path)?);
        writer.start_file("other.xml", SimpleFileOptions::default())?;
        writer.write_all(b"<x/>")?;
        writer.finish()?;

        let result = DocxExtractor.extract(&path);
        assert!(matches!(result, Err(IngestError::Docx(_))));
        Ok(())
    }

    #[test]
    fn broken_pdf_is_a_parse_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("broken.pdf");
        fs::write(&path, b"%PDF-1.4\n%broken")?;

        let result = LopdfExtractor.extract(&path);
        assert!(matches!(result, Err(IngestError::PdfParse(_))));
        Ok(())
    }

    #[test]
    fn auto_extractor_dispatches_by_extension() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let notes = dir.path().join("notes.MD");
        fs::write(&notes, "Page one\u{000C}Page two")?;
        let image = dir.path().join("scan.png");
        fs::write(&image, b"\x89PNG")?;

        let extractor = build_extractor(ExtractionStrategy::Auto, None)?;
        let document = extractor.extract(&notes)?;
        assert_eq!(document.metadata.kind, DocumentKind::Text);
        assert_eq!(document.metadata.pages, 2);

        let unsupported = extractor.extract(&image);
        assert!(matches!(unsupported, Err(IngestError::UnsupportedDocument(_))));
        Ok(())
    }

    #[test]
    fn ocr_strategy_requires_endpoint() {
        assert!(matches!(
            build_extractor(ExtractionStrategy::Ocr, None),
            Err(IngestError::InvalidArgument(_))
        ));
    }

    #[test]
    fn strategy_parses_from_cli_names() -> Result<(), IngestError> {
        assert_eq!("plain-text".parse::<ExtractionStrategy>()?, ExtractionStrategy::PlainText);
        assert_eq!("OCR".parse::<ExtractionStrategy>()?, ExtractionStrategy::Ocr);
        assert!("tesseract".parse::<ExtractionStrategy>().is_err());
        Ok(())
    }

    #[test]
    fn pdf_strings_decode_utf16_and_latin1() {
        let utf16 = [0xFE, 0xFF, 0x00, 0x50, 0x00, 0x75, 0x00, 0x6D, 0x00, 0x70];
        assert_eq!(decode_pdf_string(&utf16).as_deref(), Some("Pump"));
        assert_eq!(decode_pdf_string(b"Caf\xe9").as_deref(), Some("Café"));
        assert_eq!(decode_pdf_string(b"   "), None);
    }

    #[test]
    fn sparse_text_triggers_ocr() {
        let extractor = OcrFallbackExtractor::new(OcrEndpointConfig {
            endpoint: "http://127.0.0.1:9/ocr".to_string(),
            api_key: None,
            threshold: 10,
            timeout: Duration::from_secs(1),
        });
        assert!(extractor.needs_ocr("  1 \n 2  "));
        assert!(!extractor.needs_ocr("Hydraulic pumps"));
    }
}

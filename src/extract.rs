//! Per-format text extraction and chunking.
//!
//! Every input file maps to exactly one [`DocumentKind`]; [`extract_chunks`]
//! is the only place that branches on it.

use std::collections::HashMap;
use std::fs;
use std::io::{Cursor, Read};
use std::path::Path;

use quick_xml::Reader as XmlReader;
use quick_xml::events::Event;
use zip::ZipArchive;

use crate::{ExtractError, extension_of};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DocumentKind {
    Pdf,
    Epub,
    Html,
    PlainText,
}

impl DocumentKind {
    pub(crate) fn from_path(path: &Path) -> Self {
        match extension_of(path).as_str() {
            "pdf" => DocumentKind::Pdf,
            "epub" => DocumentKind::Epub,
            "html" | "htm" => DocumentKind::Html,
            _ => DocumentKind::PlainText,
        }
    }
}

/// Extracts `path` and splits it into chunks. An empty result means the
/// document had no usable text.
pub(crate) fn extract_chunks(
    path: &Path,
    chunk_size: usize,
    overlap: usize,
) -> Result<Vec<String>, ExtractError> {
    let text = match DocumentKind::from_path(path) {
        DocumentKind::Pdf => extract_pdf(path)?,
        DocumentKind::Epub => extract_epub(path)?,
        DocumentKind::Html => extract_html(path)?,
        DocumentKind::PlainText => read_text_lossy(path)?,
    };
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(chunk_text(&text, chunk_size, overlap))
}

/// Splits `text` into windows of `chunk_size` characters, each starting
/// `overlap` characters before the previous one ended. A window is cut
/// short at the last `.` when that falls in its final fifth.
pub(crate) fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < chars.len() {
        let mut end = (start + chunk_size).min(chars.len());
        if end < chars.len() {
            let window = &chars[start..end];
            if let Some(last_period) = window.iter().rposition(|c| *c == '.') {
                if last_period * 5 > chunk_size * 4 {
                    end = start + last_period + 1;
                }
            }
        }

        let chunk: String = chars[start..end].iter().collect();
        let chunk = chunk.trim();
        if !chunk.is_empty() {
            chunks.push(chunk.to_string());
        }

        if end >= chars.len() {
            break;
        }
        let next = end.saturating_sub(overlap);
        start = if next > start { next } else { start + 1 };
    }
    chunks
}

fn read_text_lossy(path: &Path) -> Result<String, ExtractError> {
    let bytes = fs::read(path).map_err(|source| ExtractError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(decode_dropping_invalid(&bytes))
}

/// UTF-8 decode where undecodable byte runs are dropped, not replaced.
pub(crate) fn decode_dropping_invalid(bytes: &[u8]) -> String {
    let mut text = String::with_capacity(bytes.len());
    for chunk in bytes.utf8_chunks() {
        text.push_str(chunk.valid());
    }
    text
}

#[cfg(feature = "pdf")]
fn extract_pdf(path: &Path) -> Result<String, ExtractError> {
    let bytes = fs::read(path).map_err(|source| ExtractError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    pdf_extract::extract_text_from_mem(&bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

#[cfg(not(feature = "pdf"))]
fn extract_pdf(_path: &Path) -> Result<String, ExtractError> {
    Err(ExtractError::Unsupported("pdf"))
}

#[cfg(feature = "html")]
fn extract_html(path: &Path) -> Result<String, ExtractError> {
    let raw = read_text_lossy(path)?;
    Ok(html_to_text(&raw))
}

#[cfg(not(feature = "html"))]
fn extract_html(_path: &Path) -> Result<String, ExtractError> {
    Err(ExtractError::Unsupported("html"))
}

/// Visible text of an HTML document with whitespace collapsed.
#[cfg(feature = "html")]
pub(crate) fn html_to_text(html: &str) -> String {
    let document = scraper::Html::parse_document(html);
    let mut parts = Vec::new();
    collect_visible_text(document.root_element(), &mut parts);
    collapse_whitespace(&parts.join(" "))
}

#[cfg(feature = "html")]
fn collect_visible_text(element: scraper::ElementRef<'_>, parts: &mut Vec<String>) {
    use scraper::node::Node;

    if matches!(
        element.value().name(),
        "script" | "style" | "noscript" | "head"
    ) {
        return;
    }
    for child in element.children() {
        match child.value() {
            Node::Text(text) => {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    parts.push(trimmed.to_string());
                }
            }
            Node::Element(_) => {
                if let Some(child_element) = scraper::ElementRef::wrap(child) {
                    collect_visible_text(child_element, parts);
                }
            }
            _ => {}
        }
    }
}

pub(crate) fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

const EPUB_CONTAINER_PATH: &str = "META-INF/container.xml";

fn extract_epub(path: &Path) -> Result<String, ExtractError> {
    let bytes = fs::read(path).map_err(|source| ExtractError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    epub_text(&bytes)
}

pub(crate) fn epub_text(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| ExtractError::Epub(format!("failed to open archive: {e}")))?;

    let documents = match epub_spine(&mut archive) {
        Some(spine) if !spine.is_empty() => spine,
        _ => archive
            .file_names()
            .filter(|name| {
                let lower = name.to_ascii_lowercase();
                lower.ends_with(".xhtml") || lower.ends_with(".html") || lower.ends_with(".htm")
            })
            .map(str::to_string)
            .collect(),
    };
    if documents.is_empty() {
        return Err(ExtractError::Epub("no content documents".into()));
    }

    let mut sections = Vec::new();
    for name in documents {
        let Some(xml) = read_zip_entry(&mut archive, &name) else {
            continue;
        };
        let text = xhtml_text(&xml);
        if !text.is_empty() {
            sections.push(text);
        }
    }
    Ok(sections.join("\n\n"))
}

fn read_zip_entry(archive: &mut ZipArchive<Cursor<&[u8]>>, name: &str) -> Option<String> {
    let mut file = archive.by_name(name).ok()?;
    let mut out = String::new();
    file.read_to_string(&mut out).ok()?;
    Some(out)
}

/// Content documents in reading order, from the OPF spine.
fn epub_spine(archive: &mut ZipArchive<Cursor<&[u8]>>) -> Option<Vec<String>> {
    let container = read_zip_entry(archive, EPUB_CONTAINER_PATH)?;
    let opf_path = first_attr(&container, b"rootfile", b"full-path")?;
    let opf = read_zip_entry(archive, &opf_path)?;
    let base = match opf_path.rfind('/') {
        Some(idx) => opf_path[..=idx].to_string(),
        None => String::new(),
    };

    let mut manifest: HashMap<String, String> = HashMap::new();
    let mut spine: Vec<String> = Vec::new();
    let mut reader = XmlReader::from_str(&opf);
    reader.trim_text(true);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"item" => {
                    let id = attr_value(&e, b"id");
                    let href = attr_value(&e, b"href");
                    if let (Some(id), Some(href)) = (id, href) {
                        manifest.insert(id, href);
                    }
                }
                b"itemref" => {
                    if let Some(idref) = attr_value(&e, b"idref") {
                        spine.push(idref);
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(_) => return None,
            _ => {}
        }
        buf.clear();
    }

    Some(
        spine
            .into_iter()
            .filter_map(|id| manifest.get(&id).map(|href| format!("{base}{href}")))
            .collect(),
    )
}

pub(crate) fn attr_value(e: &quick_xml::events::BytesStart<'_>, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|attr| attr.key.local_name().as_ref() == key)
        .and_then(|attr| attr.unescape_value().ok().map(|v| v.into_owned()))
}

fn first_attr(xml: &str, tag: &[u8], key: &[u8]) -> Option<String> {
    let mut reader = XmlReader::from_str(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.local_name().as_ref() == tag => {
                return attr_value(&e, key);
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
        buf.clear();
    }
}

/// Text of an XHTML content document, one line per block element,
/// skipping `<script>`, `<style>` and `<head>`.
pub(crate) fn xhtml_text(xml: &str) -> String {
    let mut reader = XmlReader::from_str(xml);
    reader.trim_text(true);
    let mut buf = Vec::new();
    let mut lines: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut skip_depth = 0usize;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = e.local_name();
                if matches!(name.as_ref(), b"script" | b"style" | b"head") {
                    skip_depth += 1;
                }
            }
            Ok(Event::End(e)) => {
                let name = e.local_name();
                match name.as_ref() {
                    b"script" | b"style" | b"head" => skip_depth = skip_depth.saturating_sub(1),
                    b"p" | b"div" | b"h1" | b"h2" | b"h3" | b"h4" | b"h5" | b"h6" | b"li"
                    | b"blockquote" | b"tr" => {
                        let line = collapse_whitespace(&current);
                        if !line.is_empty() {
                            lines.push(line);
                        }
                        current.clear();
                    }
                    _ => {}
                }
            }
            Ok(Event::Text(t)) if skip_depth == 0 => {
                if let Ok(content) = t.unescape() {
                    current.push_str(&content);
                    current.push(' ');
                }
            }
            Ok(Event::CData(t)) if skip_depth == 0 => {
                current.push_str(&String::from_utf8_lossy(&t));
                current.push(' ');
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    let tail = collapse_whitespace(&current);
    if !tail.is_empty() {
        lines.push(tail);
    }
    lines.join("\n")
}

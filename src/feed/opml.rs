use std::io::Cursor;
use std::path::Path;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use thiserror::Error;

use super::discovery::DiscoveredFeed;
use crate::util::write_atomic;

/// SEC-003: Maximum allowed nesting depth for OPML outline elements.
const MAX_OPML_DEPTH: usize = 50;

const OWNER_NAME: &str = "linkding-to-opml";
const OPML_DOCS: &str = "http://www.opml.org/spec2";

/// Errors that can occur while reading or writing OPML.
#[derive(Debug, Error)]
pub enum OpmlError {
    /// SEC-003: OPML nesting depth exceeds safety limit.
    #[error("OPML nesting depth exceeds maximum of {0} levels")]
    MaxDepthExceeded(usize),

    /// XML parsing failed.
    #[error("XML parse error: {0}")]
    XmlParse(String),

    /// Reading the input or writing the output failed.
    #[error("OPML I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A feed subscription extracted from an OPML file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpmlEntry {
    /// From `title`, falling back to `text`, then to the feed URL.
    pub title: String,
    pub xml_url: String,
    /// Website URL from `htmlUrl`, if present and non-empty.
    pub html_url: Option<String>,
    pub description: Option<String>,
}

/// Reads an OPML file and returns every outline that carries an `xmlUrl`,
/// flattened across folders.
pub async fn parse(path: &Path) -> Result<Vec<OpmlEntry>, OpmlError> {
    let content = tokio::fs::read_to_string(path).await?;
    parse_opml_content(&content)
}

/// Parses OPML content. Folder outlines (no `xmlUrl`) are traversed but
/// not returned.
pub fn parse_opml_content(content: &str) -> Result<Vec<OpmlEntry>, OpmlError> {
    // SEC-002: quick-xml (0.37) never expands <!ENTITY> declarations; custom
    // entity references fail in `decode_and_unescape_value()`.
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut buf = Vec::new();
    let mut depth: usize = 0;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.name().as_ref() == b"outline" => {
                depth += 1;
                if depth > MAX_OPML_DEPTH {
                    return Err(OpmlError::MaxDepthExceeded(MAX_OPML_DEPTH));
                }
                if let Some(entry) = parse_outline_attributes(&e, &reader)? {
                    entries.push(entry);
                }
            }
            Ok(Event::Empty(e)) if e.name().as_ref() == b"outline" => {
                if let Some(entry) = parse_outline_attributes(&e, &reader)? {
                    entries.push(entry);
                }
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"outline" => {
                depth = depth.saturating_sub(1);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(OpmlError::XmlParse(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    tracing::debug!(entries = entries.len(), "Parsed OPML document");
    Ok(entries)
}

fn parse_outline_attributes(
    e: &BytesStart<'_>,
    reader: &Reader<&[u8]>,
) -> Result<Option<OpmlEntry>, OpmlError> {
    let mut xml_url = None;
    let mut html_url = None;
    let mut title = None;
    let mut text = None;
    let mut description = None;

    for attr_result in e.attributes() {
        let attr = match attr_result {
            Ok(attr) => attr,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed OPML attribute");
                continue;
            }
        };
        let value = attr
            .decode_and_unescape_value(reader.decoder())
            .map_err(|e| OpmlError::XmlParse(e.to_string()))?
            .trim()
            .to_string();
        if value.is_empty() {
            continue;
        }
        match attr.key.as_ref() {
            b"xmlUrl" => xml_url = Some(value),
            b"htmlUrl" => html_url = Some(value),
            b"title" => title = Some(value),
            b"text" => text = Some(value),
            b"description" => description = Some(value),
            _ => {}
        }
    }

    Ok(xml_url.map(|url| OpmlEntry {
        title: title.or(text).unwrap_or_else(|| url.clone()),
        xml_url: url,
        html_url,
        description,
    }))
}

/// Renders an OPML 2.0 document with one `type="rss"` outline per feed.
pub fn export_opml(feeds: &[DiscoveredFeed], title: &str) -> Result<String, OpmlError> {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
    let now = chrono::Utc::now().to_rfc2822();

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let mut opml = BytesStart::new("opml");
    opml.push_attribute(("version", "2.0"));
    writer.write_event(Event::Start(opml))?;

    writer.write_event(Event::Start(BytesStart::new("head")))?;
    write_text_element(&mut writer, "title", title)?;
    write_text_element(&mut writer, "dateCreated", &now)?;
    write_text_element(&mut writer, "dateModified", &now)?;
    write_text_element(&mut writer, "ownerName", OWNER_NAME)?;
    write_text_element(&mut writer, "docs", OPML_DOCS)?;
    writer.write_event(Event::End(BytesEnd::new("head")))?;

    writer.write_event(Event::Start(BytesStart::new("body")))?;
    for feed in feeds {
        let mut outline = BytesStart::new("outline");
        outline.push_attribute(("type", "rss"));
        outline.push_attribute(("text", feed.feed_title.as_str()));
        outline.push_attribute(("title", feed.feed_title.as_str()));
        outline.push_attribute(("xmlUrl", feed.feed_url.as_str()));
        outline.push_attribute(("htmlUrl", feed.page_url.as_str()));
        writer.write_event(Event::Empty(outline))?;
    }
    writer.write_event(Event::End(BytesEnd::new("body")))?;
    writer.write_event(Event::End(BytesEnd::new("opml")))?;

    let bytes = writer.into_inner().into_inner();
    String::from_utf8(bytes).map_err(|e| OpmlError::XmlParse(e.to_string()))
}

fn write_text_element(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    name: &str,
    text: &str,
) -> Result<(), OpmlError> {
    writer.write_event(Event::Start(BytesStart::new(name)))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

/// Writes the OPML document to `path` atomically, creating parent
/// directories as needed.
pub fn export_to_file(feeds: &[DiscoveredFeed], title: &str, path: &Path) -> Result<(), OpmlError> {
    let content = export_opml(feeds, title)?;
    write_atomic(path, content.as_bytes())?;
    tracing::info!(file_path = %path.display(), outline_count = feeds.len(), "Wrote OPML file");
    Ok(())
}

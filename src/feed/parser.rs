//! Tolerant feed metadata parser.
//!
//! Only channel-level metadata is extracted (title, description, website
//! link); entries are never read. Each dialect is a separate attempt over
//! the same bytes, tried in order: RSS 2.0, Atom, RSS 1.0/RDF.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

use crate::util::clean_text;

/// Syndication dialect a document was recognised as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedDialect {
    Rss,
    Atom,
    Rdf,
}

impl std::fmt::Display for FeedDialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeedDialect::Rss => f.write_str("RSS"),
            FeedDialect::Atom => f.write_str("Atom"),
            FeedDialect::Rdf => f.write_str("RDF"),
        }
    }
}

/// Channel-level metadata of a feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFeed {
    pub title: String,
    pub description: String,
    /// Website link with whitespace and trailing slashes removed; empty when
    /// the feed does not declare one.
    pub link: String,
    pub dialect: FeedDialect,
}

/// Returned when none of the dialects matched.
#[derive(Debug, Error)]
#[error("failed to parse feed as RSS, Atom, or RDF")]
pub struct ParseError;

/// Why a single dialect attempt did not produce a feed.
#[derive(Debug, Clone, PartialEq, Eq)]
enum NoMatch {
    /// The root element belongs to another dialect (or is not a feed).
    WrongRoot,
    /// The document is not well-formed XML.
    Malformed(String),
    /// Structure matched but the channel has no title.
    Untitled,
}

type DialectParser = fn(&[u8]) -> Result<ParsedFeed, NoMatch>;

const DIALECTS: &[(FeedDialect, DialectParser)] = &[
    (FeedDialect::Rss, parse_rss),
    (FeedDialect::Atom, parse_atom),
    (FeedDialect::Rdf, parse_rdf),
];

/// Parses feed bytes, returning the first dialect that yields a titled channel.
pub fn parse_feed(bytes: &[u8]) -> Result<ParsedFeed, ParseError> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);

    for (dialect, parser) in DIALECTS {
        match parser(bytes) {
            Ok(feed) => return Ok(feed),
            Err(NoMatch::WrongRoot) => {}
            Err(reason) => {
                tracing::debug!(dialect = %dialect, reason = ?reason, "Feed did not parse as dialect");
            }
        }
    }

    Err(ParseError)
}

/// Event walk over one document.
///
/// The walker keeps the stack of open element names so callers can pick
/// elements by exact position, e.g. `["rss", "channel", "link"]`. Elements
/// nested deeper (items, images) never match a channel-level path.
struct Walk<'a> {
    reader: Reader<&'a [u8]>,
    stack: Vec<Vec<u8>>,
    buf: Vec<u8>,
}

enum Step {
    Open(Vec<u8>, Vec<(Vec<u8>, String)>),
    Empty(Vec<u8>, Vec<(Vec<u8>, String)>),
    Text(String),
    Close,
    Done,
}

impl<'a> Walk<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        let mut reader = Reader::from_reader(bytes);
        reader.config_mut().trim_text(true);
        Self {
            reader,
            stack: Vec::new(),
            buf: Vec::new(),
        }
    }

    fn depth(&self) -> usize {
        self.stack.len()
    }

    /// True when the open elements are exactly `path` (qualified names).
    fn at(&self, path: &[&str]) -> bool {
        self.stack.len() == path.len()
            && self
                .stack
                .iter()
                .zip(path)
                .all(|(open, want)| open.as_slice() == want.as_bytes())
    }

    fn next(&mut self) -> Result<Step, NoMatch> {
        loop {
            self.buf.clear();
            let event = self
                .reader
                .read_event_into(&mut self.buf)
                .map_err(|e| NoMatch::Malformed(e.to_string()))?;

            match event {
                Event::Start(e) => {
                    let name = e.name().as_ref().to_vec();
                    let attrs = collect_attributes(&e, &self.reader);
                    self.stack.push(name.clone());
                    return Ok(Step::Open(name, attrs));
                }
                Event::Empty(e) => {
                    let name = e.name().as_ref().to_vec();
                    let attrs = collect_attributes(&e, &self.reader);
                    return Ok(Step::Empty(name, attrs));
                }
                Event::End(_) => {
                    self.stack.pop();
                    return Ok(Step::Close);
                }
                Event::Text(e) => {
                    let text = match e.unescape() {
                        Ok(text) => text.into_owned(),
                        // Unknown HTML entities (&nbsp; etc.) are common in titles
                        Err(_) => String::from_utf8_lossy(&e).into_owned(),
                    };
                    return Ok(Step::Text(text));
                }
                Event::CData(e) => {
                    return Ok(Step::Text(String::from_utf8_lossy(&e).into_owned()));
                }
                Event::Eof => return Ok(Step::Done),
                _ => {}
            }
        }
    }
}

fn collect_attributes(e: &BytesStart<'_>, reader: &Reader<&[u8]>) -> Vec<(Vec<u8>, String)> {
    e.attributes()
        .filter_map(|attr| attr.ok())
        .filter_map(|attr| {
            let value = attr.decode_and_unescape_value(reader.decoder()).ok()?;
            Some((attr.key.local_name().as_ref().to_vec(), value.into_owned()))
        })
        .collect()
}

fn attr<'v>(attrs: &'v [(Vec<u8>, String)], name: &str) -> Option<&'v str> {
    attrs
        .iter()
        .find(|(key, _)| key.as_slice() == name.as_bytes())
        .map(|(_, value)| value.as_str())
}

/// Local part of a possibly prefixed name (`rdf:RDF` → `RDF`).
fn local(name: &[u8]) -> &[u8] {
    match name.iter().position(|&b| b == b':') {
        Some(idx) => &name[idx + 1..],
        None => name,
    }
}

fn clean_link(link: &str) -> String {
    link.trim().trim_end_matches('/').trim().to_string()
}

fn finish(
    dialect: FeedDialect,
    title: String,
    description: String,
    link: String,
) -> Result<ParsedFeed, NoMatch> {
    let title = clean_text(&title);
    if title.is_empty() {
        return Err(NoMatch::Untitled);
    }
    Ok(ParsedFeed {
        title,
        description: clean_text(&description),
        link: clean_link(&link),
        dialect,
    })
}

/// Tracks which channel-level field the walker is currently inside.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Field {
    Title,
    Description,
    Link,
}

/// RSS 2.0: `<rss><channel>…</channel></rss>`.
///
/// Real feeds carry several `<link>` elements: the channel's own, one per
/// `<item>`, one inside `<image>`, plus namespaced `<atom:link rel="self">`.
/// Only an unprefixed `<link>` that is a direct child of `<channel>` counts.
fn parse_rss(bytes: &[u8]) -> Result<ParsedFeed, NoMatch> {
    let mut walk = Walk::new(bytes);
    let mut seen_root = false;
    let mut title = String::new();
    let mut description = String::new();
    let mut link = String::new();
    let mut field: Option<Field> = None;

    loop {
        match walk.next()? {
            Step::Open(name, _) => {
                if !seen_root {
                    if name != b"rss" {
                        return Err(NoMatch::WrongRoot);
                    }
                    seen_root = true;
                    continue;
                }
                field = if walk.at(&["rss", "channel", "title"]) && title.is_empty() {
                    Some(Field::Title)
                } else if walk.at(&["rss", "channel", "description"]) && description.is_empty() {
                    Some(Field::Description)
                } else if walk.at(&["rss", "channel", "link"]) && link.is_empty() {
                    Some(Field::Link)
                } else {
                    None
                };
            }
            Step::Empty(..) if !seen_root => return Err(NoMatch::WrongRoot),
            Step::Text(text) => match field {
                Some(Field::Title) if walk.depth() == 3 => title.push_str(&text),
                Some(Field::Description) if walk.depth() == 3 => description.push_str(&text),
                Some(Field::Link) if walk.depth() == 3 => link.push_str(&text),
                _ => {}
            },
            Step::Close => {
                if walk.depth() < 3 {
                    field = None;
                }
            }
            Step::Empty(..) => {}
            Step::Done => break,
        }
    }

    if !seen_root {
        return Err(NoMatch::WrongRoot);
    }
    finish(FeedDialect::Rss, title, description, link)
}

/// Atom: `<feed>` with `<title>`, `<subtitle>` and any number of `<link>`.
///
/// Website link preference: `rel="alternate"` with an HTML type, otherwise
/// the first link that is not `rel="self"`.
fn parse_atom(bytes: &[u8]) -> Result<ParsedFeed, NoMatch> {
    let mut walk = Walk::new(bytes);
    let mut seen_root = false;
    let mut title = String::new();
    let mut description = String::new();
    let mut links: Vec<(String, String, String)> = Vec::new(); // (href, rel, type)
    let mut field: Option<Field> = None;

    loop {
        match walk.next()? {
            Step::Open(name, attrs) => {
                if !seen_root {
                    if local(&name) != b"feed" {
                        return Err(NoMatch::WrongRoot);
                    }
                    seen_root = true;
                    continue;
                }
                field = None;
                if walk.depth() == 2 {
                    match local(&name) {
                        b"title" if title.is_empty() => field = Some(Field::Title),
                        b"subtitle" if description.is_empty() => field = Some(Field::Description),
                        b"link" => links.push(atom_link(&attrs)),
                        _ => {}
                    }
                }
            }
            Step::Empty(name, attrs) => {
                if !seen_root {
                    return Err(NoMatch::WrongRoot);
                }
                if walk.depth() == 1 && local(&name) == b"link" {
                    links.push(atom_link(&attrs));
                }
            }
            Step::Text(text) => match field {
                Some(Field::Title) if walk.depth() == 2 => title.push_str(&text),
                Some(Field::Description) if walk.depth() == 2 => description.push_str(&text),
                _ => {}
            },
            Step::Close => {
                if walk.depth() < 2 {
                    field = None;
                }
            }
            Step::Done => break,
        }
    }

    if !seen_root {
        return Err(NoMatch::WrongRoot);
    }

    let link = links
        .iter()
        .find(|(_, rel, kind)| rel == "alternate" && kind.contains("text/html"))
        .or_else(|| links.iter().find(|(_, rel, _)| rel != "self"))
        .map(|(href, _, _)| href.clone())
        .unwrap_or_default();

    finish(FeedDialect::Atom, title, description, link)
}

fn atom_link(attrs: &[(Vec<u8>, String)]) -> (String, String, String) {
    (
        attr(attrs, "href").unwrap_or_default().to_string(),
        attr(attrs, "rel").unwrap_or_default().to_string(),
        attr(attrs, "type").unwrap_or_default().to_string(),
    )
}

/// RSS 1.0: `<rdf:RDF><channel>…</channel><item>…</item></rdf:RDF>`.
///
/// Items are siblings of the channel here, so a channel-scoped path already
/// excludes them. A `<link>` directly under the root is used when the
/// channel has none.
fn parse_rdf(bytes: &[u8]) -> Result<ParsedFeed, NoMatch> {
    let mut walk = Walk::new(bytes);
    let mut seen_root = false;
    let mut title = String::new();
    let mut description = String::new();
    let mut link = String::new();
    let mut root_link = String::new();
    let mut field: Option<Field> = None;
    let mut in_root_link = false;

    loop {
        match walk.next()? {
            Step::Open(name, _) => {
                if !seen_root {
                    if local(&name) != b"RDF" {
                        return Err(NoMatch::WrongRoot);
                    }
                    seen_root = true;
                    continue;
                }
                field = None;
                in_root_link = walk.depth() == 2 && local(&name) == b"link";
                let in_channel = walk.depth() == 3
                    && walk.stack.get(1).map(|n| local(n) == b"channel") == Some(true);
                if in_channel {
                    match local(&name) {
                        b"title" if title.is_empty() => field = Some(Field::Title),
                        b"description" if description.is_empty() => {
                            field = Some(Field::Description)
                        }
                        b"link" if link.is_empty() => field = Some(Field::Link),
                        _ => {}
                    }
                }
            }
            Step::Empty(..) if !seen_root => return Err(NoMatch::WrongRoot),
            Step::Empty(..) => {}
            Step::Text(text) => {
                if in_root_link && walk.depth() == 2 && root_link.is_empty() {
                    root_link.push_str(&text);
                }
                match field {
                    Some(Field::Title) if walk.depth() == 3 => title.push_str(&text),
                    Some(Field::Description) if walk.depth() == 3 => description.push_str(&text),
                    Some(Field::Link) if walk.depth() == 3 => link.push_str(&text),
                    _ => {}
                }
            }
            Step::Close => {
                field = None;
                in_root_link = false;
            }
            Step::Done => break,
        }
    }

    if !seen_root {
        return Err(NoMatch::WrongRoot);
    }
    if link.trim().is_empty() {
        link = root_link;
    }
    finish(FeedDialect::Rdf, title, description, link)
}

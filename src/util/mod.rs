//! Small helpers shared by the discovery and parsing code.
//!
//! - **Text hygiene**: strip control characters from feed metadata and build
//!   one-line previews of response bodies for debug logging.
//! - **Atomic writes**: temp file + fsync + rename, used for the cache
//!   snapshot and the OPML output.

mod fs;
mod text;

pub use fs::write_atomic;
pub use text::{clean_text, content_preview};

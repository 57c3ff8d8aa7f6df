//! PDF Embed Library
//!
//! Embeds pages of existing PDF documents into a newly built PDF.
//! This library provides functionality to:
//! - Rewrite a source page's content stream into collision-free destination names
//! - Copy images, graphics states and nested forms once per destination document
//! - Merge repeated occurrences of one font into a single destination font
//! - Carry tagged-PDF marked content and link annotations across
//!
//! # Example
//!
//! ```no_run
//! use pdf_embed::pdf::{MergeSession, SessionOptions, SourceDocument, EmbedPlacement};
//! use std::path::Path;
//!
//! let source = SourceDocument::load(Path::new("chapter.pdf"))?;
//! let mut session = MergeSession::new(SessionOptions::default());
//! for number in source.page_numbers() {
//!     session.embed_page(&source, number, &EmbedPlacement::default())?;
//! }
//! let mut output = session.finish()?;
//! output.save("combined.pdf")?;
//! # Ok::<(), pdf_embed::Error>(())
//! ```

pub mod error;
pub mod pdf;

// Re-export commonly used items
pub use error::{Error, Result};

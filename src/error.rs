//! Error types for the PDF embedding library

use std::path::PathBuf;
use thiserror::Error;

use crate::pdf::resources::ResourceCategory;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the PDF embedding library
#[derive(Error, Debug)]
pub enum Error {
    /// PDF processing error
    #[error("PDF error: {0}")]
    Pdf(#[from] lopdf::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// File not found
    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// Invalid PDF (no pages)
    #[error("PDF has no pages: {0}")]
    EmptyPdf(String),

    /// Requested page does not exist in the source document
    #[error("Page {page} not found in {source_key}")]
    PageNotFound { source_key: String, page: u32 },

    /// Content stream could not be parsed; the page is not embedded
    #[error("Malformed content stream on page {page} of {source_key}: {reason}")]
    MalformedContentStream {
        source_key: String,
        page: u32,
        reason: String,
    },

    /// Page rotation outside 0/90/180/270
    #[error("Unsupported rotation {rotation} on page {page}")]
    UnsupportedRotation { page: u32, rotation: i64 },

    /// Simple and composite contributions under one logical font key
    #[error("Font kind conflict for {key}: registered as {existing}, got {incoming}")]
    FontKindConflict {
        key: String,
        existing: &'static str,
        incoming: &'static str,
    },

    /// One code mapped to two different glyphs within a logical font
    #[error("Glyph conflict in {key} at code {code}: {existing} vs {incoming}")]
    GlyphConflict {
        key: String,
        code: u32,
        existing: String,
        incoming: String,
    },

    /// A referenced resource could not be found or copied
    #[error("Cannot resolve {category} resource /{name}: {reason}")]
    ResourceResolution {
        name: String,
        category: ResourceCategory,
        reason: String,
    },

    /// The font program codec cannot handle this program format
    #[error("Unsupported font program: {0}")]
    UnsupportedFontProgram(String),

    /// Font error
    #[error("Font error: {0}")]
    Font(String),

    /// General error
    #[error("{0}")]
    General(String),
}

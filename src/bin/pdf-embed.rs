//! PDF Embed CLI tool
//!
//! Places the pages of existing PDFs onto the pages of a new PDF, one or
//! several per sheet, merging fonts and keeping links and tagged structure.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use glob::glob;
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::process;
use tiny_skia_path::{Rect, Transform};

use pdf_embed::pdf::transform::cm_operator;
use pdf_embed::pdf::{
    find_parent_tree_array, FontMode, FormSink, MergeSession, PsFormRegistry, RewriteOptions, Rotation,
    SessionOptions, SourceDocument,
};

/// PDF Embed - Place pages of existing PDFs into a new PDF
#[derive(Parser)]
#[command(name = "pdf-embed")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "EXAMPLES:
    # Combine chapters, keeping one source page per sheet
    pdf-embed embed -o book.pdf \"chapter*.pdf\"

    # Four pages per letter sheet, clipped to each page's crop box
    pdf-embed embed -o handout.pdf --n-up 4 --paper letter --clip slides.pdf

    # Show what a PDF would bring along
    pdf-embed inspect slides.pdf")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Embed the pages of one or more PDFs into a new PDF
    Embed {
        /// Input PDF files (in order). Supports glob patterns like "*.pdf"
        #[arg(required = true)]
        inputs: Vec<String>,

        /// Output PDF file path
        #[arg(short, long)]
        output: PathBuf,

        /// Source pages per destination page
        #[arg(long, default_value_t = 1, value_parser = parse_n_up)]
        n_up: usize,

        /// Destination paper size; defaults to each source page's own size for 1-up
        #[arg(long, value_enum)]
        paper: Option<Paper>,

        /// Clip each page to its crop box
        #[arg(long)]
        clip: bool,

        /// Copy fonts per occurrence instead of merging them
        #[arg(long)]
        no_merge_fonts: bool,

        /// Leave streams uncompressed
        #[arg(long)]
        no_compress: bool,
    },

    /// Show pages, fonts, links and structure of a PDF
    Inspect {
        /// PDF file to inspect
        input: PathBuf,
    },

    /// List the PostScript form resources each page would need
    PsForms {
        /// PDF file to inspect
        input: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Paper {
    Letter,
    A4,
}

impl Paper {
    /// Portrait size in points
    fn size(self) -> [f32; 2] {
        match self {
            Paper::Letter => [612.0, 792.0],
            Paper::A4 => [595.28, 841.89],
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Embed {
            inputs,
            output,
            n_up,
            paper,
            clip,
            no_merge_fonts,
            no_compress,
        } => {
            let fonts = if no_merge_fonts { FontMode::Rekey } else { FontMode::Merge };
            cmd_embed(inputs, &output, n_up, paper, clip, fonts, !no_compress)
        }
        Commands::Inspect { input } => cmd_inspect(&input),
        Commands::PsForms { input } => cmd_ps_forms(&input),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

/// Expand glob patterns in input paths
fn expand_globs(patterns: Vec<String>) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();

    for pattern in patterns {
        if pattern.contains('*') || pattern.contains('?') || pattern.contains('[') {
            let mut matched = false;
            for entry in glob(&pattern).with_context(|| format!("Invalid glob pattern: {}", pattern))? {
                match entry {
                    Ok(path) => {
                        paths.push(path);
                        matched = true;
                    }
                    Err(e) => warn!("glob error for {}: {}", pattern, e),
                }
            }
            if !matched {
                bail!("No files matched pattern: {}", pattern);
            }
        } else {
            paths.push(PathBuf::from(pattern));
        }
    }

    paths.sort();
    Ok(paths)
}

fn parse_n_up(value: &str) -> std::result::Result<usize, String> {
    match value {
        "1" => Ok(1),
        "2" => Ok(2),
        "4" => Ok(4),
        _ => Err(format!("expected 1, 2 or 4, got {}", value)),
    }
}

/// Sheet size and the cells pages are placed into
fn sheet_layout(n_up: usize, paper: [f32; 2]) -> ([f32; 2], Vec<Rect>) {
    let [width, height] = paper;
    let (sheet, columns, rows) = match n_up {
        2 => ([height, width], 2, 1),
        4 => ([width, height], 2, 2),
        _ => ([width, height], 1, 1),
    };
    let cell_width = sheet[0] / columns as f32;
    let cell_height = sheet[1] / rows as f32;

    let mut cells = Vec::new();
    for row in 0..rows {
        for column in 0..columns {
            // First cell top left
            let x = column as f32 * cell_width;
            let y = sheet[1] - (row + 1) as f32 * cell_height;
            if let Some(cell) = Rect::from_xywh(x, y, cell_width, cell_height) {
                cells.push(cell);
            }
        }
    }
    (sheet, cells)
}

/// Width and height of a view box as it appears once rotated
///
/// Unsupported rotations are reported when the page is rewritten.
fn rotated_size(number: u32, rotate: i64, view: [f32; 4]) -> [f32; 2] {
    let (w, h) = (view[2] - view[0], view[3] - view[1]);
    match Rotation::from_degrees(number, rotate) {
        Ok(rotation) if rotation.swaps_axes() => [h, w],
        _ => [w, h],
    }
}

/// Largest rectangle of the given aspect centered in `cell`
fn fit(cell: Rect, width: f32, height: f32) -> Option<Rect> {
    let scale = (cell.width() / width).min(cell.height() / height);
    let (w, h) = (width * scale, height * scale);
    Rect::from_xywh(
        cell.x() + (cell.width() - w) / 2.0,
        cell.y() + (cell.height() - h) / 2.0,
        w,
        h,
    )
}

fn cmd_embed(
    inputs: Vec<String>,
    output: &Path,
    n_up: usize,
    paper: Option<Paper>,
    clip: bool,
    fonts: FontMode,
    compress: bool,
) -> Result<()> {
    let inputs = expand_globs(inputs)?;
    let mut sources = Vec::new();
    for path in &inputs {
        sources.push(SourceDocument::load(path).with_context(|| format!("Cannot open {}", path.display()))?);
    }

    let mut session = MergeSession::new(SessionOptions {
        compress,
        ..Default::default()
    });

    let pages: Vec<(&SourceDocument, u32)> = sources
        .iter()
        .flat_map(|source| source.page_numbers().into_iter().map(move |number| (source, number)))
        .collect();
    info!("Embedding {} pages from {} files, {}-up", pages.len(), sources.len(), n_up);

    let mut skipped = 0;
    for sheet_pages in pages.chunks(n_up) {
        let (sheet, cells) = match (paper, n_up) {
            (None, 1) => {
                let (source, number) = sheet_pages[0];
                let page = source.page(number)?;
                sheet_layout(1, rotated_size(number, page.rotation, page.view_box()))
            }
            (paper, n_up) => sheet_layout(n_up, paper.unwrap_or(Paper::Letter).size()),
        };

        let mut dest_page = session.new_page([0.0, 0.0, sheet[0], sheet[1]]);
        let mut placed = Vec::new();
        for (&(source, number), cell) in sheet_pages.iter().zip(cells) {
            let page = source.page(number)?;
            let view = page.view_box();
            let [w, h] = rotated_size(number, page.rotation, view);

            let options = RewriteOptions {
                fonts,
                clip: if clip { Rect::from_ltrb(view[0], view[1], view[2], view[3]) } else { None },
                target: fit(cell, w, h),
                ..Default::default()
            };
            let mut transform = Transform::identity();
            match session.rewrite_page(source, number, &mut dest_page, &mut transform, options) {
                Ok(rewritten) => {
                    dest_page.push_content(b"q\n");
                    dest_page.push_content(cm_operator(&transform).as_bytes());
                    dest_page.push_content(&rewritten.content);
                    dest_page.push_content(b"Q\n");
                    placed.push((source.key(), number - 1));
                }
                Err(e) => {
                    warn!("Skipping page {} of {}: {}", number, source.key(), e);
                    skipped += 1;
                }
            }
        }

        let id = session.finish_page(dest_page);
        for (key, index) in placed {
            session.assign_page_number(key, index, id)?;
        }
    }

    let mut doc = session.finish()?;
    doc.save(output)
        .with_context(|| format!("Cannot write {}", output.display()))?;

    if skipped > 0 {
        warn!("{} pages could not be embedded", skipped);
    }
    info!("Output: {}", output.display());
    Ok(())
}

/// Show information about a PDF
fn cmd_inspect(input: &Path) -> Result<()> {
    let source = SourceDocument::load(input)?;
    println!("File: {}", input.display());
    println!("Pages: {}", source.page_count());

    for number in source.page_numbers() {
        let page = source.page(number)?;
        let view = page.view_box();
        let parents = find_parent_tree_array(&source, &page)?;
        println!(
            "  Page {}: {} x {} pt, rotate {}, {} links, {} marked-content slots",
            number,
            view[2] - view[0],
            view[3] - view[1],
            page.rotation,
            page.annots.len(),
            parents.len()
        );
    }

    // Fonts as they would be merged
    let mut session = MergeSession::new(SessionOptions::default());
    for number in source.page_numbers() {
        let mut dest_page = session.new_page([0.0, 0.0, 612.0, 792.0]);
        let mut transform = Transform::identity();
        if let Err(e) = session.rewrite_page(&source, number, &mut dest_page, &mut transform, RewriteOptions::default()) {
            warn!("Page {}: {}", number, e);
        }
    }
    println!("Logical fonts: {}", session.fonts().len());
    for key in session.fonts().keys() {
        let first = session.fonts().first_char(key).unwrap_or(0);
        let last = session.fonts().last_char(key).unwrap_or(0);
        println!("  {} ({}..={})", key, first, last);
    }

    Ok(())
}

/// List PostScript form resources per page
fn cmd_ps_forms(input: &Path) -> Result<()> {
    let source = SourceDocument::load(input)?;
    let mut session = MergeSession::new(SessionOptions::default());
    let mut registry = PsFormRegistry::new();

    for number in source.page_numbers() {
        let mut dest_page = session.new_page([0.0, 0.0, 612.0, 792.0]);
        let mut transform = Transform::identity();
        let options = RewriteOptions {
            fonts: FontMode::Rekey,
            forms: Some(&mut registry as &mut dyn FormSink),
            ..Default::default()
        };
        session.rewrite_page(&source, number, &mut dest_page, &mut transform, options)?;
    }

    print!("{}", registry.include_directives());
    Ok(())
}

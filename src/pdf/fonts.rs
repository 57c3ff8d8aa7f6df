//! Logical fonts and the font registry
//!
//! Subset fonts from different source pages that are "the same" font are
//! merged under one caller-chosen key into one destination font: the encodings
//! and widths are unioned and the embedded programs are combined through a
//! [`FontProgramCodec`].

use std::collections::{BTreeMap, BTreeSet};
use log::{debug, warn};
use lopdf::{Dictionary, Document, Object, ObjectId, Stream, StringFormat};
use crate::error::{Error, Result};
use crate::pdf::codec::{FontProgramCodec, GlyphRef};
use crate::pdf::source::{as_number, SourceDocument};

/// Embedded font program formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FontFormat {
    /// `FontFile`
    Type1,
    /// `FontFile2`
    TrueType,
    /// `FontFile3` with `/Subtype /Type1C`
    Type1C,
    /// `FontFile3` with `/Subtype /CIDFontType0C`
    CidType0C,
    /// `FontFile3` with `/Subtype /OpenType`
    OpenType,
}

impl FontFormat {
    fn descriptor_key(self) -> &'static str {
        match self {
            FontFormat::Type1 => "FontFile",
            FontFormat::TrueType => "FontFile2",
            _ => "FontFile3",
        }
    }

    fn file3_subtype(self) -> Option<&'static str> {
        match self {
            FontFormat::Type1C => Some("Type1C"),
            FontFormat::CidType0C => Some("CIDFontType0C"),
            FontFormat::OpenType => Some("OpenType"),
            _ => None,
        }
    }
}

/// An embedded font program
#[derive(Debug, Clone)]
pub struct FontProgram {
    pub format: FontFormat,
    /// Decoded program bytes
    pub bytes: Vec<u8>,
    /// `Length1`..`Length3` of Type1 programs
    lengths: Vec<(String, i64)>,
}

impl FontProgram {
    pub fn new(format: FontFormat, bytes: Vec<u8>) -> Self {
        Self {
            format,
            bytes,
            lengths: Vec::new(),
        }
    }

    fn to_stream(&self) -> Stream {
        let mut dict = Dictionary::new();
        match self.format {
            FontFormat::Type1 => {
                for (key, value) in &self.lengths {
                    dict.set(key.as_str(), Object::Integer(*value));
                }
            }
            FontFormat::TrueType => dict.set("Length1", Object::Integer(self.bytes.len() as i64)),
            _ => {}
        }
        if let Some(subtype) = self.format.file3_subtype() {
            dict.set("Subtype", Object::Name(subtype.as_bytes().to_vec()));
        }
        Stream::new(dict, self.bytes.clone())
    }
}

/// Single-byte font: code -> glyph name, widths by code
#[derive(Debug, Clone)]
pub struct SimpleFont {
    base_font: String,
    subtype: String,
    base_encoding: Option<String>,
    encoding: BTreeMap<u8, String>,
    widths: BTreeMap<u8, f32>,
    /// Code -> glyph index, only for TrueType programs
    glyph_ids: BTreeMap<u8, u16>,
    to_unicode: BTreeMap<u32, String>,
    first_char: u8,
    last_char: u8,
    symbolic: bool,
    embeddable: bool,
    descriptor: Dictionary,
    program: Option<FontProgram>,
}

impl SimpleFont {
    /// Glyph name for every code this font uses
    pub fn encoding(&self) -> &BTreeMap<u8, String> {
        &self.encoding
    }

    pub fn glyph_ids(&self) -> &BTreeMap<u8, u16> {
        &self.glyph_ids
    }
}

/// CID-keyed font
#[derive(Debug, Clone)]
pub struct CompositeFont {
    base_font: String,
    cid_subtype: String,
    encoding: String,
    system_info: Dictionary,
    cid_to_gid: BTreeMap<u32, u16>,
    widths: BTreeMap<u32, f32>,
    default_width: f32,
    to_unicode: BTreeMap<u32, String>,
    symbolic: bool,
    embeddable: bool,
    descriptor: Dictionary,
    program: Option<FontProgram>,
}

impl CompositeFont {
    pub fn cid_to_gid(&self) -> &BTreeMap<u32, u16> {
        &self.cid_to_gid
    }

    fn cids(&self) -> BTreeSet<u32> {
        self.cid_to_gid.keys().chain(self.widths.keys()).copied().collect()
    }
}

/// A destination font accumulated from one or more source fonts
#[derive(Debug, Clone)]
pub enum LogicalFont {
    Simple(SimpleFont),
    Composite(CompositeFont),
}

impl LogicalFont {
    /// Read a source font dictionary
    pub fn parse(source: &SourceDocument, font: &Dictionary) -> Result<Self> {
        match name_of(source, font, b"Subtype").as_deref() {
            Some("Type0") => Ok(LogicalFont::Composite(parse_composite(source, font)?)),
            Some("Type3") => Err(Error::UnsupportedFontProgram("Type3 fonts".to_string())),
            _ => Ok(LogicalFont::Simple(parse_simple(source, font)?)),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            LogicalFont::Simple(_) => "simple",
            LogicalFont::Composite(_) => "composite",
        }
    }

    pub fn base_font(&self) -> &str {
        match self {
            LogicalFont::Simple(font) => &font.base_font,
            LogicalFont::Composite(font) => &font.base_font,
        }
    }

    /// Code (simple fonts) or glyph index (composite fonts) for a character, 0 when unmapped
    pub fn map_char(&self, c: char) -> u32 {
        let text = c.to_string();
        match self {
            LogicalFont::Simple(font) => {
                let by_unicode = font
                    .to_unicode
                    .iter()
                    .find(|(code, unicode)| **unicode == text && **code <= 255 && font.encoding.contains_key(&(**code as u8)))
                    .map(|(code, _)| *code);
                let name = glyph_name_for_char(c);
                by_unicode
                    .or_else(|| {
                        font.encoding
                            .iter()
                            .find(|(_, glyph)| **glyph == name)
                            .map(|(code, _)| *code as u32)
                    })
                    .unwrap_or(0)
            }
            LogicalFont::Composite(font) => font
                .to_unicode
                .iter()
                .find(|(_, unicode)| **unicode == text)
                .and_then(|(cid, _)| font.cid_to_gid.get(cid))
                .map(|gid| *gid as u32)
                .unwrap_or(0),
        }
    }

    pub fn first_char(&self) -> u32 {
        match self {
            LogicalFont::Simple(font) => font.first_char as u32,
            LogicalFont::Composite(font) => font.cids().iter().next().copied().unwrap_or(0),
        }
    }

    pub fn last_char(&self) -> u32 {
        match self {
            LogicalFont::Simple(font) => font.last_char as u32,
            LogicalFont::Composite(font) => font.cids().iter().next_back().copied().unwrap_or(0),
        }
    }

    /// Widths from `first_char` to `last_char`, gaps filled with 0 (simple) or the default width
    pub fn widths(&self) -> Vec<f32> {
        let (first, last) = (self.first_char(), self.last_char());
        if last < first {
            return Vec::new();
        }
        match self {
            LogicalFont::Simple(font) => (first..=last)
                .map(|code| font.widths.get(&(code as u8)).copied().unwrap_or(0.0))
                .collect(),
            LogicalFont::Composite(font) => {
                if font.cids().is_empty() {
                    return Vec::new();
                }
                (first..=last)
                    .map(|cid| font.widths.get(&cid).copied().unwrap_or(font.default_width))
                    .collect()
            }
        }
    }

    pub fn is_symbolic(&self) -> bool {
        match self {
            LogicalFont::Simple(font) => font.symbolic,
            LogicalFont::Composite(font) => font.symbolic,
        }
    }

    pub fn is_embeddable(&self) -> bool {
        match self {
            LogicalFont::Simple(font) => font.embeddable,
            LogicalFont::Composite(font) => font.embeddable,
        }
    }

    pub fn program(&self) -> Option<&FontProgram> {
        match self {
            LogicalFont::Simple(font) => font.program.as_ref(),
            LogicalFont::Composite(font) => font.program.as_ref(),
        }
    }

    /// Number of codes or CIDs in use
    pub fn glyph_count(&self) -> usize {
        match self {
            LogicalFont::Simple(font) => font.encoding.len(),
            LogicalFont::Composite(font) => font.cids().len(),
        }
    }
}

/// Key under which occurrences of one font are merged
///
/// The subset tag (`ABCDEF+`) is stripped so that subsets of one face share a key.
/// Returns `None` for fonts without a `BaseFont`.
pub fn logical_font_key(source: &SourceDocument, font: &Dictionary) -> Option<String> {
    let base_font = name_of(source, font, b"BaseFont")?;
    let subtype = name_of(source, font, b"Subtype").unwrap_or_else(|| "Type1".to_string());
    let mut key = format!("{}_{}", strip_subset_tag(&base_font), subtype);

    let base_encoding = match font.get(b"Encoding").ok().and_then(|e| source.resolve(e).ok()) {
        Some(Object::Name(name)) => Some(String::from_utf8_lossy(name).into_owned()),
        Some(Object::Dictionary(dict)) => name_of(source, dict, b"BaseEncoding"),
        _ => None,
    };
    if let Some(encoding) = base_encoding {
        key.push('_');
        key.push_str(&encoding);
    }
    Some(key)
}

fn strip_subset_tag(name: &str) -> &str {
    match name.split_once('+') {
        Some((tag, rest)) if tag.len() == 6 && tag.bytes().all(|b| b.is_ascii_uppercase()) => rest,
        _ => name,
    }
}

struct RegisteredFont {
    name: String,
    id: ObjectId,
    font: LogicalFont,
}

/// Destination fonts of one merge session, by logical font key
#[derive(Default)]
pub struct FontRegistry {
    fonts: BTreeMap<String, RegisteredFont>,
    created: Vec<String>,
}

impl FontRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Contribute a source font dictionary to the logical font `key`
    ///
    /// Returns the destination resource name when the font was created or grew,
    /// `None` when the source font was already fully covered.
    pub fn add_font(
        &mut self,
        key: &str,
        source: &SourceDocument,
        font: &Dictionary,
        dest: &mut Document,
        codec: &dyn FontProgramCodec,
    ) -> Result<Option<String>> {
        let incoming = LogicalFont::parse(source, font)?;
        self.add_logical(key, incoming, dest, codec)
    }

    /// Contribute an already parsed font
    pub fn add_logical(
        &mut self,
        key: &str,
        incoming: LogicalFont,
        dest: &mut Document,
        codec: &dyn FontProgramCodec,
    ) -> Result<Option<String>> {
        let Some(existing) = self.fonts.get(key) else {
            let font = prepare_initial(incoming, codec)?;
            let name = resource_name_for(key);
            let id = dest.new_object_id();
            debug!("New logical font {} ({}, {} glyphs) as {}", key, font.kind(), font.glyph_count(), name);
            self.fonts.insert(key.to_string(), RegisteredFont { name: name.clone(), id, font });
            self.created.push(key.to_string());
            return Ok(Some(name));
        };

        let merged = match (&existing.font, incoming) {
            (LogicalFont::Simple(current), LogicalFont::Simple(incoming)) => {
                merge_simple(key, current, incoming, codec)?.map(LogicalFont::Simple)
            }
            (LogicalFont::Composite(current), LogicalFont::Composite(incoming)) => {
                merge_composite(key, current, incoming, codec)?.map(LogicalFont::Composite)
            }
            (current, incoming) => {
                return Err(Error::FontKindConflict {
                    key: key.to_string(),
                    existing: current.kind(),
                    incoming: incoming.kind(),
                })
            }
        };

        match merged {
            Some(font) => {
                debug!("Logical font {} grew to {} glyphs", key, font.glyph_count());
                let entry = self.fonts.get_mut(key).ok_or_else(|| Error::Font(format!("Font {} vanished", key)))?;
                entry.font = font;
                Ok(Some(entry.name.clone()))
            }
            None => Ok(None),
        }
    }

    pub fn get(&self, key: &str) -> Option<&LogicalFont> {
        self.fonts.get(key).map(|entry| &entry.font)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fonts.contains_key(key)
    }

    /// Destination resource name of a logical font
    pub fn resource_name(&self, key: &str) -> Option<&str> {
        self.fonts.get(key).map(|entry| entry.name.as_str())
    }

    /// Destination object reserved for a logical font
    pub fn object_id(&self, key: &str) -> Option<ObjectId> {
        self.fonts.get(key).map(|entry| entry.id)
    }

    /// Code or glyph index for `c`, 0 if the font or the character is unknown
    pub fn map_char(&self, key: &str, c: char) -> u32 {
        self.get(key).map(|font| font.map_char(c)).unwrap_or(0)
    }

    pub fn widths(&self, key: &str) -> Vec<f32> {
        self.get(key).map(LogicalFont::widths).unwrap_or_default()
    }

    pub fn first_char(&self, key: &str) -> Option<u32> {
        self.get(key).map(LogicalFont::first_char)
    }

    pub fn last_char(&self, key: &str) -> Option<u32> {
        self.get(key).map(LogicalFont::last_char)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fonts.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fonts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fonts.is_empty()
    }

    pub(crate) fn checkpoint(&self) -> usize {
        self.created.len()
    }

    /// Drop fonts created since `checkpoint`
    pub(crate) fn rollback(&mut self, checkpoint: usize) {
        for key in self.created.drain(checkpoint..) {
            self.fonts.remove(&key);
        }
    }

    /// Write every logical font into its reserved destination object
    pub fn finish(&self, doc: &mut Document) -> Result<()> {
        for (key, entry) in &self.fonts {
            let font = match &entry.font {
                LogicalFont::Simple(font) => write_simple(doc, font),
                LogicalFont::Composite(font) => write_composite(doc, font),
            };
            debug!("Writing font {} as object {}", key, entry.id.0);
            doc.objects.insert(entry.id, Object::Dictionary(font));
        }
        Ok(())
    }
}

/// Resource names may only use regular characters
fn resource_name_for(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn prepare_initial(font: LogicalFont, codec: &dyn FontProgramCodec) -> Result<LogicalFont> {
    match font {
        LogicalFont::Simple(mut simple) => {
            if let Some(program) = simple.program.as_ref().filter(|p| p.format == FontFormat::TrueType) {
                for (code, name) in &simple.encoding {
                    let gid = match codec.lookup(program.format, &program.bytes, GlyphRef::Code(*code))? {
                        Some(gid) => Some(gid),
                        None => codec.lookup(program.format, &program.bytes, GlyphRef::Name(name))?,
                    };
                    if let Some(gid) = gid {
                        simple.glyph_ids.insert(*code, gid);
                    }
                }
            }
            Ok(LogicalFont::Simple(simple))
        }
        composite => Ok(composite),
    }
}

fn merge_simple(
    key: &str,
    existing: &SimpleFont,
    incoming: SimpleFont,
    codec: &dyn FontProgramCodec,
) -> Result<Option<SimpleFont>> {
    let mut new_codes = Vec::new();
    for (code, name) in &incoming.encoding {
        match existing.encoding.get(code) {
            Some(current) if current != name => {
                return Err(Error::GlyphConflict {
                    key: key.to_string(),
                    code: *code as u32,
                    existing: current.clone(),
                    incoming: name.clone(),
                })
            }
            Some(_) => {}
            None => new_codes.push(*code),
        }
    }

    if new_codes.is_empty() {
        return Ok(None);
    }

    let mut merged = existing.clone();
    if let (Some(base), Some(addition)) = (&existing.program, &incoming.program) {
        if base.format != addition.format {
            return Err(Error::UnsupportedFontProgram(format!(
                "cannot merge a {:?} program into {:?}",
                addition.format, base.format
            )));
        }
        let format = base.format;

        let mut wanted: Vec<u16> = Vec::new();
        let mut pending: Vec<(u8, u16)> = Vec::new();
        for code in &new_codes {
            let name = &incoming.encoding[code];
            if let Some(gid) = codec.lookup(format, &base.bytes, GlyphRef::Name(name))? {
                merged.glyph_ids.insert(*code, gid);
                continue;
            }

            let gid = match incoming.glyph_ids.get(code) {
                Some(gid) => Some(*gid),
                None => codec.lookup(format, &addition.bytes, GlyphRef::Name(name))?,
            };
            match gid {
                Some(gid) => {
                    pending.push((*code, gid));
                    if !wanted.contains(&gid) {
                        wanted.push(gid);
                    }
                }
                None => warn!("Glyph {} for code {} not found in the program of {}", name, code, key),
            }
        }

        let mut bytes = base.bytes.clone();
        if !wanted.is_empty() {
            let appended = codec.append_glyphs(format, &base.bytes, &addition.bytes, &wanted)?;
            bytes = appended.program;
            for (code, gid) in pending {
                if let Some(new_gid) = appended.remap.get(&gid) {
                    merged.glyph_ids.insert(code, *new_gid);
                }
            }
        }
        if format == FontFormat::TrueType && !merged.glyph_ids.is_empty() {
            bytes = codec.set_code_map(format, &bytes, &merged.glyph_ids)?;
        }

        merged.program = Some(FontProgram {
            bytes,
            ..base.clone()
        });
    }

    for code in &new_codes {
        merged.encoding.insert(*code, incoming.encoding[code].clone());
        if let Some(width) = incoming.widths.get(code) {
            merged.widths.insert(*code, *width);
        }
        if let Some(unicode) = incoming.to_unicode.get(&(*code as u32)) {
            merged.to_unicode.insert(*code as u32, unicode.clone());
        }
    }
    merged.first_char = merged.first_char.min(incoming.first_char);
    merged.last_char = merged.last_char.max(incoming.last_char);

    Ok(Some(merged))
}

fn merge_composite(
    key: &str,
    existing: &CompositeFont,
    incoming: CompositeFont,
    codec: &dyn FontProgramCodec,
) -> Result<Option<CompositeFont>> {
    let existing_cids = existing.cids();
    let mut new_cids = Vec::new();
    for cid in incoming.cids() {
        if existing_cids.contains(&cid) {
            if let (Some(current), Some(other)) = (existing.to_unicode.get(&cid), incoming.to_unicode.get(&cid)) {
                if current != other {
                    return Err(Error::GlyphConflict {
                        key: key.to_string(),
                        code: cid,
                        existing: current.clone(),
                        incoming: other.clone(),
                    });
                }
            }
        } else {
            new_cids.push(cid);
        }
    }

    if new_cids.is_empty() {
        return Ok(None);
    }

    let mut merged = existing.clone();
    let mut glyphs: BTreeMap<u32, u16> = new_cids
        .iter()
        .map(|cid| (*cid, incoming.cid_to_gid.get(cid).copied().unwrap_or_else(|| u16::try_from(*cid).unwrap_or(0))))
        .collect();

    if let (Some(base), Some(addition)) = (&existing.program, &incoming.program) {
        if base.format != addition.format {
            return Err(Error::UnsupportedFontProgram(format!(
                "cannot merge a {:?} program into {:?}",
                addition.format, base.format
            )));
        }

        let mut wanted: Vec<u16> = glyphs.values().copied().filter(|gid| *gid != 0).collect();
        wanted.sort_unstable();
        wanted.dedup();

        if !wanted.is_empty() {
            let appended = codec.append_glyphs(base.format, &base.bytes, &addition.bytes, &wanted)?;
            for gid in glyphs.values_mut() {
                *gid = appended.remap.get(gid).copied().unwrap_or(0);
            }
            merged.program = Some(FontProgram {
                bytes: appended.program,
                ..base.clone()
            });
        }
    }

    for cid in new_cids {
        if let Some(gid) = glyphs.remove(&cid) {
            merged.cid_to_gid.insert(cid, gid);
        }
        if let Some(width) = incoming.widths.get(&cid) {
            merged.widths.insert(cid, *width);
        }
        if let Some(unicode) = incoming.to_unicode.get(&cid) {
            merged.to_unicode.insert(cid, unicode.clone());
        }
    }

    Ok(Some(merged))
}

fn parse_simple(source: &SourceDocument, font: &Dictionary) -> Result<SimpleFont> {
    let subtype = name_of(source, font, b"Subtype").unwrap_or_else(|| "Type1".to_string());
    let base_font = name_of(source, font, b"BaseFont")
        .map(|name| strip_subset_tag(&name).to_string())
        .unwrap_or_default();

    let declared_first = integer_of(source, font, b"FirstChar").unwrap_or(0).clamp(0, 255) as u8;
    let width_values = array_of(source, font, b"Widths");
    let declared_last = integer_of(source, font, b"LastChar")
        .unwrap_or(declared_first as i64 + width_values.len() as i64 - 1)
        .clamp(declared_first as i64, 255) as u8;

    let mut widths = BTreeMap::new();
    for (index, value) in width_values.iter().enumerate() {
        let code = declared_first as usize + index;
        if code > 255 {
            break;
        }
        if let Some(width) = source.resolve(value).ok().and_then(as_number) {
            if width > 0.0 {
                widths.insert(code as u8, width);
            }
        }
    }

    let (base_encoding, differences) = match font.get(b"Encoding").ok().and_then(|e| source.resolve(e).ok()) {
        Some(Object::Name(name)) => (Some(String::from_utf8_lossy(name).into_owned()), BTreeMap::new()),
        Some(Object::Dictionary(dict)) => (name_of(source, dict, b"BaseEncoding"), parse_differences(source, dict)),
        _ => (None, BTreeMap::new()),
    };

    let descriptor = font
        .get(b"FontDescriptor")
        .ok()
        .and_then(|d| source.resolve_dict(d))
        .cloned()
        .unwrap_or_else(Dictionary::new);
    let flags = integer_of(source, &descriptor, b"Flags").unwrap_or(0);
    let program = read_program(source, &descriptor);

    let to_unicode = font
        .get(b"ToUnicode")
        .ok()
        .and_then(|t| stream_content(source, t))
        .map(|cmap| parse_to_unicode(&cmap))
        .unwrap_or_default();

    let codes: BTreeSet<u8> = widths.keys().chain(differences.keys()).copied().collect();
    let encoding = codes
        .into_iter()
        .map(|code| {
            let name = differences
                .get(&code)
                .cloned()
                .or_else(|| standard_glyph_name(code, base_encoding.as_deref()))
                .unwrap_or_else(|| format!("g{}", code));
            (code, name)
        })
        .collect::<BTreeMap<_, _>>();

    let first_char = encoding.keys().next().copied().map_or(declared_first, |c| c.min(declared_first));
    let last_char = encoding.keys().next_back().copied().map_or(declared_last, |c| c.max(declared_last));

    Ok(SimpleFont {
        base_font,
        subtype,
        base_encoding,
        encoding,
        widths,
        glyph_ids: BTreeMap::new(),
        to_unicode,
        first_char,
        last_char,
        symbolic: flags & 4 != 0,
        embeddable: program.is_some(),
        descriptor: direct_descriptor(&descriptor),
        program,
    })
}

fn parse_differences(source: &SourceDocument, encoding: &Dictionary) -> BTreeMap<u8, String> {
    let mut differences = BTreeMap::new();
    let mut code: Option<i64> = None;
    for item in array_of(source, encoding, b"Differences") {
        match source.resolve(&item) {
            Ok(Object::Integer(start)) => code = Some(*start),
            Ok(Object::Name(name)) => {
                if let Some(current) = code {
                    if (0..=255).contains(&current) {
                        differences.insert(current as u8, String::from_utf8_lossy(name).into_owned());
                    }
                    code = Some(current + 1);
                }
            }
            _ => {}
        }
    }
    differences
}

fn parse_composite(source: &SourceDocument, font: &Dictionary) -> Result<CompositeFont> {
    let base_font = name_of(source, font, b"BaseFont")
        .map(|name| strip_subset_tag(&name).to_string())
        .unwrap_or_default();
    let encoding = match font.get(b"Encoding").ok().and_then(|e| source.resolve(e).ok()) {
        Some(Object::Name(name)) => String::from_utf8_lossy(name).into_owned(),
        _ => return Err(Error::UnsupportedFontProgram("embedded CMap encodings".to_string())),
    };

    let descendant = array_of(source, font, b"DescendantFonts")
        .first()
        .and_then(|d| source.resolve_dict(d))
        .cloned()
        .ok_or_else(|| Error::Font(format!("Type0 font {} has no descendant font", base_font)))?;

    let cid_subtype = name_of(source, &descendant, b"Subtype").unwrap_or_else(|| "CIDFontType2".to_string());
    let system_info = descendant
        .get(b"CIDSystemInfo")
        .ok()
        .and_then(|info| source.resolve_dict(info))
        .cloned()
        .unwrap_or_else(Dictionary::new);
    let default_width = descendant
        .get(b"DW")
        .ok()
        .and_then(|dw| source.resolve(dw).ok())
        .and_then(as_number)
        .unwrap_or(1000.0);
    let widths = parse_cid_widths(source, &array_of(source, &descendant, b"W"));

    let to_unicode = font
        .get(b"ToUnicode")
        .ok()
        .and_then(|t| stream_content(source, t))
        .map(|cmap| parse_to_unicode(&cmap))
        .unwrap_or_default();

    let explicit_map = descendant
        .get(b"CIDToGIDMap")
        .ok()
        .and_then(|m| stream_content(source, m));
    let cids: BTreeSet<u32> = widths.keys().chain(to_unicode.keys()).copied().collect();
    let cid_to_gid = cids
        .into_iter()
        .map(|cid| {
            let gid = match &explicit_map {
                Some(map) => {
                    let offset = cid as usize * 2;
                    map.get(offset..offset + 2)
                        .map(|b| u16::from_be_bytes([b[0], b[1]]))
                        .unwrap_or(0)
                }
                None => u16::try_from(cid).unwrap_or(0),
            };
            (cid, gid)
        })
        .collect();

    let descriptor = descendant
        .get(b"FontDescriptor")
        .ok()
        .and_then(|d| source.resolve_dict(d))
        .cloned()
        .unwrap_or_else(Dictionary::new);
    let flags = integer_of(source, &descriptor, b"Flags").unwrap_or(0);
    let program = read_program(source, &descriptor);

    Ok(CompositeFont {
        base_font,
        cid_subtype,
        encoding,
        system_info: direct_descriptor(&system_info),
        cid_to_gid,
        widths,
        default_width,
        to_unicode,
        symbolic: flags & 4 != 0,
        embeddable: program.is_some(),
        descriptor: direct_descriptor(&descriptor),
        program,
    })
}

/// `W` array: `c [w1 w2 ...]` and `c_first c_last w` runs
fn parse_cid_widths(source: &SourceDocument, items: &[Object]) -> BTreeMap<u32, f32> {
    let mut widths = BTreeMap::new();
    let values: Vec<&Object> = items.iter().filter_map(|item| source.resolve(item).ok()).collect();

    let mut index = 0;
    while index + 1 < values.len() {
        let Some(first) = as_number(values[index]) else {
            index += 1;
            continue;
        };
        match values[index + 1] {
            Object::Array(run) => {
                if let Some(first) = cid_of(first) {
                    for (cid, width) in (first..=MAX_CID).zip(run) {
                        if let Some(width) = source.resolve(width).ok().and_then(as_number) {
                            widths.insert(cid, width);
                        }
                    }
                }
                index += 2;
            }
            last => {
                let last = as_number(last).and_then(|last| cid_of(last.min(MAX_CID as f32)));
                let width = values.get(index + 2).and_then(|w| as_number(w));
                if let (Some(first), Some(last), Some(width)) = (cid_of(first), last, width) {
                    for cid in first..=last {
                        widths.insert(cid, width);
                    }
                }
                index += 3;
            }
        }
    }
    widths
}

/// Largest CID a two-byte encoding can address
const MAX_CID: u32 = 0xFFFF;

fn cid_of(value: f32) -> Option<u32> {
    (0.0..=MAX_CID as f32).contains(&value).then_some(value as u32)
}

fn read_program(source: &SourceDocument, descriptor: &Dictionary) -> Option<FontProgram> {
    for key in [b"FontFile".as_slice(), b"FontFile2".as_slice(), b"FontFile3".as_slice()] {
        let Ok(reference) = descriptor.get(key) else {
            continue;
        };
        let Ok(Object::Stream(stream)) = source.resolve(reference) else {
            continue;
        };

        let format = match key {
            b"FontFile" => FontFormat::Type1,
            b"FontFile2" => FontFormat::TrueType,
            _ => match name_of(source, &stream.dict, b"Subtype").as_deref() {
                Some("Type1C") => FontFormat::Type1C,
                Some("CIDFontType0C") => FontFormat::CidType0C,
                Some("OpenType") => FontFormat::OpenType,
                other => {
                    warn!("Unknown FontFile3 subtype {:?}", other);
                    return None;
                }
            },
        };

        let bytes = match stream.decompressed_content() {
            Ok(bytes) => bytes,
            Err(_) if !stream.dict.has(b"Filter") => stream.content.clone(),
            Err(e) => {
                warn!("Cannot decode embedded font program: {}", e);
                return None;
            }
        };

        let lengths = ["Length1", "Length2", "Length3"]
            .iter()
            .filter_map(|k| integer_of(source, &stream.dict, k.as_bytes()).map(|v| (k.to_string(), v)))
            .collect();

        return Some(FontProgram { format, bytes, lengths });
    }
    None
}

/// Descriptor entries that can be carried over as-is
fn direct_descriptor(descriptor: &Dictionary) -> Dictionary {
    let mut direct = Dictionary::new();
    for (key, value) in descriptor.iter() {
        if key.starts_with(b"FontFile") || matches!(value, Object::Reference(_) | Object::Stream(_)) {
            continue;
        }
        direct.set(key.clone(), value.clone());
    }
    direct
}

fn write_simple(doc: &mut Document, font: &SimpleFont) -> Dictionary {
    let mut dict = Dictionary::new();
    dict.set("Type", Object::Name(b"Font".to_vec()));
    dict.set("Subtype", Object::Name(font.subtype.as_bytes().to_vec()));
    dict.set("BaseFont", Object::Name(font.base_font.as_bytes().to_vec()));
    dict.set("FirstChar", Object::Integer(font.first_char as i64));
    dict.set("LastChar", Object::Integer(font.last_char as i64));
    dict.set(
        "Widths",
        Object::Array(
            (font.first_char..=font.last_char)
                .map(|code| number(font.widths.get(&code).copied().unwrap_or(0.0)))
                .collect(),
        ),
    );

    // Symbolic TrueType fonts select glyphs through their own cmap
    let symbolic_truetype = font.subtype == "TrueType" && font.symbolic;
    if !symbolic_truetype {
        let mut encoding = Dictionary::new();
        encoding.set("Type", Object::Name(b"Encoding".to_vec()));
        if let Some(base) = &font.base_encoding {
            encoding.set("BaseEncoding", Object::Name(base.as_bytes().to_vec()));
        }
        encoding.set("Differences", Object::Array(differences_array(&font.encoding)));
        dict.set("Encoding", Object::Dictionary(encoding));
    } else if let Some(base) = &font.base_encoding {
        dict.set("Encoding", Object::Name(base.as_bytes().to_vec()));
    }

    if !font.descriptor.is_empty() || font.program.is_some() {
        let id = write_descriptor(doc, &font.descriptor, &font.base_font, font.program.as_ref());
        dict.set("FontDescriptor", Object::Reference(id));
    }

    if !font.to_unicode.is_empty() {
        let cmap = to_unicode_cmap(&font.to_unicode, 1);
        let id = doc.add_object(Stream::new(Dictionary::new(), cmap.into_bytes()));
        dict.set("ToUnicode", Object::Reference(id));
    }

    dict
}

fn write_composite(doc: &mut Document, font: &CompositeFont) -> Dictionary {
    let mut cid_font = Dictionary::new();
    cid_font.set("Type", Object::Name(b"Font".to_vec()));
    cid_font.set("Subtype", Object::Name(font.cid_subtype.as_bytes().to_vec()));
    cid_font.set("BaseFont", Object::Name(font.base_font.as_bytes().to_vec()));

    let system_info = if font.system_info.is_empty() {
        let mut info = Dictionary::new();
        info.set("Registry", Object::String(b"Adobe".to_vec(), StringFormat::Literal));
        info.set("Ordering", Object::String(b"Identity".to_vec(), StringFormat::Literal));
        info.set("Supplement", Object::Integer(0));
        info
    } else {
        font.system_info.clone()
    };
    cid_font.set("CIDSystemInfo", Object::Dictionary(system_info));
    cid_font.set("DW", number(font.default_width));
    cid_font.set("W", Object::Array(cid_widths_array(&font.widths)));

    if font.cid_subtype == "CIDFontType2" {
        if font.cid_to_gid.iter().all(|(cid, gid)| *cid == *gid as u32) {
            cid_font.set("CIDToGIDMap", Object::Name(b"Identity".to_vec()));
        } else {
            let len = font.cid_to_gid.keys().next_back().map_or(0, |max| *max as usize + 1);
            let mut map = vec![0u8; len * 2];
            for (cid, gid) in &font.cid_to_gid {
                let offset = *cid as usize * 2;
                map[offset..offset + 2].copy_from_slice(&gid.to_be_bytes());
            }
            let id = doc.add_object(Stream::new(Dictionary::new(), map));
            cid_font.set("CIDToGIDMap", Object::Reference(id));
        }
    }

    let descriptor_id = write_descriptor(doc, &font.descriptor, &font.base_font, font.program.as_ref());
    cid_font.set("FontDescriptor", Object::Reference(descriptor_id));
    let cid_font_id = doc.add_object(Object::Dictionary(cid_font));

    let mut dict = Dictionary::new();
    dict.set("Type", Object::Name(b"Font".to_vec()));
    dict.set("Subtype", Object::Name(b"Type0".to_vec()));
    dict.set("BaseFont", Object::Name(font.base_font.as_bytes().to_vec()));
    dict.set("Encoding", Object::Name(font.encoding.as_bytes().to_vec()));
    dict.set("DescendantFonts", Object::Array(vec![Object::Reference(cid_font_id)]));

    if !font.to_unicode.is_empty() {
        let cmap = to_unicode_cmap(&font.to_unicode, 2);
        let id = doc.add_object(Stream::new(Dictionary::new(), cmap.into_bytes()));
        dict.set("ToUnicode", Object::Reference(id));
    }

    dict
}

fn write_descriptor(
    doc: &mut Document,
    descriptor: &Dictionary,
    base_font: &str,
    program: Option<&FontProgram>,
) -> ObjectId {
    let mut descriptor = descriptor.clone();
    descriptor.set("Type", Object::Name(b"FontDescriptor".to_vec()));
    descriptor.set("FontName", Object::Name(base_font.as_bytes().to_vec()));
    if let Some(program) = program {
        let stream_id = doc.add_object(program.to_stream());
        descriptor.set(program.format.descriptor_key(), Object::Reference(stream_id));
    }
    doc.add_object(Object::Dictionary(descriptor))
}

/// `[c1 /name1 /name2 c5 /name5 ...]`, one run per block of consecutive codes
fn differences_array(encoding: &BTreeMap<u8, String>) -> Vec<Object> {
    let mut items = Vec::new();
    let mut previous: Option<u8> = None;
    for (code, name) in encoding {
        if previous.map_or(true, |p| p as u16 + 1 != *code as u16) {
            items.push(Object::Integer(*code as i64));
        }
        items.push(Object::Name(name.as_bytes().to_vec()));
        previous = Some(*code);
    }
    items
}

/// `[c [w1 w2 ...] ...]`, one run per block of consecutive CIDs
fn cid_widths_array(widths: &BTreeMap<u32, f32>) -> Vec<Object> {
    let mut items = Vec::new();
    let mut run: Vec<Object> = Vec::new();
    let mut run_start = 0u32;
    let mut previous: Option<u32> = None;

    for (cid, width) in widths {
        if previous.map_or(false, |p| p + 1 != *cid) {
            items.push(Object::Integer(run_start as i64));
            items.push(Object::Array(std::mem::take(&mut run)));
        }
        if run.is_empty() {
            run_start = *cid;
        }
        run.push(number(*width));
        previous = Some(*cid);
    }
    if !run.is_empty() {
        items.push(Object::Integer(run_start as i64));
        items.push(Object::Array(run));
    }
    items
}

fn number(value: f32) -> Object {
    if value.fract() == 0.0 {
        Object::Integer(value as i64)
    } else {
        Object::Real(value)
    }
}

/// Build a ToUnicode CMap with `code_bytes`-wide codes
pub fn to_unicode_cmap(entries: &BTreeMap<u32, String>, code_bytes: usize) -> String {
    let (range_low, range_high) = if code_bytes == 1 { ("<00>", "<FF>") } else { ("<0000>", "<FFFF>") };

    let mut cmap = String::from(
        "/CIDInit /ProcSet findresource begin\n\
         12 dict begin\n\
         begincmap\n\
         /CIDSystemInfo\n\
         << /Registry (Adobe)\n\
         /Ordering (UCS)\n\
         /Supplement 0\n\
         >> def\n\
         /CMapName /Adobe-Identity-UCS def\n\
         /CMapType 2 def\n\
         1 begincodespacerange\n",
    );
    cmap.push_str(&format!("{} {}\nendcodespacerange\n", range_low, range_high));

    let entries: Vec<_> = entries.iter().collect();
    // At most 100 entries per bfchar block
    for block in entries.chunks(100) {
        cmap.push_str(&format!("{} beginbfchar\n", block.len()));
        for (code, text) in block {
            let utf16: String = text.encode_utf16().map(|unit| format!("{:04X}", unit)).collect();
            cmap.push_str(&format!("<{:0width$X}> <{}>\n", code, utf16, width = code_bytes * 2));
        }
        cmap.push_str("endbfchar\n");
    }

    cmap.push_str("endcmap\nCMapName currentdict /CMap defineresource pop\nend\nend\n");
    cmap
}

/// Read the `bfchar` and `bfrange` mappings of a ToUnicode CMap
pub fn parse_to_unicode(cmap: &[u8]) -> BTreeMap<u32, String> {
    #[derive(Debug)]
    enum Token {
        Hex(Vec<u8>),
        Open,
        Close,
        Word(String),
    }

    let mut tokens = Vec::new();
    let mut pos = 0;
    while pos < cmap.len() {
        match cmap[pos] {
            b'<' => {
                let end = cmap[pos..].iter().position(|b| *b == b'>').map_or(cmap.len(), |e| pos + e);
                let digits: Vec<u8> = cmap[pos + 1..end].iter().copied().filter(u8::is_ascii_hexdigit).collect();
                let bytes = digits
                    .chunks(2)
                    .filter_map(|pair| {
                        let text = std::str::from_utf8(pair).ok()?;
                        let padded = if text.len() == 1 { format!("{}0", text) } else { text.to_string() };
                        u8::from_str_radix(&padded, 16).ok()
                    })
                    .collect();
                tokens.push(Token::Hex(bytes));
                pos = end + 1;
            }
            b'[' => {
                tokens.push(Token::Open);
                pos += 1;
            }
            b']' => {
                tokens.push(Token::Close);
                pos += 1;
            }
            b'%' => {
                while pos < cmap.len() && cmap[pos] != b'\n' && cmap[pos] != b'\r' {
                    pos += 1;
                }
            }
            b if b.is_ascii_whitespace() => pos += 1,
            _ => {
                let start = pos;
                while pos < cmap.len() && !cmap[pos].is_ascii_whitespace() && !b"<[]%".contains(&cmap[pos]) {
                    pos += 1;
                }
                tokens.push(Token::Word(String::from_utf8_lossy(&cmap[start..pos]).into_owned()));
            }
        }
    }

    fn code_of(bytes: &[u8]) -> u32 {
        bytes.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32)
    }
    fn text_of(bytes: &[u8]) -> String {
        let units: Vec<u16> = bytes
            .chunks(2)
            .map(|pair| u16::from_be_bytes([pair[0], *pair.get(1).unwrap_or(&0)]))
            .collect();
        String::from_utf16_lossy(&units)
    }

    let mut result = BTreeMap::new();
    let mut index = 0;
    let mut section = "";
    while index < tokens.len() {
        match (&tokens[index], section) {
            (Token::Word(word), _) if word == "beginbfchar" => section = "bfchar",
            (Token::Word(word), _) if word == "beginbfrange" => section = "bfrange",
            (Token::Word(word), _) if word.starts_with("end") => section = "",
            (Token::Hex(src), "bfchar") => {
                if let Some(Token::Hex(dst)) = tokens.get(index + 1) {
                    result.insert(code_of(src), text_of(dst));
                    index += 1;
                }
            }
            (Token::Hex(low), "bfrange") => {
                let (low, high) = match tokens.get(index + 1) {
                    Some(Token::Hex(high)) => (code_of(low), code_of(high)),
                    _ => {
                        index += 1;
                        continue;
                    }
                };
                match tokens.get(index + 2) {
                    Some(Token::Hex(dst)) => {
                        let base = text_of(dst);
                        let mut units: Vec<u16> = base.encode_utf16().collect();
                        for code in low..=high.min(low.saturating_add(0xFFFF)) {
                            result.insert(code, String::from_utf16_lossy(&units));
                            if let Some(last) = units.last_mut() {
                                *last = last.wrapping_add(1);
                            }
                        }
                        index += 2;
                    }
                    Some(Token::Open) => {
                        let mut offset = 0;
                        index += 3;
                        while let Some(Token::Hex(dst)) = tokens.get(index) {
                            result.insert(low + offset, text_of(dst));
                            offset += 1;
                            index += 1;
                        }
                        // index now at the closing bracket
                    }
                    _ => index += 1,
                }
            }
            _ => {}
        }
        index += 1;
    }
    result
}

/// Glyph names of printable ASCII 32..=126 in WinAnsi order
const ASCII_NAMES: [&str; 95] = [
    "space", "exclam", "quotedbl", "numbersign", "dollar", "percent", "ampersand", "quotesingle",
    "parenleft", "parenright", "asterisk", "plus", "comma", "hyphen", "period", "slash",
    "zero", "one", "two", "three", "four", "five", "six", "seven", "eight", "nine",
    "colon", "semicolon", "less", "equal", "greater", "question", "at",
    "A", "B", "C", "D", "E", "F", "G", "H", "I", "J", "K", "L", "M",
    "N", "O", "P", "Q", "R", "S", "T", "U", "V", "W", "X", "Y", "Z",
    "bracketleft", "backslash", "bracketright", "asciicircum", "underscore", "grave",
    "a", "b", "c", "d", "e", "f", "g", "h", "i", "j", "k", "l", "m",
    "n", "o", "p", "q", "r", "s", "t", "u", "v", "w", "x", "y", "z",
    "braceleft", "bar", "braceright", "asciitilde",
];

/// WinAnsi names for 128..=159 that differ from Latin-1
const WIN_ANSI_HIGH: [(u8, &str, char); 27] = [
    (128, "Euro", '\u{20AC}'),
    (130, "quotesinglbase", '\u{201A}'),
    (131, "florin", '\u{0192}'),
    (132, "quotedblbase", '\u{201E}'),
    (133, "ellipsis", '\u{2026}'),
    (134, "dagger", '\u{2020}'),
    (135, "daggerdbl", '\u{2021}'),
    (136, "circumflex", '\u{02C6}'),
    (137, "perthousand", '\u{2030}'),
    (138, "Scaron", '\u{0160}'),
    (139, "guilsinglleft", '\u{2039}'),
    (140, "OE", '\u{0152}'),
    (142, "Zcaron", '\u{017D}'),
    (145, "quoteleft", '\u{2018}'),
    (146, "quoteright", '\u{2019}'),
    (147, "quotedblleft", '\u{201C}'),
    (148, "quotedblright", '\u{201D}'),
    (149, "bullet", '\u{2022}'),
    (150, "endash", '\u{2013}'),
    (151, "emdash", '\u{2014}'),
    (152, "tilde", '\u{02DC}'),
    (153, "trademark", '\u{2122}'),
    (154, "scaron", '\u{0161}'),
    (155, "guilsinglright", '\u{203A}'),
    (156, "oe", '\u{0153}'),
    (158, "zcaron", '\u{017E}'),
    (159, "Ydieresis", '\u{0178}'),
];

/// Glyph name a base encoding assigns to a code
fn standard_glyph_name(code: u8, base_encoding: Option<&str>) -> Option<String> {
    let standard = matches!(base_encoding, None | Some("StandardEncoding"));
    match code {
        39 if standard => Some("quoteright".to_string()),
        96 if standard => Some("quoteleft".to_string()),
        32..=126 => Some(ASCII_NAMES[(code - 32) as usize].to_string()),
        128..=159 if base_encoding == Some("WinAnsiEncoding") => WIN_ANSI_HIGH
            .iter()
            .find(|(c, _, _)| *c == code)
            .map(|(_, name, _)| name.to_string()),
        160..=255 if base_encoding == Some("WinAnsiEncoding") => Some(format!("uni{:04X}", code)),
        _ => None,
    }
}

/// The character a glyph name stands for, by the common naming conventions
pub fn char_for_glyph_name(name: &str) -> Option<char> {
    if let Some(index) = ASCII_NAMES.iter().position(|n| *n == name) {
        return char::from_u32(32 + index as u32);
    }
    if let Some((_, _, c)) = WIN_ANSI_HIGH.iter().find(|(_, n, _)| *n == name) {
        return Some(*c);
    }
    let hex = name
        .strip_prefix("uni")
        .filter(|h| h.len() == 4)
        .or_else(|| name.strip_prefix('u').filter(|h| (4..=6).contains(&h.len())))?;
    u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
}

/// The conventional glyph name for a character
pub fn glyph_name_for_char(c: char) -> String {
    let code = c as u32;
    if (32..=126).contains(&code) {
        return ASCII_NAMES[(code - 32) as usize].to_string();
    }
    if let Some((_, name, _)) = WIN_ANSI_HIGH.iter().find(|(_, _, ch)| *ch == c) {
        return name.to_string();
    }
    if code <= 0xFFFF {
        format!("uni{:04X}", code)
    } else {
        format!("u{:X}", code)
    }
}

fn name_of(source: &SourceDocument, dict: &Dictionary, key: &[u8]) -> Option<String> {
    match source.resolve(dict.get(key).ok()?).ok()? {
        Object::Name(name) => Some(String::from_utf8_lossy(name).into_owned()),
        _ => None,
    }
}

fn integer_of(source: &SourceDocument, dict: &Dictionary, key: &[u8]) -> Option<i64> {
    match source.resolve(dict.get(key).ok()?).ok()? {
        Object::Integer(value) => Some(*value),
        Object::Real(value) => Some(*value as i64),
        _ => None,
    }
}

fn array_of(source: &SourceDocument, dict: &Dictionary, key: &[u8]) -> Vec<Object> {
    match dict.get(key).ok().and_then(|value| source.resolve(value).ok()) {
        Some(Object::Array(items)) => items.clone(),
        _ => Vec::new(),
    }
}

fn stream_content(source: &SourceDocument, object: &Object) -> Option<Vec<u8>> {
    match source.resolve(object).ok()? {
        Object::Stream(stream) => Some(stream.decompressed_content().unwrap_or_else(|_| stream.content.clone())),
        _ => None,
    }
}

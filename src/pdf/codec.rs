//! Font program codec
//!
//! The font merger decides which glyphs a merged font needs; a
//! [`FontProgramCodec`] does the binary work of finding glyphs in an embedded
//! program and appending glyphs from one program to another.
//!
//! [`SfntCodec`] covers glyf-based TrueType programs. Lookups go through
//! `ttf-parser`; rebuilding is done on the raw table directory since
//! `ttf-parser` is read-only.

use std::collections::{BTreeMap, VecDeque};
use log::debug;
use ttf_parser::{Face, GlyphId, PlatformId};
use crate::error::{Error, Result};
use crate::pdf::fonts::{char_for_glyph_name, FontFormat};

/// How a glyph is identified when looking it up in a program
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlyphRef<'a> {
    /// PostScript glyph name
    Name(&'a str),
    /// Single-byte character code, looked up in the program's symbolic cmaps
    Code(u8),
    /// Glyph index
    Id(u16),
}

/// Result of appending glyphs to a program
#[derive(Debug, Clone)]
pub struct AppendedGlyphs {
    /// The rebuilt program containing the base glyphs followed by the new ones
    pub program: Vec<u8>,
    /// Glyph index in the addition program -> glyph index in `program`
    ///
    /// Includes glyphs pulled in as components of composite glyphs.
    pub remap: BTreeMap<u16, u16>,
}

/// Binary font program operations needed to merge subset fonts
pub trait FontProgramCodec {
    /// Names of all glyphs in glyph index order
    fn glyph_names(&self, format: FontFormat, program: &[u8]) -> Result<Vec<String>>;

    /// Find a glyph in a program
    fn lookup(&self, format: FontFormat, program: &[u8], glyph: GlyphRef<'_>) -> Result<Option<u16>>;

    /// Append `glyphs` of `addition` to the end of `base`
    fn append_glyphs(
        &self,
        format: FontFormat,
        base: &[u8],
        addition: &[u8],
        glyphs: &[u16],
    ) -> Result<AppendedGlyphs>;

    /// Make single-byte codes select the given glyphs through the program's own encoding
    ///
    /// Programs whose encoding is fully described by the PDF font dictionary
    /// don't need this.
    fn set_code_map(&self, format: FontFormat, program: &[u8], codes: &BTreeMap<u8, u16>) -> Result<Vec<u8>> {
        let _ = (format, codes);
        Ok(program.to_vec())
    }
}

/// Codec for TrueType (`glyf` outline) programs
#[derive(Debug, Default, Clone, Copy)]
pub struct SfntCodec;

impl SfntCodec {
    pub fn new() -> Self {
        Self
    }

    fn check_format(format: FontFormat) -> Result<()> {
        match format {
            FontFormat::TrueType | FontFormat::OpenType => Ok(()),
            other => Err(Error::UnsupportedFontProgram(format!("{:?} programs", other))),
        }
    }
}

impl FontProgramCodec for SfntCodec {
    fn glyph_names(&self, format: FontFormat, program: &[u8]) -> Result<Vec<String>> {
        Self::check_format(format)?;
        let face = parse_face(program)?;
        Ok((0..face.number_of_glyphs()).map(|gid| glyph_name(&face, gid)).collect())
    }

    fn lookup(&self, format: FontFormat, program: &[u8], glyph: GlyphRef<'_>) -> Result<Option<u16>> {
        Self::check_format(format)?;
        let face = parse_face(program)?;

        let found = match glyph {
            GlyphRef::Id(gid) => (gid < face.number_of_glyphs()).then_some(gid),
            GlyphRef::Name(name) => (0..face.number_of_glyphs())
                .find(|gid| face.glyph_name(GlyphId(*gid)) == Some(name))
                .or_else(|| {
                    char_for_glyph_name(name)
                        .and_then(|c| face.glyph_index(c))
                        .map(|gid| gid.0)
                }),
            GlyphRef::Code(code) => lookup_code(&face, code),
        };

        // Glyph 0 is .notdef, which never counts as a match
        Ok(found.filter(|gid| *gid != 0 || matches!(glyph, GlyphRef::Id(0))))
    }

    fn append_glyphs(
        &self,
        format: FontFormat,
        base: &[u8],
        addition: &[u8],
        glyphs: &[u16],
    ) -> Result<AppendedGlyphs> {
        Self::check_format(format)?;
        let base_face = parse_face(base)?;
        let add_face = parse_face(addition)?;
        let base_font = Sfnt::read(base)?;
        let add_font = Sfnt::read(addition)?;

        if base_font.table(b"glyf").is_none() || add_font.table(b"glyf").is_none() {
            return Err(Error::UnsupportedFontProgram("sfnt without glyf outlines".to_string()));
        }

        let base_count = base_face.number_of_glyphs();
        let add_count = add_face.number_of_glyphs();
        let base_glyphs = base_font.glyphs(base_count)?;
        let add_glyphs = add_font.glyphs(add_count)?;

        // Requested glyphs first, then components of composites in discovery order
        let mut order: Vec<u16> = Vec::new();
        let mut remap = BTreeMap::new();
        let mut queue: VecDeque<u16> = glyphs.iter().copied().collect();
        while let Some(gid) = queue.pop_front() {
            if remap.contains_key(&gid) {
                continue;
            }
            if gid >= add_count {
                return Err(Error::Font(format!(
                    "Glyph {} out of range, program has {} glyphs",
                    gid, add_count
                )));
            }
            let new_gid = u16::try_from(base_count as usize + order.len())
                .map_err(|_| Error::Font("Merged font exceeds 65535 glyphs".to_string()))?;
            remap.insert(gid, new_gid);
            order.push(gid);
            for (_, component) in components(add_glyphs[gid as usize]) {
                queue.push_back(component);
            }
        }

        let total = base_count as usize + order.len();
        debug!("Appending {} glyphs to a {}-glyph program", order.len(), base_count);

        // glyf + long loca
        let mut glyf = Vec::new();
        let mut loca = Vec::with_capacity((total + 1) * 4);
        for data in &base_glyphs {
            loca.extend_from_slice(&(glyf.len() as u32).to_be_bytes());
            glyf.extend_from_slice(data);
            pad4(&mut glyf);
        }
        for gid in &order {
            loca.extend_from_slice(&(glyf.len() as u32).to_be_bytes());
            let mut data = add_glyphs[*gid as usize].to_vec();
            let refs = components(&data);
            for (offset, component) in refs {
                let new_component = remap.get(&component).copied().unwrap_or(0);
                data[offset..offset + 2].copy_from_slice(&new_component.to_be_bytes());
            }
            glyf.extend_from_slice(&data);
            pad4(&mut glyf);
        }
        loca.extend_from_slice(&(glyf.len() as u32).to_be_bytes());

        // Every glyph gets a full metric
        let mut metrics: Vec<(u16, i16)> = (0..base_count).map(|gid| base_font.metric(gid)).collect();
        metrics.extend(order.iter().map(|gid| add_font.metric(*gid)));
        let mut hmtx = Vec::with_capacity(metrics.len() * 4);
        for (advance, lsb) in &metrics {
            hmtx.extend_from_slice(&advance.to_be_bytes());
            hmtx.extend_from_slice(&lsb.to_be_bytes());
        }
        let max_advance = metrics.iter().map(|(advance, _)| *advance).max().unwrap_or(0);

        let mut hhea = base_font.required(b"hhea", 36)?.to_vec();
        hhea[10..12].copy_from_slice(&max_advance.to_be_bytes());
        hhea[34..36].copy_from_slice(&(total as u16).to_be_bytes());

        let mut maxp = base_font.required(b"maxp", 6)?.to_vec();
        maxp[4..6].copy_from_slice(&(total as u16).to_be_bytes());

        let mut head = base_font.required(b"head", 54)?.to_vec();
        head[8..12].copy_from_slice(&0u32.to_be_bytes());
        head[50..52].copy_from_slice(&1i16.to_be_bytes());

        let mut tables: Vec<([u8; 4], Vec<u8>)> = base_font
            .tables
            .iter()
            .filter(|(tag, _)| !REBUILT_TABLES.contains(&tag) && !DROPPED_TABLES.contains(&tag))
            .map(|(tag, data)| (*tag, data.to_vec()))
            .collect();
        tables.push((*b"glyf", glyf));
        tables.push((*b"loca", loca));
        tables.push((*b"hmtx", hmtx));
        tables.push((*b"hhea", hhea));
        tables.push((*b"maxp", maxp));
        tables.push((*b"head", head));

        let has_names = base_face.glyph_name(GlyphId(0)).is_some() || add_face.glyph_name(GlyphId(0)).is_some();
        if has_names {
            let mut names: Vec<String> = (0..base_count).map(|gid| glyph_name(&base_face, gid)).collect();
            names.extend(order.iter().map(|gid| glyph_name(&add_face, *gid)));
            tables.push((*b"post", build_post(base_font.table(b"post"), &names)));
        } else if let Some(post) = base_font.table(b"post") {
            tables.push((*b"post", post.to_vec()));
        }

        Ok(AppendedGlyphs {
            program: write_sfnt(tables),
            remap,
        })
    }

    fn set_code_map(&self, format: FontFormat, program: &[u8], codes: &BTreeMap<u8, u16>) -> Result<Vec<u8>> {
        Self::check_format(format)?;
        let (first, last) = match (codes.keys().next(), codes.keys().next_back()) {
            (Some(first), Some(last)) => (*first as u16, *last as u16),
            _ => return Ok(program.to_vec()),
        };

        let ids: Vec<u16> = (first..=last)
            .map(|code| codes.get(&(code as u8)).copied().unwrap_or(0))
            .collect();
        let mac = format6(first, &ids);
        let windows = format6(0xF000 + first, &ids);

        let mut cmap = Vec::new();
        cmap.extend_from_slice(&0u16.to_be_bytes());
        cmap.extend_from_slice(&2u16.to_be_bytes());
        // (1,0) Mac Roman, then (3,0) Windows Symbol
        cmap.extend_from_slice(&1u16.to_be_bytes());
        cmap.extend_from_slice(&0u16.to_be_bytes());
        cmap.extend_from_slice(&20u32.to_be_bytes());
        cmap.extend_from_slice(&3u16.to_be_bytes());
        cmap.extend_from_slice(&0u16.to_be_bytes());
        cmap.extend_from_slice(&(20 + mac.len() as u32).to_be_bytes());
        cmap.extend_from_slice(&mac);
        cmap.extend_from_slice(&windows);

        let font = Sfnt::read(program)?;
        let mut tables: Vec<([u8; 4], Vec<u8>)> = font
            .tables
            .iter()
            .filter(|(tag, _)| tag != b"cmap")
            .map(|(tag, data)| (*tag, data.to_vec()))
            .collect();
        tables.push((*b"cmap", cmap));
        Ok(write_sfnt(tables))
    }
}

/// Tables rebuilt by `append_glyphs`
const REBUILT_TABLES: [&[u8; 4]; 7] = [b"glyf", b"loca", b"hmtx", b"hhea", b"maxp", b"head", b"post"];

/// Tables that depend on the glyph count and are simply left out
const DROPPED_TABLES: [&[u8; 4]; 4] = [b"hdmx", b"LTSH", b"VDMX", b"DSIG"];

fn parse_face(program: &[u8]) -> Result<Face<'_>> {
    Face::parse(program, 0).map_err(|e| Error::Font(format!("Failed to parse font program: {}", e)))
}

fn glyph_name(face: &Face<'_>, gid: u16) -> String {
    face.glyph_name(GlyphId(gid))
        .map(String::from)
        .unwrap_or_else(|| format!("glyph{}", gid))
}

/// Code lookup the way a reader treats a symbolic TrueType font
fn lookup_code(face: &Face<'_>, code: u8) -> Option<u16> {
    let cmap = face.tables().cmap?;
    let mut fallback = None;
    for subtable in cmap.subtables {
        let found = match (subtable.platform_id, subtable.encoding_id) {
            (PlatformId::Windows, 0) => subtable
                .glyph_index(0xF000 + code as u32)
                .or_else(|| subtable.glyph_index(code as u32)),
            (PlatformId::Macintosh, 0) => subtable.glyph_index(code as u32),
            (PlatformId::Windows, 1) | (PlatformId::Unicode, _) => {
                fallback = fallback.or_else(|| subtable.glyph_index(code as u32));
                None
            }
            _ => None,
        };
        if let Some(gid) = found {
            return Some(gid.0);
        }
    }
    fallback.map(|gid| gid.0)
}

/// Raw table directory of an sfnt program
struct Sfnt<'a> {
    tables: Vec<([u8; 4], &'a [u8])>,
}

impl<'a> Sfnt<'a> {
    fn read(data: &'a [u8]) -> Result<Self> {
        let truncated = || Error::Font("Truncated sfnt table directory".to_string());
        let count = read_u16(data, 4).ok_or_else(truncated)? as usize;

        let mut tables = Vec::with_capacity(count);
        for index in 0..count {
            let record = 12 + index * 16;
            let tag: [u8; 4] = data
                .get(record..record + 4)
                .and_then(|tag| tag.try_into().ok())
                .ok_or_else(truncated)?;
            let offset = read_u32(data, record + 8).ok_or_else(truncated)? as usize;
            let length = read_u32(data, record + 12).ok_or_else(truncated)? as usize;
            let table = data.get(offset..offset + length).ok_or_else(|| {
                Error::Font(format!("Table {} extends past end of font", String::from_utf8_lossy(&tag)))
            })?;
            tables.push((tag, table));
        }

        Ok(Self { tables })
    }

    fn table(&self, tag: &[u8; 4]) -> Option<&'a [u8]> {
        self.tables.iter().find(|(t, _)| t == tag).map(|(_, data)| *data)
    }

    fn required(&self, tag: &[u8; 4], min_len: usize) -> Result<&'a [u8]> {
        self.table(tag)
            .filter(|data| data.len() >= min_len)
            .ok_or_else(|| Error::Font(format!("Missing or short {} table", String::from_utf8_lossy(tag))))
    }

    /// Outline data of every glyph, in glyph index order
    fn glyphs(&self, count: u16) -> Result<Vec<&'a [u8]>> {
        let head = self.required(b"head", 54)?;
        let loca = self.required(b"loca", 0)?;
        let glyf = self.required(b"glyf", 0)?;
        let long = read_u16(head, 50) == Some(1);

        let offset = |index: usize| -> Option<usize> {
            if long {
                read_u32(loca, index * 4).map(|value| value as usize)
            } else {
                read_u16(loca, index * 2).map(|value| value as usize * 2)
            }
        };

        (0..count as usize)
            .map(|gid| {
                let start = offset(gid).unwrap_or(0);
                let end = offset(gid + 1).unwrap_or(start);
                if end <= start {
                    return Ok(&glyf[0..0]);
                }
                glyf.get(start..end)
                    .ok_or_else(|| Error::Font(format!("Glyph {} extends past glyf table", gid)))
            })
            .collect()
    }

    /// Advance width and left side bearing
    fn metric(&self, gid: u16) -> (u16, i16) {
        let (Some(hhea), Some(hmtx)) = (self.table(b"hhea"), self.table(b"hmtx")) else {
            return (0, 0);
        };
        let long_count = read_u16(hhea, 34).unwrap_or(0) as usize;
        if long_count == 0 {
            return (0, 0);
        }

        let gid = gid as usize;
        if gid < long_count {
            (
                read_u16(hmtx, gid * 4).unwrap_or(0),
                read_u16(hmtx, gid * 4 + 2).unwrap_or(0) as i16,
            )
        } else {
            (
                read_u16(hmtx, (long_count - 1) * 4).unwrap_or(0),
                read_u16(hmtx, long_count * 4 + (gid - long_count) * 2).unwrap_or(0) as i16,
            )
        }
    }
}

/// Component references of a composite glyph: (offset of the glyph index, glyph index)
fn components(glyph: &[u8]) -> Vec<(usize, u16)> {
    const ARG_1_AND_2_ARE_WORDS: u16 = 0x0001;
    const WE_HAVE_A_SCALE: u16 = 0x0008;
    const MORE_COMPONENTS: u16 = 0x0020;
    const WE_HAVE_AN_X_AND_Y_SCALE: u16 = 0x0040;
    const WE_HAVE_A_TWO_BY_TWO: u16 = 0x0080;

    let mut result = Vec::new();
    if glyph.len() < 10 || (read_u16(glyph, 0).unwrap_or(0) as i16) >= 0 {
        return result;
    }

    let mut pos = 10;
    while let (Some(flags), Some(gid)) = (read_u16(glyph, pos), read_u16(glyph, pos + 2)) {
        result.push((pos + 2, gid));
        pos += 4;
        pos += if flags & ARG_1_AND_2_ARE_WORDS != 0 { 4 } else { 2 };
        if flags & WE_HAVE_A_SCALE != 0 {
            pos += 2;
        } else if flags & WE_HAVE_AN_X_AND_Y_SCALE != 0 {
            pos += 4;
        } else if flags & WE_HAVE_A_TWO_BY_TWO != 0 {
            pos += 8;
        }
        if flags & MORE_COMPONENTS == 0 {
            break;
        }
    }
    result
}

fn format6(first_code: u16, ids: &[u16]) -> Vec<u8> {
    let mut table = Vec::with_capacity(10 + ids.len() * 2);
    table.extend_from_slice(&6u16.to_be_bytes());
    table.extend_from_slice(&((10 + ids.len() * 2) as u16).to_be_bytes());
    table.extend_from_slice(&0u16.to_be_bytes());
    table.extend_from_slice(&first_code.to_be_bytes());
    table.extend_from_slice(&(ids.len() as u16).to_be_bytes());
    for id in ids {
        table.extend_from_slice(&id.to_be_bytes());
    }
    table
}

/// A format 2 `post` table naming every glyph explicitly
fn build_post(existing: Option<&[u8]>, names: &[String]) -> Vec<u8> {
    let mut post = match existing {
        Some(data) if data.len() >= 32 => data[..32].to_vec(),
        _ => vec![0u8; 32],
    };
    post[0..4].copy_from_slice(&0x0002_0000u32.to_be_bytes());

    post.extend_from_slice(&(names.len() as u16).to_be_bytes());
    for index in 0..names.len() {
        post.extend_from_slice(&((258 + index) as u16).to_be_bytes());
    }
    for name in names {
        let bytes = &name.as_bytes()[..name.len().min(255)];
        post.push(bytes.len() as u8);
        post.extend_from_slice(bytes);
    }
    post
}

/// Serialize tables into an sfnt program with a valid directory and checksums
fn write_sfnt(mut tables: Vec<([u8; 4], Vec<u8>)>) -> Vec<u8> {
    tables.sort_by(|a, b| a.0.cmp(&b.0));
    for (tag, data) in tables.iter_mut() {
        if tag == b"head" && data.len() >= 12 {
            data[8..12].copy_from_slice(&0u32.to_be_bytes());
        }
    }

    let count = tables.len() as u16;
    let entry_selector = if count == 0 { 0 } else { 15 - count.leading_zeros() as u16 };
    let search_range = (1u16 << entry_selector) * 16;
    let range_shift = count * 16 - search_range.min(count * 16);

    let mut out = Vec::new();
    out.extend_from_slice(&0x0001_0000u32.to_be_bytes());
    out.extend_from_slice(&count.to_be_bytes());
    out.extend_from_slice(&search_range.to_be_bytes());
    out.extend_from_slice(&entry_selector.to_be_bytes());
    out.extend_from_slice(&range_shift.to_be_bytes());

    let mut offset = 12 + tables.len() * 16;
    let mut head_offset = None;
    for (tag, data) in &tables {
        out.extend_from_slice(tag);
        out.extend_from_slice(&checksum(data).to_be_bytes());
        out.extend_from_slice(&(offset as u32).to_be_bytes());
        out.extend_from_slice(&(data.len() as u32).to_be_bytes());
        if tag == b"head" {
            head_offset = Some(offset);
        }
        offset += (data.len() + 3) & !3;
    }
    for (_, data) in &tables {
        out.extend_from_slice(data);
        pad4(&mut out);
    }

    if let Some(head) = head_offset {
        let adjustment = 0xB1B0_AFBAu32.wrapping_sub(checksum(&out));
        out[head + 8..head + 12].copy_from_slice(&adjustment.to_be_bytes());
    }
    out
}

fn checksum(data: &[u8]) -> u32 {
    data.chunks(4).fold(0u32, |sum, chunk| {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        sum.wrapping_add(u32::from_be_bytes(word))
    })
}

fn pad4(data: &mut Vec<u8>) {
    while data.len() % 4 != 0 {
        data.push(0);
    }
}

fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    data.get(offset..offset + 2).map(|b| u16::from_be_bytes([b[0], b[1]]))
}

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    data.get(offset..offset + 4).map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}


#[cfg(test)]
mod tests {
    use super::test_fonts::{build, TestGlyph};
    use super::*;

    fn base_font() -> Vec<u8> {
        build(
            &[TestGlyph::empty(".notdef", 500), TestGlyph::simple("A", 722)],
            &[(65, 1)],
        )
    }

    fn addition_font() -> Vec<u8> {
        build(
            &[
                TestGlyph::empty(".notdef", 500),
                TestGlyph::simple("B", 667),
                TestGlyph::composite("Bcomposite", 667, 1),
            ],
            &[(66, 1), (67, 2)],
        )
    }

    #[test]
    fn test_lookup() {
        let codec = SfntCodec::new();
        let font = base_font();

        assert_eq!(codec.lookup(FontFormat::TrueType, &font, GlyphRef::Name("A")).unwrap(), Some(1));
        assert_eq!(codec.lookup(FontFormat::TrueType, &font, GlyphRef::Code(65)).unwrap(), Some(1));
        assert_eq!(codec.lookup(FontFormat::TrueType, &font, GlyphRef::Code(66)).unwrap(), None);
        assert_eq!(codec.lookup(FontFormat::TrueType, &font, GlyphRef::Name("B")).unwrap(), None);
        assert_eq!(codec.lookup(FontFormat::TrueType, &font, GlyphRef::Id(1)).unwrap(), Some(1));
        assert_eq!(codec.lookup(FontFormat::TrueType, &font, GlyphRef::Id(9)).unwrap(), None);
    }

    #[test]
    fn test_append_renumbers_composite_components() {
        let codec = SfntCodec::new();
        let merged = codec
            .append_glyphs(FontFormat::TrueType, &base_font(), &addition_font(), &[2])
            .unwrap();

        // The composite lands at 2 and drags its component along to 3
        assert_eq!(merged.remap.get(&2), Some(&2));
        assert_eq!(merged.remap.get(&1), Some(&3));

        let names = codec.glyph_names(FontFormat::TrueType, &merged.program).unwrap();
        assert_eq!(names, vec![".notdef", "A", "Bcomposite", "B"]);

        let sfnt = Sfnt::read(&merged.program).unwrap();
        let glyphs = sfnt.glyphs(4).unwrap();
        assert_eq!(components(glyphs[2]), vec![(12, 3)]);
        assert_eq!(sfnt.metric(3), (667, 0));
        assert_eq!(sfnt.metric(1), (722, 0));

        // The base cmap survives untouched
        assert_eq!(codec.lookup(FontFormat::TrueType, &merged.program, GlyphRef::Code(65)).unwrap(), Some(1));
    }

    #[test]
    fn test_set_code_map() {
        let codec = SfntCodec::new();
        let merged = codec
            .append_glyphs(FontFormat::TrueType, &base_font(), &addition_font(), &[1])
            .unwrap();
        let codes: BTreeMap<u8, u16> = [(65, 1), (66, 2)].into_iter().collect();
        let program = codec.set_code_map(FontFormat::TrueType, &merged.program, &codes).unwrap();

        assert_eq!(codec.lookup(FontFormat::TrueType, &program, GlyphRef::Code(66)).unwrap(), Some(2));
        assert_eq!(codec.lookup(FontFormat::TrueType, &program, GlyphRef::Code(65)).unwrap(), Some(1));
    }

    #[test]
    fn test_unsupported_formats() {
        let codec = SfntCodec::new();
        let result = codec.append_glyphs(FontFormat::Type1C, b"", b"", &[1]);
        assert!(matches!(result, Err(Error::UnsupportedFontProgram(_))));
    }

    #[test]
    fn test_checksum_adjustment() {
        let font = base_font();
        // A whole font with a correct adjustment sums to the magic constant
        assert_eq!(checksum(&font), 0xB1B0_AFBA);
    }
}

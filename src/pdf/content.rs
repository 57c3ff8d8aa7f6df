//! Content-stream rewriting
//!
//! Every resource name a source page draws with is replaced by a destination
//! name registered in the merge session, marked-content IDs are renumbered
//! into the destination page's sequence, and nested form XObjects are
//! rewritten the same way into their own resource dictionaries.

use std::collections::BTreeMap;
use log::{debug, warn};
use lopdf::content::{Content, Operation};
use lopdf::{Dictionary, Object, ObjectId, Stream};
use tiny_skia_path::{Rect, Transform};
use crate::error::{Error, Result};
use crate::pdf::annotations::AnnotationStructRef;
use crate::pdf::fonts::logical_font_key;
use crate::pdf::postscript::FormSink;
use crate::pdf::resources::{
    copy_dictionary, copy_object, destination_name, fingerprint, register_in, ResolvedResource, ResourceCategory,
    ResourceKey, ResourceOrigin,
};
use crate::pdf::scan::{inline_dictionary, split_content, Segment};
use crate::pdf::session::MergeSession;
use crate::pdf::source::{stream_bytes, SourceDocument, SourcePage};
use crate::pdf::structure::{ParentTreeEntry, StructureParentEntry};

/// How font resources are carried over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FontMode {
    /// Merge occurrences of one logical font into a single destination font
    #[default]
    Merge,
    /// Copy each font object under a new name (PostScript output)
    Rekey,
}

/// Per-call options for [`MergeSession::rewrite_page`]
#[derive(Default)]
pub struct RewriteOptions<'a> {
    pub fonts: FontMode,
    /// Clip rectangle in source user space
    pub clip: Option<Rect>,
    /// Placement rectangle in destination space; defaults to the rotated view box at the origin
    pub target: Option<Rect>,
    /// First MCID to hand out, instead of continuing the destination page's sequence
    pub mcid_base: Option<i64>,
    /// Notified of every XObject resolved in [`FontMode::Rekey`]
    pub forms: Option<&'a mut dyn FormSink>,
}

/// Result of rewriting one source page
#[derive(Debug, Clone)]
pub struct RewrittenPage {
    /// Content in source user space, wrapped in `q ... Q`
    pub content: Vec<u8>,
    /// Source user space -> destination space
    pub transform: Transform,
    /// Marked-content regions, in content order
    pub structure: Vec<StructureParentEntry>,
    /// Source MCID -> destination MCID
    pub mcids: BTreeMap<i64, i64>,
    /// Structure references of the links carried over
    pub annotations: Vec<AnnotationStructRef>,
}

/// Output of [`Rewriter::rewrite_page`]
pub(crate) struct PageContent {
    pub content: Vec<u8>,
    pub structure: Vec<StructureParentEntry>,
    pub mcids: BTreeMap<i64, i64>,
    pub next_mcid: i64,
}

/// Rewrites one source page into a merge session
pub(crate) struct Rewriter<'s, 'o> {
    session: &'s mut MergeSession,
    source: &'s SourceDocument,
    page: &'s SourcePage,
    fonts: FontMode,
    forms: Option<&'o mut dyn FormSink>,
    parents: &'s [ParentTreeEntry],
    next_mcid: i64,
    structure: Vec<StructureParentEntry>,
    mcids: BTreeMap<i64, i64>,
    /// Source forms currently being rewritten, innermost last
    stack: Vec<ObjectId>,
}

impl<'s, 'o> Rewriter<'s, 'o> {
    pub fn new(
        session: &'s mut MergeSession,
        source: &'s SourceDocument,
        page: &'s SourcePage,
        parents: &'s [ParentTreeEntry],
        fonts: FontMode,
        forms: Option<&'o mut dyn FormSink>,
        first_mcid: i64,
    ) -> Self {
        Self {
            session,
            source,
            page,
            fonts,
            forms,
            parents,
            next_mcid: first_mcid,
            structure: Vec::new(),
            mcids: BTreeMap::new(),
            stack: Vec::new(),
        }
    }

    /// Rewrite the page content, registering resources in `resources`
    pub fn rewrite_page(mut self, resources: &mut Dictionary, clip: Option<Rect>) -> Result<PageContent> {
        let (source, page) = (self.source, self.page);
        let bytes = source.content_bytes(page)?;
        let body = self.rewrite_stream(&bytes, &page.resources, page.id, resources, 0)?;

        let mut content = b"q\n".to_vec();
        if let Some(clip) = clip {
            content.extend(format!("{} {} {} {} re W n\n", clip.x(), clip.y(), clip.width(), clip.height()).bytes());
        }
        content.extend(body);
        content.extend(b"\nQ\n");

        debug!(
            "Rewrote page {} of {}: {} marked-content regions",
            page.number,
            source.key(),
            self.structure.len()
        );

        Ok(PageContent {
            content,
            structure: self.structure,
            mcids: self.mcids,
            next_mcid: self.next_mcid,
        })
    }

    /// Rewrite one content stream whose names refer to `resources`
    ///
    /// `owner` is the page or form that holds `resources`; destination entries go
    /// into `local`. `depth` is 0 for the page itself.
    fn rewrite_stream(
        &mut self,
        bytes: &[u8],
        resources: &Dictionary,
        owner: ObjectId,
        local: &mut Dictionary,
        depth: usize,
    ) -> Result<Vec<u8>> {
        let segments = split_content(bytes).map_err(|reason| self.malformed(reason))?;

        let mut output = Vec::with_capacity(bytes.len());
        for segment in segments {
            let rewritten = match segment {
                Segment::Operations { bytes, operators } => {
                    self.rewrite_operations(bytes, operators, resources, owner, local, depth)?
                }
                Segment::InlineImage { header, data } => {
                    self.inline_image(header, data, resources, owner, local, depth)?
                }
            };
            if !output.is_empty() {
                output.push(b'\n');
            }
            output.extend(rewritten);
        }
        Ok(output)
    }

    fn rewrite_operations(
        &mut self,
        bytes: &[u8],
        operators: usize,
        resources: &Dictionary,
        owner: ObjectId,
        local: &mut Dictionary,
        depth: usize,
    ) -> Result<Vec<u8>> {
        let content = Content::decode(bytes).map_err(|e| self.malformed(e.to_string()))?;
        if content.operations.len() != operators {
            return Err(self.malformed(format!(
                "decoded {} of {} operators",
                content.operations.len(),
                operators
            )));
        }

        let mut operations = Vec::with_capacity(content.operations.len());
        for mut op in content.operations {
            match op.operator.as_str() {
                "Tf" => self.rekey_operand(&mut op, 0, ResourceCategory::Font, resources, owner, local, depth)?,
                "Do" => self.rekey_operand(&mut op, 0, ResourceCategory::XObject, resources, owner, local, depth)?,
                "gs" => self.rekey_operand(&mut op, 0, ResourceCategory::ExtGState, resources, owner, local, depth)?,
                "sh" => self.rekey_operand(&mut op, 0, ResourceCategory::Shading, resources, owner, local, depth)?,
                "cs" | "CS" => {
                    let name = self.name_operand(&op, 0)?;
                    if !is_device_space(name) {
                        self.rekey_operand(&mut op, 0, ResourceCategory::ColorSpace, resources, owner, local, depth)?;
                    }
                }
                "scn" | "SCN" => {
                    if let Some(index) = op.operands.len().checked_sub(1) {
                        if matches!(op.operands[index], Object::Name(_)) {
                            self.rekey_operand(&mut op, index, ResourceCategory::Pattern, resources, owner, local, depth)?;
                        }
                    }
                }
                "BDC" => self.marked_content(&mut op, resources, owner, local, depth)?,
                "DP" => {
                    if matches!(op.operands.get(1), Some(Object::Name(_))) {
                        self.rekey_operand(&mut op, 1, ResourceCategory::Properties, resources, owner, local, depth)?;
                    }
                }
                _ => {}
            }
            operations.push(op);
        }

        Content { operations }
            .encode()
            .map_err(|e| self.malformed(e.to_string()))
    }

    #[allow(clippy::too_many_arguments)]
    fn rekey_operand(
        &mut self,
        op: &mut Operation,
        index: usize,
        category: ResourceCategory,
        resources: &Dictionary,
        owner: ObjectId,
        local: &mut Dictionary,
        depth: usize,
    ) -> Result<()> {
        let name = self.name_operand(op, index)?.to_vec();
        let renamed = self.resolve_name(category, &name, resources, owner, local, depth)?;
        op.operands[index] = Object::Name(renamed.into_bytes());
        Ok(())
    }

    fn name_operand<'b>(&self, op: &'b Operation, index: usize) -> Result<&'b [u8]> {
        match op.operands.get(index) {
            Some(Object::Name(name)) => Ok(name),
            _ => Err(self.malformed(format!("{} expects a name operand", op.operator))),
        }
    }

    /// Renumber the MCID of a `BDC` property list, or re-key its named property list
    fn marked_content(
        &mut self,
        op: &mut Operation,
        resources: &Dictionary,
        owner: ObjectId,
        local: &mut Dictionary,
        depth: usize,
    ) -> Result<()> {
        let source = self.source;
        let properties = match op.operands.get(1) {
            Some(Object::Dictionary(dict)) => dict.clone(),
            Some(Object::Name(name)) => lookup_entry(source, ResourceCategory::Properties, name, resources)
                .and_then(|entry| source.resolve_dict(entry))
                .cloned()
                .ok_or_else(|| missing(ResourceCategory::Properties, name))?,
            _ => return Err(self.malformed("BDC expects a tag and a property list".to_string())),
        };

        // Marked content inside forms keeps its own numbering
        let source_mcid = match properties.get(b"MCID") {
            Ok(Object::Integer(mcid)) if depth == 0 => Some(*mcid),
            _ => None,
        };

        match source_mcid {
            Some(source_mcid) => {
                let mcid = self.next_mcid;
                self.next_mcid += 1;

                let mut inline = copy_dictionary(source, &mut self.session.doc, &mut self.session.copied, &properties)?;
                inline.set("MCID", Object::Integer(mcid));
                op.operands[1] = Object::Dictionary(inline);

                let element = usize::try_from(source_mcid)
                    .ok()
                    .and_then(|index| self.parents.get(index))
                    .and_then(|entry| entry.element);
                self.structure.push(StructureParentEntry {
                    mcid,
                    source_mcid,
                    element,
                });
                self.mcids.insert(source_mcid, mcid);
            }
            None => {
                if matches!(op.operands[1], Object::Name(_)) {
                    self.rekey_operand(op, 1, ResourceCategory::Properties, resources, owner, local, depth)?;
                }
            }
        }
        Ok(())
    }

    /// Re-emit an inline image, re-keying a named color space in its header
    ///
    /// The image data is copied unchanged.
    fn inline_image(
        &mut self,
        header: &[u8],
        data: &[u8],
        resources: &Dictionary,
        owner: ObjectId,
        local: &mut Dictionary,
        depth: usize,
    ) -> Result<Vec<u8>> {
        let content = Content::decode(header).map_err(|e| self.malformed(e.to_string()))?;
        let mut op = match <[Operation; 1]>::try_from(content.operations) {
            Ok([op]) if op.operator == "ID" && inline_dictionary(&op.operands).is_some() => op,
            _ => return Err(self.malformed("inline image header is not a list of key/value pairs".to_string())),
        };

        for index in (1..op.operands.len()).step_by(2) {
            let is_color_space = matches!(&op.operands[index - 1], Object::Name(key) if key == b"CS" || key == b"ColorSpace");
            let name = match &op.operands[index] {
                Object::Name(name) if is_color_space && !is_inline_device_space(name) => name.clone(),
                _ => continue,
            };
            let renamed = self.resolve_name(ResourceCategory::ColorSpace, &name, resources, owner, local, depth)?;
            op.operands[index] = Object::Name(renamed.into_bytes());
        }

        let pairs = Content { operations: vec![op] }
            .encode()
            .map_err(|e| self.malformed(e.to_string()))?;
        let mut output = Vec::with_capacity(pairs.len() + data.len() + 8);
        output.extend(b"BI ");
        output.extend(pairs);
        output.push(b'\n');
        output.extend(data);
        output.extend(b"\nEI");
        Ok(output)
    }

    /// Destination name for the resource `name` of `category`
    fn resolve_name(
        &mut self,
        category: ResourceCategory,
        name: &[u8],
        resources: &Dictionary,
        owner: ObjectId,
        local: &mut Dictionary,
        depth: usize,
    ) -> Result<String> {
        let source = self.source;
        let entry = lookup_entry(source, category, name, resources).ok_or_else(|| missing(category, name))?;

        let origin = match entry {
            Object::Reference(id) => ResourceOrigin::Object(*id),
            _ => ResourceOrigin::Direct {
                owner,
                name: name.to_vec(),
            },
        };
        let key = ResourceKey {
            source: source.key().to_string(),
            origin,
            category,
            fonts: matches!(category, ResourceCategory::Font | ResourceCategory::XObject).then_some(self.fonts),
        };

        let resolved = match self.session.cache.get(&key) {
            Some(resolved) => resolved.clone(),
            None => {
                let value = source.resolve(entry).map_err(|e| Error::ResourceResolution {
                    name: String::from_utf8_lossy(name).into_owned(),
                    category,
                    reason: e.to_string(),
                })?;

                let resolved = match (category, value) {
                    (ResourceCategory::Font, _) if self.fonts == FontMode::Merge => self.merge_font(name, entry)?,
                    (ResourceCategory::XObject, Object::Stream(stream)) if is_form(&stream.dict) => {
                        let id = match entry {
                            Object::Reference(id) => *id,
                            _ => owner,
                        };
                        self.merge_form(name, id, stream, depth)?
                    }
                    (ResourceCategory::ExtGState | ResourceCategory::ColorSpace, _)
                        if self.session.options.collapse_equal_resources =>
                    {
                        self.collapse(category, name, entry, value)?
                    }
                    _ => self.copy_resource(name, entry)?,
                };
                debug!("{} /{} of {} -> /{}", category, String::from_utf8_lossy(name), source.key(), resolved.name);
                self.session.cache.insert(key, resolved.clone());
                resolved
            }
        };

        register_in(local, category, &resolved.name, resolved.id);
        if category == ResourceCategory::XObject && self.fonts == FontMode::Rekey {
            if let Some(sink) = self.forms.as_deref_mut() {
                sink.register_form(&resolved.name, resolved.id);
            }
        }
        Ok(resolved.name)
    }

    fn copy_resource(&mut self, name: &[u8], entry: &Object) -> Result<ResolvedResource> {
        let session = &mut *self.session;
        let id = match copy_object(self.source, &mut session.doc, &mut session.copied, entry)? {
            Object::Reference(id) => id,
            direct => session.doc.add_object(direct),
        };
        Ok(ResolvedResource {
            name: destination_name(name, id),
            id,
        })
    }

    /// Reuse an earlier destination copy of a structurally equal resource
    fn collapse(
        &mut self,
        category: ResourceCategory,
        name: &[u8],
        entry: &Object,
        value: &Object,
    ) -> Result<ResolvedResource> {
        let print = fingerprint(self.source.key(), value);
        if let Some(existing) = self.session.cache.get_by_value(category, &print) {
            return Ok(existing.clone());
        }
        let resolved = self.copy_resource(name, entry)?;
        self.session.cache.insert_by_value(category, print, resolved.clone());
        Ok(resolved)
    }

    /// Route a font through the font registry, re-keying it if the registry can't take it
    fn merge_font(&mut self, name: &[u8], entry: &Object) -> Result<ResolvedResource> {
        let source = self.source;
        let Some(font) = source.resolve_dict(entry) else {
            return self.copy_resource(name, entry);
        };
        let Some(key) = logical_font_key(source, font) else {
            return self.copy_resource(name, entry);
        };

        let session = &mut *self.session;
        match session.fonts.add_font(&key, source, font, &mut session.doc, session.codec.as_ref()) {
            Ok(_) => {}
            Err(err @ (Error::UnsupportedFontProgram(_) | Error::Font(_))) => {
                warn!("Not merging font {} ({}), copying it instead", key, err);
                return self.copy_resource(name, entry);
            }
            Err(err) => return Err(err),
        }

        match (session.fonts.resource_name(&key), session.fonts.object_id(&key)) {
            (Some(name), Some(id)) => Ok(ResolvedResource {
                name: name.to_string(),
                id,
            }),
            _ => Err(Error::Font(format!("Logical font {} was not registered", key))),
        }
    }

    /// Rewrite a form XObject into a new destination form with its own resources
    fn merge_form(&mut self, name: &[u8], id: ObjectId, stream: &Stream, depth: usize) -> Result<ResolvedResource> {
        let source = self.source;
        if self.stack.contains(&id) {
            return Err(Error::ResourceResolution {
                name: String::from_utf8_lossy(name).into_owned(),
                category: ResourceCategory::XObject,
                reason: "cyclic form XObject".to_string(),
            });
        }
        let max_depth = self.session.options.max_form_depth;
        if depth >= max_depth {
            return Err(Error::ResourceResolution {
                name: String::from_utf8_lossy(name).into_owned(),
                category: ResourceCategory::XObject,
                reason: format!("forms nested deeper than {}", max_depth),
            });
        }

        let new_id = self.session.doc.new_object_id();
        let resources = stream
            .dict
            .get(b"Resources")
            .ok()
            .and_then(|r| source.resolve_dict(r))
            .cloned()
            .unwrap_or_else(Dictionary::new);
        let bytes = stream_bytes(stream);

        self.stack.push(id);
        let mut local = Dictionary::new();
        let rewritten = self.rewrite_stream(&bytes, &resources, id, &mut local, depth + 1);
        self.stack.pop();
        let content = rewritten?;

        let mut dict = Dictionary::new();
        for (key, value) in stream.dict.iter() {
            if matches!(key.as_slice(), b"Resources" | b"Length" | b"Filter" | b"DecodeParms") {
                continue;
            }
            dict.set(key.clone(), copy_object(source, &mut self.session.doc, &mut self.session.copied, value)?);
        }
        dict.set("Resources", Object::Dictionary(local));
        self.session
            .doc
            .objects
            .insert(new_id, Object::Stream(Stream::new(dict, content)));

        Ok(ResolvedResource {
            name: destination_name(name, new_id),
            id: new_id,
        })
    }

    fn malformed(&self, reason: String) -> Error {
        Error::MalformedContentStream {
            source_key: self.source.key().to_string(),
            page: self.page.number,
            reason,
        }
    }
}

fn lookup_entry<'a>(
    source: &'a SourceDocument,
    category: ResourceCategory,
    name: &[u8],
    resources: &'a Dictionary,
) -> Option<&'a Object> {
    let entries = source.resolve_dict(resources.get(category.dict_key().as_bytes()).ok()?)?;
    entries.get(name).ok()
}

fn missing(category: ResourceCategory, name: &[u8]) -> Error {
    Error::ResourceResolution {
        name: String::from_utf8_lossy(name).into_owned(),
        category,
        reason: "not in the resource dictionary".to_string(),
    }
}

fn is_form(dict: &Dictionary) -> bool {
    matches!(dict.get(b"Subtype"), Ok(Object::Name(subtype)) if subtype == b"Form")
}

fn is_device_space(name: &[u8]) -> bool {
    matches!(name, b"DeviceGray" | b"DeviceRGB" | b"DeviceCMYK" | b"Pattern")
}

fn is_inline_device_space(name: &[u8]) -> bool {
    is_device_space(name) || matches!(name, b"G" | b"RGB" | b"CMYK")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdf::fixtures::{name, numbers, resources, standard_font, DocumentBuilder};
    use crate::pdf::postscript::PsFormRegistry;
    use crate::pdf::session::SessionOptions;

    fn names_in(resources: &Dictionary, category: &str) -> Vec<String> {
        match resources.get(category.as_bytes()) {
            Ok(Object::Dictionary(entries)) => entries
                .iter()
                .map(|(key, _)| String::from_utf8_lossy(key).into_owned())
                .collect(),
            _ => Vec::new(),
        }
    }

    fn rewrite(source: &SourceDocument, options: RewriteOptions) -> Result<(MergeSession, RewrittenPage, Dictionary)> {
        let mut session = MergeSession::new(SessionOptions::default());
        let mut dest_page = session.new_page([0.0, 0.0, 200.0, 300.0]);
        let mut transform = Transform::identity();
        let rewritten = session.rewrite_page(source, 1, &mut dest_page, &mut transform, options)?;
        Ok((session, rewritten, dest_page.resources))
    }

    fn text_page(content: &[u8]) -> SourceDocument {
        let mut builder = DocumentBuilder::new();
        let font = builder.doc.add_object(Object::Dictionary(standard_font("Helvetica")));
        let mut gs = Dictionary::new();
        gs.set("Type", name("ExtGState"));
        gs.set("CA", Object::Real(0.5));
        let gs = builder.doc.add_object(Object::Dictionary(gs));
        let cs = builder.doc.add_object(Object::Array(vec![name("ICCBased"), Object::Null]));
        let mut image = Dictionary::new();
        image.set("Type", name("XObject"));
        image.set("Subtype", name("Image"));
        image.set("Width", Object::Integer(1));
        image.set("Height", Object::Integer(1));
        image.set("BitsPerComponent", Object::Integer(8));
        image.set("ColorSpace", name("DeviceGray"));
        let image = builder.doc.add_object(Stream::new(image, vec![0]));

        let res = resources(&[
            ("Font", "F1", font),
            ("ExtGState", "GS1", gs),
            ("ColorSpace", "CS0", cs),
            ("XObject", "Im1", image),
        ]);
        builder.page(content, res, Dictionary::new());
        SourceDocument::from_document("text", builder.finish(Dictionary::new())).unwrap()
    }

    #[test]
    fn test_resource_names_rewritten() {
        let source = text_page(b"BT /F1 12 Tf (Hi) Tj ET /GS1 gs /CS0 cs /DeviceRGB CS /Im1 Do");
        let options = RewriteOptions {
            fonts: FontMode::Rekey,
            ..Default::default()
        };
        let (_, rewritten, resources) = rewrite(&source, options).unwrap();
        let text = String::from_utf8_lossy(&rewritten.content).into_owned();

        assert!(text.starts_with("q\n"));
        assert!(text.ends_with("\nQ\n"));
        assert!(text.contains("/DeviceRGB CS"));
        for (category, prefix) in [("Font", "F1_"), ("ExtGState", "GS1_"), ("ColorSpace", "CS0_"), ("XObject", "Im1_")] {
            let names = names_in(&resources, category);
            assert_eq!(names.len(), 1, "{}", category);
            assert!(names[0].starts_with(prefix));
            assert!(text.contains(&format!("/{} ", names[0])), "{} missing from {}", names[0], text);
        }
    }

    #[test]
    fn test_merged_font_uses_logical_name() {
        let source = text_page(b"BT /F1 12 Tf (Hi) Tj ET");
        let (session, rewritten, resources) = rewrite(&source, RewriteOptions::default()).unwrap();

        assert_eq!(names_in(&resources, "Font"), vec!["Helvetica_Type1_WinAnsiEncoding".to_string()]);
        assert!(String::from_utf8_lossy(&rewritten.content).contains("/Helvetica_Type1_WinAnsiEncoding 12 Tf"));
        assert_eq!(session.fonts().len(), 1);
    }

    #[test]
    fn test_missing_resource() {
        let source = text_page(b"/GS9 gs");
        match rewrite(&source, RewriteOptions::default()) {
            Err(Error::ResourceResolution { name, category, .. }) => {
                assert_eq!(name, "GS9");
                assert_eq!(category, ResourceCategory::ExtGState);
            }
            other => panic!("expected a resolution error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_operand_type_mismatch_is_malformed() {
        let source = text_page(b"BT 12 12 Tf ET");
        assert!(matches!(
            rewrite(&source, RewriteOptions::default()),
            Err(Error::MalformedContentStream { page: 1, .. })
        ));
    }

    #[test]
    fn test_truncated_content_is_malformed() {
        for content in [
            b"BT /F1 12 Tf (Hello) Tj ET 0 0 m (unterminated".as_slice(),
            b"BT /F1 12 Tf <4142 Tj",
            b"q 1 0 0 1 0 0 cm [1 2 Q",
            b"BT /F1 12 Tf ET }}} 1 1 l",
        ] {
            let source = text_page(content);
            assert!(
                matches!(
                    rewrite(&source, RewriteOptions::default()),
                    Err(Error::MalformedContentStream { page: 1, .. })
                ),
                "{}",
                String::from_utf8_lossy(content)
            );
        }
    }

    fn inline_images(content: &[u8]) -> Vec<(Dictionary, Vec<u8>)> {
        split_content(content)
            .unwrap()
            .into_iter()
            .filter_map(|segment| match segment {
                Segment::InlineImage { header, data } => {
                    let op = Content::decode(header).unwrap().operations.remove(0);
                    Some((inline_dictionary(&op.operands).unwrap(), data.to_vec()))
                }
                Segment::Operations { .. } => None,
            })
            .collect()
    }

    #[test]
    fn test_inline_image_color_space_rekeyed() {
        let source = text_page(b"q 5 0 0 5 0 0 cm BI /W 2 /H 1 /BPC 8 /CS /CS0 ID \x01\x02\x03\x04\x05\x06 EI Q");
        let (_, rewritten, resources) = rewrite(&source, RewriteOptions::default()).unwrap();
        assert!(!String::from_utf8_lossy(&rewritten.content).contains("stream"));

        let images = inline_images(&rewritten.content);
        assert_eq!(images.len(), 1);
        let (dict, data) = &images[0];
        assert_eq!(data, &[1, 2, 3, 4, 5, 6]);
        assert_eq!(dict.get(b"W").unwrap().as_i64().unwrap(), 2);

        let color_space = String::from_utf8_lossy(dict.get(b"CS").unwrap().as_name().unwrap()).into_owned();
        assert!(color_space.starts_with("CS0_"));
        assert_eq!(names_in(&resources, "ColorSpace"), vec![color_space]);
    }

    #[test]
    fn test_inline_image_device_space_untouched() {
        // Four gray samples that happen to spell " EI "
        let source = text_page(b"BI /W 4 /H 1 /BPC 8 /CS /G ID  EI  EI 0 0 m");
        let (_, rewritten, resources) = rewrite(&source, RewriteOptions::default()).unwrap();

        let images = inline_images(&rewritten.content);
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].1, b" EI ");
        assert_eq!(images[0].0.get(b"CS").unwrap().as_name().unwrap(), b"G");
        assert!(names_in(&resources, "ColorSpace").is_empty());
        assert!(String::from_utf8_lossy(&rewritten.content).contains("EI\n0 0 m"));
    }

    #[test]
    fn test_font_mode_kept_apart_in_cache() {
        let source = text_page(b"BT /F1 12 Tf (Hi) Tj ET");
        let mut session = MergeSession::new(SessionOptions::default());
        let mut names = Vec::new();
        for fonts in [FontMode::Rekey, FontMode::Merge] {
            let mut dest_page = session.new_page([0.0, 0.0, 200.0, 300.0]);
            let mut transform = Transform::identity();
            let options = RewriteOptions {
                fonts,
                ..Default::default()
            };
            session
                .rewrite_page(&source, 1, &mut dest_page, &mut transform, options)
                .unwrap();
            names.extend(names_in(&dest_page.resources, "Font"));
        }

        assert_eq!(names.len(), 2);
        assert!(names[0].starts_with("F1_"));
        assert_eq!(names[1], "Helvetica_Type1_WinAnsiEncoding");
    }

    #[test]
    fn test_mcids_renumbered_from_base() {
        let source = text_page(b"/P <</MCID 0>> BDC 0 0 m EMC /Span <</MCID 1>> BDC 1 1 m EMC");
        let options = RewriteOptions {
            mcid_base: Some(10),
            ..Default::default()
        };
        let (_, rewritten, _) = rewrite(&source, options).unwrap();
        let text = String::from_utf8_lossy(&rewritten.content).into_owned();

        assert!(text.contains("/MCID 10"));
        assert!(text.contains("/MCID 11"));
        assert_eq!(rewritten.mcids, BTreeMap::from([(0, 10), (1, 11)]));
        assert_eq!(rewritten.structure.len(), 2);
        assert!(rewritten.structure.iter().all(|entry| entry.element.is_none()));
    }

    #[test]
    fn test_clip_follows_opening_save() {
        let source = text_page(b"0 0 m");
        let options = RewriteOptions {
            clip: Rect::from_xywh(0.0, 0.0, 100.0, 50.0),
            ..Default::default()
        };
        let (_, rewritten, _) = rewrite(&source, options).unwrap();
        assert!(String::from_utf8_lossy(&rewritten.content).starts_with("q\n0 0 100 50 re W n\n"));
    }

    fn form_page(self_referencing: bool) -> SourceDocument {
        let mut builder = DocumentBuilder::new();
        let font = builder.doc.add_object(Object::Dictionary(standard_font("Courier")));
        let form_id = builder.doc.new_object_id();

        let mut form = Dictionary::new();
        form.set("Type", name("XObject"));
        form.set("Subtype", name("Form"));
        form.set("BBox", numbers(&[0, 0, 10, 10]));
        let form_resources = if self_referencing {
            resources(&[("Font", "F1", font), ("XObject", "X1", form_id)])
        } else {
            resources(&[("Font", "F1", font)])
        };
        form.set("Resources", Object::Dictionary(form_resources));
        let content: &[u8] = if self_referencing {
            b"BT /F1 9 Tf ET /X1 Do"
        } else {
            b"BT /F1 9 Tf (form) Tj ET"
        };
        builder
            .doc
            .objects
            .insert(form_id, Object::Stream(Stream::new(form, content.to_vec())));

        builder.page(b"/X1 Do /X1 Do", resources(&[("XObject", "X1", form_id)]), Dictionary::new());
        SourceDocument::from_document("forms", builder.finish(Dictionary::new())).unwrap()
    }

    #[test]
    fn test_form_rewritten_with_local_resources() {
        let source = form_page(false);
        let mut sink = PsFormRegistry::new();
        let options = RewriteOptions {
            fonts: FontMode::Rekey,
            forms: Some(&mut sink),
            ..Default::default()
        };
        let (session, _, resources) = rewrite(&source, options).unwrap();

        let names = names_in(&resources, "XObject");
        assert_eq!(names.len(), 1);
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.form_id(&names[0]), Some("EmbeddedForm:1"));

        let form_id = sink.object_for("EmbeddedForm:1").unwrap();
        let form = session.document().get_object(form_id).unwrap().as_stream().unwrap();
        let local = form.dict.get(b"Resources").unwrap().as_dict().unwrap();
        let fonts = names_in(local, "Font");
        assert_eq!(fonts.len(), 1);
        assert!(fonts[0].starts_with("F1_"));
        assert!(String::from_utf8_lossy(&form.content).contains(&format!("/{} 9 Tf", fonts[0])));
    }

    #[test]
    fn test_cyclic_form_rejected() {
        let source = form_page(true);
        match rewrite(&source, RewriteOptions::default()) {
            Err(Error::ResourceResolution { category, reason, .. }) => {
                assert_eq!(category, ResourceCategory::XObject);
                assert!(reason.contains("cyclic"));
            }
            other => panic!("expected a cycle error, got {:?}", other.map(|_| ())),
        }
    }
}

//! Merge sessions: everything that lives as long as one destination document
//!
//! A [`MergeSession`] owns the destination document together with the caches
//! that make repeated embeds cheap and consistent: resource names, copied
//! objects, logical fonts, the marked-content and struct-parent counters, the
//! link registries and the destination structure tree. Nothing is global, so
//! several sessions can be built side by side.

use std::collections::{BTreeMap, HashMap};
use log::{debug, info, warn};
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};
use tiny_skia_path::{Rect, Transform};
use crate::error::Result;
use crate::pdf::annotations::{LinkTransfer, PageNumberRegistry};
use crate::pdf::codec::{FontProgramCodec, SfntCodec};
use crate::pdf::content::{FontMode, RewriteOptions, RewrittenPage, Rewriter};
use crate::pdf::fonts::FontRegistry;
use crate::pdf::resources::{CopiedObjects, ResourceKeyCache};
use crate::pdf::source::{SourceDocument, SourcePage};
use crate::pdf::structure::{find_parent_tree_array, ParentTreeEntry, StructureCheckpoint, StructureTree};
use crate::pdf::transform::{cm_operator, placement, Rotation};

/// Options fixed for the lifetime of a session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Deepest chain of nested form XObjects that is followed
    pub max_form_depth: usize,
    /// Share one destination copy between structurally equal graphics states and color spaces
    pub collapse_equal_resources: bool,
    /// Version written into the destination header
    pub pdf_version: String,
    /// Compress streams when finishing
    pub compress: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_form_depth: 16,
            collapse_equal_resources: true,
            pdf_version: "1.5".to_string(),
            compress: true,
        }
    }
}

/// A destination page being filled
///
/// The page object id is reserved up front so links and structure elements can
/// point at the page before it is written by [`MergeSession::finish_page`].
#[derive(Debug, Clone)]
pub struct DestinationPage {
    pub id: ObjectId,
    pub media_box: [f32; 4],
    pub resources: Dictionary,
    pub annots: Vec<Object>,
    pub struct_parents: Option<i64>,
    pub contents: Vec<u8>,
    next_mcid: i64,
    parent_slots: Vec<Option<ObjectId>>,
}

impl DestinationPage {
    pub fn push_content(&mut self, bytes: &[u8]) {
        self.contents.extend_from_slice(bytes);
    }

    /// MCID the next embedded page continues from
    pub fn next_mcid(&self) -> i64 {
        self.next_mcid
    }
}

/// Where and how [`MergeSession::embed_page`] places a page
#[derive(Debug, Clone, Default)]
pub struct EmbedPlacement {
    /// Placement rectangle; defaults to the whole destination page
    pub target: Option<Rect>,
    /// Destination page size; defaults to the rotated view box
    pub page_size: Option<[f32; 2]>,
    /// Clip to the source view box
    pub clip: bool,
    pub fonts: FontMode,
}

struct Snapshot {
    max_id: u32,
    cache: usize,
    copied: usize,
    fonts: usize,
    links: usize,
    structure: StructureCheckpoint,
    next_struct_parent: i64,
}

/// State of one destination document under construction
pub struct MergeSession {
    pub(crate) doc: Document,
    pub(crate) cache: ResourceKeyCache,
    pub(crate) copied: CopiedObjects,
    pub(crate) fonts: FontRegistry,
    pub(crate) codec: Box<dyn FontProgramCodec>,
    pub(crate) options: SessionOptions,
    page_numbers: HashMap<String, PageNumberRegistry>,
    structure: StructureTree,
    next_struct_parent: i64,
    pages_id: ObjectId,
    pages: Vec<ObjectId>,
}

impl MergeSession {
    /// A session merging TrueType programs with the built-in codec
    pub fn new(options: SessionOptions) -> Self {
        Self::with_codec(options, Box::new(SfntCodec::new()))
    }

    pub fn with_codec(options: SessionOptions, codec: Box<dyn FontProgramCodec>) -> Self {
        let mut doc = Document::with_version(options.pdf_version.as_str());
        let pages_id = doc.new_object_id();
        Self {
            doc,
            cache: ResourceKeyCache::new(),
            copied: CopiedObjects::default(),
            fonts: FontRegistry::new(),
            codec,
            options,
            page_numbers: HashMap::new(),
            structure: StructureTree::new(),
            next_struct_parent: 0,
            pages_id,
            pages: Vec::new(),
        }
    }

    /// Reserve a destination page
    pub fn new_page(&mut self, media_box: [f32; 4]) -> DestinationPage {
        DestinationPage {
            id: self.doc.new_object_id(),
            media_box,
            resources: Dictionary::new(),
            annots: Vec::new(),
            struct_parents: None,
            contents: Vec::new(),
            next_mcid: 0,
            parent_slots: Vec::new(),
        }
    }

    /// Rewrite a source page for drawing on `dest_page`
    ///
    /// Resources, links and structure are registered on `dest_page`; the
    /// returned content still has to be drawn under `transform`, which is
    /// replaced by the effective source-to-destination transform. On error
    /// nothing the call added to the session survives.
    pub fn rewrite_page(
        &mut self,
        source: &SourceDocument,
        page_number: u32,
        dest_page: &mut DestinationPage,
        transform: &mut Transform,
        options: RewriteOptions,
    ) -> Result<RewrittenPage> {
        let page = source.page(page_number)?;
        let rotation = Rotation::from_degrees(page.number, page.rotation)?;
        let effective = transform.pre_concat(placement(page.view_box(), rotation, options.target));
        let parents = find_parent_tree_array(source, &page)?;

        let snapshot = self.snapshot(source.key());
        match self.rewrite_into(source, &page, &parents, dest_page, effective, options) {
            Ok(rewritten) => {
                *transform = effective;
                Ok(rewritten)
            }
            Err(err) => {
                warn!("Page {} of {} not embedded: {}", page_number, source.key(), err);
                self.restore(source.key(), snapshot);
                Err(err)
            }
        }
    }

    fn rewrite_into(
        &mut self,
        source: &SourceDocument,
        page: &SourcePage,
        parents: &[ParentTreeEntry],
        dest_page: &mut DestinationPage,
        transform: Transform,
        options: RewriteOptions,
    ) -> Result<RewrittenPage> {
        let first_mcid = options.mcid_base.unwrap_or(dest_page.next_mcid);
        let mut resources = dest_page.resources.clone();
        let content = Rewriter::new(self, source, page, parents, options.fonts, options.forms, first_mcid)
            .rewrite_page(&mut resources, options.clip)?;

        let mut slots = dest_page.parent_slots.clone();
        let mut struct_parents = dest_page.struct_parents;
        let mut adopted = BTreeMap::new();
        for entry in &content.structure {
            let Some(element) = entry.element else {
                continue;
            };
            let copy = match adopted.get(&element) {
                Some(copy) => *copy,
                None => {
                    let copy = self.structure.adopt_element(
                        source,
                        &mut self.doc,
                        &mut self.copied,
                        element,
                        page.id,
                        dest_page.id,
                        &content.mcids,
                    )?;
                    adopted.insert(element, copy);
                    copy
                }
            };
            let Ok(index) = usize::try_from(entry.mcid) else {
                continue;
            };
            if slots.len() <= index {
                slots.resize(index + 1, None);
            }
            slots[index] = Some(copy);
        }
        if !adopted.is_empty() && struct_parents.is_none() {
            struct_parents = Some(self.next_struct_parent);
            self.next_struct_parent += 1;
        }

        let registry = self.page_numbers.entry(source.key().to_string()).or_default();
        let (annots, annotations) = LinkTransfer {
            source,
            page,
            dest: &mut self.doc,
            copied: &mut self.copied,
            registry,
            structure: &mut self.structure,
            next_struct_parent: &mut self.next_struct_parent,
            transform,
            dest_page: dest_page.id,
            mcids: &content.mcids,
        }
        .run()?;

        if let Some(key) = struct_parents {
            self.structure.add_page(key, slots.clone());
        }
        dest_page.resources = resources;
        dest_page.annots.extend(annots);
        dest_page.struct_parents = struct_parents;
        dest_page.parent_slots = slots;
        dest_page.next_mcid = dest_page.next_mcid.max(content.next_mcid);

        Ok(RewrittenPage {
            content: content.content,
            transform,
            structure: content.structure,
            mcids: content.mcids,
            annotations,
        })
    }

    fn snapshot(&self, source_key: &str) -> Snapshot {
        Snapshot {
            max_id: self.doc.max_id,
            cache: self.cache.checkpoint(),
            copied: self.copied.checkpoint(),
            fonts: self.fonts.checkpoint(),
            links: self.page_numbers.get(source_key).map_or(0, PageNumberRegistry::checkpoint),
            structure: self.structure.checkpoint(),
            next_struct_parent: self.next_struct_parent,
        }
    }

    fn restore(&mut self, source_key: &str, snapshot: Snapshot) {
        self.cache.rollback(snapshot.cache);
        self.copied.rollback(snapshot.copied);
        self.fonts.rollback(snapshot.fonts);
        if let Some(registry) = self.page_numbers.get_mut(source_key) {
            registry.rollback(snapshot.links);
        }
        self.structure.rollback(&mut self.doc, snapshot.structure, snapshot.next_struct_parent);
        self.next_struct_parent = snapshot.next_struct_parent;
        // Ids stay reserved so nothing handed out earlier is reused
        self.doc.objects.retain(|id, _| id.0 <= snapshot.max_id);
    }

    /// Embed one source page as a new destination page, returning the page id
    ///
    /// Links elsewhere that point at this source page are patched to the new page.
    pub fn embed_page(&mut self, source: &SourceDocument, page_number: u32, placement: &EmbedPlacement) -> Result<ObjectId> {
        let page = source.page(page_number)?;
        let rotation = Rotation::from_degrees(page.number, page.rotation)?;
        let view_box = page.view_box();
        let (width, height) = (view_box[2] - view_box[0], view_box[3] - view_box[1]);
        let size = placement.page_size.unwrap_or(if rotation.swaps_axes() {
            [height, width]
        } else {
            [width, height]
        });

        let target = placement
            .target
            .or_else(|| placement.page_size.and_then(|[w, h]| Rect::from_xywh(0.0, 0.0, w, h)));
        let clip = if placement.clip {
            Rect::from_ltrb(view_box[0], view_box[1], view_box[2], view_box[3])
        } else {
            None
        };

        let mut dest_page = self.new_page([0.0, 0.0, size[0], size[1]]);
        let mut transform = Transform::identity();
        let options = RewriteOptions {
            fonts: placement.fonts,
            clip,
            target,
            ..Default::default()
        };
        let rewritten = self.rewrite_page(source, page_number, &mut dest_page, &mut transform, options)?;

        dest_page.push_content(b"q\n");
        dest_page.push_content(cm_operator(&transform).as_bytes());
        dest_page.push_content(&rewritten.content);
        dest_page.push_content(b"Q\n");

        let id = self.finish_page(dest_page);
        self.assign_page_number(source.key(), page.number - 1, id)?;
        debug!("Embedded page {} of {} as {:?}", page_number, source.key(), id);
        Ok(id)
    }

    /// Write a destination page into the document and append it to the page tree
    pub fn finish_page(&mut self, page: DestinationPage) -> ObjectId {
        let content_id = self.doc.add_object(Stream::new(Dictionary::new(), page.contents));

        let mut dict = Dictionary::new();
        dict.set("Type", Object::Name(b"Page".to_vec()));
        dict.set("Parent", Object::Reference(self.pages_id));
        dict.set("MediaBox", Object::Array(page.media_box.iter().map(|v| Object::Real(*v)).collect()));
        dict.set("Resources", Object::Dictionary(page.resources));
        dict.set("Contents", Object::Reference(content_id));
        if !page.annots.is_empty() {
            dict.set("Annots", Object::Array(page.annots));
        }
        if let Some(key) = page.struct_parents {
            dict.set("StructParents", Object::Integer(key));
            dict.set("Tabs", Object::Name(b"S".to_vec()));
        }

        self.doc.objects.insert(page.id, Object::Dictionary(dict));
        self.pages.push(page.id);
        page.id
    }

    /// Record that source page `index` (0-based) of `source_key` landed on `page`
    ///
    /// Returns how many link destinations were patched.
    pub fn assign_page_number(&mut self, source_key: &str, index: u32, page: ObjectId) -> Result<usize> {
        self.page_numbers
            .entry(source_key.to_string())
            .or_default()
            .assign(index, page, &mut self.doc)
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    pub fn fonts(&self) -> &FontRegistry {
        &self.fonts
    }

    pub fn cache(&self) -> &ResourceKeyCache {
        &self.cache
    }

    pub fn structure(&self) -> &StructureTree {
        &self.structure
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Link registry of one source document
    pub fn page_numbers(&self, source_key: &str) -> Option<&PageNumberRegistry> {
        self.page_numbers.get(source_key)
    }

    /// Pages written so far
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Write fonts, structure tree, page tree and catalog, and hand over the document
    pub fn finish(mut self) -> Result<Document> {
        self.fonts.finish(&mut self.doc)?;

        for (key, registry) in &self.page_numbers {
            let unresolved = registry.unresolved();
            if !unresolved.is_empty() {
                warn!("Links into {} target pages that were never placed: {:?}", key, unresolved);
            }
        }

        let mut pages = Dictionary::new();
        pages.set("Type", Object::Name(b"Pages".to_vec()));
        pages.set("Kids", Object::Array(self.pages.iter().map(|id| Object::Reference(*id)).collect()));
        pages.set("Count", Object::Integer(self.pages.len() as i64));
        self.doc.objects.insert(self.pages_id, Object::Dictionary(pages));

        let mut catalog = Dictionary::new();
        catalog.set("Type", Object::Name(b"Catalog".to_vec()));
        catalog.set("Pages", Object::Reference(self.pages_id));
        self.structure.finish(&mut self.doc, &mut catalog)?;
        let catalog_id = self.doc.add_object(Object::Dictionary(catalog));
        self.doc.trailer.set("Root", Object::Reference(catalog_id));

        if self.options.compress {
            self.doc.compress();
        }

        info!("Finished document: {} pages, {} fonts", self.pages.len(), self.fonts.len());
        Ok(self.doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::pdf::fixtures::{name, numbers, resources, standard_font, DocumentBuilder};
    use crate::pdf::transform::map_rect;

    fn rotated_source(rotate: i64) -> SourceDocument {
        let mut builder = DocumentBuilder::new();
        let font = builder.doc.add_object(Object::Dictionary(standard_font("Times-Roman")));
        let mut extra = Dictionary::new();
        extra.set("Rotate", Object::Integer(rotate));
        builder.page(b"BT /F1 10 Tf (a) Tj ET", resources(&[("Font", "F1", font)]), extra);
        SourceDocument::from_document("rotated", builder.finish(Dictionary::new())).unwrap()
    }

    fn media_box(doc: &Document, page: ObjectId) -> Vec<f32> {
        doc.get_dictionary(page)
            .unwrap()
            .get(b"MediaBox")
            .unwrap()
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_float().unwrap())
            .collect()
    }

    #[test]
    fn test_embed_rotated_page_swaps_size() {
        let source = rotated_source(90);
        let mut session = MergeSession::new(SessionOptions::default());
        let id = session.embed_page(&source, 1, &EmbedPlacement::default()).unwrap();
        assert_eq!(media_box(session.document(), id), vec![0.0, 0.0, 300.0, 200.0]);
        assert_eq!(session.page_count(), 1);
    }

    #[test]
    fn test_transform_replaced_by_effective_placement() {
        let source = rotated_source(270);
        let mut session = MergeSession::new(SessionOptions::default());
        let mut dest_page = session.new_page([0.0, 0.0, 612.0, 792.0]);
        let mut transform = Transform::from_translate(5.0, 5.0);
        let options = RewriteOptions {
            target: Rect::from_xywh(10.0, 20.0, 150.0, 100.0),
            ..Default::default()
        };
        let rewritten = session
            .rewrite_page(&source, 1, &mut dest_page, &mut transform, options)
            .unwrap();

        assert_eq!(rewritten.transform, transform);
        let placed = map_rect(&transform, [0.0, 0.0, 200.0, 300.0]);
        for (actual, expected) in placed.iter().zip([15.0, 25.0, 165.0, 125.0]) {
            assert!((actual - expected).abs() < 0.001, "{:?}", placed);
        }
    }

    #[test]
    fn test_unsupported_rotation() {
        let source = rotated_source(45);
        let mut session = MergeSession::new(SessionOptions::default());
        assert!(matches!(
            session.embed_page(&source, 1, &EmbedPlacement::default()),
            Err(Error::UnsupportedRotation { page: 1, rotation: 45 })
        ));
    }

    /// Two tagged pages sharing paragraph `P`; page 2 also marks content whose
    /// element reference dangles
    fn shared_paragraph_source() -> (SourceDocument, ObjectId) {
        let mut builder = DocumentBuilder::new();
        let paragraph = builder.doc.new_object_id();
        let dangling = builder.doc.new_object_id();

        let tagged = |key: i64| {
            let mut extra = Dictionary::new();
            extra.set("StructParents", Object::Integer(key));
            extra
        };
        let first = builder.page(b"/P <</MCID 0>> BDC 0 0 m EMC", Dictionary::new(), tagged(0));
        let second = builder.page(
            b"/P <</MCID 0>> BDC 0 0 m EMC /P <</MCID 1>> BDC 1 1 m EMC",
            Dictionary::new(),
            tagged(1),
        );

        let mcr = |page: ObjectId| {
            let mut mcr = Dictionary::new();
            mcr.set("Type", name("MCR"));
            mcr.set("Pg", Object::Reference(page));
            mcr.set("MCID", Object::Integer(0));
            Object::Dictionary(mcr)
        };
        let mut element = Dictionary::new();
        element.set("Type", name("StructElem"));
        element.set("S", name("P"));
        element.set("K", Object::Array(vec![mcr(first), mcr(second)]));
        builder.doc.objects.insert(paragraph, Object::Dictionary(element));

        let mut parent_tree = Dictionary::new();
        parent_tree.set(
            "Nums",
            Object::Array(vec![
                Object::Integer(0),
                Object::Array(vec![Object::Reference(paragraph)]),
                Object::Integer(1),
                Object::Array(vec![Object::Reference(paragraph), Object::Reference(dangling)]),
            ]),
        );
        let mut root = Dictionary::new();
        root.set("Type", name("StructTreeRoot"));
        root.set("ParentTree", Object::Dictionary(parent_tree));
        let mut catalog = Dictionary::new();
        catalog.set("StructTreeRoot", Object::Dictionary(root));

        let source = SourceDocument::from_document("shared", builder.finish(catalog)).unwrap();
        (source, paragraph)
    }

    #[test]
    fn test_failed_page_restores_shared_element() {
        let (source, paragraph) = shared_paragraph_source();
        let mut session = MergeSession::new(SessionOptions::default());
        session.embed_page(&source, 1, &EmbedPlacement::default()).unwrap();

        let copy = session.structure.element("shared", paragraph).unwrap();
        let kids_before = session.document().get_dictionary(copy).unwrap().get(b"K").unwrap().clone();
        assert_eq!(kids_before, Object::Array(vec![Object::Integer(0)]));

        assert!(session.embed_page(&source, 2, &EmbedPlacement::default()).is_err());
        let kids_after = session.document().get_dictionary(copy).unwrap().get(b"K").unwrap();
        assert_eq!(kids_after, &kids_before);
        assert_eq!(session.structure.parent_tree_len(), 1);
        assert_eq!(session.page_count(), 1);
    }

    #[test]
    fn test_dangling_link_destination_dropped() {
        let mut builder = DocumentBuilder::new();
        let missing = builder.doc.new_object_id();
        let mut link = Dictionary::new();
        link.set("Type", name("Annot"));
        link.set("Subtype", name("Link"));
        link.set("Rect", numbers(&[0, 0, 10, 10]));
        link.set("Dest", Object::Reference(missing));
        let link = builder.doc.add_object(Object::Dictionary(link));
        let mut extra = Dictionary::new();
        extra.set("Annots", Object::Array(vec![Object::Reference(link)]));
        builder.page(b"0 0 m", Dictionary::new(), extra);
        let source = SourceDocument::from_document("links", builder.finish(Dictionary::new())).unwrap();

        let mut session = MergeSession::new(SessionOptions::default());
        let mut dest_page = session.new_page([0.0, 0.0, 200.0, 300.0]);
        let mut transform = Transform::identity();
        session
            .rewrite_page(&source, 1, &mut dest_page, &mut transform, RewriteOptions::default())
            .unwrap();

        assert_eq!(dest_page.annots.len(), 1);
        let Object::Reference(annot) = dest_page.annots[0] else {
            panic!("expected an annotation reference");
        };
        let annot = session.document().get_dictionary(annot).unwrap();
        assert!(!annot.has(b"Dest"));
        assert!(annot.has(b"Rect"));
    }

    #[test]
    fn test_failed_page_leaves_session_untouched() {
        let mut builder = DocumentBuilder::new();
        let font = builder.doc.add_object(Object::Dictionary(standard_font("Courier")));
        let res = resources(&[("Font", "F1", font)]);
        builder.page(b"BT /F1 10 Tf ET /Missing Do", res.clone(), Dictionary::new());
        builder.page(b"BT /F1 10 Tf ET", res, Dictionary::new());
        let source = SourceDocument::from_document("partial", builder.finish(Dictionary::new())).unwrap();

        let mut session = MergeSession::new(SessionOptions::default());
        let objects_before = session.document().objects.len();
        let err = session.embed_page(&source, 1, &EmbedPlacement::default()).unwrap_err();
        assert!(matches!(err, Error::ResourceResolution { .. }));
        assert_eq!(session.document().objects.len(), objects_before);
        assert!(session.cache().is_empty());
        assert!(session.fonts().is_empty());

        // The next page still goes through and gets fresh ids
        session.embed_page(&source, 2, &EmbedPlacement::default()).unwrap();
        assert_eq!(session.fonts().len(), 1);
        assert_eq!(session.page_count(), 1);
    }

    #[test]
    fn test_finish_writes_page_tree() {
        let source = rotated_source(0);
        let mut session = MergeSession::new(SessionOptions {
            compress: false,
            ..Default::default()
        });
        session.embed_page(&source, 1, &EmbedPlacement::default()).unwrap();
        session.embed_page(&source, 1, &EmbedPlacement::default()).unwrap();
        let doc = session.finish().unwrap();

        assert_eq!(doc.get_pages().len(), 2);
        let catalog = doc.catalog().unwrap();
        assert!(catalog.get(b"StructTreeRoot").is_err());

        // Both pages share one font object
        let fonts: Vec<_> = doc
            .get_pages()
            .values()
            .map(|id| {
                let page = doc.get_dictionary(*id).unwrap();
                let resources = page.get(b"Resources").unwrap().as_dict().unwrap();
                resources.get(b"Font").unwrap().as_dict().unwrap().clone()
            })
            .collect();
        assert_eq!(fonts[0], fonts[1]);
        assert_eq!(
            doc.get_dictionary(fonts[0].get(b"Times-Roman_Type1_WinAnsiEncoding").unwrap().as_reference().unwrap())
                .unwrap()
                .get(b"BaseFont")
                .unwrap(),
            &name("Times-Roman")
        );
    }
}

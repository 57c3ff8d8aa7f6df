//! Destination resource naming, caching and object copying
//!
//! Every source resource is registered at most once per destination document.
//! The cache is keyed by an explicit identity (source document key, object id or
//! page-local name, category) rather than by object equality, so the same image
//! used on ten pages is copied once and always gets the same destination name.
//! Fonts and forms also carry the font mode they were placed with.

use std::collections::HashMap;
use std::fmt;
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};
use crate::error::Result;
use crate::pdf::content::FontMode;
use crate::pdf::source::SourceDocument;

/// Resource dictionary categories that content operators refer to by name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceCategory {
    Font,
    XObject,
    ExtGState,
    ColorSpace,
    Pattern,
    Shading,
    Properties,
}

impl ResourceCategory {
    pub const ALL: [ResourceCategory; 7] = [
        ResourceCategory::Font,
        ResourceCategory::XObject,
        ResourceCategory::ExtGState,
        ResourceCategory::ColorSpace,
        ResourceCategory::Pattern,
        ResourceCategory::Shading,
        ResourceCategory::Properties,
    ];

    /// Key of this category inside a `/Resources` dictionary
    pub fn dict_key(self) -> &'static str {
        match self {
            ResourceCategory::Font => "Font",
            ResourceCategory::XObject => "XObject",
            ResourceCategory::ExtGState => "ExtGState",
            ResourceCategory::ColorSpace => "ColorSpace",
            ResourceCategory::Pattern => "Pattern",
            ResourceCategory::Shading => "Shading",
            ResourceCategory::Properties => "Properties",
        }
    }
}

impl fmt::Display for ResourceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dict_key())
    }
}

/// Where a source resource lives
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceOrigin {
    /// An indirect object, shared by every dictionary that references it
    Object(ObjectId),
    /// A direct object, only meaningful inside the dictionary owned by `owner`
    Direct { owner: ObjectId, name: Vec<u8> },
}

/// Identity of one source resource within a merge session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub source: String,
    pub origin: ResourceOrigin,
    pub category: ResourceCategory,
    /// Set for fonts and forms, whose destination copy depends on the font mode
    pub fonts: Option<FontMode>,
}

/// A destination resource: its name and the object it points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedResource {
    pub name: String,
    pub id: ObjectId,
}

/// Session-wide registry of resources already placed in the destination
#[derive(Debug, Default)]
pub struct ResourceKeyCache {
    names: HashMap<ResourceKey, ResolvedResource>,
    by_value: HashMap<(ResourceCategory, Vec<u8>), ResolvedResource>,
    journal: Vec<Entry>,
}

#[derive(Debug)]
enum Entry {
    Name(ResourceKey),
    Value((ResourceCategory, Vec<u8>)),
}

impl ResourceKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ResourceKey) -> Option<&ResolvedResource> {
        self.names.get(key)
    }

    pub fn insert(&mut self, key: ResourceKey, resolved: ResolvedResource) {
        self.journal.push(Entry::Name(key.clone()));
        self.names.insert(key, resolved);
    }

    /// A resource already registered with an identical fingerprint
    pub fn get_by_value(&self, category: ResourceCategory, fingerprint: &[u8]) -> Option<&ResolvedResource> {
        self.by_value.get(&(category, fingerprint.to_vec()))
    }

    pub fn insert_by_value(&mut self, category: ResourceCategory, fingerprint: Vec<u8>, resolved: ResolvedResource) {
        let key = (category, fingerprint);
        self.journal.push(Entry::Value(key.clone()));
        self.by_value.insert(key, resolved);
    }

    /// Number of distinct source resources registered
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Position to roll back to if the current page fails
    pub(crate) fn checkpoint(&self) -> usize {
        self.journal.len()
    }

    /// Forget everything registered since `checkpoint`
    pub(crate) fn rollback(&mut self, checkpoint: usize) {
        for entry in self.journal.drain(checkpoint..) {
            match entry {
                Entry::Name(key) => {
                    self.names.remove(&key);
                }
                Entry::Value(key) => {
                    self.by_value.remove(&key);
                }
            }
        }
    }
}

/// Destination name for a resource: the source name plus the destination object number
///
/// Object numbers are unique within the destination document, so names built this
/// way cannot collide across pages. The separator keeps `F1` + `23` apart from `F12` + `3`.
pub fn destination_name(source_name: &[u8], id: ObjectId) -> String {
    format!("{}_{}", String::from_utf8_lossy(source_name), id.0)
}

/// Add `name -> id` under `category` in a destination resource dictionary
pub fn register_in(resources: &mut Dictionary, category: ResourceCategory, name: &str, id: ObjectId) {
    let mut entries = match resources.get(category.dict_key().as_bytes()) {
        Ok(Object::Dictionary(existing)) => existing.clone(),
        _ => Dictionary::new(),
    };
    entries.set(name.as_bytes().to_vec(), Object::Reference(id));
    resources.set(category.dict_key(), Object::Dictionary(entries));
}

/// Keys whose indirect values tie an object to its source page or tree
///
/// They are dropped while copying so that copying an annotation or a structure
/// element never drags the source page tree along.
const DETACHED_KEYS: [&[u8]; 6] = [b"Parent", b"P", b"Pg", b"Popup", b"StructParent", b"StructParents"];

/// Source objects already copied into the destination, per source document
#[derive(Debug, Default)]
pub struct CopiedObjects {
    map: HashMap<(String, ObjectId), ObjectId>,
    journal: Vec<(String, ObjectId)>,
}

impl CopiedObjects {
    pub fn get(&self, source: &str, id: ObjectId) -> Option<ObjectId> {
        self.map.get(&(source.to_string(), id)).copied()
    }

    fn insert(&mut self, source: &str, id: ObjectId, copy: ObjectId) {
        let key = (source.to_string(), id);
        self.journal.push(key.clone());
        self.map.insert(key, copy);
    }

    pub(crate) fn checkpoint(&self) -> usize {
        self.journal.len()
    }

    pub(crate) fn rollback(&mut self, checkpoint: usize) {
        for key in self.journal.drain(checkpoint..) {
            self.map.remove(&key);
        }
    }
}

/// Deep copy an object from a source document into the destination document
///
/// Indirect objects are copied once per session and keep their identity: the new
/// object id is reserved before its content is copied, so reference cycles
/// terminate. Streams keep their encoded content and filters.
pub fn copy_object(
    source: &SourceDocument,
    dest: &mut Document,
    copied: &mut CopiedObjects,
    object: &Object,
) -> Result<Object> {
    match object {
        Object::Reference(id) => {
            if let Some(new_id) = copied.get(source.key(), *id) {
                return Ok(Object::Reference(new_id));
            }

            // Dangling references become null, as a reader would treat them
            let referenced = match source.document().get_object(*id) {
                Ok(referenced) => referenced,
                Err(_) => return Ok(Object::Null),
            };

            let new_id = dest.new_object_id();
            copied.insert(source.key(), *id, new_id);
            let copy = copy_object(source, dest, copied, referenced)?;
            dest.objects.insert(new_id, copy);

            Ok(Object::Reference(new_id))
        }
        Object::Dictionary(dict) => Ok(Object::Dictionary(copy_dictionary(source, dest, copied, dict)?)),
        Object::Array(items) => {
            let copies: Result<Vec<_>> = items
                .iter()
                .map(|item| copy_object(source, dest, copied, item))
                .collect();
            Ok(Object::Array(copies?))
        }
        Object::Stream(stream) => Ok(Object::Stream(Stream {
            dict: copy_dictionary(source, dest, copied, &stream.dict)?,
            content: stream.content.clone(),
            allows_compression: stream.allows_compression,
            start_position: None,
        })),
        // Primitive types: just clone
        _ => Ok(object.clone()),
    }
}

/// Deep copy a dictionary, leaving out indirect back-links to the source page tree
pub fn copy_dictionary(
    source: &SourceDocument,
    dest: &mut Document,
    copied: &mut CopiedObjects,
    dict: &Dictionary,
) -> Result<Dictionary> {
    let mut new_dict = Dictionary::new();
    for (key, value) in dict.iter() {
        if matches!(value, Object::Reference(_)) && DETACHED_KEYS.contains(&key.as_slice()) {
            continue;
        }
        new_dict.set(key.clone(), copy_object(source, dest, copied, value)?);
    }
    Ok(new_dict)
}

/// Structural fingerprint of a source object
///
/// Dictionary keys are visited in sorted order and references are written as
/// `(source key, object id)` without being followed. Two resources with equal
/// fingerprints render identically, so one destination copy can serve both.
pub fn fingerprint(source_key: &str, object: &Object) -> Vec<u8> {
    let mut out = Vec::new();
    write_fingerprint(source_key, object, &mut out);
    out
}

fn write_fingerprint(source_key: &str, object: &Object, out: &mut Vec<u8>) {
    match object {
        Object::Null => out.extend_from_slice(b"N;"),
        Object::Boolean(value) => out.extend_from_slice(if *value { b"T;" } else { b"F;" }),
        Object::Integer(value) => out.extend_from_slice(format!("i{};", value).as_bytes()),
        Object::Real(value) => out.extend_from_slice(format!("r{};", value).as_bytes()),
        Object::Name(name) => {
            out.push(b'/');
            out.extend_from_slice(format!("{}:", name.len()).as_bytes());
            out.extend_from_slice(name);
        }
        Object::String(bytes, _) => {
            out.push(b'(');
            out.extend_from_slice(format!("{}:", bytes.len()).as_bytes());
            out.extend_from_slice(bytes);
        }
        Object::Array(items) => {
            out.push(b'[');
            for item in items {
                write_fingerprint(source_key, item, out);
            }
            out.push(b']');
        }
        Object::Dictionary(dict) => write_dict_fingerprint(source_key, dict, out),
        Object::Stream(stream) => {
            write_dict_fingerprint(source_key, &stream.dict, out);
            out.extend_from_slice(format!("s{}:", stream.content.len()).as_bytes());
            out.extend_from_slice(&stream.content);
        }
        Object::Reference(id) => {
            out.extend_from_slice(format!("R{}:{}:{} {};", source_key.len(), source_key, id.0, id.1).as_bytes());
        }
    }
}

fn write_dict_fingerprint(source_key: &str, dict: &Dictionary, out: &mut Vec<u8>) {
    let mut entries: Vec<_> = dict.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    out.push(b'<');
    for (key, value) in entries {
        out.extend_from_slice(format!("{}:", key.len()).as_bytes());
        out.extend_from_slice(key);
        write_fingerprint(source_key, value, out);
    }
    out.push(b'>');
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source_with_cycle() -> (SourceDocument, ObjectId) {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let a_id = doc.new_object_id();
        let b_id = doc.new_object_id();

        let mut a = Dictionary::new();
        a.set("Next", Object::Reference(b_id));
        a.set("Parent", Object::Reference(pages_id));
        doc.objects.insert(a_id, Object::Dictionary(a));
        let mut b = Dictionary::new();
        b.set("Next", Object::Reference(a_id));
        doc.objects.insert(b_id, Object::Dictionary(b));

        let mut page = Dictionary::new();
        page.set("Type", Object::Name(b"Page".to_vec()));
        page.set("Parent", Object::Reference(pages_id));
        let page_id = doc.add_object(Object::Dictionary(page));
        let mut pages = Dictionary::new();
        pages.set("Type", Object::Name(b"Pages".to_vec()));
        pages.set("Kids", Object::Array(vec![Object::Reference(page_id)]));
        pages.set("Count", Object::Integer(1));
        doc.objects.insert(pages_id, Object::Dictionary(pages));
        let mut catalog = Dictionary::new();
        catalog.set("Type", Object::Name(b"Catalog".to_vec()));
        catalog.set("Pages", Object::Reference(pages_id));
        let catalog_id = doc.add_object(Object::Dictionary(catalog));
        doc.trailer.set("Root", Object::Reference(catalog_id));

        (SourceDocument::from_document("cycle", doc).unwrap(), a_id)
    }

    #[test]
    fn test_copy_handles_cycles_and_detaches_parent() {
        let (source, a_id) = source_with_cycle();
        let mut dest = Document::with_version("1.5");
        let mut copied = CopiedObjects::default();

        let copy = copy_object(&source, &mut dest, &mut copied, &Object::Reference(a_id)).unwrap();
        let new_a = match copy {
            Object::Reference(id) => id,
            other => panic!("expected reference, got {:?}", other),
        };

        // a and b copied once each, Parent left behind
        assert_eq!(dest.objects.len(), 2);
        let a = dest.get_dictionary(new_a).unwrap();
        assert!(!a.has(b"Parent"));

        // Copying again reuses the same object
        let again = copy_object(&source, &mut dest, &mut copied, &Object::Reference(a_id)).unwrap();
        assert_eq!(again, Object::Reference(new_a));
        assert_eq!(dest.objects.len(), 2);
    }

    #[test]
    fn test_destination_names_do_not_collide() {
        assert_eq!(destination_name(b"F1", (23, 0)), "F1_23");
        assert_ne!(destination_name(b"F1", (23, 0)), destination_name(b"F12", (3, 0)));
    }

    #[test]
    fn test_fingerprint_ignores_key_order() {
        let mut first = Dictionary::new();
        first.set("CA", Object::Real(0.5));
        first.set("ca", Object::Real(0.5));
        let mut second = Dictionary::new();
        second.set("ca", Object::Real(0.5));
        second.set("CA", Object::Real(0.5));
        assert_eq!(
            fingerprint("doc", &Object::Dictionary(first.clone())),
            fingerprint("doc", &Object::Dictionary(second))
        );

        first.set("SMask", Object::Reference((4, 0)));
        assert_ne!(
            fingerprint("a.pdf", &Object::Dictionary(first.clone())),
            fingerprint("b.pdf", &Object::Dictionary(first))
        );
    }

    #[test]
    fn test_cache_rollback() {
        let mut cache = ResourceKeyCache::new();
        let key = |n: u32| ResourceKey {
            source: "doc".to_string(),
            origin: ResourceOrigin::Object((n, 0)),
            category: ResourceCategory::XObject,
            fonts: Some(FontMode::Merge),
        };
        cache.insert(key(1), ResolvedResource { name: "Im1_10".to_string(), id: (10, 0) });
        let checkpoint = cache.checkpoint();
        cache.insert(key(2), ResolvedResource { name: "Im2_11".to_string(), id: (11, 0) });
        cache.insert_by_value(ResourceCategory::ExtGState, b"x".to_vec(), ResolvedResource { name: "GS0_12".to_string(), id: (12, 0) });

        cache.rollback(checkpoint);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&key(2)).is_none());
        assert!(cache.get_by_value(ResourceCategory::ExtGState, b"x").is_none());
    }

    #[test]
    fn test_register_in_keeps_existing_entries() {
        let mut resources = Dictionary::new();
        register_in(&mut resources, ResourceCategory::Font, "F1_4", (4, 0));
        register_in(&mut resources, ResourceCategory::Font, "F2_5", (5, 0));
        let fonts = match resources.get(b"Font").unwrap() {
            Object::Dictionary(dict) => dict,
            _ => panic!("Font is not a dictionary"),
        };
        assert_eq!(fonts.len(), 2);
    }
}

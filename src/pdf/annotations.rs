//! Link annotations and deferred page references
//!
//! A link on an embedded page may point at another source page whose
//! destination page doesn't exist yet. Its destination array is written with a
//! null page slot and registered in the [`PageNumberRegistry`]; the slot is
//! patched once the target page is assigned.

use std::collections::BTreeMap;
use log::{debug, warn};
use lopdf::{Dictionary, Document, Object, ObjectId};
use tiny_skia_path::{Point, Transform};
use crate::error::{Error, Result};
use crate::pdf::resources::{copy_object, CopiedObjects};
use crate::pdf::source::{as_number, SourceDocument, SourcePage};
use crate::pdf::structure::{find_object_parent, mapped_mcids, StructureTree};
use crate::pdf::transform::map_rect;

/// Annotation subtypes carried over to embedded pages
pub const TRANSFERABLE_SUBTYPES: [&[u8]; 1] = [b"Link"];

/// Keys rebuilt rather than copied
const REBUILT_KEYS: [&[u8]; 8] = [b"P", b"Parent", b"Popup", b"StructParent", b"Dest", b"A", b"Rect", b"QuadPoints"];

#[derive(Debug, Default)]
struct PendingTarget {
    arrays: Vec<ObjectId>,
    page: Option<ObjectId>,
}

/// Destination arrays waiting for the object id of the page they point at
///
/// Keys are 0-based source page indexes.
#[derive(Debug, Default)]
pub struct PageNumberRegistry {
    targets: BTreeMap<u32, PendingTarget>,
    journal: Vec<(u32, ObjectId)>,
}

impl PageNumberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a destination array whose first element must become the page `key`
    ///
    /// Patched right away if the page is already known.
    pub fn register(&mut self, key: u32, array: ObjectId, dest: &mut Document) -> Result<()> {
        let target = self.targets.entry(key).or_default();
        target.arrays.push(array);
        self.journal.push((key, array));
        if let Some(page) = target.page {
            patch(dest, array, page)?;
        }
        Ok(())
    }

    /// The destination page for `key` is now known; patch every array waiting on it
    ///
    /// Returns the number of arrays patched.
    pub fn assign(&mut self, key: u32, page: ObjectId, dest: &mut Document) -> Result<usize> {
        let target = self.targets.entry(key).or_default();
        target.page = Some(page);
        for array in &target.arrays {
            patch(dest, *array, page)?;
        }
        debug!("Page key {} assigned to {:?}, {} links patched", key, page, target.arrays.len());
        Ok(target.arrays.len())
    }

    /// Number of distinct link targets
    pub fn len(&self) -> usize {
        self.targets.values().filter(|target| !target.arrays.is_empty()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Destination arrays registered for a target
    pub fn slots(&self, key: u32) -> &[ObjectId] {
        self.targets
            .get(&key)
            .map(|target| target.arrays.as_slice())
            .unwrap_or(&[])
    }

    pub fn page_for(&self, key: u32) -> Option<ObjectId> {
        self.targets.get(&key).and_then(|target| target.page)
    }

    /// Targets that still have no page
    pub fn unresolved(&self) -> Vec<u32> {
        self.targets
            .iter()
            .filter(|(_, target)| target.page.is_none() && !target.arrays.is_empty())
            .map(|(key, _)| *key)
            .collect()
    }

    pub(crate) fn checkpoint(&self) -> usize {
        self.journal.len()
    }

    pub(crate) fn rollback(&mut self, checkpoint: usize) {
        for (key, array) in self.journal.drain(checkpoint..) {
            if let Some(target) = self.targets.get_mut(&key) {
                target.arrays.retain(|a| *a != array);
            }
        }
    }
}

fn patch(dest: &mut Document, array: ObjectId, page: ObjectId) -> Result<()> {
    match dest.get_object_mut(array)? {
        Object::Array(items) if !items.is_empty() => items[0] = Object::Reference(page),
        Object::Array(items) => items.push(Object::Reference(page)),
        _ => return Err(Error::General(format!("Destination {:?} is not an array", array))),
    }
    Ok(())
}

/// The structure reference of a transferred annotation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationStructRef {
    /// The destination annotation
    pub annotation: ObjectId,
    /// Its new `StructParent` key
    pub struct_parent: i64,
    /// Destination structure element the annotation belongs to
    pub element: Option<ObjectId>,
    /// Destination MCIDs of the marked content wrapping the link
    pub mcids: Vec<i64>,
}

/// Copies a page's links onto a destination page
pub(crate) struct LinkTransfer<'a> {
    pub source: &'a SourceDocument,
    pub page: &'a SourcePage,
    pub dest: &'a mut Document,
    pub copied: &'a mut CopiedObjects,
    pub registry: &'a mut PageNumberRegistry,
    pub structure: &'a mut StructureTree,
    pub next_struct_parent: &'a mut i64,
    pub transform: Transform,
    pub dest_page: ObjectId,
    /// Source MCID -> destination MCID on this page
    pub mcids: &'a BTreeMap<i64, i64>,
}

impl LinkTransfer<'_> {
    /// Copy every transferable annotation, returning the new annotation references
    pub fn run(&mut self) -> Result<(Vec<Object>, Vec<AnnotationStructRef>)> {
        let (source, page) = (self.source, self.page);
        let mut annots = Vec::new();
        let mut refs = Vec::new();

        for annot in &page.annots {
            let Some(dict) = source.resolve_dict(annot) else {
                continue;
            };
            let subtype = match dict.get(b"Subtype") {
                Ok(Object::Name(name)) => name.as_slice(),
                _ => continue,
            };
            if !TRANSFERABLE_SUBTYPES.contains(&subtype) {
                debug!("Skipping {} annotation", String::from_utf8_lossy(subtype));
                continue;
            }

            let (id, struct_ref) = self.transfer(dict)?;
            annots.push(Object::Reference(id));
            refs.extend(struct_ref);
        }

        Ok((annots, refs))
    }

    fn transfer(&mut self, dict: &Dictionary) -> Result<(ObjectId, Option<AnnotationStructRef>)> {
        let mut copy = Dictionary::new();
        for (key, value) in dict.iter() {
            if REBUILT_KEYS.contains(&key.as_slice()) {
                continue;
            }
            copy.set(key.clone(), copy_object(self.source, self.dest, self.copied, value)?);
        }

        if let Some(rect) = self.numbers(dict, b"Rect").filter(|values| values.len() == 4) {
            let mapped = map_rect(&self.transform, [rect[0], rect[1], rect[2], rect[3]]);
            copy.set("Rect", Object::Array(mapped.iter().map(|v| Object::Real(*v)).collect()));
        }

        if let Some(quads) = self.numbers(dict, b"QuadPoints") {
            let mut points: Vec<Point> = quads.chunks_exact(2).map(|p| Point::from_xy(p[0], p[1])).collect();
            self.transform.map_points(&mut points);
            copy.set(
                "QuadPoints",
                Object::Array(points.iter().flat_map(|p| [Object::Real(p.x), Object::Real(p.y)]).collect()),
            );
        }

        if let Ok(destination) = dict.get(b"Dest") {
            if let Some(remapped) = self.remap_destination(destination)? {
                copy.set("Dest", remapped);
            }
        }

        if let Ok(action) = dict.get(b"A") {
            copy.set("A", self.remap_action(action)?);
        }

        copy.set("P", Object::Reference(self.dest_page));
        let id = self.dest.add_object(Object::Dictionary(copy));

        let struct_ref = match dict.get(b"StructParent") {
            Ok(Object::Integer(key)) => Some(self.restructure(id, *key)?),
            _ => None,
        };

        Ok((id, struct_ref))
    }

    /// Give the annotation a fresh `StructParent` tied to its copied element
    fn restructure(&mut self, annotation: ObjectId, source_key: i64) -> Result<AnnotationStructRef> {
        let struct_parent = *self.next_struct_parent;
        *self.next_struct_parent += 1;

        let mut element = None;
        let mut mcids = Vec::new();
        if let Some(source_element) = find_object_parent(self.source, source_key) {
            let copy = self.structure.adopt_element(
                self.source,
                self.dest,
                self.copied,
                source_element,
                self.page.id,
                self.dest_page,
                self.mcids,
            )?;
            self.structure.add_object_kid(self.dest, copy, self.dest_page, annotation)?;
            self.structure.add_object(struct_parent, copy);
            mcids = mapped_mcids(self.source, source_element, self.page.id, self.mcids);
            element = Some(copy);
        } else {
            warn!("StructParent {} of a link has no parent tree entry", source_key);
        }

        let dict = self.dest.get_dictionary_mut(annotation)?;
        dict.set("StructParent", Object::Integer(struct_parent));

        Ok(AnnotationStructRef {
            annotation,
            struct_parent,
            element,
            mcids,
        })
    }

    fn remap_action(&mut self, action: &Object) -> Result<Object> {
        let source = self.source;
        let Some(dict) = source.resolve_dict(action) else {
            return Ok(Object::Null);
        };
        let is_goto = matches!(dict.get(b"S"), Ok(Object::Name(name)) if name == b"GoTo");
        if !is_goto {
            return copy_object(self.source, self.dest, self.copied, action);
        }

        let mut copy = Dictionary::new();
        for (key, value) in dict.iter() {
            if key == b"D" {
                continue;
            }
            copy.set(key.clone(), copy_object(self.source, self.dest, self.copied, value)?);
        }
        if let Ok(destination) = dict.get(b"D") {
            if let Some(remapped) = self.remap_destination(destination)? {
                copy.set("D", remapped);
            }
        }
        Ok(Object::Dictionary(copy))
    }

    /// Explicit or named destination -> indirect destination array registered for patching
    fn remap_destination(&mut self, destination: &Object) -> Result<Option<Object>> {
        let source = self.source;
        let resolved = match source.resolve(destination) {
            Ok(resolved) => resolved,
            Err(err) => {
                warn!("Dropping dangling link destination: {}", err);
                return Ok(None);
            }
        };
        let explicit = match resolved {
            Object::Array(items) => Some(items),
            Object::Name(name) | Object::String(name, _) => named_destination(source, name),
            _ => None,
        };

        let Some(items) = explicit else {
            warn!("Dropping unresolvable link destination");
            return Ok(None);
        };

        match items.first() {
            Some(Object::Reference(page)) => match source.page_index_of(*page) {
                Some(index) => {
                    let mut array = vec![Object::Null];
                    for item in &items[1..] {
                        array.push(copy_object(source, self.dest, self.copied, item)?);
                    }
                    let id = self.dest.add_object(Object::Array(array));
                    self.registry.register(index, id, self.dest)?;
                    Ok(Some(Object::Reference(id)))
                }
                None => {
                    warn!("Link target {:?} is not a page of {}", page, source.key());
                    Ok(None)
                }
            },
            // Remote destinations use page numbers
            Some(Object::Integer(_)) => Ok(Some(Object::Array(items.clone()))),
            _ => Ok(None),
        }
    }

    fn numbers(&self, dict: &Dictionary, key: &[u8]) -> Option<Vec<f32>> {
        match self.source.resolve(dict.get(key).ok()?).ok()? {
            Object::Array(items) => items
                .iter()
                .map(|item| self.source.resolve(item).ok().and_then(as_number))
                .collect(),
            _ => None,
        }
    }
}

/// Look a named destination up in the catalog's `Dests` or `Names/Dests`
fn named_destination<'a>(source: &'a SourceDocument, name: &[u8]) -> Option<&'a Vec<Object>> {
    let catalog = source.catalog()?;

    let found = catalog
        .get(b"Dests")
        .ok()
        .and_then(|dests| source.resolve_dict(dests))
        .and_then(|dests| dests.get(name).ok())
        .or_else(|| {
            let names = source.resolve_dict(catalog.get(b"Names").ok()?)?;
            let tree = source.resolve_dict(names.get(b"Dests").ok()?)?;
            name_tree_get(source, tree, name, 0)
        })?;

    match source.resolve(found).ok()? {
        Object::Array(items) => Some(items),
        Object::Dictionary(dict) => match source.resolve(dict.get(b"D").ok()?).ok()? {
            Object::Array(items) => Some(items),
            _ => None,
        },
        _ => None,
    }
}

fn name_tree_get<'a>(source: &'a SourceDocument, node: &'a Dictionary, name: &[u8], depth: usize) -> Option<&'a Object> {
    if depth > 32 {
        return None;
    }

    if let Some(Object::Array(names)) = node.get(b"Names").ok().and_then(|n| source.resolve(n).ok()) {
        for pair in names.chunks(2) {
            if let [Object::String(key, _), value] = pair {
                if key.as_slice() == name {
                    return Some(value);
                }
            }
        }
    }

    if let Some(Object::Array(kids)) = node.get(b"Kids").ok().and_then(|k| source.resolve(k).ok()) {
        for kid in kids {
            if let Some(value) = source.resolve_dict(kid).and_then(|kid| name_tree_get(source, kid, name, depth + 1)) {
                return Some(value);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_then_assign() {
        let mut dest = Document::with_version("1.5");
        let mut registry = PageNumberRegistry::new();
        let first = dest.add_object(Object::Array(vec![Object::Null, Object::Name(b"Fit".to_vec())]));
        let second = dest.add_object(Object::Array(vec![Object::Null, Object::Name(b"Fit".to_vec())]));

        registry.register(3, first, &mut dest).unwrap();
        registry.register(3, second, &mut dest).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.slots(3).len(), 2);
        assert_eq!(registry.unresolved(), vec![3]);

        let page = dest.new_object_id();
        assert_eq!(registry.assign(3, page, &mut dest).unwrap(), 2);
        for array in [first, second] {
            match dest.get_object(array).unwrap() {
                Object::Array(items) => assert_eq!(items[0], Object::Reference(page)),
                other => panic!("expected array, got {:?}", other),
            }
        }
        assert!(registry.unresolved().is_empty());
    }

    #[test]
    fn test_register_after_assign_patches_immediately() {
        let mut dest = Document::with_version("1.5");
        let mut registry = PageNumberRegistry::new();
        let page = dest.new_object_id();
        registry.assign(0, page, &mut dest).unwrap();
        assert!(registry.is_empty());

        let array = dest.add_object(Object::Array(vec![Object::Null]));
        registry.register(0, array, &mut dest).unwrap();
        match dest.get_object(array).unwrap() {
            Object::Array(items) => assert_eq!(items[0], Object::Reference(page)),
            other => panic!("expected array, got {:?}", other),
        }
    }

    #[test]
    fn test_rollback_forgets_slots() {
        let mut dest = Document::with_version("1.5");
        let mut registry = PageNumberRegistry::new();
        let array = dest.add_object(Object::Array(vec![Object::Null]));
        let checkpoint = registry.checkpoint();
        registry.register(2, array, &mut dest).unwrap();
        registry.rollback(checkpoint);
        assert!(registry.is_empty());
    }
}

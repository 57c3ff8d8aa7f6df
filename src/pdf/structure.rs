//! Tagged-PDF structure: finding a page's parent-tree slice and rebuilding
//! the destination structure tree

use std::collections::{BTreeMap, HashMap};
use log::debug;
use lopdf::{Dictionary, Document, Object, ObjectId};
use crate::error::Result;
use crate::pdf::resources::{copy_object, CopiedObjects};
use crate::pdf::source::{SourceDocument, SourcePage};

/// Deepest number tree we descend into
const MAX_TREE_DEPTH: usize = 32;

/// One slot of a page's parent-tree array: the structure element owning an MCID
#[derive(Debug, Clone, PartialEq)]
pub struct ParentTreeEntry {
    /// The structure element, `None` for a null slot
    pub element: Option<ObjectId>,
    mcids: Vec<i64>,
}

impl ParentTreeEntry {
    /// Marked-content IDs on this page owned directly by the element, ascending
    pub fn child_mcids(&self) -> &[i64] {
        &self.mcids
    }
}

/// The parent-tree array of a page, in MCID order
///
/// Untagged documents and pages yield an empty slice; a missing structure root
/// is not an error.
pub fn find_parent_tree_array(source: &SourceDocument, page: &SourcePage) -> Result<Vec<ParentTreeEntry>> {
    let Some(key) = page.struct_parents.filter(|key| *key >= 0) else {
        return Ok(Vec::new());
    };
    let Some(tree) = parent_tree(source) else {
        return Ok(Vec::new());
    };

    let slots = match number_tree_get(source, tree, key, 0).and_then(|value| source.resolve(value).ok()) {
        Some(Object::Array(slots)) => slots,
        _ => return Ok(Vec::new()),
    };

    let entries = slots
        .iter()
        .map(|slot| match slot {
            Object::Reference(id) => {
                let mcids = source
                    .resolve_dict(slot)
                    .map(|element| element_mcids(source, element, page.id))
                    .unwrap_or_default();
                ParentTreeEntry { element: Some(*id), mcids }
            }
            _ => ParentTreeEntry { element: None, mcids: Vec::new() },
        })
        .collect();

    Ok(entries)
}

/// The element a `StructParent` key points at (annotations and other objects)
pub fn find_object_parent(source: &SourceDocument, key: i64) -> Option<ObjectId> {
    match number_tree_get(source, parent_tree(source)?, key, 0)? {
        Object::Reference(id) => Some(*id),
        _ => None,
    }
}

fn parent_tree(source: &SourceDocument) -> Option<&Dictionary> {
    let root = source.resolve_dict(source.catalog()?.get(b"StructTreeRoot").ok()?)?;
    source.resolve_dict(root.get(b"ParentTree").ok()?)
}

/// Value stored under `key` in a number tree
fn number_tree_get<'a>(source: &'a SourceDocument, node: &'a Dictionary, key: i64, depth: usize) -> Option<&'a Object> {
    if depth > MAX_TREE_DEPTH {
        return None;
    }

    if let Some(Object::Array(nums)) = node.get(b"Nums").ok().and_then(|n| source.resolve(n).ok()) {
        for pair in nums.chunks(2) {
            if let [Object::Integer(k), value] = pair {
                if *k == key {
                    return Some(value);
                }
            }
        }
    }

    if let Some(Object::Array(kids)) = node.get(b"Kids").ok().and_then(|k| source.resolve(k).ok()) {
        for kid in kids {
            let Some(kid) = source.resolve_dict(kid) else {
                continue;
            };
            if let Some(Object::Array(limits)) = kid.get(b"Limits").ok().and_then(|l| source.resolve(l).ok()) {
                if let [Object::Integer(low), Object::Integer(high)] = limits.as_slice() {
                    if key < *low || key > *high {
                        continue;
                    }
                }
            }
            if let Some(value) = number_tree_get(source, kid, key, depth + 1) {
                return Some(value);
            }
        }
    }

    None
}

/// MCIDs in an element's `K` that belong to `page`, ascending
fn element_mcids(source: &SourceDocument, element: &Dictionary, page: ObjectId) -> Vec<i64> {
    let element_page = match element.get(b"Pg") {
        Ok(Object::Reference(id)) => Some(*id),
        _ => None,
    };

    let mut mcids = Vec::new();
    let mut collect = |kid: &Object| match kid {
        Object::Integer(mcid) if element_page.map_or(true, |pg| pg == page) => mcids.push(*mcid),
        Object::Dictionary(mcr) => {
            let kid_page = match mcr.get(b"Pg") {
                Ok(Object::Reference(id)) => Some(*id),
                _ => element_page,
            };
            if let Ok(Object::Integer(mcid)) = mcr.get(b"MCID") {
                if kid_page.map_or(true, |pg| pg == page) {
                    mcids.push(*mcid);
                }
            }
        }
        _ => {}
    };

    match element.get(b"K").ok().and_then(|k| source.resolve(k).ok()) {
        Some(Object::Array(kids)) => {
            for kid in kids {
                // Structure element kids are references and are skipped here
                if let Object::Dictionary(_) | Object::Integer(_) = kid {
                    collect(kid);
                }
            }
        }
        Some(kid) => collect(kid),
        None => {}
    }

    mcids.sort_unstable();
    mcids
}

/// Destination MCIDs of the marked content `element` owns on `page`
pub(crate) fn mapped_mcids(
    source: &SourceDocument,
    element: ObjectId,
    page: ObjectId,
    mcids: &BTreeMap<i64, i64>,
) -> Vec<i64> {
    source
        .document()
        .get_dictionary(element)
        .map(|dict| {
            element_mcids(source, dict, page)
                .iter()
                .filter_map(|mcid| mcids.get(mcid).copied())
                .collect()
        })
        .unwrap_or_default()
}

/// A marked-content region placed on a destination page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StructureParentEntry {
    /// MCID in the destination content stream
    pub mcid: i64,
    /// MCID in the source content stream
    pub source_mcid: i64,
    /// Source structure element owning the region
    pub element: Option<ObjectId>,
}

/// Destination structure tree under construction
#[derive(Debug, Default)]
pub struct StructureTree {
    root: Option<ObjectId>,
    elements: HashMap<(String, ObjectId), ObjectId>,
    kids: Vec<ObjectId>,
    parent_tree: BTreeMap<i64, Object>,
    role_map: BTreeMap<Vec<u8>, Vec<u8>>,
    /// Previous `K` of elements whose kids were extended in place
    edits: Vec<(ObjectId, Option<Object>)>,
}

/// Position in a [`StructureTree`] to roll back to
#[derive(Debug, Clone, Copy)]
pub(crate) struct StructureCheckpoint {
    kids: usize,
    edits: usize,
}

impl StructureTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.kids.is_empty() && self.parent_tree.is_empty()
    }

    /// Destination element copied from `element` of `source`
    pub fn element(&self, source: &str, element: ObjectId) -> Option<ObjectId> {
        self.elements.get(&(source.to_string(), element)).copied()
    }

    /// Number of parent-tree keys assigned
    pub fn parent_tree_len(&self) -> usize {
        self.parent_tree.len()
    }

    /// Parent-tree value stored under `key`
    pub fn parent_tree_value(&self, key: i64) -> Option<&Object> {
        self.parent_tree.get(&key)
    }

    /// Copy a source structure element for a destination page
    ///
    /// The copy hangs directly off the destination root. Its `K` lists the
    /// destination MCIDs of `mcids` (source MCID -> destination MCID) that the
    /// element owns; adopting an element again for another page adds marked
    /// content references for that page.
    pub(crate) fn adopt_element(
        &mut self,
        source: &SourceDocument,
        dest: &mut Document,
        copied: &mut CopiedObjects,
        element: ObjectId,
        source_page: ObjectId,
        dest_page: ObjectId,
        mcids: &BTreeMap<i64, i64>,
    ) -> Result<ObjectId> {
        let dict = source.document().get_dictionary(element)?.clone();
        let dest_mcids: Vec<i64> = element_mcids(source, &dict, source_page)
            .iter()
            .filter_map(|mcid| mcids.get(mcid).copied())
            .collect();

        if let Some(existing) = self.element(source.key(), element) {
            self.extend_kids(dest, existing, dest_page, &dest_mcids)?;
            return Ok(existing);
        }

        let root = *self.root.get_or_insert_with(|| dest.new_object_id());
        self.merge_role_map(source);

        let mut copy = Dictionary::new();
        for (key, value) in dict.iter() {
            if matches!(key.as_slice(), b"P" | b"K" | b"Pg" | b"Parent") {
                continue;
            }
            copy.set(key.clone(), copy_object(source, dest, copied, value)?);
        }
        copy.set("Type", Object::Name(b"StructElem".to_vec()));
        copy.set("P", Object::Reference(root));
        copy.set("Pg", Object::Reference(dest_page));
        copy.set("K", Object::Array(dest_mcids.iter().map(|mcid| Object::Integer(*mcid)).collect()));

        let id = dest.add_object(Object::Dictionary(copy));
        debug!("Copied structure element {:?} of {} as {:?}", element, source.key(), id);
        self.elements.insert((source.key().to_string(), element), id);
        self.kids.push(id);
        Ok(id)
    }

    fn extend_kids(&mut self, dest: &mut Document, element: ObjectId, page: ObjectId, mcids: &[i64]) -> Result<()> {
        if mcids.is_empty() {
            return Ok(());
        }
        let dict = dest.get_dictionary_mut(element)?;
        self.edits.push((element, dict.get(b"K").ok().cloned()));
        let same_page = matches!(dict.get(b"Pg"), Ok(Object::Reference(pg)) if *pg == page);
        let mut kids = match dict.get(b"K") {
            Ok(Object::Array(kids)) => kids.clone(),
            _ => Vec::new(),
        };
        for mcid in mcids {
            let present = kids.iter().any(|kid| match kid {
                Object::Integer(existing) => same_page && existing == mcid,
                Object::Dictionary(mcr) => {
                    matches!(mcr.get(b"MCID"), Ok(Object::Integer(existing)) if existing == mcid)
                        && matches!(mcr.get(b"Pg"), Ok(Object::Reference(pg)) if *pg == page)
                }
                _ => false,
            });
            if present {
                continue;
            }
            if same_page {
                kids.push(Object::Integer(*mcid));
            } else {
                let mut mcr = Dictionary::new();
                mcr.set("Type", Object::Name(b"MCR".to_vec()));
                mcr.set("Pg", Object::Reference(page));
                mcr.set("MCID", Object::Integer(*mcid));
                kids.push(Object::Dictionary(mcr));
            }
        }
        dict.set("K", Object::Array(kids));
        Ok(())
    }

    /// Append an object reference (`OBJR`) to a destination element's kids
    pub(crate) fn add_object_kid(&mut self, dest: &mut Document, element: ObjectId, page: ObjectId, object: ObjectId) -> Result<()> {
        let dict = dest.get_dictionary_mut(element)?;
        self.edits.push((element, dict.get(b"K").ok().cloned()));
        let mut kids = match dict.get(b"K") {
            Ok(Object::Array(kids)) => kids.clone(),
            Ok(other) => vec![other.clone()],
            Err(_) => Vec::new(),
        };
        let mut objr = Dictionary::new();
        objr.set("Type", Object::Name(b"OBJR".to_vec()));
        objr.set("Pg", Object::Reference(page));
        objr.set("Obj", Object::Reference(object));
        kids.push(Object::Dictionary(objr));
        dict.set("K", Object::Array(kids));
        Ok(())
    }

    /// Parent-tree array of a page: destination MCID -> element
    pub(crate) fn add_page(&mut self, key: i64, slots: Vec<Option<ObjectId>>) {
        let array = slots
            .into_iter()
            .map(|slot| slot.map_or(Object::Null, Object::Reference))
            .collect();
        self.parent_tree.insert(key, Object::Array(array));
    }

    /// Parent-tree entry of an annotation
    pub(crate) fn add_object(&mut self, key: i64, element: ObjectId) {
        self.parent_tree.insert(key, Object::Reference(element));
    }

    pub(crate) fn checkpoint(&self) -> StructureCheckpoint {
        StructureCheckpoint {
            kids: self.kids.len(),
            edits: self.edits.len(),
        }
    }

    /// Undo everything since `checkpoint`
    ///
    /// Elements created since then are forgotten, elements extended since then
    /// get their earlier `K` back in `dest`, and parent-tree keys from
    /// `first_key` on are dropped.
    pub(crate) fn rollback(&mut self, dest: &mut Document, checkpoint: StructureCheckpoint, first_key: i64) {
        let edits = self.edits.split_off(checkpoint.edits.min(self.edits.len()));
        for (element, previous) in edits.into_iter().rev() {
            let Ok(dict) = dest.get_dictionary_mut(element) else {
                continue;
            };
            match previous {
                Some(kids) => dict.set("K", kids),
                None => {
                    dict.remove(b"K");
                }
            }
        }

        let removed = self.kids.split_off(checkpoint.kids.min(self.kids.len()));
        self.elements.retain(|_, id| !removed.contains(id));
        self.parent_tree.split_off(&first_key);
    }

    fn merge_role_map(&mut self, source: &SourceDocument) {
        let role_map = source
            .catalog()
            .and_then(|catalog| catalog.get(b"StructTreeRoot").ok())
            .and_then(|root| source.resolve_dict(root))
            .and_then(|root| root.get(b"RoleMap").ok())
            .and_then(|map| source.resolve_dict(map));
        if let Some(role_map) = role_map {
            for (key, value) in role_map.iter() {
                if let Object::Name(role) = value {
                    self.role_map.entry(key.clone()).or_insert_with(|| role.clone());
                }
            }
        }
    }

    /// Write the structure tree root and hook it into the catalog
    pub fn finish(&self, dest: &mut Document, catalog: &mut Dictionary) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        let root = self.root.unwrap_or_else(|| dest.new_object_id());

        let mut nums = Vec::with_capacity(self.parent_tree.len() * 2);
        for (key, value) in &self.parent_tree {
            nums.push(Object::Integer(*key));
            nums.push(value.clone());
        }
        let mut parent_tree = Dictionary::new();
        parent_tree.set("Nums", Object::Array(nums));
        let parent_tree_id = dest.add_object(Object::Dictionary(parent_tree));

        let mut dict = Dictionary::new();
        dict.set("Type", Object::Name(b"StructTreeRoot".to_vec()));
        dict.set("K", Object::Array(self.kids.iter().map(|id| Object::Reference(*id)).collect()));
        dict.set("ParentTree", Object::Reference(parent_tree_id));
        dict.set(
            "ParentTreeNextKey",
            Object::Integer(self.parent_tree.keys().next_back().map_or(0, |key| key + 1)),
        );
        if !self.role_map.is_empty() {
            let mut role_map = Dictionary::new();
            for (key, role) in &self.role_map {
                role_map.set(key.clone(), Object::Name(role.clone()));
            }
            dict.set("RoleMap", Object::Dictionary(role_map));
        }
        dest.objects.insert(root, Object::Dictionary(dict));

        let mut mark_info = Dictionary::new();
        mark_info.set("Marked", Object::Boolean(true));
        catalog.set("MarkInfo", Object::Dictionary(mark_info));
        catalog.set("StructTreeRoot", Object::Reference(root));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(doc: &mut Document, kids: Object) -> ObjectId {
        let mut dict = Dictionary::new();
        dict.set("Type", Object::Name(b"StructElem".to_vec()));
        dict.set("S", Object::Name(b"P".to_vec()));
        dict.set("K", kids);
        doc.add_object(Object::Dictionary(dict))
    }

    /// One page, `StructParents 0`, three paragraphs owning MCIDs 0, {1, 2} and 3
    fn tagged_document(with_root: bool) -> SourceDocument {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let page_id = doc.new_object_id();

        let first = element(&mut doc, Object::Integer(0));
        let second = element(&mut doc, Object::Array(vec![Object::Integer(2), Object::Integer(1)]));
        let mut mcr = Dictionary::new();
        mcr.set("Type", Object::Name(b"MCR".to_vec()));
        mcr.set("MCID", Object::Integer(3));
        mcr.set("Pg", Object::Reference(page_id));
        let third = element(&mut doc, Object::Array(vec![Object::Dictionary(mcr)]));

        let mut page = Dictionary::new();
        page.set("Type", Object::Name(b"Page".to_vec()));
        page.set("Parent", Object::Reference(pages_id));
        page.set("StructParents", Object::Integer(0));
        doc.objects.insert(page_id, Object::Dictionary(page));

        let mut pages = Dictionary::new();
        pages.set("Type", Object::Name(b"Pages".to_vec()));
        pages.set("Kids", Object::Array(vec![Object::Reference(page_id)]));
        pages.set("Count", Object::Integer(1));
        doc.objects.insert(pages_id, Object::Dictionary(pages));

        let mut catalog = Dictionary::new();
        catalog.set("Type", Object::Name(b"Catalog".to_vec()));
        catalog.set("Pages", Object::Reference(pages_id));
        if with_root {
            // Parent tree split over two leaves to exercise Kids and Limits
            let mut empty_leaf = Dictionary::new();
            empty_leaf.set("Limits", Object::Array(vec![Object::Integer(5), Object::Integer(9)]));
            empty_leaf.set("Nums", Object::Array(vec![]));
            let empty_leaf_id = doc.add_object(Object::Dictionary(empty_leaf));

            let mut leaf = Dictionary::new();
            leaf.set("Limits", Object::Array(vec![Object::Integer(0), Object::Integer(0)]));
            leaf.set("Nums", Object::Array(vec![
                Object::Integer(0),
                Object::Array(vec![
                    Object::Reference(first),
                    Object::Reference(second),
                    Object::Reference(second),
                    Object::Reference(third),
                ]),
            ]));
            let leaf_id = doc.add_object(Object::Dictionary(leaf));

            let mut tree = Dictionary::new();
            tree.set("Kids", Object::Array(vec![Object::Reference(empty_leaf_id), Object::Reference(leaf_id)]));
            let tree_id = doc.add_object(Object::Dictionary(tree));

            let mut root = Dictionary::new();
            root.set("Type", Object::Name(b"StructTreeRoot".to_vec()));
            root.set("ParentTree", Object::Reference(tree_id));
            let root_id = doc.add_object(Object::Dictionary(root));
            catalog.set("StructTreeRoot", Object::Reference(root_id));
        }
        let catalog_id = doc.add_object(Object::Dictionary(catalog));
        doc.trailer.set("Root", Object::Reference(catalog_id));

        SourceDocument::from_document("tagged", doc).unwrap()
    }

    #[test]
    fn test_untagged_page_yields_nothing() {
        let source = tagged_document(false);
        let page = source.page(1).unwrap();
        assert!(find_parent_tree_array(&source, &page).unwrap().is_empty());
    }

    #[test]
    fn test_negative_struct_parents() {
        let source = tagged_document(true);
        let mut page = source.page(1).unwrap();
        page.struct_parents = Some(-1);
        assert!(find_parent_tree_array(&source, &page).unwrap().is_empty());
    }

    #[test]
    fn test_parent_tree_slice() {
        let source = tagged_document(true);
        let page = source.page(1).unwrap();
        let entries = find_parent_tree_array(&source, &page).unwrap();

        assert_eq!(entries.len(), 4);
        let distinct: Vec<_> = {
            let mut elements: Vec<_> = entries.iter().filter_map(|e| e.element).collect();
            elements.dedup();
            elements
        };
        assert_eq!(distinct.len(), 3);
        assert_eq!(entries[0].child_mcids(), &[0]);
        assert_eq!(entries[1].child_mcids(), &[1, 2]);
        assert_eq!(entries[3].child_mcids(), &[3]);
    }

    #[test]
    fn test_adopt_and_finish() {
        let source = tagged_document(true);
        let page = source.page(1).unwrap();
        let entries = find_parent_tree_array(&source, &page).unwrap();
        let second = entries[1].element.unwrap();

        let mut dest = Document::with_version("1.5");
        let dest_page = dest.new_object_id();
        let mut copied = CopiedObjects::default();
        let mut tree = StructureTree::new();
        let mcids: BTreeMap<i64, i64> = [(1, 11), (2, 12)].into_iter().collect();

        let copy = tree
            .adopt_element(&source, &mut dest, &mut copied, second, page.id, dest_page, &mcids)
            .unwrap();
        let again = tree
            .adopt_element(&source, &mut dest, &mut copied, second, page.id, dest_page, &BTreeMap::new())
            .unwrap();
        assert_eq!(copy, again);

        let element = dest.get_dictionary(copy).unwrap();
        assert_eq!(element.get(b"K").unwrap(), &Object::Array(vec![Object::Integer(11), Object::Integer(12)]));
        assert_eq!(element.get(b"Pg").unwrap(), &Object::Reference(dest_page));

        tree.add_page(0, vec![None, Some(copy)]);
        let mut catalog = Dictionary::new();
        tree.finish(&mut dest, &mut catalog).unwrap();
        assert!(catalog.has(b"StructTreeRoot"));
        assert!(catalog.has(b"MarkInfo"));
    }

    #[test]
    fn test_rollback_restores_extended_kids() {
        let source = tagged_document(true);
        let page = source.page(1).unwrap();
        let entries = find_parent_tree_array(&source, &page).unwrap();
        let second = entries[1].element.unwrap();

        let mut dest = Document::with_version("1.5");
        let (first_page, second_page) = (dest.new_object_id(), dest.new_object_id());
        let mut copied = CopiedObjects::default();
        let mut tree = StructureTree::new();
        let copy = tree
            .adopt_element(&source, &mut dest, &mut copied, second, page.id, first_page, &BTreeMap::from([(1, 0), (2, 1)]))
            .unwrap();
        tree.add_page(0, vec![Some(copy), Some(copy)]);
        let before = dest.get_dictionary(copy).unwrap().get(b"K").unwrap().clone();

        let checkpoint = tree.checkpoint();
        tree.adopt_element(&source, &mut dest, &mut copied, second, page.id, second_page, &BTreeMap::from([(1, 5)]))
            .unwrap();
        let link = dest.add_object(Object::Dictionary(Dictionary::new()));
        tree.add_object_kid(&mut dest, copy, second_page, link).unwrap();
        tree.add_object(1, copy);
        assert_ne!(dest.get_dictionary(copy).unwrap().get(b"K").unwrap(), &before);

        tree.rollback(&mut dest, checkpoint, 1);
        assert_eq!(dest.get_dictionary(copy).unwrap().get(b"K").unwrap(), &before);
        assert_eq!(tree.parent_tree_len(), 1);
        assert_eq!(tree.element(source.key(), second), Some(copy));
    }
}

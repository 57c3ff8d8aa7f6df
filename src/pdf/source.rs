//! Read-only access to source documents and their pages

use std::collections::BTreeMap;
use std::path::Path;
use lopdf::{Dictionary, Document, Object, ObjectId};
use crate::error::{Error, Result};

/// Longest chain of indirect references or `Parent` links we follow
const MAX_CHAIN: usize = 64;

/// A parsed source PDF plus the opaque key that identifies it within a merge session
///
/// Two `SourceDocument`s with the same key are treated as the same document by the
/// resource cache, so callers must pick keys that are unique per distinct file.
pub struct SourceDocument {
    key: String,
    doc: Document,
    pages: BTreeMap<u32, ObjectId>,
}

impl SourceDocument {
    /// Load a PDF from disk, keyed by its path
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::FileNotFound(path.to_path_buf()));
        }

        let doc = Document::load(path)?;
        Self::from_document(path.display().to_string(), doc)
    }

    /// Wrap an already parsed document
    pub fn from_document(key: impl Into<String>, doc: Document) -> Result<Self> {
        let key = key.into();
        let pages = doc.get_pages();

        if pages.is_empty() {
            return Err(Error::EmptyPdf(key));
        }

        Ok(Self { key, doc, pages })
    }

    /// The caller-chosen identity of this document
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    /// 1-based page numbers in document order
    pub fn page_numbers(&self) -> Vec<u32> {
        self.pages.keys().copied().collect()
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// 0-based index of the page with the given object id, if it is a page of this document
    pub fn page_index_of(&self, id: ObjectId) -> Option<u32> {
        self.pages
            .iter()
            .find(|(_, page_id)| **page_id == id)
            .map(|(number, _)| number - 1)
    }

    /// Look up a page by its 1-based number
    pub fn page(&self, number: u32) -> Result<SourcePage> {
        let id = *self.pages.get(&number).ok_or_else(|| Error::PageNotFound {
            source_key: self.key.clone(),
            page: number,
        })?;
        let dict = self.doc.get_dictionary(id)?;

        let media_box = self
            .inherited(dict, b"MediaBox")
            .and_then(|obj| self.rect(obj))
            .unwrap_or([0.0, 0.0, 612.0, 792.0]);
        let crop_box = self.inherited(dict, b"CropBox").and_then(|obj| self.rect(obj));
        let rotation = self
            .inherited(dict, b"Rotate")
            .and_then(|obj| self.resolve(obj).ok())
            .and_then(|obj| match obj {
                Object::Integer(value) => Some(*value),
                Object::Real(value) => Some(*value as i64),
                _ => None,
            })
            .unwrap_or(0);
        let resources = self
            .inherited(dict, b"Resources")
            .and_then(|obj| self.resolve_dict(obj))
            .cloned()
            .unwrap_or_else(Dictionary::new);
        let struct_parents = dict
            .get(b"StructParents")
            .ok()
            .and_then(|obj| self.resolve(obj).ok())
            .and_then(|obj| match obj {
                Object::Integer(value) => Some(*value),
                _ => None,
            });
        let annots = dict
            .get(b"Annots")
            .ok()
            .and_then(|obj| self.resolve(obj).ok())
            .and_then(|obj| match obj {
                Object::Array(items) => Some(items.clone()),
                _ => None,
            })
            .unwrap_or_default();

        Ok(SourcePage {
            number,
            id,
            rotation,
            media_box,
            crop_box,
            resources,
            struct_parents,
            annots,
        })
    }

    /// Concatenated, decompressed content of a page
    ///
    /// Multiple content streams are joined with a newline, matching how a viewer
    /// treats a `Contents` array as one stream.
    pub fn content_bytes(&self, page: &SourcePage) -> Result<Vec<u8>> {
        let dict = self.doc.get_dictionary(page.id)?;
        let contents = match dict.get(b"Contents") {
            Ok(contents) => self.resolve(contents)?,
            Err(_) => return Ok(Vec::new()), // No content = blank page
        };

        let mut result = Vec::new();
        match contents {
            Object::Stream(stream) => result.extend(stream_bytes(stream)),
            Object::Array(parts) => {
                for part in parts {
                    if let Object::Stream(stream) = self.resolve(part)? {
                        result.extend(stream_bytes(stream));
                        result.push(b'\n');
                    }
                }
            }
            _ => {}
        }

        Ok(result)
    }

    /// Follow indirect references until a direct object is reached
    pub fn resolve<'a>(&'a self, object: &'a Object) -> Result<&'a Object> {
        let mut current = object;
        for _ in 0..MAX_CHAIN {
            match current {
                Object::Reference(id) => current = self.doc.get_object(*id)?,
                _ => return Ok(current),
            }
        }
        Err(Error::General("Reference chain too long".to_string()))
    }

    /// Resolve to a dictionary, accepting a stream's dictionary as well
    pub fn resolve_dict<'a>(&'a self, object: &'a Object) -> Option<&'a Dictionary> {
        match self.resolve(object).ok()? {
            Object::Dictionary(dict) => Some(dict),
            Object::Stream(stream) => Some(&stream.dict),
            _ => None,
        }
    }

    /// The document catalog, if the trailer points at one
    pub fn catalog(&self) -> Option<&Dictionary> {
        let root = self.doc.trailer.get(b"Root").ok()?;
        self.resolve_dict(root)
    }

    /// Look up an attribute on a page, walking up the `Parent` chain
    fn inherited<'a>(&'a self, page: &'a Dictionary, key: &[u8]) -> Option<&'a Object> {
        let mut node = page;
        for _ in 0..MAX_CHAIN {
            if let Ok(value) = node.get(key) {
                return Some(value);
            }
            node = node
                .get(b"Parent")
                .ok()
                .and_then(|parent| self.resolve_dict(parent))?;
        }
        None
    }

    fn rect(&self, object: &Object) -> Option<[f32; 4]> {
        match self.resolve(object).ok()? {
            Object::Array(items) if items.len() == 4 => {
                let mut values = [0.0f32; 4];
                for (slot, item) in values.iter_mut().zip(items) {
                    *slot = as_number(self.resolve(item).ok()?)?;
                }
                // Normalise so that [0],[1] is the lower-left corner
                Some([
                    values[0].min(values[2]),
                    values[1].min(values[3]),
                    values[0].max(values[2]),
                    values[1].max(values[3]),
                ])
            }
            _ => None,
        }
    }
}

/// One page of a [`SourceDocument`], with inherited attributes already resolved
#[derive(Debug, Clone)]
pub struct SourcePage {
    /// 1-based page number
    pub number: u32,
    pub id: ObjectId,
    /// Raw `/Rotate` value, validated when the page is rewritten
    pub rotation: i64,
    pub media_box: [f32; 4],
    pub crop_box: Option<[f32; 4]>,
    pub resources: Dictionary,
    /// Key into the document's structure parent tree
    pub struct_parents: Option<i64>,
    pub annots: Vec<Object>,
}

impl SourcePage {
    /// The visible area: crop box, falling back to the media box
    pub fn view_box(&self) -> [f32; 4] {
        self.crop_box.unwrap_or(self.media_box)
    }
}

/// Numeric value of an integer or real object
pub fn as_number(object: &Object) -> Option<f32> {
    match object {
        Object::Integer(value) => Some(*value as f32),
        Object::Real(value) => Some(*value),
        _ => None,
    }
}

pub(crate) fn stream_bytes(stream: &lopdf::Stream) -> Vec<u8> {
    stream
        .decompressed_content()
        .unwrap_or_else(|_| stream.content.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::Stream;

    fn two_page_document() -> Document {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let content_id = doc.add_object(Stream::new(Dictionary::new(), b"0 0 m 10 10 l S".to_vec()));

        let mut first = Dictionary::new();
        first.set("Type", Object::Name(b"Page".to_vec()));
        first.set("Parent", Object::Reference(pages_id));
        first.set("Contents", Object::Reference(content_id));
        first.set("CropBox", Object::Array(vec![
            Object::Integer(10),
            Object::Integer(10),
            Object::Integer(110),
            Object::Integer(210),
        ]));
        let first_id = doc.add_object(Object::Dictionary(first));

        let mut second = Dictionary::new();
        second.set("Type", Object::Name(b"Page".to_vec()));
        second.set("Parent", Object::Reference(pages_id));
        second.set("Rotate", Object::Integer(90));
        let second_id = doc.add_object(Object::Dictionary(second));

        let mut pages = Dictionary::new();
        pages.set("Type", Object::Name(b"Pages".to_vec()));
        pages.set("Kids", Object::Array(vec![
            Object::Reference(first_id),
            Object::Reference(second_id),
        ]));
        pages.set("Count", Object::Integer(2));
        pages.set("MediaBox", Object::Array(vec![
            Object::Integer(0),
            Object::Integer(0),
            Object::Integer(200),
            Object::Integer(300),
        ]));
        doc.objects.insert(pages_id, Object::Dictionary(pages));

        let mut catalog = Dictionary::new();
        catalog.set("Type", Object::Name(b"Catalog".to_vec()));
        catalog.set("Pages", Object::Reference(pages_id));
        let catalog_id = doc.add_object(Object::Dictionary(catalog));
        doc.trailer.set("Root", Object::Reference(catalog_id));
        doc
    }

    #[test]
    fn test_inherited_attributes() {
        let source = SourceDocument::from_document("two", two_page_document()).unwrap();
        assert_eq!(source.page_numbers(), vec![1, 2]);

        let first = source.page(1).unwrap();
        assert_eq!(first.media_box, [0.0, 0.0, 200.0, 300.0]);
        assert_eq!(first.view_box(), [10.0, 10.0, 110.0, 210.0]);
        assert_eq!(first.rotation, 0);

        let second = source.page(2).unwrap();
        assert_eq!(second.rotation, 90);
        assert_eq!(second.view_box(), [0.0, 0.0, 200.0, 300.0]);
        assert_eq!(source.page_index_of(second.id), Some(1));
    }

    #[test]
    fn test_content_bytes() {
        let source = SourceDocument::from_document("two", two_page_document()).unwrap();
        let first = source.page(1).unwrap();
        assert_eq!(source.content_bytes(&first).unwrap(), b"0 0 m 10 10 l S".to_vec());

        let second = source.page(2).unwrap();
        assert!(source.content_bytes(&second).unwrap().is_empty());
    }

    #[test]
    fn test_missing_page() {
        let source = SourceDocument::from_document("two", two_page_document()).unwrap();
        assert!(matches!(source.page(7), Err(Error::PageNotFound { page: 7, .. })));
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = SourceDocument::load(Path::new("nonexistent.pdf"));
        assert!(matches!(result, Err(Error::FileNotFound(_))));
    }
}

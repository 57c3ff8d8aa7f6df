//! In-memory source documents for unit tests

use lopdf::{Dictionary, Document, Object, ObjectId, Stream};

pub(crate) fn name(value: &str) -> Object {
    Object::Name(value.as_bytes().to_vec())
}

pub(crate) fn numbers(values: &[i64]) -> Object {
    Object::Array(values.iter().map(|v| Object::Integer(*v)).collect())
}

/// Builds a small page tree page by page
pub(crate) struct DocumentBuilder {
    pub doc: Document,
    pages_id: ObjectId,
    kids: Vec<ObjectId>,
}

impl DocumentBuilder {
    pub fn new() -> Self {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        Self {
            doc,
            pages_id,
            kids: Vec::new(),
        }
    }

    /// Add a 200 x 300 page; `extra` entries are merged into the page dictionary
    pub fn page(&mut self, content: &[u8], resources: Dictionary, extra: Dictionary) -> ObjectId {
        let content_id = self.doc.add_object(Stream::new(Dictionary::new(), content.to_vec()));

        let mut page = Dictionary::new();
        page.set("Type", name("Page"));
        page.set("Parent", Object::Reference(self.pages_id));
        page.set("MediaBox", numbers(&[0, 0, 200, 300]));
        page.set("Contents", Object::Reference(content_id));
        page.set("Resources", Object::Dictionary(resources));
        for (key, value) in extra.iter() {
            page.set(key.clone(), value.clone());
        }

        let id = self.doc.add_object(Object::Dictionary(page));
        self.kids.push(id);
        id
    }

    /// Write the page tree and catalog; `catalog` entries are merged in
    pub fn finish(mut self, catalog: Dictionary) -> Document {
        let mut pages = Dictionary::new();
        pages.set("Type", name("Pages"));
        pages.set("Kids", Object::Array(self.kids.iter().map(|id| Object::Reference(*id)).collect()));
        pages.set("Count", Object::Integer(self.kids.len() as i64));
        self.doc.objects.insert(self.pages_id, Object::Dictionary(pages));

        let mut root = catalog;
        root.set("Type", name("Catalog"));
        root.set("Pages", Object::Reference(self.pages_id));
        let root_id = self.doc.add_object(Object::Dictionary(root));
        self.doc.trailer.set("Root", Object::Reference(root_id));
        self.doc
    }
}

/// `/Category << /name ref >>` resource entry
pub(crate) fn resources(entries: &[(&str, &str, ObjectId)]) -> Dictionary {
    let mut resources = Dictionary::new();
    for (category, resource, id) in entries {
        let mut sub = match resources.get(category.as_bytes()) {
            Ok(Object::Dictionary(existing)) => existing.clone(),
            _ => Dictionary::new(),
        };
        sub.set(resource.as_bytes().to_vec(), Object::Reference(*id));
        resources.set(category.as_bytes().to_vec(), Object::Dictionary(sub));
    }
    resources
}

/// Base-14 font dictionary without an embedded program
pub(crate) fn standard_font(base: &str) -> Dictionary {
    let mut font = Dictionary::new();
    font.set("Type", name("Font"));
    font.set("Subtype", name("Type1"));
    font.set("BaseFont", name(base));
    font.set("Encoding", name("WinAnsiEncoding"));
    font
}

//! Form registration hook for PostScript output
//!
//! When pages are replayed as PostScript instead of being written to a PDF,
//! every form or image XObject becomes a PostScript form resource that has to
//! be declared up front. The rewriter reports each one to a [`FormSink`].

use std::collections::HashMap;
use lopdf::ObjectId;

/// Receives the XObjects a rewritten page draws
pub trait FormSink {
    /// Register the XObject `name` (destination resource name) backed by `id`
    ///
    /// Returns the identifier the PostScript side uses for it. Registering the
    /// same name twice returns the same identifier.
    fn register_form(&mut self, name: &str, id: ObjectId) -> String;
}

/// Numbers forms as `EmbeddedForm:1`, `EmbeddedForm:2`, ...
#[derive(Debug, Default)]
pub struct PsFormRegistry {
    forms: Vec<(String, ObjectId, String)>,
    by_name: HashMap<String, usize>,
}

impl PsFormRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.forms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forms.is_empty()
    }

    /// PostScript identifier registered for a resource name
    pub fn form_id(&self, name: &str) -> Option<&str> {
        self.by_name.get(name).map(|index| self.forms[*index].2.as_str())
    }

    /// Destination object behind a PostScript identifier
    pub fn object_for(&self, form_id: &str) -> Option<ObjectId> {
        self.forms.iter().find(|(_, _, id)| id == form_id).map(|(_, object, _)| *object)
    }

    /// Resource declarations for the document prolog
    pub fn include_directives(&self) -> String {
        self.forms
            .iter()
            .map(|(_, _, id)| format!("%%IncludeResource: form {}\n", id))
            .collect()
    }

    /// Code that paints a registered form
    pub fn paint(&self, name: &str) -> Option<String> {
        self.form_id(name).map(|id| format!("{} execform\n", id))
    }
}

impl FormSink for PsFormRegistry {
    fn register_form(&mut self, name: &str, id: ObjectId) -> String {
        if let Some(index) = self.by_name.get(name) {
            return self.forms[*index].2.clone();
        }
        let form_id = format!("EmbeddedForm:{}", self.forms.len() + 1);
        self.by_name.insert(name.to_string(), self.forms.len());
        self.forms.push((name.to_string(), id, form_id.clone()));
        form_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forms_numbered_once() {
        let mut registry = PsFormRegistry::new();
        assert_eq!(registry.register_form("Fm0_12", (12, 0)), "EmbeddedForm:1");
        assert_eq!(registry.register_form("Im1_13", (13, 0)), "EmbeddedForm:2");
        assert_eq!(registry.register_form("Fm0_12", (12, 0)), "EmbeddedForm:1");
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.object_for("EmbeddedForm:2"), Some((13, 0)));
    }

    #[test]
    fn test_directives() {
        let mut registry = PsFormRegistry::new();
        registry.register_form("Fm0_12", (12, 0));
        assert_eq!(registry.include_directives(), "%%IncludeResource: form EmbeddedForm:1\n");
        assert_eq!(registry.paint("Fm0_12").as_deref(), Some("EmbeddedForm:1 execform\n"));
        assert!(registry.paint("Other").is_none());
    }
}

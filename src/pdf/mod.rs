//! PDF page embedding module

pub mod annotations;
pub mod codec;
pub mod content;
#[cfg(test)]
mod fixtures;
pub mod fonts;
pub mod postscript;
pub mod resources;
mod scan;
pub mod session;
pub mod source;
pub mod structure;
pub mod transform;

// Re-export commonly used items
pub use annotations::{AnnotationStructRef, PageNumberRegistry};
pub use codec::{FontProgramCodec, SfntCodec};
pub use content::{FontMode, RewriteOptions, RewrittenPage};
pub use fonts::{FontFormat, FontRegistry, LogicalFont};
pub use postscript::{FormSink, PsFormRegistry};
pub use resources::{ResourceCategory, ResourceKeyCache};
pub use session::{DestinationPage, EmbedPlacement, MergeSession, SessionOptions};
pub use source::{SourceDocument, SourcePage};
pub use structure::{find_parent_tree_array, ParentTreeEntry, StructureParentEntry, StructureTree};
pub use transform::Rotation;

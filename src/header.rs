//! Stream-level metadata.

use crate::location::Bounds;

/// Metadata of an OSM data stream, decoded once per input before any entity
/// buffer is delivered. Consumers treat it as read-only.
#[derive(Debug, Clone, Default)]
pub struct Header {
    /// Bounding box of the data, if the writer recorded one.
    pub bounding_box: Option<Bounds>,
    /// Features a reader must understand to process the stream.
    pub required_features: Vec<String>,
    /// Features a reader may ignore.
    pub optional_features: Vec<String>,
    /// Name of the program that wrote the stream.
    pub writing_program: String,
    /// True if the stream may contain several versions of the same object.
    pub has_multiple_object_versions: bool,
}

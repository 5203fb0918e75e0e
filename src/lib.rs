//! Streaming decoder for OpenStreetMap data.
//!
//! This crate covers the core of an OSM processing toolchain:
//!
//! * a parallel, order-preserving decoder for the PBF binary format
//!   ([`pbf::PbfReader`]),
//! * a byte-accurate parser for the OPL text format ([`opl::OplReader`]),
//! * a family of id-to-location indexes used while assembling geometries
//!   ([`index::LocationIndex`]),
//! * the fixed-point [`location::Location`] and [`segment::NodeRefSegment`]
//!   primitives the assembly math is built on.
//!
//! Both readers produce [`buffer::EntityBuffer`] batches with identical
//! entity representations, so downstream code does not care which format
//! the data came from.

pub mod buffer;
pub mod entity;
pub mod error;
pub mod header;
pub mod index;
pub mod location;
pub mod opl;
pub mod pbf;
pub mod segment;

pub use buffer::EntityBuffer;
pub use entity::{
    Changeset, Entity, EntityFilter, ItemType, Metadata, Node, NodeRef, ObjectId, Relation,
    RelationMember, TagList, Timestamp, Way,
};
pub use error::{Error, Result};
pub use header::Header;
pub use index::{create_map, map_types, LocationIndex};
pub use location::{Bounds, Location};
pub use opl::OplReader;
pub use pbf::PbfReader;
pub use segment::{NodeRefSegment, SegmentRole, WayHandle};

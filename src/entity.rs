//! The OSM entity model: nodes, ways, relations and changesets.

use std::fmt;
use std::ops::BitOr;

use chrono::NaiveDateTime;

use crate::location::{Bounds, Location};

/// Signed OSM object id.
pub type ObjectId = i64;

/// Seconds since the Unix epoch; zero means "not set".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

impl Timestamp {
    pub const fn from_seconds(seconds: i64) -> Self {
        Self(seconds)
    }

    pub const fn seconds(&self) -> i64 {
        self.0
    }

    pub const fn is_set(&self) -> bool {
        self.0 != 0
    }

    /// Parses the 20-character extended ISO-8601 UTC form
    /// `YYYY-MM-DDTHH:MM:SSZ`.
    pub fn parse_iso(s: &str) -> Option<Self> {
        let dt = NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).ok()?;
        Some(Self(dt.and_utc().timestamp()))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match chrono::DateTime::from_timestamp(self.0, 0) {
            Some(dt) => write!(f, "{}", dt.format(TIMESTAMP_FORMAT)),
            None => write!(f, "(invalid timestamp)"),
        }
    }
}

/// The four kinds of OSM entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemType {
    Node,
    Way,
    Relation,
    Changeset,
}

impl ItemType {
    /// Maps the single-character OPL encoding to an item type.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'n' => Some(ItemType::Node),
            b'w' => Some(ItemType::Way),
            b'r' => Some(ItemType::Relation),
            b'c' => Some(ItemType::Changeset),
            _ => None,
        }
    }

    pub fn as_char(&self) -> char {
        match self {
            ItemType::Node => 'n',
            ItemType::Way => 'w',
            ItemType::Relation => 'r',
            ItemType::Changeset => 'c',
        }
    }
}

/// Bitmask selecting which entity kinds a parser should emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityFilter(u8);

impl EntityFilter {
    pub const NOTHING: Self = Self(0);
    pub const NODES: Self = Self(1);
    pub const WAYS: Self = Self(2);
    pub const RELATIONS: Self = Self(4);
    pub const CHANGESETS: Self = Self(8);
    pub const OBJECTS: Self = Self(1 | 2 | 4);
    pub const ALL: Self = Self(1 | 2 | 4 | 8);

    pub fn contains(self, item_type: ItemType) -> bool {
        let bit = match item_type {
            ItemType::Node => 1,
            ItemType::Way => 2,
            ItemType::Relation => 4,
            ItemType::Changeset => 8,
        };
        self.0 & bit != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl Default for EntityFilter {
    fn default() -> Self {
        Self::ALL
    }
}

impl BitOr for EntityFilter {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Common metadata shared by nodes, ways and relations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub version: u32,
    pub visible: bool,
    pub timestamp: Timestamp,
    pub changeset: u32,
    pub uid: u32,
    pub user: String,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            version: 0,
            visible: true,
            timestamp: Timestamp::default(),
            changeset: 0,
            uid: 0,
            user: String::new(),
        }
    }
}

/// Ordered list of key/value tags. Duplicate keys are preserved as written
/// by the producer.
pub type TagList = Vec<(String, String)>;

/// A reference to a node, optionally with a prefilled location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRef {
    pub id: ObjectId,
    pub location: Location,
}

impl NodeRef {
    pub const fn new(id: ObjectId, location: Location) -> Self {
        Self { id, location }
    }

    pub const fn without_location(id: ObjectId) -> Self {
        Self {
            id,
            location: Location::undefined(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Node {
    pub id: ObjectId,
    pub meta: Metadata,
    pub tags: TagList,
    pub location: Location,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Way {
    pub id: ObjectId,
    pub meta: Metadata,
    pub tags: TagList,
    pub nodes: Vec<NodeRef>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationMember {
    pub member_type: ItemType,
    pub id: ObjectId,
    pub role: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Relation {
    pub id: ObjectId,
    pub meta: Metadata,
    pub tags: TagList,
    pub members: Vec<RelationMember>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Changeset {
    pub id: u32,
    pub uid: u32,
    pub user: String,
    pub created_at: Timestamp,
    pub closed_at: Timestamp,
    pub num_changes: u32,
    pub num_comments: u32,
    pub bounds: Bounds,
    pub tags: TagList,
}

/// A single decoded OSM entity.
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    Node(Node),
    Way(Way),
    Relation(Relation),
    Changeset(Changeset),
}

impl Entity {
    pub fn item_type(&self) -> ItemType {
        match self {
            Entity::Node(_) => ItemType::Node,
            Entity::Way(_) => ItemType::Way,
            Entity::Relation(_) => ItemType::Relation,
            Entity::Changeset(_) => ItemType::Changeset,
        }
    }
}

//! Append-only arena of decoded entities.
//!
//! An [`EntityBuffer`] is the unit of handoff between pipeline stages: a
//! decoder fills one, commits every entity and moves the whole buffer to the
//! consumer. Entities become visible to iteration only once committed, so a
//! parse failure can always roll the buffer back to the last good state.

use crate::entity::{
    Changeset, Entity, Metadata, Node, NodeRef, ObjectId, Relation, RelationMember, TagList,
    Timestamp, Way,
};
use crate::location::{Bounds, Location};

#[derive(Debug, Default)]
pub struct EntityBuffer {
    entities: Vec<Entity>,
    committed: usize,
}

impl EntityBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entities: Vec::with_capacity(capacity),
            committed: 0,
        }
    }

    /// Makes sure there is room for at least `capacity` entities in total.
    pub fn reserve(&mut self, capacity: usize) {
        self.entities
            .reserve(capacity.saturating_sub(self.entities.len()));
    }

    /// Number of committed entities.
    pub fn len(&self) -> usize {
        self.committed
    }

    pub fn is_empty(&self) -> bool {
        self.committed == 0
    }

    /// Iterates over the committed entities in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities[..self.committed].iter()
    }

    /// Appends a finished entity and commits it immediately.
    pub fn push(&mut self, entity: Entity) {
        self.entities.truncate(self.committed);
        self.entities.push(entity);
        self.committed = self.entities.len();
    }

    /// Drops everything appended after the last commit.
    pub fn rollback(&mut self) {
        self.entities.truncate(self.committed);
    }

    pub fn clear(&mut self) {
        self.entities.clear();
        self.committed = 0;
    }

    pub fn start_node(&mut self, id: ObjectId) -> NodeBuilder<'_> {
        NodeBuilder {
            buffer: self,
            node: Node {
                id,
                ..Node::default()
            },
        }
    }

    pub fn start_way(&mut self, id: ObjectId) -> WayBuilder<'_> {
        WayBuilder {
            buffer: self,
            way: Way {
                id,
                ..Way::default()
            },
        }
    }

    pub fn start_relation(&mut self, id: ObjectId) -> RelationBuilder<'_> {
        RelationBuilder {
            buffer: self,
            relation: Relation {
                id,
                ..Relation::default()
            },
        }
    }

    pub fn start_changeset(&mut self, id: u32) -> ChangesetBuilder<'_> {
        ChangesetBuilder {
            buffer: self,
            changeset: Changeset {
                id,
                ..Changeset::default()
            },
        }
    }
}

impl<'a> IntoIterator for &'a EntityBuffer {
    type Item = &'a Entity;
    type IntoIter = std::slice::Iter<'a, Entity>;

    fn into_iter(self) -> Self::IntoIter {
        self.entities[..self.committed].iter()
    }
}

macro_rules! metadata_setters {
    ($builder:ident, $field:ident) => {
        impl<'a> $builder<'a> {
            pub fn set_version(&mut self, version: u32) -> &mut Self {
                self.$field.meta.version = version;
                self
            }

            pub fn set_visible(&mut self, visible: bool) -> &mut Self {
                self.$field.meta.visible = visible;
                self
            }

            pub fn set_timestamp(&mut self, timestamp: Timestamp) -> &mut Self {
                self.$field.meta.timestamp = timestamp;
                self
            }

            pub fn set_changeset(&mut self, changeset: u32) -> &mut Self {
                self.$field.meta.changeset = changeset;
                self
            }

            pub fn set_uid(&mut self, uid: u32) -> &mut Self {
                self.$field.meta.uid = uid;
                self
            }

            pub fn set_user(&mut self, user: impl Into<String>) -> &mut Self {
                self.$field.meta.user = user.into();
                self
            }

            pub fn set_metadata(&mut self, meta: Metadata) -> &mut Self {
                self.$field.meta = meta;
                self
            }

            pub fn add_tag(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
                self.$field.tags.push((key.into(), value.into()));
                self
            }

            /// Direct access to the tag list for nested section parsers.
            pub fn tags_mut(&mut self) -> &mut TagList {
                &mut self.$field.tags
            }
        }
    };
}

/// Builder for a node staged on an [`EntityBuffer`].
///
/// Dropping a builder without calling [`NodeBuilder::commit`] discards the
/// staged entity and leaves the buffer untouched.
pub struct NodeBuilder<'a> {
    buffer: &'a mut EntityBuffer,
    node: Node,
}

metadata_setters!(NodeBuilder, node);

impl<'a> NodeBuilder<'a> {
    pub fn set_location(&mut self, location: Location) -> &mut Self {
        self.node.location = location;
        self
    }

    pub fn commit(self) {
        self.buffer.push(Entity::Node(self.node));
    }
}

pub struct WayBuilder<'a> {
    buffer: &'a mut EntityBuffer,
    way: Way,
}

metadata_setters!(WayBuilder, way);

impl<'a> WayBuilder<'a> {
    pub fn add_node_ref(&mut self, node_ref: NodeRef) -> &mut Self {
        self.way.nodes.push(node_ref);
        self
    }

    pub fn nodes_mut(&mut self) -> &mut Vec<NodeRef> {
        &mut self.way.nodes
    }

    pub fn commit(self) {
        self.buffer.push(Entity::Way(self.way));
    }
}

pub struct RelationBuilder<'a> {
    buffer: &'a mut EntityBuffer,
    relation: Relation,
}

metadata_setters!(RelationBuilder, relation);

impl<'a> RelationBuilder<'a> {
    pub fn add_member(&mut self, member: RelationMember) -> &mut Self {
        self.relation.members.push(member);
        self
    }

    pub fn members_mut(&mut self) -> &mut Vec<RelationMember> {
        &mut self.relation.members
    }

    pub fn commit(self) {
        self.buffer.push(Entity::Relation(self.relation));
    }
}

pub struct ChangesetBuilder<'a> {
    buffer: &'a mut EntityBuffer,
    changeset: Changeset,
}

impl<'a> ChangesetBuilder<'a> {
    pub fn set_uid(&mut self, uid: u32) -> &mut Self {
        self.changeset.uid = uid;
        self
    }

    pub fn set_user(&mut self, user: impl Into<String>) -> &mut Self {
        self.changeset.user = user.into();
        self
    }

    pub fn set_created_at(&mut self, timestamp: Timestamp) -> &mut Self {
        self.changeset.created_at = timestamp;
        self
    }

    pub fn set_closed_at(&mut self, timestamp: Timestamp) -> &mut Self {
        self.changeset.closed_at = timestamp;
        self
    }

    pub fn set_num_changes(&mut self, num_changes: u32) -> &mut Self {
        self.changeset.num_changes = num_changes;
        self
    }

    pub fn set_num_comments(&mut self, num_comments: u32) -> &mut Self {
        self.changeset.num_comments = num_comments;
        self
    }

    pub fn set_bounds(&mut self, bounds: Bounds) -> &mut Self {
        self.changeset.bounds = bounds;
        self
    }

    pub fn add_tag(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.changeset.tags.push((key.into(), value.into()));
        self
    }

    pub fn tags_mut(&mut self) -> &mut TagList {
        &mut self.changeset.tags
    }

    pub fn commit(self) {
        self.buffer.push(Entity::Changeset(self.changeset));
    }
}

//! Decoding of PBF blobs into headers and entity buffers.

use std::io::Read;

use flate2::read::ZlibDecoder;
use prost::Message;

use super::proto;
use super::MAX_UNCOMPRESSED_BLOB_SIZE;
use crate::buffer::EntityBuffer;
use crate::entity::{EntityFilter, ItemType, Metadata, NodeRef, RelationMember, Timestamp};
use crate::error::{Error, Result};
use crate::header::Header;
use crate::location::{Bounds, Location};

/// Nanodegrees per location unit.
const RESOLUTION: i64 = 100;

pub(crate) fn decode_header(data: &[u8]) -> Result<Header> {
    let block = proto::HeaderBlock::decode(data)
        .map_err(|e| Error::pbf(format!("invalid HeaderBlock: {e}")))?;

    let mut header = Header::default();
    for feature in block.required_features {
        match feature.as_str() {
            "OsmSchema-V0.6" | "DenseNodes" => {}
            "HistoricalInformation" => header.has_multiple_object_versions = true,
            _ => {
                return Err(Error::pbf(format!(
                    "required feature not supported: {feature}"
                )))
            }
        }
        header.required_features.push(feature);
    }
    header.optional_features = block.optional_features;
    if let Some(program) = block.writingprogram {
        header.writing_program = program;
    }
    if let Some(bbox) = block.bbox {
        header.bounding_box = Some(Bounds::from_corners(
            Location::new((bbox.left / RESOLUTION) as i32, (bbox.bottom / RESOLUTION) as i32),
            Location::new((bbox.right / RESOLUTION) as i32, (bbox.top / RESOLUTION) as i32),
        ));
    }
    Ok(header)
}

pub(crate) fn decode_data_blob(data: &[u8], filter: EntityFilter) -> Result<EntityBuffer> {
    let payload = extract_blob_payload(data)?;
    let block = proto::PrimitiveBlock::decode(payload.as_slice())
        .map_err(|e| Error::pbf(format!("invalid PrimitiveBlock: {e}")))?;
    decode_primitive_block(block, filter)
}

fn extract_blob_payload(data: &[u8]) -> Result<Vec<u8>> {
    let blob = proto::Blob::decode(data).map_err(|e| Error::pbf(format!("invalid Blob: {e}")))?;

    if let Some(raw) = blob.raw {
        return Ok(raw);
    }
    if let Some(zlib_data) = blob.zlib_data {
        let raw_size = blob.raw_size.unwrap_or(0);
        if raw_size < 0 || raw_size as usize > MAX_UNCOMPRESSED_BLOB_SIZE {
            return Err(Error::pbf(format!("invalid blob size: {raw_size}")));
        }
        let mut payload = Vec::with_capacity(raw_size as usize);
        ZlibDecoder::new(zlib_data.as_slice())
            .read_to_end(&mut payload)
            .map_err(|e| Error::pbf(format!("zlib decompression failed: {e}")))?;
        if payload.len() != raw_size as usize {
            return Err(Error::pbf(
                "decompressed blob size does not match raw_size",
            ));
        }
        return Ok(payload);
    }
    Err(Error::pbf("can only read raw or zlib compressed blob"))
}

struct BlockContext {
    strings: Vec<String>,
    granularity: i64,
    lat_offset: i64,
    lon_offset: i64,
    date_granularity: i64,
}

impl BlockContext {
    fn new(block: &mut proto::PrimitiveBlock) -> Result<Self> {
        let strings = std::mem::take(&mut block.stringtable.s)
            .into_iter()
            .map(|bytes| {
                String::from_utf8(bytes)
                    .map_err(|_| Error::pbf("invalid UTF-8 in string table"))
            })
            .collect::<Result<Vec<String>>>()?;
        Ok(Self {
            strings,
            granularity: i64::from(block.granularity.unwrap_or(100)),
            lat_offset: block.lat_offset.unwrap_or(0),
            lon_offset: block.lon_offset.unwrap_or(0),
            date_granularity: i64::from(block.date_granularity.unwrap_or(1000)),
        })
    }

    fn string(&self, idx: usize) -> Result<&str> {
        self.strings
            .get(idx)
            .map(String::as_str)
            .ok_or_else(|| Error::pbf("string table index out of range"))
    }

    fn location(&self, raw_lon: i64, raw_lat: i64) -> Location {
        Location::new(
            ((self.lon_offset + self.granularity * raw_lon) / RESOLUTION) as i32,
            ((self.lat_offset + self.granularity * raw_lat) / RESOLUTION) as i32,
        )
    }

    fn timestamp(&self, raw: i64) -> Timestamp {
        Timestamp::from_seconds(raw * self.date_granularity / 1000)
    }

    fn metadata(&self, info: Option<&proto::Info>) -> Result<Metadata> {
        let mut meta = Metadata::default();
        if let Some(info) = info {
            meta.version = info.version.unwrap_or(0).max(0) as u32;
            meta.visible = info.visible.unwrap_or(true);
            meta.timestamp = self.timestamp(info.timestamp.unwrap_or(0));
            meta.changeset = info.changeset.unwrap_or(0).max(0) as u32;
            meta.uid = info.uid.unwrap_or(0).max(0) as u32;
            if let Some(user_sid) = info.user_sid {
                meta.user = self.string(user_sid as usize)?.to_string();
            }
        }
        Ok(meta)
    }

    fn tags(&self, keys: &[u32], vals: &[u32]) -> Result<Vec<(String, String)>> {
        if keys.len() != vals.len() {
            return Err(Error::pbf("mismatched tag key and value arrays"));
        }
        keys.iter()
            .zip(vals.iter())
            .map(|(&k, &v)| {
                Ok((
                    self.string(k as usize)?.to_string(),
                    self.string(v as usize)?.to_string(),
                ))
            })
            .collect()
    }
}

fn decode_primitive_block(
    mut block: proto::PrimitiveBlock,
    filter: EntityFilter,
) -> Result<EntityBuffer> {
    let ctx = BlockContext::new(&mut block)?;
    let mut buffer = EntityBuffer::new();

    for group in block.primitivegroup {
        if let Some(dense) = group.dense {
            if filter.contains(ItemType::Node) {
                decode_dense_nodes(&ctx, dense, &mut buffer)?;
            }
        } else if !group.nodes.is_empty() {
            if filter.contains(ItemType::Node) {
                decode_nodes(&ctx, group.nodes, &mut buffer)?;
            }
        } else if !group.ways.is_empty() {
            if filter.contains(ItemType::Way) {
                decode_ways(&ctx, group.ways, &mut buffer)?;
            }
        } else if !group.relations.is_empty() {
            if filter.contains(ItemType::Relation) {
                decode_relations(&ctx, group.relations, &mut buffer)?;
            }
        } else if !group.changesets.is_empty() {
            return Err(Error::pbf("changesets in PBF format are not supported"));
        }
    }
    Ok(buffer)
}

fn decode_dense_nodes(
    ctx: &BlockContext,
    dense: proto::DenseNodes,
    buffer: &mut EntityBuffer,
) -> Result<()> {
    let n = dense.id.len();
    if dense.lat.len() != n || dense.lon.len() != n {
        return Err(Error::pbf("malformed DenseNodes: unequal array lengths"));
    }

    let mut id = 0i64;
    let mut lat = 0i64;
    let mut lon = 0i64;
    let mut timestamp = 0i64;
    let mut changeset = 0i64;
    let mut uid = 0i64;
    let mut user_sid = 0i64;
    let mut tags_offset = 0usize;

    for i in 0..n {
        id += dense.id[i];
        lat += dense.lat[i];
        lon += dense.lon[i];

        let mut builder = buffer.start_node(id);
        builder.set_location(ctx.location(lon, lat));

        if let Some(info) = &dense.denseinfo {
            timestamp += info.timestamp.get(i).copied().unwrap_or(0);
            changeset += info.changeset.get(i).copied().unwrap_or(0);
            uid += i64::from(info.uid.get(i).copied().unwrap_or(0));
            user_sid += i64::from(info.user_sid.get(i).copied().unwrap_or(0));

            builder.set_version(info.version.get(i).copied().unwrap_or(0).max(0) as u32);
            builder.set_visible(info.visible.get(i).copied().unwrap_or(true));
            builder.set_timestamp(ctx.timestamp(timestamp));
            builder.set_changeset(changeset.max(0) as u32);
            builder.set_uid(uid.max(0) as u32);
            let user = ctx.string(user_sid.max(0) as usize)?.to_string();
            builder.set_user(user);
        }

        while tags_offset < dense.keys_vals.len() {
            let k = dense.keys_vals[tags_offset];
            tags_offset += 1;
            if k == 0 {
                break;
            }
            if tags_offset >= dense.keys_vals.len() {
                return Err(Error::pbf("malformed DenseNodes: truncated keys_vals"));
            }
            let v = dense.keys_vals[tags_offset];
            tags_offset += 1;
            let key = ctx.string(k as usize)?.to_string();
            let value = ctx.string(v as usize)?.to_string();
            builder.add_tag(key, value);
        }

        builder.commit();
    }
    Ok(())
}

fn decode_nodes(
    ctx: &BlockContext,
    nodes: Vec<proto::Node>,
    buffer: &mut EntityBuffer,
) -> Result<()> {
    for node in nodes {
        let mut builder = buffer.start_node(node.id);
        builder.set_metadata(ctx.metadata(node.info.as_ref())?);
        builder.set_location(ctx.location(node.lon, node.lat));
        *builder.tags_mut() = ctx.tags(&node.keys, &node.vals)?;
        builder.commit();
    }
    Ok(())
}

fn decode_ways(ctx: &BlockContext, ways: Vec<proto::Way>, buffer: &mut EntityBuffer) -> Result<()> {
    for way in ways {
        let mut builder = buffer.start_way(way.id);
        builder.set_metadata(ctx.metadata(way.info.as_ref())?);
        *builder.tags_mut() = ctx.tags(&way.keys, &way.vals)?;

        let mut node_ref = 0i64;
        for delta in way.refs {
            node_ref += delta;
            builder.add_node_ref(NodeRef::without_location(node_ref));
        }
        builder.commit();
    }
    Ok(())
}

fn decode_relations(
    ctx: &BlockContext,
    relations: Vec<proto::Relation>,
    buffer: &mut EntityBuffer,
) -> Result<()> {
    for relation in relations {
        if relation.roles_sid.len() != relation.memids.len()
            || relation.memids.len() != relation.types.len()
        {
            return Err(Error::pbf("malformed Relation: unequal member arrays"));
        }

        let mut builder = buffer.start_relation(relation.id);
        builder.set_metadata(ctx.metadata(relation.info.as_ref())?);
        *builder.tags_mut() = ctx.tags(&relation.keys, &relation.vals)?;

        let mut memid = 0i64;
        for i in 0..relation.memids.len() {
            memid += relation.memids[i];
            let member_type = match proto::relation::MemberType::from_i32(relation.types[i]) {
                Some(proto::relation::MemberType::Node) => ItemType::Node,
                Some(proto::relation::MemberType::Way) => ItemType::Way,
                Some(proto::relation::MemberType::Relation) => ItemType::Relation,
                None => return Err(Error::pbf("malformed Relation: unknown member type")),
            };
            let role = ctx.string(relation.roles_sid[i].max(0) as usize)?.to_string();
            builder.add_member(RelationMember {
                member_type,
                id: memid,
                role,
            });
        }
        builder.commit();
    }
    Ok(())
}

//! Parser for the OPL text format.
//!
//! OPL encodes one entity per line as a type character, an id and a list of
//! single-character fields in free order. Strings are unquoted with
//! `%HHHH%` hex escapes for everything that would collide with the field
//! separators. The parser reports errors with the exact line and byte
//! column and never leaves a partially built entity in the buffer.

use std::io::BufRead;

use crate::buffer::EntityBuffer;
use crate::entity::{EntityFilter, ItemType, NodeRef, RelationMember, Timestamp};
use crate::error::{Error, Result};
use crate::location::{Bounds, Location};

// Arbitrary limit how long integers can get.
const MAX_INT_LEN: usize = 16;

/// Consumes consecutive space and tab characters. There must be at least
/// one.
fn parse_space(data: &[u8], pos: &mut usize) -> Result<()> {
    if !matches!(data.get(*pos), Some(&(b' ' | b'\t'))) {
        return Err(Error::opl("expected space or tab character", *pos));
    }
    while matches!(data.get(*pos), Some(&(b' ' | b'\t'))) {
        *pos += 1;
    }
    Ok(())
}

/// True if `pos` points at something other than the end of the line or a
/// space or tab.
fn non_empty(data: &[u8], pos: usize) -> bool {
    !matches!(data.get(pos), None | Some(&(b' ' | b'\t')))
}

/// Advances to the next space or tab character or the end of the line and
/// returns the new position.
fn skip_section(data: &[u8], pos: &mut usize) -> usize {
    while non_empty(data, *pos) {
        *pos += 1;
    }
    *pos
}

/// Parses one `%...%` hex escape and appends the encoded Unicode scalar to
/// `out` as UTF-8.
fn parse_escaped(data: &[u8], pos: &mut usize, out: &mut Vec<u8>) -> Result<()> {
    let mut value: u32 = 0;
    for _ in 0..=8 {
        let b = match data.get(*pos) {
            None => return Err(Error::opl("eol", *pos)),
            Some(b) => *b,
        };
        if b == b'%' {
            *pos += 1;
            let c = char::from_u32(value)
                .ok_or_else(|| Error::opl("invalid unicode code point", *pos))?;
            let mut encoded = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut encoded).as_bytes());
            return Ok(());
        }
        let digit = match b {
            b'0'..=b'9' => u32::from(b - b'0'),
            b'a'..=b'f' => u32::from(b - b'a') + 10,
            b'A'..=b'F' => u32::from(b - b'A') + 10,
            _ => return Err(Error::opl("not a hex char", *pos)),
        };
        value = (value << 4) | digit;
        *pos += 1;
    }
    Err(Error::opl("hex escape too long", *pos))
}

/// Parses a string up to the end of the line or the next space, tab, comma
/// or equal sign, resolving escapes.
fn parse_string(data: &[u8], pos: &mut usize) -> Result<String> {
    let start = *pos;
    let mut out = Vec::new();
    loop {
        match data.get(*pos) {
            None | Some(&(b' ' | b'\t' | b',' | b'=')) => break,
            Some(&b'%') => {
                *pos += 1;
                parse_escaped(data, pos, &mut out)?;
            }
            Some(b) => {
                out.push(*b);
                *pos += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|_| Error::opl("invalid UTF-8 string", start))
}

/// Parses an integer of at most 15 digits that must fit the target type.
fn parse_int<T: TryFrom<i64>>(data: &[u8], pos: &mut usize) -> Result<T> {
    if *pos >= data.len() {
        return Err(Error::opl("expected integer", *pos));
    }
    let negative = data[*pos] == b'-';
    if negative {
        *pos += 1;
    }

    let mut value: i64 = 0;
    let mut n = MAX_INT_LEN;
    while let Some(d) = data.get(*pos).filter(|b| b.is_ascii_digit()) {
        n -= 1;
        if n == 0 {
            return Err(Error::opl("integer too long", *pos));
        }
        value = value * 10 + i64::from(d - b'0');
        *pos += 1;
    }
    if n == MAX_INT_LEN {
        return Err(Error::opl("expected integer", *pos));
    }

    if negative {
        value = -value;
    }
    T::try_from(value).map_err(|_| Error::opl("integer too long", *pos))
}

fn parse_visible(data: &[u8], pos: &mut usize) -> Result<bool> {
    match data.get(*pos) {
        Some(&b'V') => {
            *pos += 1;
            Ok(true)
        }
        Some(&b'D') => {
            *pos += 1;
            Ok(false)
        }
        _ => Err(Error::opl("invalid visible flag", *pos)),
    }
}

/// Parses a timestamp in the 20-character extended ISO-8601 UTC format. An
/// empty field yields the unset timestamp.
fn parse_timestamp(data: &[u8], pos: &mut usize) -> Result<Timestamp> {
    if !non_empty(data, *pos) {
        return Ok(Timestamp::default());
    }
    let end = *pos + 20;
    let timestamp = data
        .get(*pos..end)
        .and_then(|bytes| std::str::from_utf8(bytes).ok())
        .and_then(Timestamp::parse_iso)
        .ok_or_else(|| Error::opl("can not parse timestamp", *pos))?;
    *pos = end;
    Ok(timestamp)
}

/// Checks that `pos` points at the given character and consumes it.
fn parse_char(data: &[u8], pos: &mut usize, c: u8) -> Result<()> {
    if data.get(*pos) == Some(&c) {
        *pos += 1;
        return Ok(());
    }
    Err(Error::opl(format!("expected '{}'", c as char), *pos))
}

/// Parses a `key=value,key=value,...` tag section. `data` must be
/// truncated at the section end.
fn parse_tags(data: &[u8], mut pos: usize, tags: &mut Vec<(String, String)>) -> Result<()> {
    loop {
        let key = parse_string(data, &mut pos)?;
        parse_char(data, &mut pos, b'=')?;
        let value = parse_string(data, &mut pos)?;
        tags.push((key, value));
        if !non_empty(data, pos) {
            break;
        }
        parse_char(data, &mut pos, b',')?;
    }
    Ok(())
}

/// Parses a `nID x<lon> y<lat>,...` way node section. `data` must be
/// truncated at the section end.
fn parse_way_nodes(data: &[u8], mut pos: usize, nodes: &mut Vec<NodeRef>) -> Result<()> {
    while pos < data.len() {
        parse_char(data, &mut pos, b'n')?;
        if pos == data.len() {
            return Err(Error::opl("expected integer", pos));
        }
        let id = parse_int::<i64>(data, &mut pos)?;
        if pos == data.len() {
            nodes.push(NodeRef::without_location(id));
            return Ok(());
        }

        let mut location = Location::undefined();
        if data[pos] == b'x' {
            pos += 1;
            location.set_lon_partial(data, &mut pos)?;
            if pos < data.len() && data[pos] == b'y' {
                pos += 1;
                location.set_lat_partial(data, &mut pos)?;
            }
        }
        nodes.push(NodeRef::new(id, location));

        if pos == data.len() {
            return Ok(());
        }
        parse_char(data, &mut pos, b',')?;
    }
    Ok(())
}

/// Parses a `[nwr]ID@role,...` member section. `data` must be truncated at
/// the section end.
fn parse_relation_members(
    data: &[u8],
    mut pos: usize,
    members: &mut Vec<RelationMember>,
) -> Result<()> {
    while pos < data.len() {
        let member_type = match ItemType::from_byte(data[pos]) {
            Some(t @ (ItemType::Node | ItemType::Way | ItemType::Relation)) => t,
            _ => return Err(Error::opl("unknown object type", pos)),
        };
        pos += 1;

        if pos == data.len() {
            return Err(Error::opl("expected integer", pos));
        }
        let id = parse_int::<i64>(data, &mut pos)?;
        parse_char(data, &mut pos, b'@')?;
        if pos == data.len() {
            members.push(RelationMember {
                member_type,
                id,
                role: String::new(),
            });
            return Ok(());
        }
        let role = parse_string(data, &mut pos)?;
        members.push(RelationMember {
            member_type,
            id,
            role,
        });

        if pos == data.len() {
            return Ok(());
        }
        parse_char(data, &mut pos, b',')?;
    }
    Ok(())
}

fn parse_node(data: &[u8], pos: &mut usize, buffer: &mut EntityBuffer) -> Result<()> {
    let id = parse_int::<i64>(data, pos)?;
    let mut builder = buffer.start_node(id);

    let mut tags_section = None;
    let mut user = String::new();
    let mut location = Location::undefined();

    while *pos < data.len() {
        parse_space(data, pos)?;
        if *pos == data.len() {
            break;
        }
        let c = data[*pos];
        *pos += 1;
        match c {
            b'v' => {
                let version = parse_int(data, pos)?;
                builder.set_version(version);
            }
            b'd' => {
                let visible = parse_visible(data, pos)?;
                builder.set_visible(visible);
            }
            b'c' => {
                let changeset = parse_int(data, pos)?;
                builder.set_changeset(changeset);
            }
            b't' => {
                let timestamp = parse_timestamp(data, pos)?;
                builder.set_timestamp(timestamp);
            }
            b'i' => {
                let uid = parse_int(data, pos)?;
                builder.set_uid(uid);
            }
            b'u' => user = parse_string(data, pos)?,
            b'T' => {
                if non_empty(data, *pos) {
                    let start = *pos;
                    let end = skip_section(data, pos);
                    tags_section = Some((start, end));
                }
            }
            b'x' => {
                if non_empty(data, *pos) {
                    location.set_lon_partial(data, pos)?;
                }
            }
            b'y' => {
                if non_empty(data, *pos) {
                    location.set_lat_partial(data, pos)?;
                }
            }
            _ => {
                *pos -= 1;
                return Err(Error::opl("unknown attribute", *pos));
            }
        }
    }

    if location.valid() {
        builder.set_location(location);
    }
    builder.set_user(user);
    if let Some((start, end)) = tags_section {
        parse_tags(&data[..end], start, builder.tags_mut())?;
    }
    builder.commit();
    Ok(())
}

fn parse_way(data: &[u8], pos: &mut usize, buffer: &mut EntityBuffer) -> Result<()> {
    let id = parse_int::<i64>(data, pos)?;
    let mut builder = buffer.start_way(id);

    let mut tags_section = None;
    let mut nodes_section = None;
    let mut user = String::new();

    while *pos < data.len() {
        parse_space(data, pos)?;
        if *pos == data.len() {
            break;
        }
        let c = data[*pos];
        *pos += 1;
        match c {
            b'v' => {
                let version = parse_int(data, pos)?;
                builder.set_version(version);
            }
            b'd' => {
                let visible = parse_visible(data, pos)?;
                builder.set_visible(visible);
            }
            b'c' => {
                let changeset = parse_int(data, pos)?;
                builder.set_changeset(changeset);
            }
            b't' => {
                let timestamp = parse_timestamp(data, pos)?;
                builder.set_timestamp(timestamp);
            }
            b'i' => {
                let uid = parse_int(data, pos)?;
                builder.set_uid(uid);
            }
            b'u' => user = parse_string(data, pos)?,
            b'T' => {
                if non_empty(data, *pos) {
                    let start = *pos;
                    let end = skip_section(data, pos);
                    tags_section = Some((start, end));
                }
            }
            b'N' => {
                let start = *pos;
                let end = skip_section(data, pos);
                nodes_section = Some((start, end));
            }
            _ => {
                *pos -= 1;
                return Err(Error::opl("unknown attribute", *pos));
            }
        }
    }

    builder.set_user(user);
    if let Some((start, end)) = tags_section {
        parse_tags(&data[..end], start, builder.tags_mut())?;
    }
    if let Some((start, end)) = nodes_section {
        parse_way_nodes(&data[..end], start, builder.nodes_mut())?;
    }
    builder.commit();
    Ok(())
}

fn parse_relation(data: &[u8], pos: &mut usize, buffer: &mut EntityBuffer) -> Result<()> {
    let id = parse_int::<i64>(data, pos)?;
    let mut builder = buffer.start_relation(id);

    let mut tags_section = None;
    let mut members_section = None;
    let mut user = String::new();

    while *pos < data.len() {
        parse_space(data, pos)?;
        if *pos == data.len() {
            break;
        }
        let c = data[*pos];
        *pos += 1;
        match c {
            b'v' => {
                let version = parse_int(data, pos)?;
                builder.set_version(version);
            }
            b'd' => {
                let visible = parse_visible(data, pos)?;
                builder.set_visible(visible);
            }
            b'c' => {
                let changeset = parse_int(data, pos)?;
                builder.set_changeset(changeset);
            }
            b't' => {
                let timestamp = parse_timestamp(data, pos)?;
                builder.set_timestamp(timestamp);
            }
            b'i' => {
                let uid = parse_int(data, pos)?;
                builder.set_uid(uid);
            }
            b'u' => user = parse_string(data, pos)?,
            b'T' => {
                if non_empty(data, *pos) {
                    let start = *pos;
                    let end = skip_section(data, pos);
                    tags_section = Some((start, end));
                }
            }
            b'M' => {
                let start = *pos;
                let end = skip_section(data, pos);
                members_section = Some((start, end));
            }
            _ => {
                *pos -= 1;
                return Err(Error::opl("unknown attribute", *pos));
            }
        }
    }

    builder.set_user(user);
    if let Some((start, end)) = tags_section {
        parse_tags(&data[..end], start, builder.tags_mut())?;
    }
    if let Some((start, end)) = members_section {
        if start != end {
            parse_relation_members(&data[..end], start, builder.members_mut())?;
        }
    }
    builder.commit();
    Ok(())
}

fn parse_changeset(data: &[u8], pos: &mut usize, buffer: &mut EntityBuffer) -> Result<()> {
    let id = parse_int::<u32>(data, pos)?;
    let mut builder = buffer.start_changeset(id);

    let mut tags_section = None;
    let mut user = String::new();
    let mut location1 = Location::undefined();
    let mut location2 = Location::undefined();

    while *pos < data.len() {
        parse_space(data, pos)?;
        if *pos == data.len() {
            break;
        }
        let c = data[*pos];
        *pos += 1;
        match c {
            b'k' => {
                let num_changes = parse_int(data, pos)?;
                builder.set_num_changes(num_changes);
            }
            b's' => {
                let created_at = parse_timestamp(data, pos)?;
                builder.set_created_at(created_at);
            }
            b'e' => {
                let closed_at = parse_timestamp(data, pos)?;
                builder.set_closed_at(closed_at);
            }
            b'd' => {
                let num_comments = parse_int(data, pos)?;
                builder.set_num_comments(num_comments);
            }
            b'i' => {
                let uid = parse_int(data, pos)?;
                builder.set_uid(uid);
            }
            b'u' => user = parse_string(data, pos)?,
            b'x' => {
                if non_empty(data, *pos) {
                    location1.set_lon_partial(data, pos)?;
                }
            }
            b'y' => {
                if non_empty(data, *pos) {
                    location1.set_lat_partial(data, pos)?;
                }
            }
            b'X' => {
                if non_empty(data, *pos) {
                    location2.set_lon_partial(data, pos)?;
                }
            }
            b'Y' => {
                if non_empty(data, *pos) {
                    location2.set_lat_partial(data, pos)?;
                }
            }
            b'T' => {
                if non_empty(data, *pos) {
                    let start = *pos;
                    let end = skip_section(data, pos);
                    tags_section = Some((start, end));
                }
            }
            _ => {
                *pos -= 1;
                return Err(Error::opl("unknown attribute", *pos));
            }
        }
    }

    if location1.valid() && location2.valid() {
        let mut bounds = Bounds::new();
        bounds.extend(location1);
        bounds.extend(location2);
        builder.set_bounds(bounds);
    }
    builder.set_user(user);
    if let Some((start, end)) = tags_section {
        parse_tags(&data[..end], start, builder.tags_mut())?;
    }
    builder.commit();
    Ok(())
}

/// Parses one OPL line into the buffer.
///
/// Returns whether an entity was committed; empty lines, comment lines and
/// entities excluded by the filter yield `false`. On error the buffer is
/// rolled back to the last commit and the error carries the line number and
/// byte column of the offending input.
pub fn parse_line(
    line_number: u64,
    line: &[u8],
    buffer: &mut EntityBuffer,
    filter: EntityFilter,
) -> Result<bool> {
    parse_line_inner(line, buffer, filter).map_err(|e| {
        buffer.rollback();
        match e {
            Error::Opl {
                message, column, ..
            } => Error::Opl {
                message,
                line: line_number,
                column,
            },
            other => other,
        }
    })
}

fn parse_line_inner(line: &[u8], buffer: &mut EntityBuffer, filter: EntityFilter) -> Result<bool> {
    let mut pos = 1;
    match line.first() {
        None | Some(&b'#') => Ok(false),
        Some(&b'n') if filter.contains(ItemType::Node) => {
            parse_node(line, &mut pos, buffer)?;
            Ok(true)
        }
        Some(&b'w') if filter.contains(ItemType::Way) => {
            parse_way(line, &mut pos, buffer)?;
            Ok(true)
        }
        Some(&b'r') if filter.contains(ItemType::Relation) => {
            parse_relation(line, &mut pos, buffer)?;
            Ok(true)
        }
        Some(&b'c') if filter.contains(ItemType::Changeset) => {
            parse_changeset(line, &mut pos, buffer)?;
            Ok(true)
        }
        Some(&(b'n' | b'w' | b'r' | b'c')) => Ok(false),
        Some(_) => Err(Error::opl("unknown type", 0)),
    }
}

const ENTITIES_PER_BUFFER: usize = 512;

/// Line-by-line OPL reader producing committed entity buffers.
///
/// `read` returns an empty buffer at the end of the input, matching the PBF
/// consumer surface. A carriage return before the line feed is tolerated.
pub struct OplReader<R> {
    reader: R,
    filter: EntityFilter,
    line_number: u64,
    done: bool,
}

impl<R: BufRead> OplReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_filter(reader, EntityFilter::ALL)
    }

    pub fn with_filter(reader: R, filter: EntityFilter) -> Self {
        Self {
            reader,
            filter,
            line_number: 0,
            done: false,
        }
    }

    pub fn read(&mut self) -> Result<EntityBuffer> {
        let mut buffer = EntityBuffer::new();
        if self.done {
            return Ok(buffer);
        }
        let mut line = Vec::new();
        while buffer.len() < ENTITIES_PER_BUFFER {
            line.clear();
            if self.reader.read_until(b'\n', &mut line)? == 0 {
                self.done = true;
                break;
            }
            self.line_number += 1;
            let mut bytes = line.as_slice();
            if bytes.last() == Some(&b'\n') {
                bytes = &bytes[..bytes.len() - 1];
            }
            if bytes.last() == Some(&b'\r') {
                bytes = &bytes[..bytes.len() - 1];
            }
            parse_line(self.line_number, bytes, &mut buffer, self.filter)?;
        }
        Ok(buffer)
    }
}

//! On-disk encoding of a sibling group.
//!
//! Per-group blob: `{parent_morton: u64, children_mask: u8, count: u8,
//! lengths[count]: u32}` followed by `count` node blobs, each `{morton:
//! u64, n_samples: u32, samples: n_samples x Point}`. The group header's
//! `children_mask` records which of the up-to-8 children this group
//! actually holds; whether a given child node in turn has children of
//! its own is not stored here at all (that lives in a different group
//! one level down) and is stitched back on by the caller once the next
//! level down has been loaded. The container itself is a keyed blob
//! store (key is `parent_morton`); content addressing is not needed
//! since groups are never deduplicated.

use crate::error::{OctError, Result};
use crate::morton::MortonCode;
use crate::node::Node;
use crate::point::{AttributeSet, Point};

pub fn serialize_group<M: MortonCode>(parent: M, nodes: &[Node<M>], layout: AttributeSet) -> Vec<u8> {
    let children_mask = nodes.iter().fold(0u8, |mask, n| {
        let octant = (n.morton.bits() & 7) as u8;
        mask | (1 << octant)
    });
    let mut body = Vec::new();
    let mut lengths = Vec::with_capacity(nodes.len());
    for node in nodes {
        let start = body.len();
        body.extend_from_slice(&node.morton.bits().to_le_bytes());
        body.extend_from_slice(&(node.samples.len() as u32).to_le_bytes());
        for sample in &node.samples {
            sample.write(layout, &mut body);
        }
        lengths.push((body.len() - start) as u32);
    }

    let mut out = Vec::with_capacity(8 + 1 + 1 + lengths.len() * 4 + body.len());
    out.extend_from_slice(&parent.bits().to_le_bytes());
    out.push(children_mask);
    out.push(nodes.len() as u8);
    for len in &lengths {
        out.extend_from_slice(&len.to_le_bytes());
    }
    out.extend_from_slice(&body);
    out
}

/// Parses a group blob back into its parent code, children mask and node
/// list, in the octant order they were written.
pub fn deserialize_group<M: MortonCode>(buf: &[u8], layout: AttributeSet) -> Result<(M, u8, Vec<Node<M>>)> {
    let corrupt = |msg: &str| OctError::CorruptInput(format!("sibling group: {msg}"));
    if buf.len() < 10 {
        return Err(corrupt("buffer shorter than fixed header"));
    }
    let parent_bits = u64::from_le_bytes(buf[0..8].try_into().unwrap());
    let parent = M::from_bits(parent_bits)?;
    let children_mask = buf[8];
    let count = buf[9] as usize;
    let lengths_end = 10 + count * 4;
    if buf.len() < lengths_end {
        return Err(corrupt("buffer shorter than length table"));
    }
    let mut lengths = Vec::with_capacity(count);
    for i in 0..count {
        let offset = 10 + i * 4;
        lengths.push(u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap()) as usize);
    }

    let mut nodes = Vec::with_capacity(count);
    let mut cursor = lengths_end;
    for &len in &lengths {
        let end = cursor.checked_add(len).ok_or_else(|| corrupt("node blob length overflow"))?;
        if buf.len() < end {
            return Err(corrupt("truncated node blob"));
        }
        nodes.push(parse_node::<M>(&buf[cursor..end], layout)?);
        cursor = end;
    }
    Ok((parent, children_mask, nodes))
}

/// Reads just the parent code and each member's morton code from a group
/// blob, without decoding any sample arrays. Used to rebuild the cold
/// store's directory and child index on startup without paying the cost
/// of a full [`deserialize_group`] over every blob in the file.
pub fn peek_group_members<M: MortonCode>(buf: &[u8]) -> Result<(M, Vec<M>)> {
    let corrupt = |msg: &str| OctError::CorruptInput(format!("sibling group: {msg}"));
    if buf.len() < 10 {
        return Err(corrupt("buffer shorter than fixed header"));
    }
    let parent_bits = u64::from_le_bytes(buf[0..8].try_into().unwrap());
    let parent = M::from_bits(parent_bits)?;
    let count = buf[9] as usize;
    let lengths_end = 10 + count * 4;
    if buf.len() < lengths_end {
        return Err(corrupt("buffer shorter than length table"));
    }
    let mut lengths = Vec::with_capacity(count);
    for i in 0..count {
        let offset = 10 + i * 4;
        lengths.push(u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap()) as usize);
    }
    let mut members = Vec::with_capacity(count);
    let mut cursor = lengths_end;
    for &len in &lengths {
        let end = cursor.checked_add(len).ok_or_else(|| corrupt("node blob length overflow"))?;
        if buf.len() < cursor + 8 || buf.len() < end {
            return Err(corrupt("truncated node blob"));
        }
        let morton_bits = u64::from_le_bytes(buf[cursor..cursor + 8].try_into().unwrap());
        members.push(M::from_bits(morton_bits)?);
        cursor = end;
    }
    Ok((parent, members))
}

fn parse_node<M: MortonCode>(buf: &[u8], layout: AttributeSet) -> Result<Node<M>> {
    let corrupt = || OctError::CorruptInput("node blob shorter than fixed header".to_string());
    if buf.len() < 12 {
        return Err(corrupt());
    }
    let morton_bits = u64::from_le_bytes(buf[0..8].try_into().unwrap());
    let morton = M::from_bits(morton_bits)?;
    let n_samples = u32::from_le_bytes(buf[8..12].try_into().unwrap()) as usize;
    let mut samples = Vec::with_capacity(n_samples);
    let mut cursor = 12;
    for _ in 0..n_samples {
        let (point, consumed) = Point::read(layout, &buf[cursor..])?;
        samples.push(point);
        cursor += consumed;
    }
    let children_mask = 0; // overwritten by the caller once all siblings are known
    Ok(Node {
        morton,
        samples,
        children_mask,
        dirty: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::morton::MortonMedium;
    use crate::vector::vec3f;

    #[test]
    fn roundtrips_a_mixed_group() {
        let parent = MortonMedium::root().child(2).unwrap();
        let c0 = parent.child(0).unwrap();
        let c5 = parent.child(5).unwrap();
        let nodes = vec![
            Node::new_leaf(c0, vec![Point::new(vec3f(1.0, 0.0, 0.0))]),
            Node::new_inner(c5, vec![Point::new(vec3f(0.0, 1.0, 0.0)), Point::new(vec3f(0.0, 0.0, 1.0))], 0b11),
        ];
        let layout = AttributeSet::POS_NORMAL_COLOR;
        let blob = serialize_group(parent, &nodes, layout);
        let (read_parent, mask, read_nodes) = deserialize_group::<MortonMedium>(&blob, layout).unwrap();
        assert_eq!(read_parent, parent);
        assert_eq!(mask, 0b10_0001);
        assert_eq!(read_nodes.len(), 2);
        assert_eq!(read_nodes[0].morton, c0);
        assert_eq!(read_nodes[0].samples.len(), 1);
        assert_eq!(read_nodes[1].morton, c5);
        assert_eq!(read_nodes[1].samples.len(), 2);
    }

    #[test]
    fn truncated_buffer_is_corrupt_input() {
        let result = deserialize_group::<MortonMedium>(&[0u8; 4], AttributeSet::POS);
        assert!(matches!(result, Err(OctError::CorruptInput(_))));
    }
}

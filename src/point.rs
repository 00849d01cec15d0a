//! Fixed-size point record and its on-wire serialization.
//!
//! `Point` always carries pos/normal/color in memory; the attributes a
//! given run actually serializes are pinned at construction time by an
//! [`AttributeSet`]. The layout is a plain `#[repr(C)]`/`bytemuck::Pod`
//! struct, sized with `static_assertions::assert_eq_size!`.

use bitflags::bitflags;

use crate::error::{OctError, Result};
use crate::vector::{vec3f, Vec3f32};

bitflags! {
    /// Which optional attributes a run's records carry on the wire.
    /// `pos` is always present; this only toggles `normal`/`color`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AttributeSet: u8 {
        const NORMAL = 0b01;
        const COLOR = 0b10;
    }
}

impl AttributeSet {
    pub const POS: AttributeSet = AttributeSet::empty();
    pub const POS_NORMAL: AttributeSet = AttributeSet::NORMAL;
    pub const POS_NORMAL_COLOR: AttributeSet = AttributeSet::NORMAL.union(AttributeSet::COLOR);

    /// Matches the descriptor's `attributes` field spelling.
    pub fn descriptor_name(self) -> &'static str {
        if self.contains(AttributeSet::COLOR) {
            "pos+normal+color"
        } else if self.contains(AttributeSet::NORMAL) {
            "pos+normal"
        } else {
            "pos"
        }
    }

    pub fn from_descriptor_name(name: &str) -> Result<Self> {
        match name {
            "pos" => Ok(Self::POS),
            "pos+normal" => Ok(Self::POS_NORMAL),
            "pos+normal+color" => Ok(Self::POS_NORMAL_COLOR),
            other => Err(OctError::CorruptInput(format!(
                "unknown attribute layout {other:?}"
            ))),
        }
    }

    /// Serialized record size in bytes for this layout: 12 bytes for pos,
    /// plus 12 for normal, plus 12 for color, each only if present.
    pub fn record_size(self) -> usize {
        12 + if self.contains(AttributeSet::NORMAL) { 12 } else { 0 }
            + if self.contains(AttributeSet::COLOR) { 12 } else { 0 }
    }
}

/// A single point sample: position, normal, optional color.
///
/// Always fully populated in memory (absent attributes are zero-filled on
/// read); only [`AttributeSet`] controls what a run actually writes.
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Zeroable, bytemuck::Pod)]
#[repr(C)]
pub struct Point {
    pub pos: Vec3f32,
    pub normal: Vec3f32,
    pub color: Vec3f32,
}

static_assertions::assert_eq_size!(Point, [u8; 36]);

impl Default for Point {
    fn default() -> Self {
        Self {
            pos: vec3f(0.0, 0.0, 0.0),
            normal: vec3f(0.0, 0.0, 0.0),
            color: vec3f(0.0, 0.0, 0.0),
        }
    }
}

impl Point {
    pub fn new(pos: Vec3f32) -> Self {
        Self {
            pos,
            ..Default::default()
        }
    }

    /// Bytes this point occupies on the wire under `layout`.
    pub fn serialized_size(layout: AttributeSet) -> usize {
        layout.record_size()
    }

    /// Writes this point's fields selected by `layout`, little-endian,
    /// tightly packed, appending to `buf`.
    pub fn write(&self, layout: AttributeSet, buf: &mut Vec<u8>) {
        write_vec3(&self.pos, buf);
        if layout.contains(AttributeSet::NORMAL) {
            write_vec3(&self.normal, buf);
        }
        if layout.contains(AttributeSet::COLOR) {
            write_vec3(&self.color, buf);
        }
    }

    /// Reads one point from `buf` (which must hold at least
    /// `serialized_size(layout)` bytes), returning the point and the
    /// number of bytes consumed.
    pub fn read(layout: AttributeSet, buf: &[u8]) -> Result<(Self, usize)> {
        let needed = layout.record_size();
        if buf.len() < needed {
            return Err(OctError::CorruptInput(format!(
                "truncated point record: need {needed} bytes, have {}",
                buf.len()
            )));
        }
        let mut cursor = 0;
        let pos = read_vec3(buf, &mut cursor);
        let normal = if layout.contains(AttributeSet::NORMAL) {
            read_vec3(buf, &mut cursor)
        } else {
            vec3f(0.0, 0.0, 0.0)
        };
        let color = if layout.contains(AttributeSet::COLOR) {
            read_vec3(buf, &mut cursor)
        } else {
            vec3f(0.0, 0.0, 0.0)
        };
        Ok((Self { pos, normal, color }, cursor))
    }
}

fn write_vec3(v: &Vec3f32, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&v.0.to_le_bytes());
    buf.extend_from_slice(&v.1.to_le_bytes());
    buf.extend_from_slice(&v.2.to_le_bytes());
}

fn read_vec3(buf: &[u8], cursor: &mut usize) -> Vec3f32 {
    let x = f32::from_le_bytes(buf[*cursor..*cursor + 4].try_into().unwrap());
    let y = f32::from_le_bytes(buf[*cursor + 4..*cursor + 8].try_into().unwrap());
    let z = f32::from_le_bytes(buf[*cursor + 8..*cursor + 12].try_into().unwrap());
    *cursor += 12;
    vec3f(x, y, z)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_roundtrips_bitwise_for_every_layout() {
        let p = Point {
            pos: vec3f(1.5, -2.25, 3.0),
            normal: vec3f(0.0, 1.0, 0.0),
            color: vec3f(0.2, 0.4, 0.8),
        };
        for layout in [
            AttributeSet::POS,
            AttributeSet::POS_NORMAL,
            AttributeSet::POS_NORMAL_COLOR,
        ] {
            let mut buf = Vec::new();
            p.write(layout, &mut buf);
            assert_eq!(buf.len(), Point::serialized_size(layout));
            let (read_back, consumed) = Point::read(layout, &buf).unwrap();
            assert_eq!(consumed, buf.len());
            assert_eq!(read_back.pos, p.pos);
            if layout.contains(AttributeSet::NORMAL) {
                assert_eq!(read_back.normal, p.normal);
            } else {
                assert_eq!(read_back.normal, vec3f(0.0, 0.0, 0.0));
            }
            if layout.contains(AttributeSet::COLOR) {
                assert_eq!(read_back.color, p.color);
            } else {
                assert_eq!(read_back.color, vec3f(0.0, 0.0, 0.0));
            }
        }
    }

    #[test]
    fn truncated_buffer_is_corrupt_input() {
        let buf = [0u8; 4];
        let result = Point::read(AttributeSet::POS, &buf);
        assert!(matches!(result, Err(OctError::CorruptInput(_))));
    }

    #[test]
    fn descriptor_name_roundtrips() {
        for layout in [
            AttributeSet::POS,
            AttributeSet::POS_NORMAL,
            AttributeSet::POS_NORMAL_COLOR,
        ] {
            let name = layout.descriptor_name();
            assert_eq!(AttributeSet::from_descriptor_name(name).unwrap(), layout);
        }
    }
}

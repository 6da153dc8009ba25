//! Selection attachment encoding.
//!
//! Every forward and gizmo fragment writes a texel `[id, selected, marker]`
//! into the selection attachment. Ids are stored as `f32`, so every id must
//! stay below 2^24 to survive the round trip exactly.

use crate::ids::ObjectId;

/// Encoded selection id as written to the selection attachment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SelectionId(u32);

/// Largest encoded id a mesh may use. Everything above is reserved.
pub const MAX_OBJECT_ID: u32 = 16_777_199;

/// Reserved ids written by the three gizmo axes (X, Y, Z).
pub const GIZMO_AXIS_IDS: [u32; 3] = [16_777_200, 16_777_201, 16_777_202];

/// Texel marker written by every geometry fragment. Background stays zero.
pub const GEOMETRY_MARKER: f32 = 1.0;

/// Gizmo axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub const ALL: [Self; 3] = [Self::X, Self::Y, Self::Z];

    pub const fn index(self) -> usize {
        match self {
            Self::X => 0,
            Self::Y => 1,
            Self::Z => 2,
        }
    }

    /// Reserved selection id for this axis.
    pub const fn selection_id(self) -> SelectionId {
        SelectionId(GIZMO_AXIS_IDS[self.index()])
    }
}

impl SelectionId {
    /// Nothing under the cursor.
    pub const NONE: Self = Self(0);

    /// Encode a scene object id. Objects past the id range are unpickable.
    pub const fn from_object(id: ObjectId) -> Self {
        if id.0 < MAX_OBJECT_ID {
            Self(id.0 + 1)
        } else {
            Self::NONE
        }
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Value written into the first channel of the attachment.
    pub const fn as_f32(self) -> f32 {
        self.0 as f32
    }
}

/// Outcome of a pick query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PickResult {
    Nothing,
    Object { id: ObjectId, selected: bool },
    GizmoAxis(Axis),
}

/// Decode one selection texel.
pub fn decode_texel(texel: [f32; 3]) -> PickResult {
    let [id, selected, marker] = texel;
    if marker < GEOMETRY_MARKER * 0.5 || !id.is_finite() || id < 0.5 {
        return PickResult::Nothing;
    }
    let raw = id.round() as u32;
    if let Some(axis) = Axis::ALL.iter().find(|a| a.selection_id().raw() == raw) {
        return PickResult::GizmoAxis(*axis);
    }
    if raw > MAX_OBJECT_ID {
        return PickResult::Nothing;
    }
    PickResult::Object {
        id: ObjectId(raw - 1),
        selected: selected > 0.5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_ids_are_exact_in_f32() {
        for id in GIZMO_AXIS_IDS {
            assert_eq!((id as f32) as u32, id);
        }
        assert_eq!((MAX_OBJECT_ID as f32) as u32, MAX_OBJECT_ID);
    }

    #[test]
    fn object_ids_never_collide_with_gizmo() {
        for raw in [0, 1, 1000, MAX_OBJECT_ID - 1, MAX_OBJECT_ID, u32::MAX] {
            let encoded = SelectionId::from_object(ObjectId(raw));
            assert!(!GIZMO_AXIS_IDS.contains(&encoded.raw()));
        }
    }

    #[test]
    fn decode_object() {
        let id = SelectionId::from_object(ObjectId(41));
        assert_eq!(
            decode_texel([id.as_f32(), 1.0, GEOMETRY_MARKER]),
            PickResult::Object {
                id: ObjectId(41),
                selected: true
            }
        );
    }

    #[test]
    fn decode_gizmo_axes() {
        for axis in Axis::ALL {
            let texel = [axis.selection_id().as_f32(), 0.0, GEOMETRY_MARKER];
            assert_eq!(decode_texel(texel), PickResult::GizmoAxis(axis));
        }
    }

    #[test]
    fn decode_background() {
        assert_eq!(decode_texel([0.0, 0.0, 0.0]), PickResult::Nothing);
        assert_eq!(decode_texel([5.0, 0.0, 0.0]), PickResult::Nothing);
        assert_eq!(decode_texel([f32::NAN, 0.0, 1.0]), PickResult::Nothing);
    }

    #[test]
    fn decode_is_deterministic() {
        let texel = [SelectionId::from_object(ObjectId(3)).as_f32(), 0.0, 1.0];
        assert_eq!(decode_texel(texel), decode_texel(texel));
    }
}

//! Operand and result descriptors shared by every instruction record.

/// One of the four lanes of a general-purpose register or constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Comp {
    X,
    Y,
    Z,
    W,
}

impl Comp {
    pub fn index(self) -> u32 {
        match self {
            Self::X => 0,
            Self::Y => 1,
            Self::Z => 2,
            Self::W => 3,
        }
    }

    pub fn from_index(index: u32) -> Option<Self> {
        match index {
            0 => Some(Self::X),
            1 => Some(Self::Y),
            2 => Some(Self::Z),
            3 => Some(Self::W),
            _ => None,
        }
    }
}

/// Source swizzle: which backing lane feeds each of the four logical lanes.
///
/// Backing storage is always a 4-component vector, so the selection always
/// resolves to four entries even when fewer lanes are logically used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Swizzle(pub [Comp; 4]);

impl Swizzle {
    pub fn identity() -> Self {
        Self([Comp::X, Comp::Y, Comp::Z, Comp::W])
    }

    /// Broadcast of a single lane to all four positions.
    pub fn splat(comp: Comp) -> Self {
        Self([comp; 4])
    }

    pub fn get(&self, lane: u32) -> Comp {
        self.0[lane as usize]
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::identity()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteMask(pub u8);

impl WriteMask {
    pub fn all() -> Self {
        Self(0b1111)
    }

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn contains_lane(&self, lane: u32) -> bool {
        (self.0 & (1 << lane)) != 0
    }

    pub fn count(&self) -> u32 {
        u32::from(self.0 & 0b1111).count_ones()
    }

    pub fn is_empty(&self) -> bool {
        (self.0 & 0b1111) == 0
    }
}

/// How the storage index of an operand or result is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageAddressing {
    /// The index from the instruction word, as is.
    Static,
    /// Instruction index plus the `a0` address register (written by `maxa`).
    AddressAbsolute,
    /// Instruction index plus the innermost loop index `aL.x`.
    AddressRelative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandSource {
    Register,
    FloatConstant,
    /// A vertex fetch constant slot; never a valid ALU data source.
    VertexFetchConstant,
    /// A texture fetch constant slot; never a valid ALU data source.
    TextureFetchConstant,
}

impl OperandSource {
    pub fn name(self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::FloatConstant => "float constant",
            Self::VertexFetchConstant => "vertex fetch constant",
            Self::TextureFetchConstant => "texture fetch constant",
        }
    }
}

/// Where an instruction result is exported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultTarget {
    None,
    Register,
    /// Vertex stage clip-space position export (`oPos`).
    Position,
    /// Vertex stage auxiliary export: point size in X, edge flag in Y,
    /// kill-vertex in Z (`oPts`).
    PointSizeEdgeFlagKillVertex,
    /// Vertex stage interpolator export (`o0`..`o15`).
    Interpolator,
    /// Pixel stage color export (`oC0`..`oC3`).
    Color,
    /// Pixel stage depth export (`oDepth`).
    Depth,
}

impl ResultTarget {
    /// Number of meaningful destination lanes for this target.
    pub fn used_component_count(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Register | Self::Position | Self::Interpolator | Self::Color => 4,
            Self::PointSizeEdgeFlagKillVertex => 3,
            Self::Depth => 1,
        }
    }

    fn component_mask(self) -> u8 {
        ((1u32 << self.used_component_count()) - 1) as u8
    }
}

/// Per-lane result selection: a lane of the computed value, or the
/// constants 0.0 / 1.0 that the hardware can write directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultComponent {
    X,
    Y,
    Z,
    W,
    Zero,
    One,
}

impl ResultComponent {
    /// Source lane index when this selection names a value lane.
    pub fn lane(self) -> Option<u32> {
        match self {
            Self::X => Some(0),
            Self::Y => Some(1),
            Self::Z => Some(2),
            Self::W => Some(3),
            Self::Zero | Self::One => None,
        }
    }
}

/// A decoded source operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operand {
    pub source: OperandSource,
    pub index: u32,
    pub addressing: StorageAddressing,
    pub negate: bool,
    pub absolute: bool,
    pub swizzle: Swizzle,
}

impl Operand {
    pub fn register(index: u32) -> Self {
        Self {
            source: OperandSource::Register,
            index,
            addressing: StorageAddressing::Static,
            negate: false,
            absolute: false,
            swizzle: Swizzle::identity(),
        }
    }

    pub fn float_constant(index: u32) -> Self {
        Self {
            source: OperandSource::FloatConstant,
            ..Self::register(index)
        }
    }

    pub fn with_swizzle(self, swizzle: Swizzle) -> Self {
        Self { swizzle, ..self }
    }

    pub fn negated(self) -> Self {
        Self {
            negate: !self.negate,
            ..self
        }
    }

    /// Lanes on which `self` and `other` select the same data, as a 4-bit
    /// mask. Zero when the operands address different storage or carry
    /// different modifiers, since no lane can then be shared.
    pub fn identical_components(&self, other: &Operand) -> u8 {
        if self.source != other.source
            || self.index != other.index
            || self.addressing != other.addressing
            || self.negate != other.negate
            || self.absolute != other.absolute
        {
            return 0;
        }
        let mut identical = 0u8;
        for lane in 0..4 {
            if self.swizzle.get(lane) == other.swizzle.get(lane) {
                identical |= 1 << lane;
            }
        }
        identical
    }
}

/// A decoded result descriptor.
///
/// `write_mask` says which destination lanes the instruction writes;
/// `components` says what each written lane receives (a value lane or a
/// constant). A lane outside the mask is never touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultInfo {
    pub target: ResultTarget,
    pub index: u32,
    pub addressing: StorageAddressing,
    pub write_mask: WriteMask,
    pub components: [ResultComponent; 4],
    pub saturate: bool,
}

impl ResultInfo {
    pub fn none() -> Self {
        Self {
            target: ResultTarget::None,
            index: 0,
            addressing: StorageAddressing::Static,
            write_mask: WriteMask::empty(),
            components: [
                ResultComponent::X,
                ResultComponent::Y,
                ResultComponent::Z,
                ResultComponent::W,
            ],
            saturate: false,
        }
    }

    pub fn register(index: u32) -> Self {
        Self {
            target: ResultTarget::Register,
            index,
            write_mask: WriteMask::all(),
            ..Self::none()
        }
    }

    pub fn position() -> Self {
        Self {
            target: ResultTarget::Position,
            write_mask: WriteMask::all(),
            ..Self::none()
        }
    }

    pub fn with_mask(self, write_mask: WriteMask) -> Self {
        Self { write_mask, ..self }
    }

    /// Destination lanes actually written, clipped to what the target has.
    pub fn used_write_mask(&self) -> u8 {
        if self.target == ResultTarget::None {
            return 0;
        }
        self.write_mask.0 & self.target.component_mask()
    }

    /// Which lanes of the computed value feed at least one written lane.
    pub fn used_result_components(&self) -> u8 {
        let used_write_mask = self.used_write_mask();
        let mut used = 0u8;
        for lane in 0..4 {
            if used_write_mask & (1 << lane) == 0 {
                continue;
            }
            if let Some(source_lane) = self.components[lane as usize].lane() {
                used |= 1 << source_lane;
            }
        }
        used
    }

    /// Written lanes receiving the constants 0/1 rather than value lanes.
    /// Returns `(lanes, values)`: a bit set in `values` means 1.0.
    pub fn used_constant_components(&self) -> (u8, u8) {
        let used_write_mask = self.used_write_mask();
        let mut lanes = 0u8;
        let mut values = 0u8;
        for lane in 0..4 {
            if used_write_mask & (1 << lane) == 0 {
                continue;
            }
            match self.components[lane as usize] {
                ResultComponent::Zero => lanes |= 1 << lane,
                ResultComponent::One => {
                    lanes |= 1 << lane;
                    values |= 1 << lane;
                }
                _ => {}
            }
        }
        (lanes, values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn identical_components_respects_modifiers() {
        let a = Operand::register(3);
        let b = Operand::register(3);
        assert_eq!(a.identical_components(&b), 0b1111);
        assert_eq!(a.identical_components(&b.negated()), 0);
        let c = b.with_swizzle(Swizzle([Comp::X, Comp::X, Comp::Z, Comp::W]));
        assert_eq!(a.identical_components(&c), 0b1101);
    }

    #[test]
    fn result_component_queries() {
        let mut result = ResultInfo::register(0).with_mask(WriteMask(0b1011));
        result.components = [
            ResultComponent::W,
            ResultComponent::One,
            ResultComponent::Y,
            ResultComponent::X,
        ];
        // Lane 2 is masked out, so Y is not a used source lane.
        assert_eq!(result.used_write_mask(), 0b1011);
        assert_eq!(result.used_result_components(), 0b1001);
        assert_eq!(result.used_constant_components(), (0b0010, 0b0010));
    }

    #[test]
    fn no_target_means_no_writes() {
        let result = ResultInfo {
            write_mask: WriteMask::all(),
            ..ResultInfo::none()
        };
        assert_eq!(result.used_write_mask(), 0);
        assert_eq!(result.used_result_components(), 0);
    }

    #[test]
    fn point_size_target_is_three_lanes() {
        let result = ResultInfo {
            target: ResultTarget::PointSizeEdgeFlagKillVertex,
            write_mask: WriteMask::all(),
            ..ResultInfo::none()
        };
        assert_eq!(result.used_write_mask(), 0b0111);
    }
}

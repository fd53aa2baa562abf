//! SPIR-V backend for decoded Xenos shader microcode.
//!
//! Lowers a [`xenos_ucode::ShaderProgram`] record stream into a single
//! complete SPIR-V module in one forward pass:
//!
//! - The whole program body runs inside one outer loop; jump and loop
//!   records re-dispatch through a program-counter switch instead of
//!   arbitrary branches, so the output stays reducible for drivers.
//! - Guest float arithmetic is emitted with contraction disabled and
//!   the Xenos multiply rule (`0 * anything = 0`) preserved.
//! - Resource declarations (constant buffers, the shared memory
//!   buffer) appear only when the program actually touches them, bound
//!   at the set indices of [`DescriptorSet`].
//!
//! Translation never executes the program; malformed streams surface
//! as [`TranslateError`] values, not panics.

mod alu;
mod builder;
mod error;
mod fetch;
mod operands;
mod translator;

pub use error::TranslateError;
pub use translator::{translate, Translator};

/// Capabilities of the device the module is emitted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Features {
    /// Packed SPIR-V version of the emitted module, one of the
    /// `Features::SPIRV_*` constants. 1.3 moves the shared memory
    /// buffer to the StorageBuffer storage class, 1.4 lists every
    /// module-scope variable on the entry point interface.
    pub spirv_version: u32,
    /// Declare the ClipDistance capability and a six-element clip
    /// distance array on the vertex output block.
    pub clip_distance: bool,
    /// Declare the CullDistance capability.
    pub cull_distance: bool,
    /// Declare float-controls execution modes (flush denormals,
    /// preserve signed zero/inf/nan) for 32-bit operations.
    pub float_controls: bool,
}

impl Features {
    /// Version words in SPIR-V header layout, major in bits 16..24 and
    /// minor in bits 8..16.
    pub const SPIRV_1_0: u32 = 1 << 16;
    pub const SPIRV_1_1: u32 = 1 << 16 | 1 << 8;
    pub const SPIRV_1_2: u32 = 1 << 16 | 2 << 8;
    pub const SPIRV_1_3: u32 = 1 << 16 | 3 << 8;
    pub const SPIRV_1_4: u32 = 1 << 16 | 4 << 8;
    pub const SPIRV_1_5: u32 = 1 << 16 | 5 << 8;
    pub const SPIRV_1_6: u32 = 1 << 16 | 6 << 8;

    /// Everything this backend can take advantage of.
    pub fn all() -> Self {
        Self {
            spirv_version: Self::SPIRV_1_4,
            clip_distance: true,
            cull_distance: true,
            float_controls: true,
        }
    }

    pub fn version_major(&self) -> u8 {
        (self.spirv_version >> 16) as u8
    }

    pub fn version_minor(&self) -> u8 {
        (self.spirv_version >> 8) as u8
    }
}

impl Default for Features {
    /// The baseline every Vulkan implementation provides.
    fn default() -> Self {
        Self {
            spirv_version: Self::SPIRV_1_0,
            clip_distance: false,
            cull_distance: false,
            float_controls: false,
        }
    }
}

/// Descriptor set indices emitted modules bind resources in, ordered
/// from most to least frequently rebound so set switches invalidate as
/// little as possible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum DescriptorSet {
    /// Vertex and texture fetch constants, rebound for nearly every
    /// draw.
    FetchConstants = 0,
    /// Vertex-stage float constants, per object.
    FloatConstantsVertex = 1,
    /// Pixel-stage float constants, per material.
    FloatConstantsPixel = 2,
    /// Pixel-stage combined images and samplers, per material.
    TexturesPixel = 3,
    /// Vertex-stage combined images and samplers, rarely present.
    TexturesVertex = 4,
    /// Host-side system constants, stable across many draws.
    SystemConstants = 5,
    /// Bool and loop flow-control constants, rarely changed.
    BoolLoopConstants = 6,
    /// The unified guest memory buffer, bound once.
    SharedMemoryAndEdram = 7,
}

impl DescriptorSet {
    pub fn index(self) -> u32 {
        self as u32
    }
}

/// How the host runs a vertex-stage program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VertexMode {
    /// Plain vertex shader, fetching by vertex index.
    #[default]
    Vertex,
    /// Tessellation evaluation shader, fetching by primitive id; used
    /// when the guest draw supplies tessellation patches.
    TessellationEvaluation,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn packed_versions_unpack() {
        let features = Features {
            spirv_version: Features::SPIRV_1_4,
            ..Features::default()
        };
        assert_eq!(features.version_major(), 1);
        assert_eq!(features.version_minor(), 4);
        assert_eq!(Features::default().version_minor(), 0);
        assert!(Features::SPIRV_1_3 < Features::SPIRV_1_4);
    }

    #[test]
    fn descriptor_sets_are_stable() {
        assert_eq!(DescriptorSet::FetchConstants.index(), 0);
        assert_eq!(DescriptorSet::FloatConstantsVertex.index(), 1);
        assert_eq!(DescriptorSet::FloatConstantsPixel.index(), 2);
        assert_eq!(DescriptorSet::BoolLoopConstants.index(), 6);
        assert_eq!(DescriptorSet::SharedMemoryAndEdram.index(), 7);
    }
}

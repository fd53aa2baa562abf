//! Host-side layout of fetch constants.
//!
//! Fetch constants live in a GPU-visible table of 96 vertex entries (two
//! words each). Shaders read them through a uniform buffer; the host fills
//! that buffer with the packed words defined here.

use bytemuck::{Pod, Zeroable};

use crate::format::Endian;

/// Discriminator in the low two bits of the first fetch constant word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchConstantType {
    InvalidTexture,
    InvalidVertex,
    Texture,
    Vertex,
}

impl FetchConstantType {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::InvalidTexture),
            1 => Some(Self::InvalidVertex),
            2 => Some(Self::Texture),
            3 => Some(Self::Vertex),
            _ => None,
        }
    }

    pub fn raw(self) -> u32 {
        #[deny(unreachable_patterns)]
        match self {
            Self::InvalidTexture => 0,
            Self::InvalidVertex => 1,
            Self::Texture => 2,
            Self::Vertex => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::InvalidTexture => "invalid_texture",
            Self::InvalidVertex => "invalid_vertex",
            Self::Texture => "texture",
            Self::Vertex => "vertex",
        }
    }
}

/// One vertex fetch constant as the hardware stores it.
///
/// Word 0 holds the type tag in bits 0..2 and the buffer base address in
/// dwords in bits 2..32. Word 1 holds the endian swap in bits 0..2 and the
/// buffer size in dwords in bits 2..26.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct VertexFetchConstant {
    pub words: [u32; 2],
}

impl VertexFetchConstant {
    pub fn new(address_dwords: u32, size_dwords: u32, endian: Endian) -> Self {
        Self {
            words: [
                FetchConstantType::Vertex.raw() | (address_dwords << 2),
                endian.raw() | (size_dwords << 2),
            ],
        }
    }

    pub fn fetch_type(&self) -> FetchConstantType {
        match self.words[0] & 0b11 {
            0 => FetchConstantType::InvalidTexture,
            1 => FetchConstantType::InvalidVertex,
            2 => FetchConstantType::Texture,
            _ => FetchConstantType::Vertex,
        }
    }

    /// Buffer base address in dwords.
    pub fn base_address(&self) -> u32 {
        self.words[0] >> 2
    }

    /// Buffer size in dwords.
    pub fn size(&self) -> u32 {
        (self.words[1] >> 2) & 0xFF_FFFF
    }

    pub fn endian(&self) -> Endian {
        match self.words[1] & 0b11 {
            0 => Endian::None,
            1 => Endian::Swap8In16,
            2 => Endian::Swap8In32,
            _ => Endian::Swap16In32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn packs_and_unpacks() {
        let constant = VertexFetchConstant::new(0x2_0000, 0x600, Endian::Swap8In32);
        assert_eq!(constant.fetch_type(), FetchConstantType::Vertex);
        assert_eq!(constant.base_address(), 0x2_0000);
        assert_eq!(constant.size(), 0x600);
        assert_eq!(constant.endian(), Endian::Swap8In32);
        assert_eq!(constant.words[0] & 0b11, 3);
    }

    #[test]
    fn zeroed_is_invalid() {
        let constant: VertexFetchConstant = Zeroable::zeroed();
        assert_eq!(constant.fetch_type(), FetchConstantType::InvalidTexture);
    }

    #[test]
    fn is_plain_old_data() {
        let constants = [
            VertexFetchConstant::new(16, 4, Endian::None),
            VertexFetchConstant::new(32, 8, Endian::Swap16In32),
        ];
        let bytes: &[u8] = bytemuck::cast_slice(&constants);
        assert_eq!(bytes.len(), 16);
        let back: &[VertexFetchConstant] = bytemuck::cast_slice(bytes);
        assert_eq!(back, &constants);
    }
}

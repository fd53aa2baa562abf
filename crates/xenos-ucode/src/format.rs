//! Vertex data formats and in-memory layout descriptions.
//!
//! Format names follow the hardware mnemonics, which list components from the
//! most significant bits down: `Int2_10_10_10` stores X in the low 10 bits and
//! the 2-bit W lane at the top of the word. Signedness and normalization are
//! not part of the format; the fetch instruction carries them separately.

/// The data format of a vertex fetch, before sign/normalization handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    Int8x4,
    Int2_10_10_10,
    Int10_11_11,
    Int11_11_10,
    Int16x2,
    Int16x4,
    Float16x2,
    Float16x4,
    Int32,
    Int32x2,
    Int32x4,
    Float32,
    Float32x2,
    Float32x3,
    Float32x4,
}

/// How the stored bits are turned into float lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatFamily {
    /// Sub-32-bit integer lanes packed into one or two words.
    PackedInteger,
    /// IEEE 754 half floats, two per word.
    HalfFloat,
    /// Full 32-bit integer lanes, one per word.
    Integer32,
    /// IEEE 754 single floats, one per word.
    Float32,
}

/// Bit position of one lane of a packed-integer format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedComponent {
    pub word: u32,
    pub offset: u32,
    pub width: u32,
}

const fn packed(word: u32, offset: u32, width: u32) -> PackedComponent {
    PackedComponent {
        word,
        offset,
        width,
    }
}

const LAYOUT_8_8_8_8: [PackedComponent; 4] = [
    packed(0, 0, 8),
    packed(0, 8, 8),
    packed(0, 16, 8),
    packed(0, 24, 8),
];
const LAYOUT_2_10_10_10: [PackedComponent; 4] = [
    packed(0, 0, 10),
    packed(0, 10, 10),
    packed(0, 20, 10),
    packed(0, 30, 2),
];
const LAYOUT_10_11_11: [PackedComponent; 3] =
    [packed(0, 0, 11), packed(0, 11, 11), packed(0, 22, 10)];
const LAYOUT_11_11_10: [PackedComponent; 3] =
    [packed(0, 0, 10), packed(0, 10, 11), packed(0, 21, 11)];
const LAYOUT_16_16: [PackedComponent; 2] = [packed(0, 0, 16), packed(0, 16, 16)];
const LAYOUT_16_16_16_16: [PackedComponent; 4] = [
    packed(0, 0, 16),
    packed(0, 16, 16),
    packed(1, 0, 16),
    packed(1, 16, 16),
];

impl VertexFormat {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            6 => Some(Self::Int8x4),
            7 => Some(Self::Int2_10_10_10),
            16 => Some(Self::Int10_11_11),
            17 => Some(Self::Int11_11_10),
            25 => Some(Self::Int16x2),
            26 => Some(Self::Int16x4),
            31 => Some(Self::Float16x2),
            32 => Some(Self::Float16x4),
            33 => Some(Self::Int32),
            34 => Some(Self::Int32x2),
            35 => Some(Self::Int32x4),
            36 => Some(Self::Float32),
            37 => Some(Self::Float32x2),
            38 => Some(Self::Float32x4),
            57 => Some(Self::Float32x3),
            _ => None,
        }
    }

    pub fn raw(self) -> u32 {
        #[deny(unreachable_patterns)]
        match self {
            Self::Int8x4 => 6,
            Self::Int2_10_10_10 => 7,
            Self::Int10_11_11 => 16,
            Self::Int11_11_10 => 17,
            Self::Int16x2 => 25,
            Self::Int16x4 => 26,
            Self::Float16x2 => 31,
            Self::Float16x4 => 32,
            Self::Int32 => 33,
            Self::Int32x2 => 34,
            Self::Int32x4 => 35,
            Self::Float32 => 36,
            Self::Float32x2 => 37,
            Self::Float32x4 => 38,
            Self::Float32x3 => 57,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Int8x4 => "8_8_8_8",
            Self::Int2_10_10_10 => "2_10_10_10",
            Self::Int10_11_11 => "10_11_11",
            Self::Int11_11_10 => "11_11_10",
            Self::Int16x2 => "16_16",
            Self::Int16x4 => "16_16_16_16",
            Self::Float16x2 => "16_16_float",
            Self::Float16x4 => "16_16_16_16_float",
            Self::Int32 => "32",
            Self::Int32x2 => "32_32",
            Self::Int32x4 => "32_32_32_32",
            Self::Float32 => "32_float",
            Self::Float32x2 => "32_32_float",
            Self::Float32x3 => "32_32_32_float",
            Self::Float32x4 => "32_32_32_32_float",
        }
    }

    pub fn family(self) -> FormatFamily {
        match self {
            Self::Int8x4
            | Self::Int2_10_10_10
            | Self::Int10_11_11
            | Self::Int11_11_10
            | Self::Int16x2
            | Self::Int16x4 => FormatFamily::PackedInteger,
            Self::Float16x2 | Self::Float16x4 => FormatFamily::HalfFloat,
            Self::Int32 | Self::Int32x2 | Self::Int32x4 => FormatFamily::Integer32,
            Self::Float32 | Self::Float32x2 | Self::Float32x3 | Self::Float32x4 => {
                FormatFamily::Float32
            }
        }
    }

    /// Number of lanes the format provides.
    pub fn component_count(self) -> u32 {
        match self {
            Self::Int32 | Self::Float32 => 1,
            Self::Int16x2 | Self::Float16x2 | Self::Int32x2 | Self::Float32x2 => 2,
            Self::Int10_11_11 | Self::Int11_11_10 | Self::Float32x3 => 3,
            Self::Int8x4
            | Self::Int2_10_10_10
            | Self::Int16x4
            | Self::Float16x4
            | Self::Int32x4
            | Self::Float32x4 => 4,
        }
    }

    /// Total 32-bit words one element of this format occupies.
    pub fn word_count(self) -> u32 {
        match self.family() {
            FormatFamily::PackedInteger => {
                if self == Self::Int16x4 {
                    2
                } else {
                    1
                }
            }
            FormatFamily::HalfFloat => self.component_count() / 2,
            FormatFamily::Integer32 | FormatFamily::Float32 => self.component_count(),
        }
    }

    /// Words that must be loaded to produce the lanes in `used_components`,
    /// as a bit mask over the element's words. Lanes beyond the component
    /// count are ignored.
    pub fn needed_words(self, used_components: u8) -> u8 {
        let used = used_components & (((1u32 << self.component_count()) - 1) as u8);
        if used == 0 {
            return 0;
        }
        match self {
            Self::Int8x4
            | Self::Int2_10_10_10
            | Self::Int10_11_11
            | Self::Int11_11_10
            | Self::Int16x2
            | Self::Float16x2 => 0b0001,
            Self::Int16x4 | Self::Float16x4 => {
                let mut words = 0;
                if used & 0b0011 != 0 {
                    words |= 0b0001;
                }
                if used & 0b1100 != 0 {
                    words |= 0b0010;
                }
                words
            }
            Self::Int32
            | Self::Int32x2
            | Self::Int32x4
            | Self::Float32
            | Self::Float32x2
            | Self::Float32x3
            | Self::Float32x4 => used,
        }
    }

    /// Lane layout for packed-integer formats, from lane X upward.
    pub fn packed_components(self) -> Option<&'static [PackedComponent]> {
        match self {
            Self::Int8x4 => Some(&LAYOUT_8_8_8_8),
            Self::Int2_10_10_10 => Some(&LAYOUT_2_10_10_10),
            Self::Int10_11_11 => Some(&LAYOUT_10_11_11),
            Self::Int11_11_10 => Some(&LAYOUT_11_11_10),
            Self::Int16x2 => Some(&LAYOUT_16_16),
            Self::Int16x4 => Some(&LAYOUT_16_16_16_16),
            _ => None,
        }
    }
}

/// Byte swap applied to fetched words, from the fetch constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    None,
    Swap8In16,
    Swap8In32,
    Swap16In32,
}

impl Endian {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::None),
            1 => Some(Self::Swap8In16),
            2 => Some(Self::Swap8In32),
            3 => Some(Self::Swap16In32),
            _ => None,
        }
    }

    pub fn raw(self) -> u32 {
        #[deny(unreachable_patterns)]
        match self {
            Self::None => 0,
            Self::Swap8In16 => 1,
            Self::Swap8In32 => 2,
            Self::Swap16In32 => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Swap8In16 => "8in16",
            Self::Swap8In32 => "8in32",
            Self::Swap16In32 => "16in32",
        }
    }
}

/// How signed packed integers map to floats when normalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignedRepeatingFractionMode {
    /// Divide by `2^(n-1) - 1`; both most negative values clamp to -1.
    ZeroClampMinusOne,
    /// Divide by `2^(n-1) - 0.5` and offset so zero is unrepresentable.
    NoZero,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const ALL_FORMATS: [VertexFormat; 15] = [
        VertexFormat::Int8x4,
        VertexFormat::Int2_10_10_10,
        VertexFormat::Int10_11_11,
        VertexFormat::Int11_11_10,
        VertexFormat::Int16x2,
        VertexFormat::Int16x4,
        VertexFormat::Float16x2,
        VertexFormat::Float16x4,
        VertexFormat::Int32,
        VertexFormat::Int32x2,
        VertexFormat::Int32x4,
        VertexFormat::Float32,
        VertexFormat::Float32x2,
        VertexFormat::Float32x3,
        VertexFormat::Float32x4,
    ];

    #[test]
    fn raw_roundtrip() {
        for format in ALL_FORMATS {
            assert_eq!(VertexFormat::from_raw(format.raw()), Some(format));
        }
        assert_eq!(VertexFormat::from_raw(0), None);
        assert_eq!(VertexFormat::from_raw(58), None);
    }

    #[test]
    fn packed_layouts_fill_their_words() {
        for format in ALL_FORMATS {
            let Some(layout) = format.packed_components() else {
                continue;
            };
            assert_eq!(layout.len() as u32, format.component_count());
            let mut per_word = [0u32; 2];
            for component in layout {
                assert!(component.offset + component.width <= 32);
                per_word[component.word as usize] += component.width;
            }
            // 10_11_11 and 11_11_10 leave no spare bits either.
            let used_bits: u32 = per_word[..format.word_count() as usize].iter().sum();
            assert_eq!(used_bits, format.word_count() * 32);
        }
    }

    #[test]
    fn needed_words_single_word_formats() {
        assert_eq!(VertexFormat::Int8x4.needed_words(0b1000), 0b0001);
        assert_eq!(VertexFormat::Int10_11_11.needed_words(0b1000), 0);
        assert_eq!(VertexFormat::Int10_11_11.needed_words(0b0100), 0b0001);
        assert_eq!(VertexFormat::Float16x2.needed_words(0b0010), 0b0001);
        assert_eq!(VertexFormat::Float16x2.needed_words(0b1100), 0);
    }

    #[test]
    fn needed_words_split_formats() {
        assert_eq!(VertexFormat::Int16x4.needed_words(0b0010), 0b0001);
        assert_eq!(VertexFormat::Int16x4.needed_words(0b0100), 0b0010);
        assert_eq!(VertexFormat::Float16x4.needed_words(0b1001), 0b0011);
        assert_eq!(VertexFormat::Float32x3.needed_words(0b0101), 0b0101);
        assert_eq!(VertexFormat::Float32x3.needed_words(0b1000), 0);
        assert_eq!(VertexFormat::Int32x4.needed_words(0b1111), 0b1111);
    }

    #[test]
    fn word_counts() {
        assert_eq!(VertexFormat::Int16x4.word_count(), 2);
        assert_eq!(VertexFormat::Float16x4.word_count(), 2);
        assert_eq!(VertexFormat::Int2_10_10_10.word_count(), 1);
        assert_eq!(VertexFormat::Float32x3.word_count(), 3);
    }

    #[test]
    fn endian_roundtrip() {
        for raw in 0..4 {
            let endian = Endian::from_raw(raw).unwrap();
            assert_eq!(endian.raw(), raw);
        }
        assert_eq!(Endian::from_raw(4), None);
    }
}

#![macro_use]

/// Bit mask covering `range` of a 64-bit word.
pub(crate) const fn range_mask(range: std::ops::Range<usize>) -> u64 {
    let width = range.end - range.start;
    let field = if width >= 64 { !0u64 } else { (1u64 << width) - 1 };
    field << range.start
}

/// Implement basic methods for lock word snapshot types.
macro_rules! impl_word_basic_methods {
    ($WordT:ty) => {
        impl $WordT {
            /// Create a zeroed word.
            pub fn new() -> Self {
                Self(::bitvec::prelude::bitarr![0; 64])
            }

            /// Decode a word value fetched from the segment.
            pub fn from_u64(value: u64) -> Self {
                let mut word = Self::new();
                word.0.store_le(value);
                word
            }

            /// Interpret the word as an integer.
            pub fn as_u64(&self) -> u64 {
                self.0.load_le()
            }
        }

        impl Default for $WordT {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<u64> for $WordT {
            fn from(value: u64) -> Self {
                Self::from_u64(value)
            }
        }
    };
}

/// Define a getter for a bit range of a lock word.
/// Must be used within an `impl` block.
macro_rules! word_field {
    ($field:ident, $FieldT:ty, $range:expr) => {
        pub fn $field(self) -> $FieldT {
            self.0[$range].load_le()
        }
    };

    ($field:ident, $FieldT:ty, $range:expr, WITH_MASK) => {
        pub fn $field(self) -> $FieldT {
            self.0[$range].load_le()
        }

        ::paste::paste! {
            #[allow(non_upper_case_globals)]
            pub const [<MASK_ $field>]: u64 = crate::macros::range_mask($range);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_mask() {
        assert_eq!(range_mask(0..1), 0x1);
        assert_eq!(range_mask(1..64), !0x1);
        assert_eq!(range_mask(4..16), 0xfff0);
        assert_eq!(range_mask(0..64), !0);
    }
}

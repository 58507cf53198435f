//! Bitmask surfaces
//!
//! Result types, result extras and search options are small flag sets with
//! named members. Unknown bits are dropped when converting from raw integers.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

macro_rules! flag_set {
    (
        $(#[$meta:meta])*
        $name:ident: $repr:ty {
            $( $(#[$fmeta:meta])* $flag:ident = $value:expr, )+
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name($repr);

        impl $name {
            /// No flag set
            pub const NONE: $name = $name(0);
            $( $(#[$fmeta])* pub const $flag: $name = $name($value); )+

            const KNOWN: $repr = 0 $( | $value )+;
            const NAMES: &'static [(&'static str, $repr)] = &[ $( (stringify!($flag), $value), )+ ];

            /// Raw bit value
            pub const fn bits(self) -> $repr {
                self.0
            }

            /// Build from raw bits, ignoring unknown bits
            pub const fn from_bits_truncate(bits: $repr) -> $name {
                $name(bits & Self::KNOWN)
            }

            pub const fn is_empty(self) -> bool {
                self.0 == 0
            }

            /// Whether every flag of `other` is set in `self`
            pub const fn contains(self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }

            /// Whether any flag of `other` is set in `self`
            pub const fn intersects(self, other: $name) -> bool {
                self.0 & other.0 != 0
            }

            pub const fn union(self, other: $name) -> $name {
                $name(self.0 | other.0)
            }

            pub const fn intersection(self, other: $name) -> $name {
                $name(self.0 & other.0)
            }

            pub const fn difference(self, other: $name) -> $name {
                $name(self.0 & !other.0)
            }
        }

        impl BitOr for $name {
            type Output = $name;
            fn bitor(self, rhs: $name) -> $name {
                self.union(rhs)
            }
        }

        impl BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: $name) {
                self.0 |= rhs.0;
            }
        }

        impl BitAnd for $name {
            type Output = $name;
            fn bitand(self, rhs: $name) -> $name {
                self.intersection(rhs)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let names: Vec<&str> = Self::NAMES
                    .iter()
                    .filter(|(_, v)| self.0 & *v == *v && v.count_ones() == 1)
                    .map(|(n, _)| *n)
                    .collect();
                if names.is_empty() {
                    write!(f, "{}(NONE)", stringify!($name))
                } else {
                    write!(f, "{}({})", stringify!($name), names.join(" | "))
                }
            }
        }
    };
}

flag_set! {
    /// Kinds of result a scan may produce
    ResultType: u32 {
        /// EAN-8 linear barcode
        EAN8 = 1 << 0,
        /// EAN-13 linear barcode
        EAN13 = 1 << 1,
        /// QR Code 2D barcode
        QRCODE = 1 << 2,
        /// Data Matrix 2D barcode
        DATAMATRIX = 1 << 3,
        /// Reference image recognized on device or on the server
        IMAGE = 1 << 31,
    }
}

impl ResultType {
    /// Every barcode format
    pub const ALL_BARCODES: ResultType = ResultType(1 | 2 | 4 | 8);

    /// Every barcode format plus image recognition
    pub const ALL: ResultType = ResultType(1 | 2 | 4 | 8 | (1 << 31));

    /// The single barcode flags, in examination order
    pub const BARCODE_FORMATS: [ResultType; 4] = [
        ResultType::EAN13,
        ResultType::EAN8,
        ResultType::QRCODE,
        ResultType::DATAMATRIX,
    ];

    /// Barcode part of the mask
    pub const fn barcodes(self) -> ResultType {
        self.intersection(Self::ALL_BARCODES)
    }

    /// Short human label for a single-flag value
    pub fn label(self) -> &'static str {
        match self {
            ResultType::EAN8 => "ean8",
            ResultType::EAN13 => "ean13",
            ResultType::QRCODE => "qrcode",
            ResultType::DATAMATRIX => "datamatrix",
            ResultType::IMAGE => "image",
            _ => "mixed",
        }
    }
}

flag_set! {
    /// Geometric extras attached to local image results
    ResultExtras: u32 {
        /// Four corners of the match in query pixel coordinates
        CORNERS = 1 << 0,
        /// 3x3 homography in normalized coordinates
        HOMOGRAPHY = 1 << 1,
        /// Original dimensions of the reference image
        DIMENSIONS = 1 << 2,
    }
}

flag_set! {
    /// Image matching options
    SearchOptions: u32 {
        /// Disable partial (sub-region) matching
        NO_PARTIAL = 1 << 0,
        /// Widen the scale range for small or distant targets
        SMALL_TARGET = 1 << 1,
    }
}

impl SearchOptions {
    pub const DEFAULT: SearchOptions = SearchOptions::NONE;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_union_and_contains() {
        let mask = ResultType::EAN13 | ResultType::IMAGE;
        assert!(mask.contains(ResultType::EAN13));
        assert!(mask.contains(ResultType::IMAGE));
        assert!(!mask.contains(ResultType::QRCODE));
        assert!(!mask.contains(ResultType::EAN13 | ResultType::EAN8));
        assert!(mask.intersects(ResultType::EAN13 | ResultType::EAN8));
    }

    #[test]
    fn test_from_bits_ignores_unknown() {
        let flags = ResultExtras::from_bits_truncate(0xFF);
        assert_eq!(flags, ResultExtras::CORNERS | ResultExtras::HOMOGRAPHY | ResultExtras::DIMENSIONS);

        let options = SearchOptions::from_bits_truncate(1 << 10);
        assert!(options.is_empty());

        let types = ResultType::from_bits_truncate(u32::MAX);
        assert_eq!(types, ResultType::ALL);
    }

    #[test]
    fn test_barcodes_strips_image() {
        let mask = ResultType::ALL;
        assert_eq!(mask.barcodes(), ResultType::ALL_BARCODES);
        assert!(!mask.barcodes().contains(ResultType::IMAGE));
        assert_eq!(ResultType::IMAGE.barcodes(), ResultType::NONE);
    }

    #[test]
    fn test_debug_lists_names() {
        let mask = ResultType::EAN8 | ResultType::QRCODE;
        assert_eq!(format!("{:?}", mask), "ResultType(EAN8 | QRCODE)");
        assert_eq!(format!("{:?}", SearchOptions::DEFAULT), "SearchOptions(NONE)");
    }

    #[test]
    fn test_difference() {
        let mask = ResultType::ALL.difference(ResultType::IMAGE);
        assert_eq!(mask, ResultType::ALL_BARCODES);
    }
}

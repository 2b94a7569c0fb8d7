// Key comparator: operator-class-dependent ordering over prefix bytes. See
// `btreeCompare()` in `btree.c` and §4.3 of SPEC_FULL.md.

use std::cmp::Ordering;

/// The five operator classes the reference implementation dispatches on.
/// Each index file is opened against exactly one, chosen at creation time.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OperatorClass {
    /// Byte-exact lexicographic equality/ordering over the stored prefix.
    Eq,

    /// As [`Self::Eq`], but both sides are ASCII-lowercased before compare.
    Like,

    /// First 8 bytes reinterpreted as a native-endian `u64` timestamp.
    StampEq,

    /// First 4 bytes reinterpreted as a `u32` virtual-table id.
    VtidEq,

    /// First 4 bytes reinterpreted as a `u32` user id.
    UserIdEq,

    /// First byte reinterpreted as a `u8` opcode.
    OpcodeEq,
}

impl OperatorClass {
    /// Whether this operator class can differentiate an insertion record
    /// from a deletion record purely from its key bytes — the "special
    /// field" predicates that drive the scan driver's force-save rule
    /// (§4.7 / Open Question 1).
    #[must_use]
    pub fn is_special_field(self) -> bool {
        matches!(
            self,
            Self::StampEq | Self::VtidEq | Self::UserIdEq | Self::OpcodeEq
        )
    }

    /// Compares two raw key-prefix byte slices (already truncated to their
    /// stored lengths) under this operator class.
    #[must_use]
    pub fn compare(self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            Self::Eq => compare_exhaustion(a, b, |x| x),
            Self::Like => compare_exhaustion(a, b, |x| x.to_ascii_lowercase()),
            Self::StampEq => compare_fixed_width::<8>(a, b, u64::from_ne_bytes),
            Self::VtidEq | Self::UserIdEq => {
                compare_fixed_width::<4>(a, b, |buf| u64::from(u32::from_ne_bytes(buf)))
            }
            Self::OpcodeEq => compare_fixed_width::<1>(a, b, |buf| u64::from(buf[0])),
        }
    }
}

/// Byte-exact / case-fold comparison: walk both slices together; the first
/// side to run out of bytes compares less; if both run out together, the
/// keys are equal. This mirrors the reference implementation's exhaustion
/// rule exactly rather than simply comparing slice lengths up front, which
/// matters once case-folding makes the two inputs diverge byte-by-byte.
fn compare_exhaustion(a: &[u8], b: &[u8], fold: impl Fn(u8) -> u8) -> Ordering {
    let mut ia = a.iter();
    let mut ib = b.iter();
    loop {
        match (ia.next(), ib.next()) {
            (Some(&x), Some(&y)) => {
                let ord = fold(x).cmp(&fold(y));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
        }
    }
}

/// Fixed-width numeric comparison: reinterpret the leading `N` bytes of each
/// side (zero-padding if shorter) and compare numerically.
fn compare_fixed_width<const N: usize>(
    a: &[u8],
    b: &[u8],
    decode: impl Fn([u8; N]) -> u64,
) -> Ordering {
    #[allow(clippy::indexing_slicing)]
    fn pad<const N: usize>(s: &[u8]) -> [u8; N] {
        let mut buf = [0u8; N];
        let len = s.len().min(N);
        buf[..len].copy_from_slice(&s[..len]);
        buf
    }
    decode(pad::<N>(a)).cmp(&decode(pad::<N>(b)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eq_exhaustion_rule() {
        assert_eq!(OperatorClass::Eq.compare(b"ab", b"ab"), Ordering::Equal);
        assert_eq!(OperatorClass::Eq.compare(b"a", b"ab"), Ordering::Less);
        assert_eq!(OperatorClass::Eq.compare(b"ab", b"a"), Ordering::Greater);
        assert_eq!(OperatorClass::Eq.compare(b"ab", b"ac"), Ordering::Less);
    }

    #[test]
    fn like_case_folds_both_sides() {
        assert_eq!(OperatorClass::Like.compare(b"ABC", b"abc"), Ordering::Equal);
        assert_eq!(OperatorClass::Like.compare(b"ABD", b"abc"), Ordering::Greater);
    }

    #[test]
    fn special_fields_flagged() {
        assert!(OperatorClass::StampEq.is_special_field());
        assert!(!OperatorClass::Eq.is_special_field());
        assert!(!OperatorClass::Like.is_special_field());
    }
}

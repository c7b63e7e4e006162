//! Offset codec: opaque total-order tokens over (byte position, message index).

use std::cmp::Ordering;

/// Sentinel meaning "before the beginning of the stream".
pub const BEFORE_BEGINNING: &str = "-1";

/// Width chosen so that zero-padded decimal digits sort the same way
/// lexicographically as numerically, for any `u64` value.
const FIELD_WIDTH: usize = 20;

/// A stream position: bytes written so far, and how many messages have been
/// appended. Rendered as `"<bytePos>_<seqIndex>"`, both zero-padded to
/// `FIELD_WIDTH` digits so string comparison agrees with numeric comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Offset {
    pub byte_pos: u64,
    pub seq_idx: u64,
}

impl Offset {
    pub fn initial() -> Self {
        Self { byte_pos: 0, seq_idx: 0 }
    }

    /// Advance past a message of `len` bytes.
    pub fn advance(self, len: u64) -> Self {
        Self {
            byte_pos: self.byte_pos + len,
            seq_idx: self.seq_idx + 1,
        }
    }

    pub fn render(self) -> String {
        format!(
            "{:0width$}_{:0width$}",
            self.byte_pos,
            self.seq_idx,
            width = FIELD_WIDTH
        )
    }

    /// Parse a rendered offset. The `"-1"` sentinel is not accepted here —
    /// callers special-case it before calling `parse`.
    pub fn parse(s: &str) -> Option<Self> {
        let (bp, si) = s.split_once('_')?;
        if bp.len() != FIELD_WIDTH || si.len() != FIELD_WIDTH {
            return None;
        }
        Some(Self {
            byte_pos: bp.parse().ok()?,
            seq_idx: si.parse().ok()?,
        })
    }
}

impl PartialOrd for Offset {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Offset {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.byte_pos, self.seq_idx).cmp(&(other.byte_pos, other.seq_idx))
    }
}

/// Compare two rendered offsets, treating `"-1"` as less than everything.
pub fn compare_rendered(a: &str, b: &str) -> Ordering {
    match (a == BEFORE_BEGINNING, b == BEFORE_BEGINNING) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_renders_zero() {
        assert_eq!(Offset::initial().render(), format!("{:020}_{:020}", 0, 0));
    }

    #[test]
    fn advance_increments_both_fields() {
        let o = Offset::initial().advance(5);
        assert_eq!(o.byte_pos, 5);
        assert_eq!(o.seq_idx, 1);
        let o2 = o.advance(3);
        assert_eq!(o2.byte_pos, 8);
        assert_eq!(o2.seq_idx, 2);
    }

    #[test]
    fn render_parse_roundtrip() {
        let o = Offset { byte_pos: 123456789, seq_idx: 42 };
        let rendered = o.render();
        assert_eq!(Offset::parse(&rendered), Some(o));
    }

    #[test]
    fn lexicographic_order_matches_numeric_order() {
        let a = Offset { byte_pos: 9, seq_idx: 0 };
        let b = Offset { byte_pos: 10, seq_idx: 0 };
        assert!(a < b);
        assert!(a.render() < b.render());
    }

    #[test]
    fn sentinel_is_less_than_any_real_offset() {
        let real = Offset::initial().render();
        assert_eq!(compare_rendered(BEFORE_BEGINNING, &real), Ordering::Less);
        assert_eq!(compare_rendered(&real, BEFORE_BEGINNING), Ordering::Greater);
        assert_eq!(compare_rendered(BEFORE_BEGINNING, BEFORE_BEGINNING), Ordering::Equal);
    }

    #[test]
    fn parse_rejects_malformed_input() {
        assert_eq!(Offset::parse("garbage"), None);
        assert_eq!(Offset::parse("1_2"), None); // wrong width
        assert_eq!(Offset::parse(BEFORE_BEGINNING), None);
    }
}

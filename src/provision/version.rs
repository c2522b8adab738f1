use std::cmp::Ordering;

/// Compare dotted version strings segment by segment.
///
/// The first unequal numeric segment decides. When every compared segment is
/// equal the version with fewer segments is the lesser one, so `1.0` sorts
/// before `1.0.0`.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let left: Vec<&str> = a.split('.').collect();
    let right: Vec<&str> = b.split('.').collect();
    for (l, r) in left.iter().zip(right.iter()) {
        let ordering = compare_segments(l, r);
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    left.len().cmp(&right.len())
}

/// Leading digits of a segment with leading zeros removed. Empty reads as 0.
fn leading_digits(segment: &str) -> &str {
    let trimmed = segment.trim();
    let end = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    trimmed[..end].trim_start_matches('0')
}

/// Numeric order of two segments without a width limit: more digits is
/// larger, equal widths compare lexically.
fn compare_segments(a: &str, b: &str) -> Ordering {
    let (a, b) = (leading_digits(a), leading_digits(b));
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

/// Leading digits of a segment; `2rc1` reads as 2 and a non-numeric segment as 0.
/// Values past `u64::MAX` saturate.
pub fn parse_version_number(segment: &str) -> u64 {
    let digits = leading_digits(segment);
    if digits.is_empty() {
        return 0;
    }
    digits.parse().unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shorter_equal_prefix_is_lesser() {
        assert_eq!(compare_versions("2.4", "2.4.1"), Ordering::Less);
        assert_eq!(compare_versions("1.0", "1.0.0"), Ordering::Less);
        assert_eq!(compare_versions("2.4.1", "2.4"), Ordering::Greater);
    }

    #[test]
    fn segments_compare_numerically() {
        assert_eq!(compare_versions("2.10", "2.9"), Ordering::Greater);
        assert_eq!(compare_versions("2.3.1", "2.4"), Ordering::Less);
        assert_eq!(compare_versions("2.4", "2.4"), Ordering::Equal);
    }

    #[test]
    fn odd_segments_stay_total() {
        assert_eq!(parse_version_number("2rc1"), 2);
        assert_eq!(parse_version_number("git"), 0);
        assert_eq!(compare_versions("", ""), Ordering::Equal);
        assert_eq!(compare_versions("1.x", "1.0"), Ordering::Equal);
    }

    #[test]
    fn oversized_segments_keep_numeric_order() {
        assert_eq!(compare_versions("99999999999999999999", "1"), Ordering::Greater);
        assert_eq!(
            compare_versions("2.18446744073709551616", "2.18446744073709551615"),
            Ordering::Greater
        );
        assert_eq!(compare_versions("1.007", "1.7"), Ordering::Equal);
        assert_eq!(compare_versions("1.010", "1.9"), Ordering::Greater);
        assert_eq!(parse_version_number("99999999999999999999"), u64::MAX);
        assert_eq!(parse_version_number("007"), 7);
    }
}

use std::cmp::Ordering;

/// Compare dotted version strings component by component, numerically.
///
/// Missing components count as zero and non-digit characters inside a
/// component are ignored, so `"1.0"` equals `"1.0.0"` and `"0.10"` is newer
/// than `"0.9"`.
pub fn compare_version(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (x, y) => match component(x).cmp(&component(y)) {
                Ordering::Equal => {}
                ord => return ord,
            },
        }
    }
}

/// Whether `version` is a non-empty run of dot separated decimal numbers.
pub fn is_numeric_version(version: &str) -> bool {
    !version.is_empty()
        && version
            .split('.')
            .all(|v| !v.is_empty() && v.bytes().all(|c| c.is_ascii_digit()))
}

fn component(part: Option<&str>) -> u64 {
    part.map(|v| {
        v.bytes()
            .filter(u8::is_ascii_digit)
            .fold(0u64, |acc, d| {
                acc.saturating_mul(10).saturating_add(u64::from(d - b'0'))
            })
    })
    .unwrap_or(0)
}

#[cfg(test)]
mod test {
    use super::{compare_version, is_numeric_version};
    use std::cmp::Ordering;

    #[test]
    fn test_compare() {
        assert_eq!(compare_version("0.7.9", "0.8.0"), Ordering::Less);
        assert_eq!(compare_version("0.8.0", "0.8.0"), Ordering::Equal);
        assert_eq!(compare_version("1.0", "0.9.9"), Ordering::Greater);
        assert_eq!(compare_version("0.10.0", "0.9.0"), Ordering::Greater);
        assert_eq!(compare_version("1.0", "1.0.0"), Ordering::Equal);
        assert_eq!(compare_version("1.0.1", "1.0"), Ordering::Greater);
        assert_eq!(compare_version("0.8.0-beta", "0.8.0"), Ordering::Equal);
        assert_eq!(compare_version("", "0.8.0"), Ordering::Less);
    }

    #[test]
    fn test_numeric() {
        assert!(is_numeric_version("0.8.0"));
        assert!(is_numeric_version("12"));
        assert!(!is_numeric_version(""));
        assert!(!is_numeric_version("0..1"));
        assert!(!is_numeric_version("v1.0"));
    }
}

/// Parse DICOM PatientAge ("065Y", "6M", "012W", ...) to whole years.
pub(crate) fn parse_age_years(age: &str) -> Option<u32> {
    for (suffix, divisor) in &DIVISORS {
        if let Some(left) = age.strip_suffix(suffix) {
            return left.parse::<f32>().ok().map(|num| (num / divisor) as u32);
        }
    }
    age.trim().parse().ok()
}

/// Units of time per year
const DIVISORS: [(&str, f32); 4] = [("Y", 1.0), ("M", 12.0), ("W", 52.14), ("D", 365.24)];

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[rstest]
    #[case("030Y", 30)]
    #[case("065Y", 65)]
    #[case("018M", 1)]
    #[case("104W", 1)]
    #[case("400D", 1)]
    #[case("000Y", 0)]
    fn test_parse_age_years(#[case] age: &str, #[case] expected: u32) {
        assert_eq!(parse_age_years(age).unwrap(), expected)
    }

    #[test]
    fn test_parse_age_rejects_garbage() {
        assert_eq!(parse_age_years("unknown"), None);
    }
}

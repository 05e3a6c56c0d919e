/// Fractional mile values that are published under a metric or common label.
/// 2.7 is already a friendly mile value and keeps its miles label.
const FRACTIONAL_LABELS: &[(f64, &str)] = &[
    (3.107, "5km"),
    (6.214, "10km"),
    (0.932, "1.5km"),
    (1.553, "2.5km"),
    (2.7, "2.7 Miles"),
    (0.746, "1.2km"),
    (0.5, "1/2 Mile"),
];

/// Convert a race distance in miles into the label shown in the results index.
pub fn format_distance(miles: f64) -> String {
    if miles == 1.0 {
        return "1 Mile".to_string();
    }
    if miles.is_finite() && miles.fract() == 0.0 {
        return format!("{miles} Miles");
    }
    for (value, label) in FRACTIONAL_LABELS {
        if miles == *value {
            return (*label).to_string();
        }
    }
    format!("{miles} Miles")
}

#[cfg(test)]
mod tests {
    use super::format_distance;

    #[test]
    fn integral_distances_use_mile_or_miles() {
        assert_eq!(format_distance(1.0), "1 Mile");
        for n in 2..=25 {
            assert_eq!(format_distance(f64::from(n)), format!("{n} Miles"));
        }
    }

    #[test]
    fn known_fractions_map_to_published_labels() {
        assert_eq!(format_distance(3.107), "5km");
        assert_eq!(format_distance(6.214), "10km");
        assert_eq!(format_distance(0.932), "1.5km");
        assert_eq!(format_distance(1.553), "2.5km");
        assert_eq!(format_distance(0.746), "1.2km");
        assert_eq!(format_distance(0.5), "1/2 Mile");
    }

    #[test]
    fn two_point_seven_stays_in_miles() {
        assert_eq!(format_distance(2.7), "2.7 Miles");
    }

    #[test]
    fn other_fractions_fall_back_to_raw_value() {
        assert_eq!(format_distance(1.25), "1.25 Miles");
        assert_eq!(format_distance(3.1), "3.1 Miles");
        assert_eq!(format_distance(0.75), "0.75 Miles");
    }

    #[test]
    fn parsed_calendar_values_hit_the_table() {
        let parsed: f64 = "3.107".parse().expect("parse");
        assert_eq!(format_distance(parsed), "5km");
    }

    #[test]
    fn huge_integral_distances_keep_their_value() {
        assert_eq!(format_distance(1e20), "100000000000000000000 Miles");
        assert!(format_distance(1e300).starts_with("1000000000"));
        assert_eq!(format_distance(1e300).len(), 301 + " Miles".len());
    }
}

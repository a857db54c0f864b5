//! Count values with optional unit suffixes, such as `10K`, `1.5M` or `MAX`.

fn multiplier(suffix: &str) -> Option<u64> {
    match suffix.to_ascii_uppercase().as_str() {
        "" => Some(1),
        "K" => Some(1_000),
        "M" => Some(1_000_000),
        "B" | "G" => Some(1_000_000_000),
        "T" => Some(1_000_000_000_000),
        "P" => Some(1_000_000_000_000_000),
        "E" => Some(1_000_000_000_000_000_000),
        _ => None,
    }
}

fn split_suffix(spec: &str) -> (&str, &str) {
    let number_end = spec
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(spec.len());

    let (number, suffix) = spec.split_at(number_end);
    (number.trim(), suffix.trim())
}

/// Parses a whole count. Fractional forms are accepted as long as the scaled value is whole.
pub(crate) fn parse_count(spec: &str) -> Option<u64> {
    let spec = spec.trim();

    if spec.eq_ignore_ascii_case("max") {
        return Some(u64::MAX);
    }

    let (number, suffix) = split_suffix(spec);
    let multiplier = multiplier(suffix)?;

    if let Ok(whole) = number.parse::<u64>() {
        return whole.checked_mul(multiplier);
    }

    let scaled = parse_scaled(number, multiplier)?;

    #[expect(
        clippy::cast_precision_loss,
        reason = "only used as an upper bound, precision is irrelevant"
    )]
    let limit = u64::MAX as f64;

    if scaled < 0.0 || scaled.fract() != 0.0 || scaled >= limit {
        return None;
    }

    #[expect(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        reason = "checked above to be a non-negative whole number within range"
    )]
    Some(scaled as u64)
}

/// Parses a possibly fractional quantity, such as a rate in operations per second.
pub(crate) fn parse_quantity(spec: &str) -> Option<f64> {
    let (number, suffix) = split_suffix(spec.trim());
    parse_scaled(number, multiplier(suffix)?)
}

fn parse_scaled(number: &str, multiplier: u64) -> Option<f64> {
    let value = number.parse::<f64>().ok()?;

    #[expect(
        clippy::cast_precision_loss,
        reason = "multipliers are powers of ten that f64 represents closely enough"
    )]
    let scaled = value * multiplier as f64;

    scaled.is_finite().then_some(scaled)
}

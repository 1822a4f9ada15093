//! Phone number normalisation for dedup keys and carrier lookups.
//!
//! Listings carry numbers in whatever shape the map provider renders them:
//! "011 111 1111", "+27 11 111 1111", "0111111111". Everything is collapsed
//! to the local 10-digit form (leading zero) before it is used as a cache
//! key or typed into the carrier site.

/// Normalise a raw phone string to local 10-digit form.
///
/// Returns `None` when the input has no usable number in it. Accepted
/// shapes:
/// - local 10 digits starting with `0`
/// - international `+27` / `27` prefix followed by 9 digits
/// - bare 9 digits (leading zero assumed dropped)
#[must_use]
pub fn normalize(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }

    if digits.len() == 11 && digits.starts_with("27") {
        return Some(format!("0{}", &digits[2..]));
    }
    if digits.len() == 10 && digits.starts_with('0') {
        return Some(digits);
    }
    if digits.len() == 9 && !digits.starts_with('0') {
        return Some(format!("0{digits}"));
    }

    None
}

/// Dedup key component for a phone field.
///
/// `None` phones still participate in dedup (name-only collisions), so the
/// key component is the empty string rather than absent.
#[must_use]
pub fn dedup_component(phone: Option<&str>) -> String {
    phone.and_then(normalize).unwrap_or_default()
}

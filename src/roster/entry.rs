use crate::roster::model::{ClockTime, RespawnTime};

/// Keep only ASCII digits, in order.
pub fn only_digits(input: &str) -> String {
    input.chars().filter(|ch| ch.is_ascii_digit()).collect()
}

/// Per-digit clamp for live "HHmm" entry, truncated to four digits:
/// d0: 0-2, d1: 0-3 when d0 is 2 else 0-9, d2: 0-5, d3: 0-9.
/// Every prefix of the result is a prefix of some legal clock time.
pub fn clamp_digits(input: &str) -> String {
    let mut digits: Vec<u8> = only_digits(input).into_bytes();
    digits.truncate(4);
    if let Some(d0) = digits.first_mut() {
        *d0 = (*d0).min(b'2');
    }
    let hour_cap = if digits.first() == Some(&b'2') { b'3' } else { b'9' };
    if let Some(d1) = digits.get_mut(1) {
        *d1 = (*d1).min(hour_cap);
    }
    if let Some(d2) = digits.get_mut(2) {
        *d2 = (*d2).min(b'5');
    }
    String::from_utf8(digits).unwrap_or_default()
}

/// Commit an entry the way the editor does on blur: left-pad one to three
/// digits with zeros, clamp, and produce the resulting time. An empty
/// entry clears the time.
pub fn finalize_entry(input: &str) -> RespawnTime {
    let mut digits = only_digits(input);
    if digits.is_empty() {
        return RespawnTime::None;
    }
    if digits.len() < 4 {
        digits = format!("{digits:0>4}");
    }
    let digits = clamp_digits(&digits);
    match ClockTime::from_digits(&digits) {
        Some(clock) => RespawnTime::Clock(clock),
        None => RespawnTime::None,
    }
}

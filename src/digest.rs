//! Content digest helpers

/// Length of the abbreviated digest shown in tables and labels
pub const SHORT_LEN: usize = 7;

/// Split a digest into (algorithm, encoded hex)
/// Examples:
///   "sha256:abc" -> ("sha256", "abc")
///   "sha512:abc" -> ("sha512", "abc")
///   "abc" -> ("sha256", "abc")
pub fn split(digest: &str) -> (&str, &str) {
    match digest.split_once(':') {
        Some((algo, hex)) => (algo, hex),
        None => ("sha256", digest),
    }
}

/// Split a digest only when both halves are safe as path components:
/// algorithm components `[a-z0-9]+` joined by `+._-`, encoded `[A-Za-z0-9=_-]+`
pub fn checked(digest: &str) -> Option<(&str, &str)> {
    let (algorithm, encoded) = digest.split_once(':')?;

    let algorithm_ok = algorithm
        .split(['+', '.', '_', '-'])
        .all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
    let encoded_ok =
        !encoded.is_empty() && encoded.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'=' || b == b'_' || b == b'-');

    (algorithm_ok && encoded_ok).then_some((algorithm, encoded))
}

/// Strip the algorithm prefix, whatever it is
pub fn bare(digest: &str) -> &str {
    split(digest).1
}

/// First seven characters of the bare digest
pub fn short(digest: &str) -> &str {
    let hex = bare(digest);
    match hex.char_indices().nth(SHORT_LEN) {
        Some((idx, _)) => &hex[..idx],
        None => hex,
    }
}

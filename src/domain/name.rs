//! Domain name normalization.
//!
//! Every name entering the crate goes through [`normalize`] exactly once;
//! all downstream comparisons assume lower-cased names without a trailing
//! dot.

/// Maximum length of a full domain name.
pub const MAX_DOMAIN_LEN: usize = 253;

/// Maximum characters per label.
pub const MAX_LABEL_LEN: usize = 63;

/// Normalizes a raw domain name, returning `None` for anything that is not
/// a valid domain.
///
/// Rules: at most one trailing dot is stripped, the result is lower-cased,
/// and every label must be 1-63 ASCII alphanumeric/hyphen characters that
/// neither start nor end with a hyphen. The root zone `"."` is rejected; it
/// is represented by the group-level match-any flag instead.
pub fn normalize(raw: &str) -> Option<String> {
    let stripped = raw.strip_suffix('.').unwrap_or(raw);
    if stripped.is_empty() || stripped.len() > MAX_DOMAIN_LEN {
        return None;
    }

    for label in stripped.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return None;
        }
        let bytes = label.as_bytes();
        if bytes[0] == b'-' || bytes[bytes.len() - 1] == b'-' {
            return None;
        }
        if !bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-') {
            return None;
        }
    }

    Some(stripped.to_ascii_lowercase())
}

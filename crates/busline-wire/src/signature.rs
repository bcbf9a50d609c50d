//! Type signature helpers
//!
//! Signatures are handled as strings of single complete types. Only the
//! parsing needed for comparisons lives here: splitting a signature into
//! complete types, and checking that one list of types is a prefix of
//! another.

/// Basic (non-container) type codes
const BASIC_TYPES: &str = "ybnqiuxtdsogvh";

/// Maximum container nesting accepted
const MAX_DEPTH: usize = 64;

/// Length of the complete type starting at `sig[0]`, or `None` if malformed
fn complete_type_len(sig: &[u8], depth: usize) -> Option<usize> {
    if depth > MAX_DEPTH {
        return None;
    }
    let first = *sig.first()?;
    match first {
        b'a' => {
            if sig.get(1) == Some(&b'{') {
                // dict entry: key must be basic, then one value type
                let key = *sig.get(2)?;
                if !BASIC_TYPES.as_bytes().contains(&key) || key == b'v' {
                    return None;
                }
                let value_len = complete_type_len(&sig[3..], depth + 1)?;
                if sig.get(3 + value_len) != Some(&b'}') {
                    return None;
                }
                Some(4 + value_len)
            } else {
                Some(1 + complete_type_len(&sig[1..], depth + 1)?)
            }
        }
        b'(' => {
            let mut pos = 1;
            while *sig.get(pos)? != b')' {
                pos += complete_type_len(&sig[pos..], depth + 1)?;
            }
            if pos == 1 {
                // empty structs are not allowed
                return None;
            }
            Some(pos + 1)
        }
        c if BASIC_TYPES.as_bytes().contains(&c) => Some(1),
        _ => None,
    }
}

/// Split a signature into its complete types
pub fn split_signature(signature: &str) -> Option<Vec<&str>> {
    let bytes = signature.as_bytes();
    let mut types = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        let len = complete_type_len(&bytes[pos..], 0)?;
        types.push(&signature[pos..pos + len]);
        pos += len;
    }
    Some(types)
}

/// True if `signature` is a well-formed sequence of complete types
pub fn is_valid_signature(signature: &str) -> bool {
    signature.len() <= 255 && split_signature(signature).is_some()
}

/// True if `signature` is exactly one complete type
pub fn is_single_complete_type(signature: &str) -> bool {
    matches!(split_signature(signature), Some(types) if types.len() == 1)
}

/// True if the types of `prefix` are the leading types of `signature`
///
/// Comparison happens on complete-type boundaries, so `"a"` is not a
/// prefix of `"ai"`.
pub fn starts_with_types(signature: &str, prefix: &str) -> bool {
    let (Some(full), Some(head)) = (split_signature(signature), split_signature(prefix)) else {
        return false;
    };
    head.len() <= full.len() && head.iter().zip(full.iter()).all(|(a, b)| a == b)
}

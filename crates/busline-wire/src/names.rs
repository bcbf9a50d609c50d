//! Validation of bus names, object paths, interface and member names

/// Maximum length of any name
const MAX_NAME_LENGTH: usize = 255;

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Object path: `/` or `/seg(/seg)*` with `[A-Za-z0-9_]+` segments
pub fn is_valid_object_path(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    let Some(rest) = path.strip_prefix('/') else {
        return false;
    };
    rest.split('/')
        .all(|segment| !segment.is_empty() && segment.chars().all(is_name_char))
}

fn is_valid_element(element: &str, allow_leading_digit: bool, allow_dash: bool) -> bool {
    let mut chars = element.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if first.is_ascii_digit() && !allow_leading_digit {
        return false;
    }
    let ok = |c: char| is_name_char(c) || (allow_dash && c == '-');
    ok(first) && chars.all(ok)
}

/// Interface name: at least two dot-separated elements, no leading digits
pub fn is_valid_interface_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return false;
    }
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() >= 2 && parts.iter().all(|p| is_valid_element(p, false, false))
}

/// Member name: a single element, no leading digit
pub fn is_valid_member_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= MAX_NAME_LENGTH && is_valid_element(name, false, false)
}

/// Error names follow the interface name rules
pub fn is_valid_error_name(name: &str) -> bool {
    is_valid_interface_name(name)
}

/// Unique connection name, e.g. `:1.42`
pub fn is_valid_unique_connection_name(name: &str) -> bool {
    let Some(rest) = name.strip_prefix(':') else {
        return false;
    };
    if name.len() > MAX_NAME_LENGTH {
        return false;
    }
    let parts: Vec<&str> = rest.split('.').collect();
    parts.len() >= 2 && parts.iter().all(|p| is_valid_element(p, true, true))
}

/// Bus name: either a unique name or a well-known name
pub fn is_valid_bus_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return false;
    }
    if name.starts_with(':') {
        return is_valid_unique_connection_name(name);
    }
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() >= 2 && parts.iter().all(|p| is_valid_element(p, false, true))
}

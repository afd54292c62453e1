// Copyright 2024 Shutter Authors
// SPDX-License-Identifier: Apache-2.0

//! Filesystem-safe names
//!
//! Class, method and screenshot names end up as path components on the agent
//! side, so both ends restrict them to `[A-Za-z0-9._-]`.

/// Replacement for characters outside the allowed set
pub const REPLACEMENT: char = '_';

fn is_allowed(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

/// Replace every character outside `[A-Za-z0-9._-]` with `_`.
///
/// `.` and `..` would escape the directory they are joined onto and are
/// replaced wholesale.
pub fn sanitize_component(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| if is_allowed(c) { c } else { REPLACEMENT })
        .collect();

    match sanitized.as_str() {
        "" | "." | ".." => REPLACEMENT.to_string().repeat(sanitized.len().max(1)),
        _ => sanitized,
    }
}

/// True if `name` can be used as a single path component unchanged.
pub fn is_safe_component(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && name.chars().all(is_allowed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_keeps_allowed() {
        assert_eq!(sanitize_component("com.example.Login_Test-2"), "com.example.Login_Test-2");
    }

    #[test]
    fn test_sanitize_replaces_others() {
        assert_eq!(sanitize_component("Outer$Inner"), "Outer_Inner");
        assert_eq!(sanitize_component("a b/c"), "a_b_c");
        assert_eq!(sanitize_component("héllo"), "h_llo");
    }

    #[test]
    fn test_sanitize_dot_components() {
        assert_eq!(sanitize_component("."), "_");
        assert_eq!(sanitize_component(".."), "__");
        assert_eq!(sanitize_component(""), "_");
        assert_eq!(sanitize_component("../etc"), ".._etc");
    }

    #[test]
    fn test_is_safe_component() {
        assert!(is_safe_component("testTap"));
        assert!(!is_safe_component(".."));
        assert!(!is_safe_component("a/b"));
        assert!(!is_safe_component(""));
    }
}

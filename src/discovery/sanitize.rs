/// Convert a branch or directory name into a workspace name.
///
/// Lowercases, maps `/`, `_` and space to `-`, then drops every character
/// outside `[a-z0-9-]`. The result is safe as a DNS label and as a port
/// allocator key. It may be empty.
///
/// - `"feature/auth"` -> `"feature-auth"`
/// - `"Feature/JIRA-123 Fix"` -> `"feature-jira-123-fix"`
/// - `"feature/user_profile"` -> `"feature-user-profile"`
pub fn sanitize_name(raw: &str) -> String {
    raw.to_lowercase()
        .chars()
        .map(|c| match c {
            '/' | '_' | ' ' => '-',
            other => other,
        })
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-')
        .collect()
}

/// True if `name` could have come out of [`sanitize_name`] and is usable
/// as a registry key.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

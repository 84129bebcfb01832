//! Password check for update requests.

/// Longest update password that can be configured.
pub const MAX_PASSWORD_LEN: usize = 64;

/// Check a presented password against the configured one.
///
/// An empty `configured` password disables authentication. A missing
/// `presented` password is treated as the empty string. The comparison does
/// not stop at the first differing byte.
#[must_use]
pub fn validate_password(configured: &str, presented: Option<&str>) -> bool {
    if configured.is_empty() {
        return true;
    }

    let configured = configured.as_bytes();
    let presented = presented.unwrap_or_default().as_bytes();
    if configured.len() != presented.len() {
        return false;
    }

    let diff = configured
        .iter()
        .zip(presented)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b));
    diff == 0
}

/// Whether `password` can be stored as the update password.
///
/// The empty string is valid and means "no authentication".
#[must_use]
pub fn is_valid_password(password: &str) -> bool {
    password.len() <= MAX_PASSWORD_LEN && password.bytes().all(|b| b.is_ascii_graphic() || b == b' ')
}

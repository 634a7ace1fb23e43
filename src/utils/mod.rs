//! Shared utilities

pub mod error;

pub use error::{AppError, AppResult};

/// Current UTC timestamp in RFC 3339 format, the wire format used for
/// message and conversation timestamps.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Derive a short, single-line chat title from the user's first message.
pub fn title_from_first_user_message(msg: &str) -> String {
    let trimmed = msg.trim().replace('\n', " ");
    if trimmed.is_empty() {
        return "New chat".to_string();
    }
    let chars: Vec<char> = trimmed.chars().collect();
    if chars.len() > 29 {
        let mut title: String = chars[..28].iter().collect();
        title.push('…');
        title
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_title_short_message() {
        assert_eq!(title_from_first_user_message("Check INC123"), "Check INC123");
    }

    #[test]
    fn test_title_truncates_long_message() {
        let long = "a".repeat(60);
        let title = title_from_first_user_message(&long);
        assert_eq!(title.chars().count(), 29);
        assert!(title.ends_with('…'));
    }

    #[test]
    fn test_title_empty_message() {
        assert_eq!(title_from_first_user_message("   "), "New chat");
        assert_eq!(title_from_first_user_message("\n"), "New chat");
    }

    #[test]
    fn test_title_flattens_newlines() {
        assert_eq!(title_from_first_user_message("a\nb"), "a b");
    }
}

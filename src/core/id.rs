use rand::Rng;

use super::error::{Error, ErrorKind, Result};

/// Maximum length of a container identifier, per spec.
const MAX_ID_LEN: usize = 1024;

/// Length (in hex characters) of a generated container ID, used when the
/// caller doesn't supply one explicitly.
const GENERATED_ID_LEN: usize = 16;

/// Validate a container identifier:
///
/// - non-empty, length <= 1024
/// - matches `^[A-Za-z0-9][A-Za-z0-9_.-]*$`
/// - not equal to `.` or `..`
///
/// The character class already forbids `/`, so "equal to its own
/// path-cleaned form" reduces to rejecting the two reserved dot names.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::msg("validate_id", ErrorKind::InvalidConfig, "empty container id"));
    }
    if id.len() > MAX_ID_LEN {
        return Err(Error::msg(
            "validate_id",
            ErrorKind::InvalidConfig,
            format!("container id exceeds {MAX_ID_LEN} characters"),
        ));
    }
    if id == "." || id == ".." {
        return Err(Error::msg(
            "validate_id",
            ErrorKind::InvalidConfig,
            "container id must not be '.' or '..'",
        ));
    }

    let mut chars = id.chars();
    let first = chars.next().expect("checked non-empty above");
    if !first.is_ascii_alphanumeric() {
        return Err(Error::msg(
            "validate_id",
            ErrorKind::InvalidConfig,
            "container id must start with an alphanumeric character",
        ));
    }
    for c in chars {
        if !(c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-') {
            return Err(Error::msg(
                "validate_id",
                ErrorKind::InvalidConfig,
                format!("container id contains disallowed character '{c}'"),
            ));
        }
    }

    Ok(())
}

/// Generate a random hex container ID (16 hex chars = 8 random bytes).
/// Always satisfies [`validate_id`].
pub fn generate_id() -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..GENERATED_ID_LEN / 2).map(|_| rng.gen()).collect();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_ids() {
        assert!(validate_id("a").is_ok());
        assert!(validate_id("container-1").is_ok());
        assert!(validate_id("Container_1.2").is_ok());
        assert!(validate_id(&"a".repeat(1024)).is_ok());
    }

    #[test]
    fn rejects_empty() {
        assert_eq!(validate_id("").unwrap_err().kind, ErrorKind::InvalidConfig);
    }

    #[test]
    fn rejects_too_long() {
        assert!(validate_id(&"a".repeat(1025)).is_err());
    }

    #[test]
    fn rejects_dot_and_dotdot() {
        assert!(validate_id(".").is_err());
        assert!(validate_id("..").is_err());
    }

    #[test]
    fn rejects_leading_punctuation() {
        assert!(validate_id("-abc").is_err());
        assert!(validate_id("_abc").is_err());
        assert!(validate_id(".abc").is_err());
    }

    #[test]
    fn rejects_path_separators() {
        assert!(validate_id("a/b").is_err());
        assert!(validate_id("../etc").is_err());
    }

    #[test]
    fn generated_id_is_valid_and_unique() {
        let a = generate_id();
        let b = generate_id();
        assert!(validate_id(&a).is_ok());
        assert_eq!(a.len(), GENERATED_ID_LEN);
        assert_ne!(a, b);
    }
}

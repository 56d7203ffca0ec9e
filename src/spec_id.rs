//! SPEC identifier validation and normalization.
//!
//! The canonical form is `SPEC-<IDENT>-<NNN>` where `<IDENT>` is uppercase
//! alphanumeric and `<NNN>` is exactly three digits (e.g., `SPEC-AUTH-001`).
//! The registry itself accepts any stable identifier; these helpers exist so
//! the command surface can validate and normalize user input for display.

use std::sync::LazyLock;

use regex::Regex;

static SPEC_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^SPEC-[A-Z0-9]+-[0-9]{3}$").unwrap());

/// Check whether `id` is in the canonical SPEC form.
pub fn is_valid(id: &str) -> bool {
    SPEC_ID.is_match(id)
}

/// Normalize a user-supplied id: trim, uppercase, then validate.
///
/// Returns `None` when the input cannot be brought into the canonical form.
pub fn normalize(id: &str) -> Option<String> {
    let candidate = id.trim().to_uppercase();
    is_valid(&candidate).then_some(candidate)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("SPEC-ABC-001")]
    #[case("SPEC-TEST-999")]
    #[case("SPEC-A-001")]
    #[case("SPEC-ABCDEFG-999")]
    #[case("SPEC-A1B2-001")]
    fn accepts_canonical_ids(#[case] id: &str) {
        assert!(is_valid(id), "{id} should be valid");
    }

    #[rstest]
    #[case("spec-abc-001")] // lowercase prefix
    #[case("SPEC-abc-001")] // lowercase identifier
    #[case("Spec-ABC-001")] // mixed case
    #[case("SPEC-ABC")] // missing number
    #[case("SPEC-ABC-1")] // too few digits
    #[case("SPEC-ABC-1234")] // too many digits
    #[case("ABC-001")] // missing prefix
    #[case("SPEC-001")] // missing identifier
    #[case("SPEC--001")] // empty identifier
    #[case("SPEC-ABC_DEF-001")] // underscore
    #[case("SPEC-ABC.001")] // dot separator
    #[case("")]
    fn rejects_malformed_ids(#[case] id: &str) {
        assert!(!is_valid(id), "{id} should be invalid");
    }

    #[rstest]
    #[case("spec-abc-001", "SPEC-ABC-001")]
    #[case("SPEC-abc-001", "SPEC-ABC-001")]
    #[case("Spec-Abc-001", "SPEC-ABC-001")]
    #[case("SPEC-ABC-001", "SPEC-ABC-001")]
    #[case("  SPEC-ABC-001", "SPEC-ABC-001")]
    #[case("spec-a1b2-999  ", "SPEC-A1B2-999")]
    #[case("  spec-verylongid-123  ", "SPEC-VERYLONGID-123")]
    fn normalizes_case_and_whitespace(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(normalize(input).as_deref(), Some(expected));
    }

    #[rstest]
    #[case("invalid")]
    #[case("")]
    #[case("   ")]
    #[case("SPEC-ABC")]
    fn normalize_rejects_unrecoverable_input(#[case] input: &str) {
        assert_eq!(normalize(input), None);
    }
}

//! Deterministic feature branch naming

const SLUG_MAX_LEN: usize = 50;

/// Branch name for a feature: `feature/<id>-<slug>`
pub fn feature_branch_name(id: u64, name: &str) -> String {
    format!("feature/{}-{}", id, slugify(name))
}

/// Lowercase the name, collapse runs of non-alphanumeric characters to a
/// single hyphen, trim leading/trailing hyphens, truncate to 50 characters
/// without leaving a trailing hyphen
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_hyphen = false;

    for ch in name.to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.push(ch);
        } else {
            pending_hyphen = true;
        }
    }

    slug.truncate(SLUG_MAX_LEN);
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_slug() {
        assert_eq!(slugify("Dark mode toggle"), "dark-mode-toggle");
    }

    #[test]
    fn test_collapses_runs() {
        assert_eq!(slugify("add -- some!!  punctuation"), "add-some-punctuation");
    }

    #[test]
    fn test_trims_edges() {
        assert_eq!(slugify("  (wrapped in noise)  "), "wrapped-in-noise");
    }

    #[test]
    fn test_underscores_collapse_too() {
        assert_eq!(slugify("snake_case_name"), "snake-case-name");
    }

    #[test]
    fn test_truncates_without_trailing_hyphen() {
        let name = "a ".repeat(60);
        let slug = slugify(&name);
        assert!(slug.len() <= 50);
        assert!(!slug.ends_with('-'));
    }

    #[test]
    fn test_slug_charset_property() {
        let inputs = [
            "Über-Feature: añadir diacríticos!",
            "100% coverage (or else)",
            "",
            "----",
            "MixedCASE and 123",
        ];
        for input in inputs {
            let slug = slugify(input);
            assert!(slug.len() <= 50, "{:?}", slug);
            assert!(
                slug.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'),
                "{:?}",
                slug
            );
            assert!(!slug.starts_with('-'), "{:?}", slug);
            assert!(!slug.ends_with('-'), "{:?}", slug);
            assert!(!slug.contains("--"), "{:?}", slug);
        }
    }

    #[test]
    fn test_branch_name_format() {
        assert_eq!(
            feature_branch_name(7, "Add user login"),
            "feature/7-add-user-login"
        );
    }
}

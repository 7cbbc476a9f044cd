//! Suffix rules deciding which question names are measured.
//!
//! Names are fully-qualified, trailing dot included, and compared byte for
//! byte. No case folding is applied.
//!
//! Require and deny suffixes are not mirror images. Every require suffix
//! must be present, and one that ends in `.` is also found as a run of
//! whole labels anywhere in the name, so `.prod.` admits
//! `svc.prod.internal.`. Deny suffixes only ever match the end of the name.

use crate::config::SuffixConfig;

/// Outcome of evaluating one name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The name is measured.
    Pass,
    /// A required suffix is missing from the name.
    MissingRequired(String),
    /// The name ends in a denied suffix.
    Denied(String),
}

impl Verdict {
    /// True when the question should be emitted.
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass)
    }
}

/// Require and deny suffix lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameFilter {
    require_suffixes: Vec<String>,
    deny_suffixes: Vec<String>,
}

impl NameFilter {
    /// Build a filter from explicit rule lists.
    pub fn new(require_suffixes: Vec<String>, deny_suffixes: Vec<String>) -> Self {
        Self {
            require_suffixes,
            deny_suffixes,
        }
    }

    /// A filter that passes every name.
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Suffixes a name must all carry.
    pub fn require_suffixes(&self) -> &[String] {
        &self.require_suffixes
    }

    /// Suffixes that exclude a name.
    pub fn deny_suffixes(&self) -> &[String] {
        &self.deny_suffixes
    }

    /// Evaluate `name` against the rules.
    ///
    /// Every required suffix must be present, not just one of them: with
    /// `[".prod.", ".internal."]`, `svc.prod.internal.` passes and
    /// `svc.prod.example.` does not. A required suffix is present when the
    /// name ends with it or carries it as a run of whole labels. Deny
    /// suffixes only match at the end of the name.
    pub fn evaluate(&self, name: &str) -> Verdict {
        if let Some(missing) = self
            .require_suffixes
            .iter()
            .find(|suffix| !has_required_suffix(name, suffix))
        {
            return Verdict::MissingRequired(missing.clone());
        }

        if let Some(denied) = self
            .deny_suffixes
            .iter()
            .find(|suffix| name.ends_with(suffix.as_str()))
        {
            return Verdict::Denied(denied.clone());
        }

        Verdict::Pass
    }
}

/// `name` ends with `suffix`, or contains it aligned to label boundaries.
fn has_required_suffix(name: &str, suffix: &str) -> bool {
    if name.ends_with(suffix) {
        return true;
    }
    if !suffix.ends_with('.') {
        return false;
    }
    // A suffix with a leading dot supplies its own boundary, so it may
    // start on the dot that ends the previous label.
    let aligned = |start: usize| {
        suffix.starts_with('.') || start == 0 || name.as_bytes()[start - 1] == b'.'
    };
    (0..name.len())
        .filter(|&start| name.is_char_boundary(start) && aligned(start))
        .any(|start| name[start..].starts_with(suffix))
}

impl From<&SuffixConfig> for NameFilter {
    fn from(config: &SuffixConfig) -> Self {
        Self::new(config.only.clone(), config.ignore.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_empty_filter_passes_everything() {
        let filter = NameFilter::allow_all();
        assert!(filter.evaluate("api.example.com.").is_pass());
        assert!(filter.evaluate(".").is_pass());
    }

    #[test]
    fn test_deny_suffix() {
        let filter = NameFilter::new(vec![], strings(&[".cluster.local."]));

        assert_eq!(
            filter.evaluate("kube-dns.kube-system.svc.cluster.local."),
            Verdict::Denied(".cluster.local.".to_string())
        );
        assert!(filter.evaluate("api.example.com.").is_pass());
    }

    #[test]
    fn test_require_suffixes_are_conjunctive() {
        let filter = NameFilter::new(strings(&[".prod.", ".internal."]), vec![]);

        assert!(filter.evaluate("svc.prod.internal.").is_pass());
        // Would pass if any one required suffix were enough.
        assert_eq!(
            filter.evaluate("svc.prod.example."),
            Verdict::MissingRequired(".internal.".to_string())
        );
        assert_eq!(
            filter.evaluate("svc.dev.internal."),
            Verdict::MissingRequired(".prod.".to_string())
        );
    }

    #[test]
    fn test_required_suffix_must_align_to_labels() {
        let filter = NameFilter::new(strings(&["prod."]), vec![]);
        assert!(filter.evaluate("svc.prod.internal.").is_pass());
        assert!(filter.evaluate("prod.internal.").is_pass());
        assert!(!filter.evaluate("svc.nonprod.internal.").is_pass());
        // Plain end-of-name matching still applies.
        assert!(filter.evaluate("svc.nonprod.").is_pass());
    }

    #[test]
    fn test_required_suffix_found_after_overlapping_partial_match() {
        // The first occurrence of "a.a." starts mid-label; a later one is
        // aligned.
        let filter = NameFilter::new(strings(&["a.a."]), vec![]);
        assert!(filter.evaluate("ba.a.a.x.").is_pass());
        assert!(!filter.evaluate("ba.a.x.").is_pass());

        let filter = NameFilter::new(strings(&[".a.a."]), vec![]);
        assert!(filter.evaluate("x.a.a.a.y.").is_pass());
    }

    #[test]
    fn test_required_suffix_without_trailing_dot_only_matches_at_end() {
        let filter = NameFilter::new(strings(&[".internal"]), vec![]);
        assert!(!filter.evaluate("svc.internal.").is_pass());
        assert!(!filter.evaluate("svc.internal.example.").is_pass());
    }

    #[test]
    fn test_single_require_suffix() {
        let filter = NameFilter::new(strings(&[".internal."]), vec![]);
        assert!(filter.evaluate("svc.prod.internal.").is_pass());
        assert!(!filter.evaluate("svc.prod.example.").is_pass());
    }

    #[test]
    fn test_deny_only_matches_at_end() {
        let filter = NameFilter::new(vec![], strings(&[".cluster.local."]));
        assert!(filter.evaluate("web.cluster.local.example.com.").is_pass());
    }

    #[test]
    fn test_require_checked_before_deny() {
        let filter = NameFilter::new(strings(&[".internal."]), strings(&["db.internal."]));

        assert!(filter.evaluate("api.internal.").is_pass());
        assert_eq!(
            filter.evaluate("db.internal."),
            Verdict::Denied("db.internal.".to_string())
        );
        assert_eq!(
            filter.evaluate("db.example."),
            Verdict::MissingRequired(".internal.".to_string())
        );
    }

    #[test]
    fn test_matching_is_case_sensitive_and_literal() {
        let filter = NameFilter::new(vec![], strings(&[".cluster.local."]));
        assert!(filter.evaluate("web.CLUSTER.LOCAL.").is_pass());
        // No trailing dot in the rule's view of the name means no match.
        assert!(filter.evaluate("web.cluster.local").is_pass());
    }

    #[test]
    fn test_from_suffix_config() {
        let config = SuffixConfig {
            ignore: strings(&[".svc.cluster.local."]),
            only: strings(&[".local."]),
        };
        let filter = NameFilter::from(&config);
        assert_eq!(filter.require_suffixes(), [".local.".to_string()]);
        assert_eq!(filter.deny_suffixes(), [".svc.cluster.local.".to_string()]);
    }
}

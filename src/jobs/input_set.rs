//! Input set — a primary identifier plus a bounded, de-duplicated member list.
//!
//! Cardinality and duplication are checked eagerly on `add`. Edits in place
//! (`replace_primary`, `set_member`) are never rejected so a form can hold
//! half-typed values; the full check runs when the set is turned into a
//! request config.

use crate::error::InputError;
use crate::jobs::model::GapConfig;

/// Product rule: a target plus at most four competitors.
pub const DEFAULT_MAX_EXTRA: usize = 4;

/// Case-insensitive, whitespace-trimmed form used for equality.
pub fn normalize(identifier: &str) -> String {
    identifier.trim().to_lowercase()
}

/// Ordered participants of one analysis request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSet {
    primary: String,
    members: Vec<String>,
    max_extra: usize,
}

impl InputSet {
    pub fn new(primary: impl Into<String>) -> Self {
        Self::with_capacity(primary, DEFAULT_MAX_EXTRA)
    }

    pub fn with_capacity(primary: impl Into<String>, max_extra: usize) -> Self {
        Self {
            primary: primary.into(),
            members: Vec::new(),
            max_extra,
        }
    }

    pub fn primary(&self) -> &str {
        &self.primary
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn max_extra(&self) -> usize {
        self.max_extra
    }

    /// Number of slots including the primary.
    pub fn len(&self) -> usize {
        1 + self.members.len()
    }

    pub fn is_full(&self) -> bool {
        self.members.len() >= self.max_extra
    }

    /// Append a member.
    pub fn add(&mut self, identifier: impl Into<String>) -> Result<(), InputError> {
        if self.is_full() {
            return Err(InputError::CapacityExceeded {
                max: self.max_extra,
            });
        }

        let identifier = identifier.into();
        let key = normalize(&identifier);
        // Blank rows are placeholders, not identifiers.
        if !key.is_empty() && self.contains_normalized(&key) {
            return Err(InputError::DuplicateMember {
                identifier: identifier.trim().to_string(),
            });
        }

        self.members.push(identifier);
        Ok(())
    }

    /// Remove the entry at `index` (0 is the primary, members start at 1).
    pub fn remove(&mut self, index: usize) -> Result<String, InputError> {
        if index == 0 {
            return Err(InputError::PrimaryNotRemovable);
        }
        if index > self.members.len() {
            return Err(InputError::IndexOutOfRange {
                index,
                len: self.len(),
            });
        }
        Ok(self.members.remove(index - 1))
    }

    /// Replace the primary. Always succeeds.
    pub fn replace_primary(&mut self, identifier: impl Into<String>) {
        self.primary = identifier.into();
    }

    /// Overwrite the member at `index` (1-based, like `remove`). Not validated.
    pub fn set_member(&mut self, index: usize, identifier: impl Into<String>) -> Result<(), InputError> {
        if index == 0 {
            self.replace_primary(identifier);
            return Ok(());
        }
        let len = self.len();
        let slot = self
            .members
            .get_mut(index - 1)
            .ok_or(InputError::IndexOutOfRange { index, len })?;
        *slot = identifier.into();
        Ok(())
    }

    /// `[primary, ...members]` without blank entries, trimmed.
    pub fn to_ordered_list(&self) -> Vec<String> {
        std::iter::once(&self.primary)
            .chain(self.members.iter())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Full submission-time check: primary present, no normalized duplicates.
    pub fn validate(&self) -> Result<(), InputError> {
        if self.primary.trim().is_empty() {
            return Err(InputError::EmptyPrimary);
        }
        if self.members.len() > self.max_extra {
            return Err(InputError::CapacityExceeded {
                max: self.max_extra,
            });
        }

        let mut seen = std::collections::HashSet::new();
        for identifier in self.to_ordered_list() {
            if !seen.insert(normalize(&identifier)) {
                return Err(InputError::DuplicateMember { identifier });
            }
        }
        Ok(())
    }

    /// Validate and build the competitor gap request config.
    pub fn to_gap_config(&self) -> Result<GapConfig, InputError> {
        self.validate()?;
        Ok(GapConfig {
            domains: self.to_ordered_list(),
        })
    }

    fn contains_normalized(&self, key: &str) -> bool {
        normalize(&self.primary) == key || self.members.iter().any(|m| normalize(m) == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_stops_at_capacity() {
        let mut set = InputSet::new("target.com");
        let results: Vec<_> = (0..=DEFAULT_MAX_EXTRA)
            .map(|i| set.add(format!("rival{i}.com")))
            .collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), DEFAULT_MAX_EXTRA);
        assert_eq!(
            results.last().unwrap(),
            &Err(InputError::CapacityExceeded { max: 4 })
        );
        assert!(set.is_full());
        assert_eq!(set.len(), 5);
    }

    #[test]
    fn duplicates_are_case_and_whitespace_insensitive() {
        let mut set = InputSet::new("target.com");
        set.add("Example.com").unwrap();
        let err = set.add("example.com ").unwrap_err();
        assert_eq!(
            err,
            InputError::DuplicateMember {
                identifier: "example.com".into()
            }
        );
    }

    #[test]
    fn member_may_not_duplicate_primary() {
        let mut set = InputSet::new("Target.com");
        assert!(matches!(
            set.add(" target.COM"),
            Err(InputError::DuplicateMember { .. })
        ));
    }

    #[test]
    fn blank_rows_are_allowed_and_filtered() {
        let mut set = InputSet::new("target.com");
        set.add("").unwrap();
        set.add("  ").unwrap();
        set.add("rival.com").unwrap();
        assert_eq!(set.to_ordered_list(), vec!["target.com", "rival.com"]);
    }

    #[test]
    fn primary_cannot_be_removed() {
        let mut set = InputSet::new("target.com");
        set.add("rival.com").unwrap();
        assert_eq!(set.remove(0), Err(InputError::PrimaryNotRemovable));
        assert_eq!(
            set.remove(2),
            Err(InputError::IndexOutOfRange { index: 2, len: 2 })
        );
        assert_eq!(set.remove(1).unwrap(), "rival.com");
        assert!(set.members().is_empty());
    }

    #[test]
    fn replace_primary_accepts_transient_state() {
        let mut set = InputSet::new("target.com");
        set.add("rival.com").unwrap();
        set.replace_primary("");
        assert_eq!(set.to_ordered_list(), vec!["rival.com"]);
        assert_eq!(set.validate(), Err(InputError::EmptyPrimary));

        set.replace_primary("RIVAL.com");
        assert!(matches!(
            set.validate(),
            Err(InputError::DuplicateMember { .. })
        ));

        set.replace_primary("new-target.com");
        assert!(set.validate().is_ok());
    }

    #[test]
    fn set_member_edits_in_place() {
        let mut set = InputSet::new("target.com");
        set.add("").unwrap();
        set.set_member(1, "rival.com").unwrap();
        assert_eq!(set.members().to_vec(), vec!["rival.com"]);
        assert!(set.set_member(5, "x.com").is_err());
    }

    #[test]
    fn gap_config_keeps_primary_first() {
        let mut set = InputSet::new(" target.com ");
        set.add("b.com").unwrap();
        set.add("a.com").unwrap();
        let config = set.to_gap_config().unwrap();
        assert_eq!(config.domains, vec!["target.com", "b.com", "a.com"]);
    }
}

//! Named groups of related cache keys.
//!
//! One business event (points changed, attendance saved) can stale several
//! read views at once; a group lists every key feeding those views.

use serde::Deserialize;
use std::collections::BTreeMap;

/// Registry of named cache key groups.
///
/// Members ending in `*` match every key with that prefix.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct CacheGroups {
  groups: BTreeMap<String, Vec<String>>,
}

impl Default for CacheGroups {
  fn default() -> Self {
    let mut groups = BTreeMap::new();
    groups.insert(
      "points".to_string(),
      vec![
        "manage_points_data".to_string(),
        "dashboard_groups".to_string(),
        "dashboard_participant_info".to_string(),
        "participants".to_string(),
        "participant_points_*".to_string(),
      ],
    );
    groups.insert(
      "attendance".to_string(),
      vec![
        "attendance_*".to_string(),
        "attendance_dates".to_string(),
        "participants".to_string(),
      ],
    );
    groups.insert(
      "badges".to_string(),
      vec![
        "badge_dashboard_*".to_string(),
        "badge_summary".to_string(),
        "pending_badges".to_string(),
      ],
    );
    Self { groups }
  }
}

impl CacheGroups {
  pub fn empty() -> Self {
    Self {
      groups: BTreeMap::new(),
    }
  }

  /// Add or replace a group.
  pub fn with_group<I, S>(mut self, name: &str, members: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self
      .groups
      .insert(name.to_string(), members.into_iter().map(Into::into).collect());
    self
  }

  pub fn members(&self, name: &str) -> Option<&[String]> {
    self.groups.get(name).map(Vec::as_slice)
  }

  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.groups.keys().map(String::as_str)
  }

  /// Whether `key` belongs to group `name`. Unknown groups match nothing.
  pub fn contains(&self, name: &str, key: &str) -> bool {
    self
      .members(name)
      .map(|members| members.iter().any(|m| member_matches(m, key)))
      .unwrap_or(false)
  }
}

fn member_matches(member: &str, key: &str) -> bool {
  match member.strip_suffix('*') {
    Some(prefix) => key.starts_with(prefix),
    None => member == key,
  }
}

/// Which keys a group invalidation removes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupSelector {
  /// A group from the registry
  Named(String),
  /// Every key starting with the prefix
  Prefix(String),
  /// An explicit set of keys
  Keys(Vec<String>),
}

impl GroupSelector {
  pub fn named(name: impl Into<String>) -> Self {
    Self::Named(name.into())
  }

  pub(crate) fn matches(&self, groups: &CacheGroups, key: &str) -> bool {
    match self {
      Self::Named(name) => groups.contains(name, key),
      Self::Prefix(prefix) => key.starts_with(prefix.as_str()),
      Self::Keys(keys) => keys.iter().any(|k| k == key),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_exact_and_prefix_members() {
    let groups = CacheGroups::empty().with_group("points", ["dashboard_groups", "points_*"]);
    assert!(groups.contains("points", "dashboard_groups"));
    assert!(groups.contains("points", "points_week_12"));
    assert!(!groups.contains("points", "dashboard_groups_old"));
    assert!(!groups.contains("badges", "dashboard_groups"));
  }

  #[test]
  fn test_default_groups_present() {
    let groups = CacheGroups::default();
    let names: Vec<&str> = groups.names().collect();
    assert_eq!(names, vec!["attendance", "badges", "points"]);
    assert!(groups.contains("points", "participant_points_42"));
  }

  #[test]
  fn test_deserialize_from_yaml_map() {
    let groups: CacheGroups = serde_yaml::from_str("forms: [form_*]\n").unwrap();
    assert!(groups.contains("forms", "form_health"));
  }
}

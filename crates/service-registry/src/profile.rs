//! Profiles: named service scopes with directory and environment overrides

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;

use crate::models::ServiceId;

/// A named scope of services
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Profile name
    pub name: String,
    /// Services in scope
    pub service_ids: BTreeSet<ServiceId>,
    /// Overrides the global projects directory
    #[serde(default)]
    pub projects_dir: Option<PathBuf>,
    /// Profile level environment
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Per-call context handed to the engine
///
/// `service_ids: None` means every registered service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileContext {
    /// Services in scope
    pub service_ids: Option<BTreeSet<ServiceId>>,
    /// Directory that relative service directories resolve against
    pub projects_dir_override: Option<PathBuf>,
    /// Environment layered between global and service values
    pub env_overrides: BTreeMap<String, String>,
}

impl ProfileContext {
    /// Context covering every service with no overrides
    pub fn all() -> Self {
        Self::default()
    }

    /// Context restricted to the given services
    pub fn scoped(ids: impl IntoIterator<Item = ServiceId>) -> Self {
        Self {
            service_ids: Some(ids.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Whether a service is in scope
    pub fn includes(&self, id: &ServiceId) -> bool {
        self.service_ids.as_ref().is_none_or(|ids| ids.contains(id))
    }
}

impl From<&Profile> for ProfileContext {
    fn from(profile: &Profile) -> Self {
        Self {
            service_ids: Some(profile.service_ids.clone()),
            projects_dir_override: profile.projects_dir.clone(),
            env_overrides: profile.env.clone(),
        }
    }
}

/// Bidirectional profile membership index
#[derive(Debug, Default, Clone)]
pub struct ProfileIndex {
    profiles: BTreeMap<String, Profile>,
    by_service: HashMap<ServiceId, BTreeSet<String>>,
}

impl ProfileIndex {
    /// Empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a profile
    pub fn insert(&mut self, profile: Profile) {
        self.remove(&profile.name);
        for id in &profile.service_ids {
            self.by_service
                .entry(*id)
                .or_default()
                .insert(profile.name.clone());
        }
        self.profiles.insert(profile.name.clone(), profile);
    }

    /// Remove a profile
    pub fn remove(&mut self, name: &str) -> Option<Profile> {
        let profile = self.profiles.remove(name)?;
        for id in &profile.service_ids {
            if let Some(names) = self.by_service.get_mut(id) {
                names.remove(name);
                if names.is_empty() {
                    self.by_service.remove(id);
                }
            }
        }
        Some(profile)
    }

    /// Drop a service from every profile
    pub fn remove_service(&mut self, id: &ServiceId) {
        if let Some(names) = self.by_service.remove(id) {
            for name in names {
                if let Some(profile) = self.profiles.get_mut(&name) {
                    profile.service_ids.remove(id);
                }
            }
        }
    }

    /// Look up a profile
    pub fn get(&self, name: &str) -> Option<&Profile> {
        self.profiles.get(name)
    }

    /// Services in a profile
    pub fn services_of(&self, name: &str) -> Option<&BTreeSet<ServiceId>> {
        self.profiles.get(name).map(|p| &p.service_ids)
    }

    /// Profiles a service belongs to
    pub fn profiles_of(&self, id: &ServiceId) -> Vec<&str> {
        self.by_service
            .get(id)
            .map(|names| names.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Context for a named profile
    pub fn context(&self, name: &str) -> Option<ProfileContext> {
        self.profiles.get(name).map(ProfileContext::from)
    }

    /// Profile names in order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }

    /// Number of profiles
    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    /// Whether there are no profiles
    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn profile(name: &str, ids: &[u128]) -> Profile {
        Profile {
            name: name.into(),
            service_ids: ids.iter().map(|n| Uuid::from_u128(*n)).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_both_directions_stay_in_sync() {
        let mut index = ProfileIndex::new();
        index.insert(profile("backend", &[1, 2]));
        index.insert(profile("full", &[1, 2, 3]));

        assert_eq!(index.profiles_of(&Uuid::from_u128(1)), vec!["backend", "full"]);
        assert_eq!(index.profiles_of(&Uuid::from_u128(3)), vec!["full"]);

        // Replacing a profile rewrites the reverse map
        index.insert(profile("backend", &[2]));
        assert_eq!(index.profiles_of(&Uuid::from_u128(1)), vec!["full"]);

        index.remove_service(&Uuid::from_u128(2));
        assert!(index.services_of("backend").is_some_and(|s| s.is_empty()));
        assert!(index.profiles_of(&Uuid::from_u128(2)).is_empty());

        index.remove("full");
        assert!(index.profiles_of(&Uuid::from_u128(1)).is_empty());
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_context_scope() {
        let mut index = ProfileIndex::new();
        let mut p = profile("web", &[7]);
        p.projects_dir = Some(PathBuf::from("/work"));
        index.insert(p);

        let ctx = index.context("web").unwrap();
        assert!(ctx.includes(&Uuid::from_u128(7)));
        assert!(!ctx.includes(&Uuid::from_u128(8)));
        assert_eq!(ctx.projects_dir_override, Some(PathBuf::from("/work")));
        assert!(ProfileContext::all().includes(&Uuid::from_u128(8)));
        assert!(index.context("missing").is_none());
    }
}

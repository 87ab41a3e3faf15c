//! Static registry of configured egress profiles.

use std::collections::HashSet;

use super::models::Profile;
use crate::config::{ConfigError, ServerConfig};

/// Profiles in configuration order. Composition is fixed after construction.
#[derive(Debug, Clone)]
pub struct ProfileRegistry {
    profiles: Vec<Profile>,
}

impl ProfileRegistry {
    /// Build a registry, validating unique names and well-formed descriptors.
    pub fn new(profiles: Vec<Profile>) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        for profile in &profiles {
            if profile.name.trim().is_empty() {
                return Err(ConfigError::EmptyName);
            }
            if !seen.insert(profile.name.as_str()) {
                return Err(ConfigError::DuplicateName(profile.name.clone()));
            }
            profile.route()?;
        }

        Ok(Self { profiles })
    }

    pub fn from_config(config: &ServerConfig) -> Result<Self, ConfigError> {
        Self::new(config.profiles.clone())
    }

    /// Enabled profiles in configuration order.
    pub fn list_enabled(&self) -> Vec<&Profile> {
        self.profiles.iter().filter(|p| p.enabled).collect()
    }

    /// All profiles, enabled or not, in configuration order.
    pub fn all(&self) -> &[Profile] {
        &self.profiles
    }

    pub fn get(&self, name: &str) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.name == name)
    }
}

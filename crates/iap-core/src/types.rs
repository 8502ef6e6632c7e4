//! Core domain types

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProfileError;

/// Identifies a VM instance by project, zone and name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceLocator {
    /// Project ID
    pub project: String,
    /// Zone the instance runs in
    pub zone: String,
    /// Instance name
    pub name: String,
}

impl InstanceLocator {
    /// Create a new instance locator
    pub fn new(
        project: impl Into<String>,
        zone: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            zone: zone.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for InstanceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "projects/{}/zones/{}/instances/{}",
            self.project, self.zone, self.name
        )
    }
}

impl FromStr for InstanceLocator {
    type Err = ProfileError;

    /// Parse `projects/{project}/zones/{zone}/instances/{name}`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim_matches('/').split('/').collect();
        match parts.as_slice() {
            ["projects", project, "zones", zone, "instances", name]
                if !project.is_empty() && !zone.is_empty() && !name.is_empty() =>
            {
                Ok(Self::new(*project, *zone, *name))
            }
            _ => Err(ProfileError::InvalidLocator(s.to_string())),
        }
    }
}

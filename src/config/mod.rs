//! Settings and state file locations

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Identifiers the login engine and the smoke test run with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Application (client) id registered in Azure AD
    pub client_id: String,
    /// Tenant used for the library backends ("common" for multi-tenant)
    pub tenant_id: String,
    /// Authority handed to the platform account manager
    pub authority: String,
    /// Mixed Reality account id, used by the token smoke test
    pub account_id: String,
    /// Azure region of the rendering service
    pub region: String,
    /// Scope requested from every backend
    pub scope: String,
    /// Resource for the platform brokers
    pub resource: String,
    /// Azure AD login instance
    pub instance: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            tenant_id: "common".to_string(),
            authority: "organizations".to_string(),
            account_id: String::new(),
            region: "westus2".to_string(),
            scope: "https://sts.mixedreality.azure.com/.default".to_string(),
            resource: "https://sts.mixedreality.azure.com".to_string(),
            instance: "https://login.microsoftonline.com".to_string(),
        }
    }
}

impl Settings {
    fn project_dirs() -> Result<ProjectDirs> {
        ProjectDirs::from("com", "aad-login-cli", "aad-login-cli")
            .context("Could not determine config directory")
    }

    /// Get config file path
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::project_dirs()?.config_dir().join("config.toml"))
    }

    /// Directory for the identity mapping and the legacy token cache.
    pub fn data_dir() -> Result<PathBuf> {
        Ok(Self::project_dirs()?.data_dir().to_path_buf())
    }

    /// Load settings from the default location.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// A missing file is not an error: defaults apply and a warning is logged.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::warn!(
                "No settings file at {}, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).context("Failed to read settings file")?;
        toml::from_str(&content).context("Failed to parse settings file")
    }

    /// Configuration problems worth telling the user about. None of them
    /// stop the program.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.client_id.trim().is_empty() {
            warnings.push("client_id is not set; library backends cannot acquire tokens".to_string());
        }
        if self.account_id.trim().is_empty() {
            warnings.push("account_id is not set; the token smoke test will be skipped".to_string());
        }
        if self.region.trim().is_empty() {
            warnings.push("region is not set; the token smoke test will be skipped".to_string());
        }
        warnings
    }
}

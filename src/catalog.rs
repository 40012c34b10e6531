// src/catalog.rs

//! Package catalog collaborator
//!
//! The request flows ask the catalog the questions a checkpoint needs
//! answered before anything is sent to the daemon: is the application
//! removable, which licenses does an install or upgrade pull in, would
//! installing it force other applications out.

use crate::bus::{AppRef, PackageId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// License id to the applications requiring it
pub type LicenseMap = BTreeMap<String, BTreeSet<AppRef>>;

/// Whether an application may be removed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Removability {
    Removable,
    /// Removable after the user confirms `reason`
    NeedsConfirmation(String),
    /// Part of the base system
    NotRemovable,
}

/// Whether an application may be installed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Installability {
    Installable,
    /// Installable once every license in the map is accepted
    NeedsLicenses(LicenseMap),
    /// Missing, masked or conflicting dependencies
    Unsatisfiable,
}

/// Interface to the package matching and version library
pub trait PackageCatalog: Send + Sync {
    /// Display name of an application
    fn name(&self, app: &AppRef) -> String;

    fn removability(&self, app: &AppRef) -> Removability;

    fn installability(&self, app: &AppRef) -> Installability;

    /// Installed applications that installing `app` would remove
    fn install_conflicts(&self, app: &AppRef) -> Vec<AppRef>;

    /// Licenses pulled in by the pending system upgrade
    fn upgrade_licenses(&self) -> LicenseMap;

    /// Id of the installed-packages repository
    fn installed_repository(&self) -> String;
}

/// Per-application catalog record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogEntry {
    pub name: String,
    /// Base-system package
    pub system: bool,
    /// Confirmation text shown before removal
    pub removal_warning: Option<String>,
    pub licenses: Vec<String>,
    pub unsatisfiable: bool,
    pub conflicts: Vec<AppRef>,
}

/// Table-driven catalog
///
/// Used by the command-line front end (loaded from JSON) and by tests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticCatalog {
    installed_repository: String,
    entries: HashMap<String, HashMap<PackageId, CatalogEntry>>,
    upgrade_licenses: LicenseMap,
}

impl StaticCatalog {
    pub const INSTALLED_REPOSITORY: &'static str = "__system__";

    pub fn new() -> Self {
        Self {
            installed_repository: Self::INSTALLED_REPOSITORY.to_string(),
            ..Default::default()
        }
    }

    pub fn with_entry(mut self, app: AppRef, entry: CatalogEntry) -> Self {
        self.insert(app, entry);
        self
    }

    pub fn with_upgrade_license(mut self, license: &str, app: AppRef) -> Self {
        self.upgrade_licenses
            .entry(license.to_string())
            .or_default()
            .insert(app);
        self
    }

    pub fn insert(&mut self, app: AppRef, entry: CatalogEntry) {
        self.entries
            .entry(app.repository_id)
            .or_default()
            .insert(app.package_id, entry);
    }

    /// Load a catalog table from a JSON file
    pub fn load(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut catalog: Self = serde_json::from_str(&content)?;
        if catalog.installed_repository.is_empty() {
            catalog.installed_repository = Self::INSTALLED_REPOSITORY.to_string();
        }
        Ok(catalog)
    }

    fn entry(&self, app: &AppRef) -> Option<&CatalogEntry> {
        self.entries
            .get(&app.repository_id)
            .and_then(|repo| repo.get(&app.package_id))
    }
}

impl PackageCatalog for StaticCatalog {
    fn name(&self, app: &AppRef) -> String {
        self.entry(app)
            .map(|e| e.name.clone())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| app.to_string())
    }

    fn removability(&self, app: &AppRef) -> Removability {
        match self.entry(app) {
            Some(entry) if entry.system => Removability::NotRemovable,
            Some(CatalogEntry {
                removal_warning: Some(reason),
                ..
            }) => Removability::NeedsConfirmation(reason.clone()),
            _ => Removability::Removable,
        }
    }

    fn installability(&self, app: &AppRef) -> Installability {
        let Some(entry) = self.entry(app) else {
            return Installability::Installable;
        };
        if entry.unsatisfiable {
            return Installability::Unsatisfiable;
        }
        if entry.licenses.is_empty() {
            return Installability::Installable;
        }
        let map = entry
            .licenses
            .iter()
            .map(|license| (license.clone(), BTreeSet::from([app.clone()])))
            .collect();
        Installability::NeedsLicenses(map)
    }

    fn install_conflicts(&self, app: &AppRef) -> Vec<AppRef> {
        self.entry(app)
            .map(|e| e.conflicts.clone())
            .unwrap_or_default()
    }

    fn upgrade_licenses(&self) -> LicenseMap {
        self.upgrade_licenses.clone()
    }

    fn installed_repository(&self) -> String {
        self.installed_repository.clone()
    }
}

//! Registry state owned by the lifecycle manager.
//!
//! Mappings, module records, activated plugins, in-flight operations and
//! package records live in one structure so that every check-and-update is a
//! single critical section.

use crate::error::{Error, Result};
use crate::isolation::ModuleHandle;
use crate::packages::{PackageMetadata, PackageRecord};
use crate::plugins::{context_prefix, ActivatedPlugin};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;

/// One-to-one link between a package and its isolation context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextMapping {
    pub package_id: String,
    pub context_id: String,
}

/// Record of a loaded package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadedModule {
    pub package_id: String,
    /// Archive the package was loaded from
    pub archive_path: PathBuf,
    /// Binary modules the package contributed
    pub modules: Vec<ModuleHandle>,
    pub loaded_at: DateTime<Utc>,
    /// Whether the boundary still knows the context
    pub active: bool,
    pub context_id: String,
    /// Framework folder the binaries were loaded from
    pub framework: String,
}

/// Reconciled view of a loaded package and its plugins
#[derive(Debug, Clone)]
pub struct LoadedModuleSnapshot {
    pub module: LoadedModule,
    pub plugins: Vec<ActivatedPlugin>,
}

#[derive(Debug, Default)]
pub(crate) struct Registry {
    mappings: HashMap<String, ContextMapping>,
    modules: HashMap<String, LoadedModule>,
    /// Keyed by `{context_id}::{plugin_id}`
    plugins: BTreeMap<String, ActivatedPlugin>,
    in_flight: HashSet<String>,
    packages: BTreeMap<String, PackageRecord>,
}

impl Registry {
    pub fn is_mapped(&self, package_id: &str) -> bool {
        self.mappings.contains_key(package_id)
    }

    pub fn mapping(&self, package_id: &str) -> Option<&ContextMapping> {
        self.mappings.get(package_id)
    }

    pub fn maps_context(&self, context_id: &str) -> bool {
        self.mappings.values().any(|m| m.context_id == context_id)
    }

    /// Whether `context_id` is mapped to a package with no operation in flight
    pub fn maps_settled_context(&self, context_id: &str) -> bool {
        self.mappings
            .values()
            .any(|m| m.context_id == context_id && !self.in_flight.contains(&m.package_id))
    }

    pub fn mapped_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.mappings.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Reserve `package_id` for a load
    pub fn reserve_load(&mut self, package_id: &str) -> Result<()> {
        if self.mappings.contains_key(package_id) || self.in_flight.contains(package_id) {
            return Err(Error::AlreadyLoaded(package_id.to_string()));
        }
        self.in_flight.insert(package_id.to_string());
        Ok(())
    }

    /// Reserve `package_id` for an unload, returning its mapping and plugins
    pub fn reserve_unload(
        &mut self,
        package_id: &str,
    ) -> Result<(ContextMapping, Vec<ActivatedPlugin>)> {
        let mapping = self
            .mappings
            .get(package_id)
            .cloned()
            .ok_or_else(|| Error::NotLoaded(package_id.to_string()))?;
        if self.in_flight.contains(package_id) {
            return Err(Error::OperationInProgress(package_id.to_string()));
        }
        self.in_flight.insert(package_id.to_string());
        let plugins = self.plugins_of(&mapping.context_id);
        Ok((mapping, plugins))
    }

    pub fn release(&mut self, package_id: &str) {
        self.in_flight.remove(package_id);
    }

    /// Commit a finished load
    pub fn commit_load(&mut self, module: LoadedModule, plugins: Vec<ActivatedPlugin>) {
        let package_id = module.package_id.clone();
        for plugin in plugins {
            self.plugins.insert(plugin.registry_key(), plugin);
        }
        self.mappings.insert(
            package_id.clone(),
            ContextMapping {
                package_id: package_id.clone(),
                context_id: module.context_id.clone(),
            },
        );
        self.modules.insert(package_id.clone(), module);
        self.set_installed(&package_id, true);
        self.in_flight.remove(&package_id);
    }

    /// Commit a finished unload
    pub fn commit_unload(&mut self, package_id: &str) {
        if let Some(mapping) = self.mappings.remove(package_id) {
            let prefix = context_prefix(&mapping.context_id);
            self.plugins.retain(|key, _| !key.starts_with(&prefix));
        }
        self.modules.remove(package_id);
        self.set_installed(package_id, false);
        self.in_flight.remove(package_id);
    }

    pub fn module(&self, package_id: &str) -> Option<&LoadedModule> {
        self.modules.get(package_id)
    }

    pub fn modules(&self) -> impl Iterator<Item = &LoadedModule> {
        self.modules.values()
    }

    /// Plugins owned by `context_id`, in key order
    pub fn plugins_of(&self, context_id: &str) -> Vec<ActivatedPlugin> {
        let prefix = context_prefix(context_id);
        self.plugins
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(_, plugin)| plugin.clone())
            .collect()
    }

    pub fn remove_plugin(&mut self, key: &str) -> Option<ActivatedPlugin> {
        self.plugins.remove(key)
    }

    pub fn plugins(&self) -> impl Iterator<Item = &ActivatedPlugin> {
        self.plugins.values()
    }

    /// Insert or refresh a package record from source metadata
    pub fn upsert_package(&mut self, metadata: &PackageMetadata) -> PackageRecord {
        let installed = self.mappings.contains_key(&metadata.id);
        let record = PackageRecord::from_metadata(metadata, installed);
        self.packages.insert(metadata.id.clone(), record.clone());
        record
    }

    /// Make sure a record exists for a package installed by id and version
    pub fn ensure_package(&mut self, package_id: &str, version: &str) {
        self.packages
            .entry(package_id.to_string())
            .or_insert_with(|| PackageRecord {
                name: package_id.to_string(),
                version: version.to_string(),
                author: String::new(),
                description: String::new(),
                installed: false,
                stale: false,
            });
    }

    pub fn mark_stale(&mut self, package_id: &str) {
        if let Some(record) = self.packages.get_mut(package_id) {
            record.stale = true;
        }
    }

    pub fn packages(&self) -> Vec<PackageRecord> {
        self.packages.values().cloned().collect()
    }

    fn set_installed(&mut self, package_id: &str, installed: bool) {
        if let Some(record) = self.packages.get_mut(package_id) {
            record.installed = installed;
        }
    }
}

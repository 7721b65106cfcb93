//! Plugin instance lifecycle
//!
//! Maps session-level plugin instance ids to loaded host instances. A
//! binding survives as long as its instance stays in the session and the
//! resolved descriptor keeps the same id and version.
//!
//! Per instance:
//!
//! ```text
//! Unbound --ensure_binding--> Bound --crash (unrecovered)--> Crashed
//!    ^                          |  ^                            |
//!    +------release_stale-------+  +----------rebind------------+
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, Result};
use patchconf::PluginsConfig;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::engine::{
    DescriptorResolver, InstanceRuntime, LoadOptions, PluginDescriptor, PluginHandle, PluginHost,
};
use crate::error::SyncError;
use crate::session::PluginNode;

/// A session-level instance bound to a loaded host instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginInstanceBinding {
    pub descriptor: PluginDescriptor,
    /// Changes every time the host restarts the instance
    pub host_instance_id: String,
    pub handle: PluginHandle,
}

pub struct PluginLifecycleManager {
    host: Arc<dyn PluginHost>,
    resolver: Arc<dyn DescriptorResolver>,
    config: PluginsConfig,
    bindings: Mutex<BTreeMap<String, PluginInstanceBinding>>,
}

impl PluginLifecycleManager {
    pub fn new(
        host: Arc<dyn PluginHost>,
        resolver: Arc<dyn DescriptorResolver>,
        config: PluginsConfig,
    ) -> Self {
        Self {
            host,
            resolver,
            config,
            bindings: Mutex::new(BTreeMap::new()),
        }
    }

    fn bindings(&self) -> MutexGuard<'_, BTreeMap<String, PluginInstanceBinding>> {
        self.bindings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make sure `node`'s instance is loaded with the descriptor it resolves
    /// to.
    ///
    /// `Ok(None)` means no descriptor resolves and the node should run
    /// offline. An existing binding for the same build is reused; a binding
    /// for a different build is released and replaced.
    pub async fn ensure_binding(
        &self,
        node: &PluginNode,
    ) -> Result<Option<PluginInstanceBinding>, SyncError> {
        let instance_id = node.instance_id.as_str();
        let existing = self.bindings().get(instance_id).cloned();

        let Some(descriptor) = self.resolver.resolve(instance_id, node) else {
            debug!(instance.id = %instance_id, plugin.id = %node.plugin_id, "No descriptor resolves; node will run offline");
            if let Some(old) = existing {
                self.bindings().remove(instance_id);
                self.release_quietly(instance_id, &old).await;
            }
            return Ok(None);
        };

        if let Some(binding) = existing {
            if binding.descriptor.same_build(&descriptor) {
                return Ok(Some(binding));
            }
            info!(
                instance.id = %instance_id,
                from = %binding.descriptor.version,
                to = %descriptor.version,
                "Plugin build changed; replacing binding"
            );
            self.bindings().remove(instance_id);
            self.release_quietly(instance_id, &binding).await;
        }

        let options = LoadOptions {
            instance_id: instance_id.to_string(),
            sandbox_identifier: self.config.sandbox_identifier(instance_id),
            automation_bindings: node.automated_parameters.clone(),
        };
        let loaded = self
            .host
            .load_plugin(&descriptor, &options)
            .await
            .map_err(|e| SyncError::plugin(instance_id, e))?;

        let binding = PluginInstanceBinding {
            descriptor,
            host_instance_id: loaded.host_instance_id,
            handle: loaded.handle,
        };
        info!(
            instance.id = %instance_id,
            host.instance = %binding.host_instance_id,
            plugin.id = %binding.descriptor.id,
            "Plugin loaded"
        );
        self.bindings()
            .insert(instance_id.to_string(), binding.clone());
        Ok(Some(binding))
    }

    /// Release and forget every binding whose instance is not in `active`.
    /// Returns the released instance ids.
    pub async fn release_stale(&self, active: &BTreeSet<String>) -> Vec<String> {
        let stale: Vec<(String, PluginInstanceBinding)> = {
            let mut bindings = self.bindings();
            let ids: Vec<String> = bindings
                .keys()
                .filter(|id| !active.contains(*id))
                .cloned()
                .collect();
            ids.into_iter()
                .filter_map(|id| bindings.remove(&id).map(|binding| (id, binding)))
                .collect()
        };

        let mut released = Vec::with_capacity(stale.len());
        for (instance_id, binding) in stale {
            self.release_quietly(&instance_id, &binding).await;
            self.resolver.clear_instance(&instance_id);
            released.push(instance_id);
        }
        released
    }

    /// Teardown: release every binding and drop all resolver caches.
    pub async fn release_all(&self) -> usize {
        let all = std::mem::take(&mut *self.bindings());
        let count = all.len();
        for (instance_id, binding) in all {
            self.release_quietly(&instance_id, &binding).await;
        }
        self.resolver.clear_all();
        count
    }

    /// Forget a binding without asking the host to release it. The host
    /// instance is already gone after an unrecovered crash.
    pub fn evict(&self, instance_id: &str) -> Option<PluginInstanceBinding> {
        let evicted = self.bindings().remove(instance_id);
        if evicted.is_some() {
            debug!(instance.id = %instance_id, "Evicted plugin binding");
        }
        evicted
    }

    /// Point an instance's binding at the host's restarted runtime.
    ///
    /// Keeps the current descriptor when a binding exists, otherwise
    /// resolves it again from `node`.
    pub fn rebind(
        &self,
        node: &PluginNode,
        runtime: InstanceRuntime,
    ) -> Result<PluginInstanceBinding, SyncError> {
        let instance_id = node.instance_id.as_str();
        let mut bindings = self.bindings();
        let descriptor = match bindings.get(instance_id) {
            Some(binding) => binding.descriptor.clone(),
            None => self.resolver.resolve(instance_id, node).ok_or_else(|| {
                SyncError::plugin(instance_id, anyhow!("no descriptor resolves for rebind"))
            })?,
        };
        let binding = PluginInstanceBinding {
            descriptor,
            host_instance_id: runtime.native_instance_id,
            handle: runtime.handle,
        };
        info!(
            instance.id = %instance_id,
            host.instance = %binding.host_instance_id,
            "Plugin rebound"
        );
        bindings.insert(instance_id.to_string(), binding.clone());
        Ok(binding)
    }

    pub fn binding(&self, instance_id: &str) -> Option<PluginInstanceBinding> {
        self.bindings().get(instance_id).cloned()
    }

    pub fn bound_instances(&self) -> Vec<String> {
        self.bindings().keys().cloned().collect()
    }

    async fn release_quietly(&self, instance_id: &str, binding: &PluginInstanceBinding) {
        match self.host.release_plugin(&binding.host_instance_id).await {
            Ok(()) => debug!(
                instance.id = %instance_id,
                host.instance = %binding.host_instance_id,
                "Plugin released"
            ),
            Err(e) => warn!(
                instance.id = %instance_id,
                host.instance = %binding.host_instance_id,
                error = %format!("{e:#}"),
                "Plugin release failed"
            ),
        }
    }
}

/// Resolves descriptors from the host's plugin catalog.
///
/// A node pinned to a version only matches that version; an unpinned node
/// takes the last catalog entry for its plugin id. The choice is cached per
/// instance so a catalog refresh does not silently swap a running build.
pub struct CatalogResolver {
    catalog: Vec<PluginDescriptor>,
    chosen: Mutex<HashMap<String, PluginDescriptor>>,
}

impl CatalogResolver {
    pub fn new(catalog: Vec<PluginDescriptor>) -> Self {
        Self {
            catalog,
            chosen: Mutex::new(HashMap::new()),
        }
    }

    pub async fn from_host(host: &dyn PluginHost) -> Result<Self> {
        let catalog = host.list_available_plugins().await?;
        debug!(count = catalog.len(), "Loaded plugin catalog");
        Ok(Self::new(catalog))
    }

    fn chosen(&self) -> MutexGuard<'_, HashMap<String, PluginDescriptor>> {
        self.chosen.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DescriptorResolver for CatalogResolver {
    fn resolve(&self, instance_id: &str, node: &PluginNode) -> Option<PluginDescriptor> {
        let mut chosen = self.chosen();
        if let Some(descriptor) = chosen.get(instance_id) {
            let pinned_elsewhere = node
                .version
                .as_ref()
                .is_some_and(|version| *version != descriptor.version);
            if descriptor.id == node.plugin_id && !pinned_elsewhere {
                return Some(descriptor.clone());
            }
        }

        let descriptor = self
            .catalog
            .iter()
            .filter(|d| d.id == node.plugin_id)
            .filter(|d| node.version.as_ref().map_or(true, |v| *v == d.version))
            .last()
            .cloned()?;
        chosen.insert(instance_id.to_string(), descriptor.clone());
        Some(descriptor)
    }

    fn clear_instance(&self, instance_id: &str) {
        self.chosen().remove(instance_id);
    }

    fn clear_all(&self) {
        self.chosen().clear();
    }
}

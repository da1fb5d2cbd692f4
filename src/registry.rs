//! Provider registry and lifecycle manager.
//!
//! # Purpose
//!
//! Owns the provider catalog for one orchestration session, builds adapters for providers
//! whose credentials are present, and tracks the single active provider/model pair.
//!
//! # Lifecycle
//!
//! ```text
//! catalog entry ──initialize()──► credential found? ──yes──► adapter (default model)
//!                                         │
//!                                         └──no──► skipped (CredentialMissing)
//!
//! register_provider(descriptor) ──► custom-<slug>-<8 hex>
//! deregister_provider(id)       ──► only runtime ids; clears the active pair if it pointed there
//! revoke_credential(id)         ──► adapters dropped, descriptor kept
//! ```
//!
//! # Concurrency
//!
//! Mutations are serialized through one writer mutex. Readers take short `RwLock` read
//! guards and clone out `Arc`s, so concurrent `generate` calls through different adapters
//! never contend on the registry. No lock is held across an `.await`.
//!
//! # Example
//!
//! ```ignore
//! let registry = ProviderRegistry::from_config(&config, Arc::new(EnvCredentialSource), AdapterFactory::new());
//! let report = registry.initialize();
//! registry.set_provider("anthropic", "claude-3-5-haiku-20241022")?;
//! let adapter = registry.active_adapter()?;
//! ```

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::credentials::{self, redact, CredentialSource};
use crate::error::{GenError, Result};
use crate::factory::AdapterFactory;
use crate::model_config::{CodeforgeConfig, ModelDescriptor, ProviderDescriptor};
use crate::traits::{GenerateOptions, ProviderAdapter};

/// The active provider/model pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSelection {
    pub provider_id: String,
    pub model_id: String,
}

impl ActiveSelection {
    pub fn new(provider_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            model_id: model_id.into(),
        }
    }
}

/// Catalog entry as reported by [`ProviderRegistry::list_providers`].
#[derive(Debug, Clone, Serialize)]
pub struct ProviderInfo {
    pub descriptor: ProviderDescriptor,
    /// An adapter can be built (credential present or not required).
    pub available: bool,
    /// Added through `register_provider`.
    pub runtime: bool,
}

/// A provider left unregistered by the startup scan.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedProvider {
    pub provider_id: String,
    pub reason: String,
}

/// Outcome of [`ProviderRegistry::initialize`].
#[derive(Debug, Clone, Default)]
pub struct InitReport {
    pub registered: Vec<String>,
    pub skipped: Vec<SkippedProvider>,
    pub active: Option<ActiveSelection>,
}

struct ProviderEntry {
    descriptor: ProviderDescriptor,
    runtime: bool,
    credential: Option<String>,
    available: bool,
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderEntry {
    fn new(descriptor: ProviderDescriptor, runtime: bool) -> Self {
        Self {
            descriptor,
            runtime,
            credential: None,
            available: false,
            adapters: HashMap::new(),
        }
    }
}

/// Session-owned registry of providers and adapters.
pub struct ProviderRegistry {
    entries: RwLock<Vec<ProviderEntry>>,
    active: RwLock<Option<ActiveSelection>>,
    writer: Mutex<()>,
    preferred: Option<ActiveSelection>,
    credentials: Arc<dyn CredentialSource>,
    factory: AdapterFactory,
}

impl ProviderRegistry {
    /// Registry over `catalog`. Call [`initialize`](Self::initialize) to scan credentials.
    pub fn new(
        catalog: Vec<ProviderDescriptor>,
        credentials: Arc<dyn CredentialSource>,
        factory: AdapterFactory,
    ) -> Self {
        Self {
            entries: RwLock::new(
                catalog
                    .into_iter()
                    .map(|d| ProviderEntry::new(d, false))
                    .collect(),
            ),
            active: RwLock::new(None),
            writer: Mutex::new(()),
            preferred: None,
            credentials,
            factory,
        }
    }

    /// Registry over the configured catalog, preferring the `[defaults]` pair.
    pub fn from_config(
        config: &CodeforgeConfig,
        credentials: Arc<dyn CredentialSource>,
        factory: AdapterFactory,
    ) -> Self {
        let mut registry = Self::new(config.providers.clone(), credentials, factory);
        registry.preferred = Some(ActiveSelection::new(
            &config.defaults.provider,
            &config.defaults.model,
        ));
        registry
    }

    /// Startup scan: register every provider with a usable credential.
    ///
    /// Picks the active pair: the configured default if available, else the default
    /// model of the first available provider.
    pub fn initialize(&self) -> InitReport {
        let _writer = self.writer.lock();
        let mut report = InitReport::default();

        {
            let mut entries = self.entries.write();
            for entry in entries.iter_mut() {
                match self.activate_entry(entry) {
                    Ok(()) => report.registered.push(entry.descriptor.id.clone()),
                    Err(e) => {
                        debug!(provider = %entry.descriptor.id, reason = %e, "Provider skipped");
                        report.skipped.push(SkippedProvider {
                            provider_id: entry.descriptor.id.clone(),
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }

        let active = self.pick_default();
        *self.active.write() = active.clone();
        report.active = active;

        info!(
            registered = report.registered.len(),
            skipped = report.skipped.len(),
            "Provider scan complete"
        );
        report
    }

    /// Resolve the credential and build the default-model adapter.
    fn activate_entry(&self, entry: &mut ProviderEntry) -> Result<()> {
        entry.adapters.clear();
        entry.available = false;
        entry.credential = None;

        let credential = credentials::resolve(self.credentials.as_ref(), &entry.descriptor);
        if entry.descriptor.requires_auth() && credential.is_none() {
            return Err(GenError::CredentialMissing(entry.descriptor.id.clone()));
        }
        if let Some(key) = &credential {
            debug!(provider = %entry.descriptor.id, key = %redact(key), "Credential found");
        }

        let model_id = entry
            .descriptor
            .default_model_id()
            .map(str::to_string)
            .ok_or_else(|| {
                GenError::Registration(format!("provider '{}' has no models", entry.descriptor.id))
            })?;
        let adapter = self.factory.create(
            &entry.descriptor,
            &model_id,
            credential.as_deref(),
            self.factory.timeout_for(&entry.descriptor),
        )?;

        entry.adapters.insert(model_id, adapter);
        entry.credential = credential;
        entry.available = true;
        Ok(())
    }

    fn pick_default(&self) -> Option<ActiveSelection> {
        let entries = self.entries.read();
        if let Some(preferred) = &self.preferred {
            let usable = entries.iter().any(|e| {
                e.available
                    && e.descriptor.id == preferred.provider_id
                    && e.descriptor.model(&preferred.model_id).is_some()
            });
            if usable {
                return Some(preferred.clone());
            }
        }
        entries.iter().filter(|e| e.available).find_map(|e| {
            e.descriptor
                .default_model_id()
                .map(|model| ActiveSelection::new(&e.descriptor.id, model))
        })
    }

    /// Re-read the credential for one provider (a key appeared or changed).
    ///
    /// Returns whether the provider is available afterwards.
    pub fn refresh_provider(&self, provider_id: &str) -> Result<bool> {
        let _writer = self.writer.lock();
        let mut entries = self.entries.write();
        let entry = entries
            .iter_mut()
            .find(|e| e.descriptor.id == provider_id)
            .ok_or_else(|| GenError::ProviderNotFound(provider_id.to_string()))?;
        match self.activate_entry(entry) {
            Ok(()) => Ok(true),
            Err(GenError::CredentialMissing(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Register a runtime provider. The descriptor's id is replaced by a generated one.
    pub fn register_provider(&self, descriptor: ProviderDescriptor) -> Result<String> {
        let credential = credentials::resolve(self.credentials.as_ref(), &descriptor);
        self.register_provider_with_credential(descriptor, credential)
    }

    /// Register a runtime provider with an explicit credential.
    pub fn register_provider_with_credential(
        &self,
        mut descriptor: ProviderDescriptor,
        credential: Option<String>,
    ) -> Result<String> {
        if descriptor.models.is_empty() {
            return Err(GenError::Registration(format!(
                "provider '{}' declares no models",
                descriptor.name
            )));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = descriptor.models.iter().find(|m| !seen.insert(m.id.as_str())) {
            return Err(GenError::Registration(format!(
                "duplicate model id '{}'",
                dup.id
            )));
        }

        let _writer = self.writer.lock();
        let mut entries = self.entries.write();

        let slug = slugify(if descriptor.name.trim().is_empty() {
            &descriptor.id
        } else {
            &descriptor.name
        });
        let id = loop {
            let simple = uuid::Uuid::new_v4().simple().to_string();
            let candidate = format!("custom-{}-{}", slug, &simple[..8]);
            if !entries.iter().any(|e| e.descriptor.id == candidate) {
                break candidate;
            }
        };
        descriptor.id = id.clone();

        let mut entry = ProviderEntry::new(descriptor, true);
        let credential = credential.filter(|c| !credentials::is_placeholder(c));
        entry.available = credential.is_some() || !entry.descriptor.requires_auth();
        entry.credential = credential;
        entries.push(entry);

        info!(provider = %id, "Registered runtime provider");
        Ok(id)
    }

    /// Remove a runtime provider. Built-in catalog entries and unknown ids are rejected.
    pub fn deregister_provider(&self, provider_id: &str) -> bool {
        let _writer = self.writer.lock();
        let mut entries = self.entries.write();

        let Some(index) = entries.iter().position(|e| e.descriptor.id == provider_id) else {
            warn!(provider = provider_id, "Deregister of unknown provider");
            return false;
        };
        if !entries[index].runtime {
            warn!(provider = provider_id, "Refusing to deregister a catalog provider");
            return false;
        }
        entries.remove(index);
        drop(entries);

        self.clear_active_if(provider_id);
        info!(provider = provider_id, "Deregistered provider");
        true
    }

    /// Drop the credential and adapters of a provider, keeping its descriptor.
    pub fn revoke_credential(&self, provider_id: &str) -> Result<()> {
        let _writer = self.writer.lock();
        {
            let mut entries = self.entries.write();
            let entry = entries
                .iter_mut()
                .find(|e| e.descriptor.id == provider_id)
                .ok_or_else(|| GenError::ProviderNotFound(provider_id.to_string()))?;
            entry.adapters.clear();
            entry.credential = None;
            entry.available = false;
        }
        self.clear_active_if(provider_id);
        info!(provider = provider_id, "Credential revoked");
        Ok(())
    }

    fn clear_active_if(&self, provider_id: &str) {
        let mut active = self.active.write();
        if active
            .as_ref()
            .is_some_and(|a| a.provider_id == provider_id)
        {
            *active = None;
        }
    }

    /// Select the active pair. On error the previous pair is kept.
    pub fn set_provider(&self, provider_id: &str, model_id: &str) -> Result<()> {
        let _writer = self.writer.lock();
        {
            let entries = self.entries.read();
            let entry = entries
                .iter()
                .find(|e| e.descriptor.id == provider_id)
                .ok_or_else(|| GenError::ProviderNotFound(provider_id.to_string()))?;
            if entry.descriptor.model(model_id).is_none() {
                return Err(GenError::ModelNotFound {
                    provider: provider_id.to_string(),
                    model: model_id.to_string(),
                });
            }
            if !entry.available {
                return Err(GenError::CredentialMissing(provider_id.to_string()));
            }
        }
        *self.active.write() = Some(ActiveSelection::new(provider_id, model_id));
        info!(provider = provider_id, model = model_id, "Active provider set");
        Ok(())
    }

    /// The active pair, if any.
    pub fn active(&self) -> Option<ActiveSelection> {
        self.active.read().clone()
    }

    /// Adapter for the active pair.
    pub fn active_adapter(&self) -> Result<Arc<dyn ProviderAdapter>> {
        let active = self
            .active()
            .ok_or_else(|| GenError::ProviderNotFound("no active provider".to_string()))?;
        self.adapter(&active.provider_id, &active.model_id)
    }

    /// Adapter bound to `provider_id`/`model_id`, created on first use.
    pub fn adapter(&self, provider_id: &str, model_id: &str) -> Result<Arc<dyn ProviderAdapter>> {
        {
            let entries = self.entries.read();
            let entry = find(&entries, provider_id)?;
            if let Some(adapter) = entry.adapters.get(model_id) {
                return Ok(adapter.clone());
            }
        }

        let _writer = self.writer.lock();
        let mut entries = self.entries.write();
        let entry = entries
            .iter_mut()
            .find(|e| e.descriptor.id == provider_id)
            .ok_or_else(|| GenError::ProviderNotFound(provider_id.to_string()))?;
        if let Some(adapter) = entry.adapters.get(model_id) {
            return Ok(adapter.clone());
        }
        if !entry.available {
            return Err(GenError::CredentialMissing(provider_id.to_string()));
        }

        let adapter = self.factory.create(
            &entry.descriptor,
            model_id,
            entry.credential.as_deref(),
            self.factory.timeout_for(&entry.descriptor),
        )?;
        entry.adapters.insert(model_id.to_string(), adapter.clone());
        Ok(adapter)
    }

    /// All providers in catalog order.
    pub fn list_providers(&self) -> Vec<ProviderInfo> {
        self.entries
            .read()
            .iter()
            .map(|e| ProviderInfo {
                descriptor: e.descriptor.clone(),
                available: e.available,
                runtime: e.runtime,
            })
            .collect()
    }

    /// Models of one provider.
    pub fn list_models(&self, provider_id: &str) -> Result<Vec<ModelDescriptor>> {
        let entries = self.entries.read();
        Ok(find(&entries, provider_id)?.descriptor.models.clone())
    }

    /// Snapshot of every descriptor, in catalog order.
    pub fn catalog(&self) -> Vec<ProviderDescriptor> {
        self.entries
            .read()
            .iter()
            .map(|e| e.descriptor.clone())
            .collect()
    }

    /// Snapshot of descriptors whose adapters can be built.
    pub fn available_catalog(&self) -> Vec<ProviderDescriptor> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.available)
            .map(|e| e.descriptor.clone())
            .collect()
    }

    /// Look up a model descriptor.
    pub fn model(&self, provider_id: &str, model_id: &str) -> Option<ModelDescriptor> {
        let entries = self.entries.read();
        find(&entries, provider_id)
            .ok()
            .and_then(|e| e.descriptor.model(model_id).cloned())
    }

    /// Minimal round trip. Never returns an error.
    pub async fn test_connection(&self, provider_id: &str) -> bool {
        let model_id = {
            let active = self.active();
            match active {
                Some(a) if a.provider_id == provider_id => Some(a.model_id),
                _ => {
                    let entries = self.entries.read();
                    find(&entries, provider_id)
                        .ok()
                        .and_then(|e| e.descriptor.default_model_id().map(str::to_string))
                }
            }
        };
        let Some(model_id) = model_id else {
            return false;
        };
        let adapter = match self.adapter(provider_id, &model_id) {
            Ok(adapter) => adapter,
            Err(e) => {
                debug!(provider = provider_id, error = %e, "Connection test skipped");
                return false;
            }
        };

        let options = GenerateOptions::default().max_tokens(1);
        match adapter.generate("ping", &options).await {
            Ok(_) => true,
            Err(e) => {
                warn!(provider = provider_id, error = %e, "Connection test failed");
                false
            }
        }
    }

    /// Test every provider concurrently.
    pub async fn test_all_providers(&self) -> BTreeMap<String, bool> {
        let ids: Vec<String> = self
            .entries
            .read()
            .iter()
            .map(|e| e.descriptor.id.clone())
            .collect();
        let results = join_all(ids.iter().map(|id| self.test_connection(id))).await;
        ids.into_iter().zip(results).collect()
    }
}

fn find<'a>(entries: &'a [ProviderEntry], provider_id: &str) -> Result<&'a ProviderEntry> {
    entries
        .iter()
        .find(|e| e.descriptor.id == provider_id)
        .ok_or_else(|| GenError::ProviderNotFound(provider_id.to_string()))
}

fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.trim().to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "provider".to_string()
    } else {
        slug
    }
}

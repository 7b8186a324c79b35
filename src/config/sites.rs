//! Registry of execution sites.
//!
//! Sites are stored as a handful of parallel maps on one metadata record
//! (`runners`, `runners_id`, `urls`, `tokens`, `backend_types`,
//! `use_kerberos`, `eos_mount_point`). Endpoint and credentials are looked
//! up per machine for every backend that is opened, never stored in
//! process-wide state.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::error::ConfigError;
use crate::core::MachineId;
use crate::storage::{self, MetadataStore};

/// Remote bulk-storage mount used when a site does not configure one.
pub const DEFAULT_EOS_MOUNT_POINT: &str = "/eos/user/unknown";

/// Execution strategy used by a site.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Submit to a remote workflow engine.
    #[default]
    #[serde(alias = "reana")]
    Remote,
    /// Materialise the workflow on local disk.
    #[serde(alias = "dry")]
    Local,
}

impl BackendKind {
    /// Parse a stored backend type. Anything unrecognised is remote.
    pub fn parse(s: &str) -> Self {
        match s {
            "local" | "dry" => BackendKind::Local,
            _ => BackendKind::Remote,
        }
    }

    /// The stored string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Remote => "remote",
            BackendKind::Local => "local",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to talk to one execution site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Site {
    /// Human readable site name.
    pub name: String,
    /// Machine identity used in job and workflow records.
    pub machine: MachineId,
    /// Engine endpoint.
    pub url: String,
    /// Engine access token.
    pub token: String,
    /// Execution strategy.
    pub kind: BackendKind,
    /// Whether rules touching bulk storage need kerberos.
    pub use_kerberos: bool,
    /// Mount point of the remote bulk storage.
    pub eos_mount_point: String,
}

/// Site registry backed by a metadata record.
#[derive(Clone)]
pub struct SiteRegistry {
    store: Arc<dyn MetadataStore>,
    record: PathBuf,
}

impl SiteRegistry {
    /// Create a registry reading `record` through `store`.
    pub fn new(store: Arc<dyn MetadataStore>, record: impl Into<PathBuf>) -> Self {
        Self {
            store,
            record: record.into(),
        }
    }

    async fn map<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<BTreeMap<String, T>, ConfigError> {
        Ok(storage::read_or(self.store.as_ref(), &self.record, key, BTreeMap::new()).await?)
    }

    async fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), ConfigError> {
        Ok(storage::write(self.store.as_ref(), &self.record, key, value).await?)
    }

    /// Registered site names in registration order.
    pub async fn names(&self) -> Result<Vec<String>, ConfigError> {
        Ok(storage::read_or(self.store.as_ref(), &self.record, "runners", Vec::new()).await?)
    }

    /// Machine identity of a named site.
    pub async fn machine_id(&self, name: &str) -> Result<Option<MachineId>, ConfigError> {
        let ids: BTreeMap<String, String> = self.map("runners_id").await?;
        Ok(ids.get(name).map(|id| MachineId::new(id.as_str())))
    }

    /// Resolve the site serving `machine`.
    ///
    /// Machines missing from the registry resolve to an unnamed remote site
    /// with empty credentials, so that callers fail at the engine rather
    /// than here.
    pub async fn site(&self, machine: &MachineId) -> Result<Site, ConfigError> {
        let ids: BTreeMap<String, String> = self.map("runners_id").await?;
        let urls: BTreeMap<String, String> = self.map("urls").await?;
        let tokens: BTreeMap<String, String> = self.map("tokens").await?;
        let kinds: BTreeMap<String, String> = self.map("backend_types").await?;
        let kerberos: BTreeMap<String, bool> = self.map("use_kerberos").await?;
        let mounts: BTreeMap<String, String> = self.map("eos_mount_point").await?;

        let key = machine.as_str();
        let name = ids
            .iter()
            .find(|(_, id)| id.as_str() == key)
            .map(|(name, _)| name.clone())
            .unwrap_or_else(|| key.to_string());

        Ok(Site {
            name,
            machine: machine.clone(),
            url: urls.get(key).cloned().unwrap_or_default(),
            token: tokens.get(key).cloned().unwrap_or_default(),
            kind: kinds
                .get(key)
                .map(|k| BackendKind::parse(k))
                .unwrap_or_default(),
            use_kerberos: kerberos.get(key).copied().unwrap_or(false),
            eos_mount_point: mounts
                .get(key)
                .cloned()
                .unwrap_or_else(|| DEFAULT_EOS_MOUNT_POINT.to_string()),
        })
    }

    /// All registered sites in registration order.
    pub async fn sites(&self) -> Result<Vec<Site>, ConfigError> {
        let mut sites = Vec::new();
        for name in self.names().await? {
            if let Some(machine) = self.machine_id(&name).await? {
                let mut site = self.site(&machine).await?;
                site.name = name;
                sites.push(site);
            }
        }
        Ok(sites)
    }

    /// Register a new site and return its freshly allocated machine id.
    pub async fn register(
        &self,
        name: &str,
        url: &str,
        token: &str,
        kind: BackendKind,
    ) -> Result<MachineId, ConfigError> {
        let mut names = self.names().await?;
        if names.iter().any(|n| n == name) {
            return Err(ConfigError::DuplicateSite(name.to_string()));
        }
        let machine = MachineId::new(Uuid::new_v4().simple().to_string());

        let mut ids: BTreeMap<String, String> = self.map("runners_id").await?;
        let mut urls: BTreeMap<String, String> = self.map("urls").await?;
        let mut tokens: BTreeMap<String, String> = self.map("tokens").await?;
        let mut kinds: BTreeMap<String, String> = self.map("backend_types").await?;

        names.push(name.to_string());
        ids.insert(name.to_string(), machine.to_string());
        urls.insert(machine.to_string(), url.to_string());
        tokens.insert(machine.to_string(), token.to_string());
        kinds.insert(machine.to_string(), kind.as_str().to_string());

        self.put("runners", &names).await?;
        self.put("runners_id", &ids).await?;
        self.put("urls", &urls).await?;
        self.put("tokens", &tokens).await?;
        self.put("backend_types", &kinds).await?;

        info!(site = name, machine = %machine, kind = %kind, "registered site");
        Ok(machine)
    }

    /// Remove a site from every map of the registry.
    pub async fn remove(&self, name: &str) -> Result<(), ConfigError> {
        let mut names = self.names().await?;
        let Some(pos) = names.iter().position(|n| n == name) else {
            return Err(ConfigError::UnknownSite(name.to_string()));
        };
        names.remove(pos);

        let mut ids: BTreeMap<String, String> = self.map("runners_id").await?;
        let machine = ids.remove(name);
        self.put("runners", &names).await?;
        self.put("runners_id", &ids).await?;

        if let Some(machine) = machine {
            for key in ["urls", "tokens", "backend_types", "eos_mount_point"] {
                let mut map: BTreeMap<String, String> = self.map(key).await?;
                map.remove(&machine);
                self.put(key, &map).await?;
            }
            let mut kerberos: BTreeMap<String, bool> = self.map("use_kerberos").await?;
            kerberos.remove(&machine);
            self.put("use_kerberos", &kerberos).await?;
        }

        info!(site = name, "removed site");
        Ok(())
    }

    /// Enable or disable kerberos for a machine.
    pub async fn set_use_kerberos(&self, machine: &MachineId, on: bool) -> Result<(), ConfigError> {
        let mut kerberos: BTreeMap<String, bool> = self.map("use_kerberos").await?;
        kerberos.insert(machine.to_string(), on);
        self.put("use_kerberos", &kerberos).await
    }

    /// Set the bulk-storage mount point of a machine.
    pub async fn set_eos_mount_point(
        &self,
        machine: &MachineId,
        mount: &str,
    ) -> Result<(), ConfigError> {
        let mut mounts: BTreeMap<String, String> = self.map("eos_mount_point").await?;
        mounts.insert(machine.to_string(), mount.to_string());
        self.put("eos_mount_point", &mounts).await
    }
}

impl fmt::Debug for SiteRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SiteRegistry")
            .field("record", &self.record)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;
    use serde_json::json;
    use std::path::Path;

    fn registry() -> (Arc<InMemoryStore>, SiteRegistry) {
        let store = Arc::new(InMemoryStore::new());
        let registry = SiteRegistry::new(store.clone(), "/state/config.json");
        (store, registry)
    }

    #[tokio::test]
    async fn test_register_and_resolve() {
        let (_, registry) = registry();
        let machine = registry
            .register("cern", "https://reana.cern.ch", "tok", BackendKind::Remote)
            .await
            .unwrap();

        let site = registry.site(&machine).await.unwrap();
        assert_eq!(site.name, "cern");
        assert_eq!(site.url, "https://reana.cern.ch");
        assert_eq!(site.token, "tok");
        assert_eq!(site.kind, BackendKind::Remote);
        assert!(!site.use_kerberos);
        assert_eq!(site.eos_mount_point, DEFAULT_EOS_MOUNT_POINT);
        assert_eq!(registry.machine_id("cern").await.unwrap(), Some(machine));
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let (_, registry) = registry();
        registry
            .register("a", "u", "t", BackendKind::Local)
            .await
            .unwrap();
        let result = registry.register("a", "u", "t", BackendKind::Local).await;
        assert!(matches!(result, Err(ConfigError::DuplicateSite(_))));
    }

    #[tokio::test]
    async fn test_legacy_backend_names() {
        let (store, registry) = registry();
        let record = Path::new("/state/config.json");
        store
            .write_variable(record, "runners", json!(["old", "new"]))
            .await
            .unwrap();
        store
            .write_variable(record, "runners_id", json!({"old": "m1", "new": "m2"}))
            .await
            .unwrap();
        store
            .write_variable(record, "backend_types", json!({"m1": "dry", "m2": "reana"}))
            .await
            .unwrap();

        let sites = registry.sites().await.unwrap();
        assert_eq!(sites.len(), 2);
        assert_eq!(sites[0].name, "old");
        assert_eq!(sites[0].kind, BackendKind::Local);
        assert_eq!(sites[1].kind, BackendKind::Remote);
    }

    #[tokio::test]
    async fn test_unknown_machine_defaults_to_remote() {
        let (_, registry) = registry();
        let site = registry.site(&MachineId::new("ghost")).await.unwrap();
        assert_eq!(site.kind, BackendKind::Remote);
        assert_eq!(site.url, "");
        assert_eq!(site.name, "ghost");
    }

    #[tokio::test]
    async fn test_remove_clears_every_map() {
        let (store, registry) = registry();
        let machine = registry
            .register("gone", "u", "t", BackendKind::Remote)
            .await
            .unwrap();
        registry.set_use_kerberos(&machine, true).await.unwrap();
        registry
            .set_eos_mount_point(&machine, "/eos/user/x")
            .await
            .unwrap();

        registry.remove("gone").await.unwrap();

        assert!(registry.names().await.unwrap().is_empty());
        let record = store.record(Path::new("/state/config.json")).unwrap();
        for key in ["runners_id", "urls", "tokens", "backend_types", "use_kerberos", "eos_mount_point"] {
            assert_eq!(record.get(key), Some(&json!({})), "{} not cleared", key);
        }
    }

    #[tokio::test]
    async fn test_remove_unknown_site() {
        let (_, registry) = registry();
        let result = registry.remove("nope").await;
        assert!(matches!(result, Err(ConfigError::UnknownSite(_))));
    }

    #[test]
    fn test_backend_kind_serde_aliases() {
        let kind: BackendKind = serde_json::from_value(json!("dry")).unwrap();
        assert_eq!(kind, BackendKind::Local);
        let kind: BackendKind = serde_json::from_value(json!("reana")).unwrap();
        assert_eq!(kind, BackendKind::Remote);
        assert_eq!(serde_json::to_value(BackendKind::Local).unwrap(), json!("local"));
    }
}

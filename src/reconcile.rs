//! Keeps the `site_downtime` / `site_up` tables in line with the NMS.
//!
//! Each run fetches the current list for one status, resolves every item to a
//! canonical registry site id and upserts it. Rows for sites the NMS no longer
//! reports are then deleted, unless nothing resolved at all in this run.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{SlaError, SlaResult};
use crate::models::{SiteStatusKind, SiteStatusRecord};
use crate::nms::{NmsSite, NmsSource};
use crate::registry::{RegistrySnapshot, SiteRegistry};
use crate::store::{SiteStatusStore, UpsertOutcome};

// ---

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub deleted: u64,
    pub errors: usize,
}

pub struct ReconcileService {
    nms: Option<Arc<dyn NmsSource>>,
    registry: Arc<dyn SiteRegistry>,
    store: Arc<dyn SiteStatusStore>,
}

impl ReconcileService {
    pub fn new(
        nms: Option<Arc<dyn NmsSource>>,
        registry: Arc<dyn SiteRegistry>,
        store: Arc<dyn SiteStatusStore>,
    ) -> Self {
        ReconcileService {
            nms,
            registry,
            store,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.nms.is_some()
    }

    /// Registry snapshot, or an empty one when no registry is configured.
    async fn snapshot(&self) -> SlaResult<Arc<RegistrySnapshot>> {
        match self.registry.snapshot().await {
            Ok(snapshot) => Ok(snapshot),
            Err(SlaError::RegistryNotConfigured(what)) => {
                warn!("{} is not configured, no NMS site can be resolved", what);
                Ok(Arc::new(RegistrySnapshot::default()))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn sync(&self, kind: SiteStatusKind) -> SlaResult<SyncReport> {
        // ---
        let nms = self
            .nms
            .as_ref()
            .ok_or(SlaError::RegistryNotConfigured("NMS inventory"))?;

        let items = nms.list_sites(kind).await?;
        let snapshot = self.snapshot().await?;

        let mut report = SyncReport::default();
        let mut resolved: Vec<String> = Vec::with_capacity(items.len());

        for item in &items {
            let Some(site_id) =
                snapshot.resolve_site_id(&item.site_id_name, item.terminal_id.as_deref())
            else {
                debug!(
                    "Skipping NMS site '{}' (terminal {:?}): not in registry",
                    item.site_id_name, item.terminal_id
                );
                report.skipped += 1;
                continue;
            };

            let record = status_record(&snapshot, site_id.clone(), item);
            resolved.push(site_id);

            match self.store.upsert_site_status(kind, &record).await {
                Ok(UpsertOutcome::Inserted) => report.inserted += 1,
                Ok(UpsertOutcome::Updated) => report.updated += 1,
                Err(e) => {
                    warn!("Upsert of {} status for {} failed: {}", kind.as_str(), record.site_id, e);
                    report.errors += 1;
                }
            }
        }

        if resolved.is_empty() {
            warn!(
                "No '{}' site resolved out of {} NMS items, keeping existing rows",
                kind.as_str(),
                items.len()
            );
        } else {
            resolved.sort();
            resolved.dedup();
            match self.store.delete_site_status_except(kind, &resolved).await {
                Ok(deleted) => report.deleted = deleted,
                Err(e) => {
                    warn!("Pruning stale '{}' rows failed: {}", kind.as_str(), e);
                    report.errors += 1;
                }
            }
        }

        info!("Site status sync '{}': {:?}", kind.as_str(), report);
        Ok(report)
    }

    pub async fn list(&self, kind: SiteStatusKind) -> SlaResult<Vec<SiteStatusRecord>> {
        Ok(self.store.list_site_status(kind).await?)
    }

    /// Run `sync` for both statuses every `every`, starting after one period.
    pub fn spawn_periodic(self: Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        // ---
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                debug!("Running scheduled site status sync");
                for kind in [SiteStatusKind::Down, SiteStatusKind::Up] {
                    if let Err(e) = self.sync(kind).await {
                        warn!("Scheduled '{}' sync failed: {}", kind.as_str(), e);
                    }
                }
            }
        })
    }
}

fn status_record(snapshot: &RegistrySnapshot, site_id: String, item: &NmsSite) -> SiteStatusRecord {
    let site_name = item
        .name
        .clone()
        .or_else(|| snapshot.details(&site_id).map(|d| d.name.clone()));
    SiteStatusRecord {
        site_id,
        site_name,
        terminal_id: item.terminal_id.clone(),
        down_since: item.down_since_utc(),
        down_seconds: item.down_seconds_whole(),
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use async_trait::async_trait;

    use crate::error::StorageError;
    use crate::registry::{RegistryClient, Site, StaticRegistry};
    use crate::store::MemoryStore;

    struct FixedNms(Vec<NmsSite>);

    #[async_trait]
    impl NmsSource for FixedNms {
        async fn list_sites(&self, _status: SiteStatusKind) -> SlaResult<Vec<NmsSite>> {
            Ok(self.0.clone())
        }
    }

    /// Fails every upsert for one site id.
    struct FlakyStore {
        inner: MemoryStore,
        poisoned: &'static str,
    }

    #[async_trait]
    impl SiteStatusStore for FlakyStore {
        async fn upsert_site_status(
            &self,
            kind: SiteStatusKind,
            record: &SiteStatusRecord,
        ) -> Result<UpsertOutcome, StorageError> {
            if record.site_id == self.poisoned {
                return Err(StorageError::Backend("deadlock detected".into()));
            }
            self.inner.upsert_site_status(kind, record).await
        }

        async fn delete_site_status_except(
            &self,
            kind: SiteStatusKind,
            keep: &[String],
        ) -> Result<u64, StorageError> {
            self.inner.delete_site_status_except(kind, keep).await
        }

        async fn list_site_status(
            &self,
            kind: SiteStatusKind,
        ) -> Result<Vec<SiteStatusRecord>, StorageError> {
            self.inner.list_site_status(kind).await
        }
    }

    fn nms_site(id: &str, terminal: Option<&str>) -> NmsSite {
        NmsSite {
            site_id_name: id.to_string(),
            name: None,
            terminal_id: terminal.map(str::to_string),
            down_since: Some("2025-01-01T00:00:00Z".into()),
            down_seconds: Some(7200.0),
        }
    }

    fn registry() -> Arc<dyn SiteRegistry> {
        Arc::new(StaticRegistry::new([
            Site::active("SITE-A", "Alpha", "talis5", "MALUKU").with_terminal("T-A"),
            Site::active("SITE-B", "Bravo", "mix", "ACEH"),
        ]))
    }

    fn service(items: Vec<NmsSite>, store: Arc<dyn SiteStatusStore>) -> ReconcileService {
        ReconcileService::new(Some(Arc::new(FixedNms(items))), registry(), store)
    }

    #[tokio::test]
    async fn resolves_upserts_and_prunes() {
        // ---
        let store = MemoryStore::new();
        let stale = SiteStatusRecord {
            site_id: "SITE-B".into(),
            site_name: None,
            terminal_id: None,
            down_since: None,
            down_seconds: None,
        };
        store
            .upsert_site_status(SiteStatusKind::Down, &stale)
            .await
            .unwrap();

        let svc = service(
            vec![
                nms_site("nms-123", Some("T-A")),
                nms_site("UNKNOWN", None),
            ],
            Arc::new(store.clone()),
        );
        let report = svc.sync(SiteStatusKind::Down).await.unwrap();

        assert_eq!(
            report,
            SyncReport {
                inserted: 1,
                updated: 0,
                skipped: 1,
                deleted: 1,
                errors: 0
            }
        );
        let rows = svc.list(SiteStatusKind::Down).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].site_id, "SITE-A");
        assert_eq!(rows[0].site_name.as_deref(), Some("Alpha"));
        assert_eq!(rows[0].down_seconds, Some(7200));

        let again = svc.sync(SiteStatusKind::Down).await.unwrap();
        assert_eq!((again.inserted, again.updated, again.deleted), (0, 1, 0));
    }

    #[tokio::test]
    async fn nothing_resolved_keeps_existing_rows() {
        // ---
        let store = MemoryStore::new();
        let existing = SiteStatusRecord {
            site_id: "SITE-A".into(),
            site_name: None,
            terminal_id: None,
            down_since: None,
            down_seconds: None,
        };
        store
            .upsert_site_status(SiteStatusKind::Up, &existing)
            .await
            .unwrap();

        let svc = service(vec![nms_site("GHOST", None)], Arc::new(store.clone()));
        let report = svc.sync(SiteStatusKind::Up).await.unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(report.deleted, 0);
        assert_eq!(store.list_site_status(SiteStatusKind::Up).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn per_item_failures_are_counted() {
        // ---
        let store = FlakyStore {
            inner: MemoryStore::new(),
            poisoned: "SITE-A",
        };
        let svc = service(
            vec![nms_site("SITE-A", None), nms_site("SITE-B", None)],
            Arc::new(store),
        );

        let report = svc.sync(SiteStatusKind::Down).await.unwrap();
        assert_eq!(report.errors, 1);
        assert_eq!(report.inserted, 1);
    }

    #[tokio::test]
    async fn unconfigured_registry_resolves_nothing() {
        // ---
        let registry = RegistryClient::new(reqwest::Client::new(), None, 100, Duration::from_secs(60));
        let svc = ReconcileService::new(
            Some(Arc::new(FixedNms(vec![nms_site("SITE-A", None)]))),
            Arc::new(registry),
            Arc::new(MemoryStore::new()),
        );

        let report = svc.sync(SiteStatusKind::Down).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.inserted, 0);
    }

    #[tokio::test]
    async fn missing_nms_is_an_error() {
        // ---
        let svc = ReconcileService::new(None, registry(), Arc::new(MemoryStore::new()));
        assert!(!svc.is_enabled());
        assert!(svc.sync(SiteStatusKind::Down).await.is_err());
    }
}

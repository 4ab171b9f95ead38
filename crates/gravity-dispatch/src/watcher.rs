//! Configuration-store watcher.
//!
//! Watches the product KV store and turns change events into rule-index
//! swaps and subscriber lifecycle notifications. Rapid PUT bursts (a
//! multi-key product update) are debounced into one application per
//! product: the watcher collects changes for a short window after the
//! first event, keeping only the latest change per product, then applies
//! the batch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::bus::{ConfigEvent, ConfigStore};
use crate::error::Result;
use crate::product::ProductSetting;
use crate::rule_manager::RuleManager;

/// Receives product lifecycle notifications after the rule index has been
/// updated.
#[async_trait]
pub trait ProductLifecycle: Send + Sync {
    /// A product was created or updated (and is enabled).
    async fn product_updated(&self, setting: ProductSetting);

    /// A product was deleted or disabled.
    async fn product_removed(&self, name: &str);
}

/// Watches the config store and applies product changes.
pub struct ConfigWatcher {
    store: Arc<dyn ConfigStore>,
    rule_manager: Arc<RuleManager>,
    debounce: Duration,
}

impl ConfigWatcher {
    /// Creates a watcher with the default 50 ms debounce window.
    #[must_use]
    pub fn new(store: Arc<dyn ConfigStore>, rule_manager: Arc<RuleManager>) -> Self {
        Self {
            store,
            rule_manager,
            debounce: Duration::from_millis(50),
        }
    }

    /// Overrides the debounce window.
    #[must_use]
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Loads every product currently in the store and applies it.
    ///
    /// # Errors
    ///
    /// Returns store errors; individual malformed settings are logged and
    /// skipped.
    pub async fn load_existing(&self, lifecycle: &Arc<dyn ProductLifecycle>) -> Result<()> {
        for name in self.store.keys().await? {
            match self.store.get(&name).await? {
                Some(data) => self.apply_put(&name, &data, lifecycle).await,
                None => continue,
            }
        }
        Ok(())
    }

    /// Runs the watch loop until `shutdown` fires or the stream ends.
    ///
    /// # Errors
    ///
    /// Returns an error only if the watch stream cannot be established.
    pub async fn run(
        self,
        lifecycle: Arc<dyn ProductLifecycle>,
        shutdown: Arc<Notify>,
    ) -> Result<()> {
        use futures::StreamExt;

        let mut stream = self.store.watch().await?;
        // Latest change per product; `None` marks a delete.
        let mut pending: HashMap<String, Option<Bytes>> = HashMap::new();

        info!("config watcher started");
        loop {
            // Wait for the first change (or shutdown).
            tokio::select! {
                biased;
                () = shutdown.notified() => break,
                event = stream.next() => match event {
                    Some(event) => stage(&mut pending, event),
                    None => break,
                },
            }

            // Debounce: keep absorbing changes until the window closes, so
            // a burst of PUTs becomes one application per product.
            let window = tokio::time::sleep(self.debounce);
            tokio::pin!(window);
            loop {
                tokio::select! {
                    biased;
                    () = &mut window => break,
                    event = stream.next() => match event {
                        Some(event) => stage(&mut pending, event),
                        None => break,
                    },
                }
            }

            for (name, change) in pending.drain() {
                match change {
                    Some(data) => self.apply_put(&name, &data, &lifecycle).await,
                    None => self.apply_delete(&name, &lifecycle).await,
                }
            }
        }

        info!("config watcher stopped");
        Ok(())
    }

    async fn apply_put(&self, name: &str, data: &Bytes, lifecycle: &Arc<dyn ProductLifecycle>) {
        let setting = match ProductSetting::from_bytes(data) {
            Ok(setting) => setting,
            Err(e) => {
                warn!(product = %name, error = %e, "ignoring malformed product setting");
                return;
            }
        };

        if !setting.enabled {
            info!(product = %name, "product disabled");
            self.apply_delete(name, lifecycle).await;
            return;
        }

        let rules = match setting.build_rules() {
            Ok(rules) => rules,
            Err(e) => {
                warn!(product = %name, error = %e, "ignoring product with bad rules");
                return;
            }
        };

        info!(product = %name, rules = rules.len(), "product updated");
        self.rule_manager.replace_product(&setting.name, rules);
        lifecycle.product_updated(setting).await;
    }

    async fn apply_delete(&self, name: &str, lifecycle: &Arc<dyn ProductLifecycle>) {
        if self.rule_manager.remove_product(name) {
            info!(product = %name, "product removed");
        }
        lifecycle.product_removed(name).await;
    }
}

fn stage(pending: &mut HashMap<String, Option<Bytes>>, event: ConfigEvent) {
    match event {
        ConfigEvent::Put { name, data } => {
            pending.insert(name, Some(data));
        }
        ConfigEvent::Delete { name } => {
            pending.insert(name, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::memory::MemoryConfigStore;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingLifecycle {
        updates: Mutex<Vec<String>>,
        removals: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ProductLifecycle for RecordingLifecycle {
        async fn product_updated(&self, setting: ProductSetting) {
            self.updates.lock().push(setting.name);
        }

        async fn product_removed(&self, name: &str) {
            self.removals.lock().push(name.to_string());
        }
    }

    fn setting_bytes(name: &str, enabled: bool) -> Bytes {
        let json = json!({
            "name": name,
            "enabled": enabled,
            "schema": {"id": {"type": "int"}},
            "rules": [{"event": "created", "pk": ["id"]}],
            "subscription": {"subject": "in.test"},
        });
        Bytes::from(serde_json::to_vec(&json).unwrap())
    }

    async fn start_watcher(
        store: &Arc<MemoryConfigStore>,
        rule_manager: &Arc<RuleManager>,
        lifecycle: &Arc<RecordingLifecycle>,
    ) -> (Arc<Notify>, tokio::task::JoinHandle<()>) {
        let watcher = ConfigWatcher::new(
            Arc::clone(store) as Arc<dyn ConfigStore>,
            Arc::clone(rule_manager),
        )
        .with_debounce(Duration::from_millis(20));
        let shutdown = Arc::new(Notify::new());
        let lifecycle = Arc::clone(lifecycle) as Arc<dyn ProductLifecycle>;
        let handle = {
            let shutdown = Arc::clone(&shutdown);
            tokio::spawn(async move {
                watcher.run(lifecycle, shutdown).await.unwrap();
            })
        };
        // Give the watch stream a beat to register.
        tokio::time::sleep(Duration::from_millis(10)).await;
        (shutdown, handle)
    }

    #[tokio::test]
    async fn test_put_installs_rules_and_notifies() {
        let store = MemoryConfigStore::new();
        let rule_manager = Arc::new(RuleManager::new());
        let lifecycle = Arc::new(RecordingLifecycle::default());
        let (shutdown, handle) = start_watcher(&store, &rule_manager, &lifecycle).await;

        store.put("p1", setting_bytes("p1", true)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(rule_manager.get_rule("p1", "created").is_some());
        assert_eq!(lifecycle.updates.lock().as_slice(), ["p1"]);

        shutdown.notify_one();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_burst_debounces_to_one_update() {
        let store = MemoryConfigStore::new();
        let rule_manager = Arc::new(RuleManager::new());
        let lifecycle = Arc::new(RecordingLifecycle::default());
        let (shutdown, handle) = start_watcher(&store, &rule_manager, &lifecycle).await;

        for _ in 0..5 {
            store.put("p1", setting_bytes("p1", true)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(lifecycle.updates.lock().len(), 1);

        shutdown.notify_one();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_removes_product() {
        let store = MemoryConfigStore::new();
        let rule_manager = Arc::new(RuleManager::new());
        let lifecycle = Arc::new(RecordingLifecycle::default());
        let (shutdown, handle) = start_watcher(&store, &rule_manager, &lifecycle).await;

        store.put("p1", setting_bytes("p1", true)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        store.delete("p1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(rule_manager.get_rule("p1", "created").is_none());
        assert_eq!(lifecycle.removals.lock().as_slice(), ["p1"]);

        shutdown.notify_one();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_disabled_product_treated_as_removed() {
        let store = MemoryConfigStore::new();
        let rule_manager = Arc::new(RuleManager::new());
        let lifecycle = Arc::new(RecordingLifecycle::default());
        let (shutdown, handle) = start_watcher(&store, &rule_manager, &lifecycle).await;

        store.put("p1", setting_bytes("p1", true)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        store.put("p1", setting_bytes("p1", false)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(rule_manager.get_rule("p1", "created").is_none());
        assert_eq!(lifecycle.removals.lock().as_slice(), ["p1"]);

        shutdown.notify_one();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_setting_skipped() {
        let store = MemoryConfigStore::new();
        let rule_manager = Arc::new(RuleManager::new());
        let lifecycle = Arc::new(RecordingLifecycle::default());
        let (shutdown, handle) = start_watcher(&store, &rule_manager, &lifecycle).await;

        store
            .put("p1", Bytes::from_static(b"not json"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(lifecycle.updates.lock().is_empty());
        assert!(rule_manager.product_names().is_empty());

        shutdown.notify_one();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_load_existing() {
        let store = MemoryConfigStore::new();
        store.put("p1", setting_bytes("p1", true)).await.unwrap();
        store.put("p2", setting_bytes("p2", false)).await.unwrap();

        let rule_manager = Arc::new(RuleManager::new());
        let lifecycle = Arc::new(RecordingLifecycle::default());
        let watcher = ConfigWatcher::new(
            Arc::clone(&store) as Arc<dyn ConfigStore>,
            Arc::clone(&rule_manager),
        );

        watcher
            .load_existing(&(Arc::clone(&lifecycle) as Arc<dyn ProductLifecycle>))
            .await
            .unwrap();

        assert!(rule_manager.get_rule("p1", "created").is_some());
        assert!(rule_manager.get_rule("p2", "created").is_none());
        assert_eq!(lifecycle.updates.lock().as_slice(), ["p1"]);
    }
}

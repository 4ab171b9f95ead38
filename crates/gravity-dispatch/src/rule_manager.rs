//! The product → event → rule index.
//!
//! Readers never block on updates: the index lives behind
//! `RwLock<Arc<RuleIndex>>`, and every read path clones the `Arc` first.
//! Mutations build a fresh index and swap the pointer, so a message in
//! flight sees either the old or the new view in full, never a torn mix.

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::warn;

use crate::rule::Rule;

/// An immutable snapshot of all products' rules.
#[derive(Debug, Default, Clone)]
pub struct RuleIndex {
    products: FxHashMap<String, ProductRules>,
}

/// One product's event → rule map.
#[derive(Debug, Default, Clone)]
pub struct ProductRules {
    events: FxHashMap<String, Arc<Rule>>,
}

impl RuleIndex {
    /// Looks up a rule by product and event name.
    #[must_use]
    pub fn get(&self, product: &str, event: &str) -> Option<Arc<Rule>> {
        self.products
            .get(product)
            .and_then(|p| p.events.get(event))
            .cloned()
    }

    /// Returns a product's rules (no ordering guarantee).
    #[must_use]
    pub fn list(&self, product: &str) -> Vec<Arc<Rule>> {
        self.products
            .get(product)
            .map(|p| p.events.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the names of all indexed products.
    #[must_use]
    pub fn product_names(&self) -> Vec<String> {
        self.products.keys().cloned().collect()
    }

    /// Returns `true` if the product has at least one rule.
    #[must_use]
    pub fn contains_product(&self, product: &str) -> bool {
        self.products.contains_key(product)
    }

    fn insert(&mut self, rule: Arc<Rule>) {
        let product = self
            .products
            .entry(rule.product.clone())
            .or_default();
        if product.events.insert(rule.event.clone(), Arc::clone(&rule)).is_some() {
            warn!(
                product = %rule.product,
                event = %rule.event,
                "duplicate rule for event, later definition wins"
            );
        }
    }
}

/// Maintains the rule index and hands out immutable snapshots.
#[derive(Debug, Default)]
pub struct RuleManager {
    index: RwLock<Arc<RuleIndex>>,
}

impl RuleManager {
    /// Creates an empty rule manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current index snapshot. The snapshot is immutable and
    /// stays valid across concurrent updates.
    #[must_use]
    pub fn snapshot(&self) -> Arc<RuleIndex> {
        Arc::clone(&self.index.read())
    }

    /// Looks up a rule by product and event name.
    #[must_use]
    pub fn get_rule(&self, product: &str, event: &str) -> Option<Arc<Rule>> {
        self.snapshot().get(product, event)
    }

    /// Returns a product's rules.
    #[must_use]
    pub fn list_rules(&self, product: &str) -> Vec<Arc<Rule>> {
        self.snapshot().list(product)
    }

    /// Returns the names of all products with rules.
    #[must_use]
    pub fn product_names(&self) -> Vec<String> {
        self.snapshot().product_names()
    }

    /// Adds or replaces a single rule.
    pub fn add_rule(&self, rule: Rule) {
        self.mutate(|index| index.insert(Arc::new(rule)));
    }

    /// Removes a rule, returning `true` if it existed. A product left with
    /// no events is removed from the index.
    pub fn remove_rule(&self, product: &str, event: &str) -> bool {
        let mut removed = false;
        self.mutate(|index| {
            if let Some(rules) = index.products.get_mut(product) {
                removed = rules.events.remove(event).is_some();
                if rules.events.is_empty() {
                    index.products.remove(product);
                }
            }
        });
        removed
    }

    /// Replaces one product's rules in a single swap.
    pub fn replace_product(&self, product: &str, rules: Vec<Rule>) {
        self.mutate(|index| {
            index.products.remove(product);
            for rule in rules {
                index.insert(Arc::new(rule));
            }
        });
    }

    /// Removes a product and all its rules.
    pub fn remove_product(&self, product: &str) -> bool {
        let mut removed = false;
        self.mutate(|index| {
            removed = index.products.remove(product).is_some();
        });
        removed
    }

    /// Replaces the entire index atomically. Within one call, a later rule
    /// for the same `(product, event)` wins over an earlier one (with a
    /// diagnostic).
    pub fn replace_all(&self, rules: impl IntoIterator<Item = Rule>) {
        let mut index = RuleIndex::default();
        for rule in rules {
            index.insert(Arc::new(rule));
        }
        *self.index.write() = Arc::new(index);
    }

    /// Copy-on-write mutation: clone the current index, apply `f`, swap.
    fn mutate(&self, f: impl FnOnce(&mut RuleIndex)) {
        let mut guard = self.index.write();
        let mut next = (**guard).clone();
        f(&mut next);
        *guard = Arc::new(next);
    }
}

use std::collections::{BTreeSet, HashSet};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::services::DeviceRegistry;

/// Known fan addresses plus the addresses whose interlock warning was already delivered.
#[derive(Default)]
pub struct MemoryRegistry {
    addresses: Mutex<BTreeSet<String>>,
    suppressed: Mutex<HashSet<String>>,
}

impl MemoryRegistry {
    pub fn new<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            addresses: Mutex::new(addresses.into_iter().map(Into::into).collect()),
            suppressed: Mutex::new(HashSet::new()),
        }
    }
}

#[async_trait]
impl DeviceRegistry for MemoryRegistry {
    async fn list(&self) -> Vec<String> {
        self.addresses.lock().await.iter().cloned().collect()
    }

    async fn add(&self, ip_address: &str) {
        self.addresses.lock().await.insert(ip_address.to_string());
    }

    async fn mark_suppressed(&self, ip_address: &str) {
        self.suppressed.lock().await.insert(ip_address.to_string());
    }

    async fn is_suppressed(&self, ip_address: &str) -> bool {
        self.suppressed.lock().await.contains(ip_address)
    }

    async fn clear_suppressed(&self, ip_address: &str) {
        self.suppressed.lock().await.remove(ip_address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn addresses_are_unique_and_sorted() {
        let registry = MemoryRegistry::new(["10.0.0.9", "10.0.0.3"]);
        registry.add("10.0.0.9").await;
        registry.add("10.0.0.5").await;

        assert_eq!(registry.list().await, vec!["10.0.0.3", "10.0.0.5", "10.0.0.9"]);
    }

    #[tokio::test]
    async fn suppression_round_trip() {
        let registry = MemoryRegistry::default();
        registry.mark_suppressed("10.0.0.3").await;
        assert!(registry.is_suppressed("10.0.0.3").await);

        registry.clear_suppressed("10.0.0.3").await;
        assert!(!registry.is_suppressed("10.0.0.3").await);
    }
}

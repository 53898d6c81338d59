//! Environment leases.
//!
//! Every language owns a pool of interchangeable environments. Recipes with unique
//! artifact names share environments freely (round-robin). Recipes with a fixed entry
//! point lease an environment exclusively: with N environments at most N executions
//! of that language run at once, each alone in its environment.
//!
//! A table only sees executions dispatched from its own process. Other processes may run
//! the same recipe in the same environment at the same time, so fixed entry points also get
//! a private directory per execution (see `ArtifactNames`); the lease bounds local load.

use sandrun_common::types::Language;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::registry::{LanguageRecipe, LanguageRegistry};

#[derive(Debug)]
struct EnvironmentPool {
    language: Language,
    exclusive: bool,
    environments: Vec<String>,
    /// Round-robin cursor for shared pools
    next: AtomicUsize,
    /// Idle environments of an exclusive pool; always holds as many ids as there are free permits
    idle: Mutex<VecDeque<String>>,
    permits: Arc<Semaphore>,
}

impl EnvironmentPool {
    fn new(recipe: &LanguageRecipe) -> Self {
        let environments: Vec<String> = recipe
            .environments
            .iter()
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .collect();
        Self {
            language: recipe.language,
            exclusive: recipe.requires_exclusive_lease(),
            next: AtomicUsize::new(0),
            idle: Mutex::new(environments.iter().cloned().collect()),
            permits: Arc::new(Semaphore::new(environments.len())),
            environments,
        }
    }

    fn idle(&self) -> std::sync::MutexGuard<'_, VecDeque<String>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A claim on one environment for the duration of one execution.
/// Dropping the lease returns an exclusive environment to its pool.
#[derive(Debug)]
pub struct EnvironmentLease {
    environment_id: String,
    language: Language,
    exclusive: Option<ExclusiveHold>,
}

#[derive(Debug)]
struct ExclusiveHold {
    pool: Arc<EnvironmentPool>,
    // Dropped after the id is back in the idle queue
    _permit: OwnedSemaphorePermit,
}

impl EnvironmentLease {
    pub fn environment_id(&self) -> &str {
        &self.environment_id
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive.is_some()
    }
}

impl Drop for EnvironmentLease {
    fn drop(&mut self) {
        if let Some(hold) = &self.exclusive {
            hold.pool.idle().push_back(self.environment_id.clone());
            debug!(language = %self.language, environment = %self.environment_id, "Exclusive lease released");
        }
    }
}

/// Leases for every language in a registry
#[derive(Debug, Clone)]
pub struct LeaseTable {
    pools: Arc<HashMap<Language, Arc<EnvironmentPool>>>,
}

impl LeaseTable {
    pub fn new(registry: &LanguageRegistry) -> Self {
        let pools = registry
            .recipes()
            .map(|recipe| (recipe.language, Arc::new(EnvironmentPool::new(recipe))))
            .collect();
        Self { pools: Arc::new(pools) }
    }

    /// Lease an environment for `recipe`, waiting for an idle one if the recipe is exclusive.
    /// Returns `None` only for a language this table was not built with.
    pub async fn acquire(&self, recipe: &LanguageRecipe) -> Option<EnvironmentLease> {
        let pool = self.pools.get(&recipe.language)?.clone();
        if pool.environments.is_empty() {
            return None;
        }

        if !pool.exclusive {
            let idx = pool.next.fetch_add(1, Ordering::Relaxed) % pool.environments.len();
            return Some(EnvironmentLease {
                environment_id: pool.environments[idx].clone(),
                language: pool.language,
                exclusive: None,
            });
        }

        // The semaphore is never closed, so acquisition only fails if that invariant breaks
        let permit = pool.permits.clone().acquire_owned().await.ok()?;
        let environment_id = pool.idle().pop_front()?;
        debug!(language = %pool.language, environment = %environment_id, "Exclusive lease acquired");

        Some(EnvironmentLease {
            environment_id,
            language: pool.language,
            exclusive: Some(ExclusiveHold { pool, _permit: permit }),
        })
    }

    /// Environments of `language` not currently leased exclusively
    pub fn available(&self, language: Language) -> usize {
        self.pools
            .get(&language)
            .map(|pool| if pool.exclusive { pool.permits.available_permits() } else { pool.environments.len() })
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn registry_with(java_envs: &[&str]) -> LanguageRegistry {
        let mut java = LanguageRecipe::builtin(Language::Java);
        java.environments = java_envs.iter().map(|s| s.to_string()).collect();
        let mut python = LanguageRecipe::builtin(Language::Python);
        python.environments = vec!["py-1".to_string(), "py-2".to_string()];
        LanguageRegistry::from_recipes(vec![java, python]).unwrap()
    }

    #[tokio::test]
    async fn test_shared_pool_round_robins_without_blocking() {
        let registry = registry_with(&["java-1"]);
        let table = LeaseTable::new(&registry);
        let python = registry.get(Language::Python).unwrap();

        let a = table.acquire(python).await.unwrap();
        let b = table.acquire(python).await.unwrap();
        let c = table.acquire(python).await.unwrap();
        assert!(!a.is_exclusive());
        assert_ne!(a.environment_id(), b.environment_id());
        assert_eq!(a.environment_id(), c.environment_id());
    }

    #[tokio::test]
    async fn test_exclusive_lease_blocks_until_released() {
        let registry = registry_with(&["java-1"]);
        let table = LeaseTable::new(&registry);
        let java = registry.get(Language::Java).unwrap().clone();

        let held = table.acquire(&java).await.unwrap();
        assert!(held.is_exclusive());
        assert_eq!(table.available(Language::Java), 0);

        let waiter = {
            let table = table.clone();
            let java = java.clone();
            tokio::spawn(async move { table.acquire(&java).await.map(|l| l.environment_id().to_string()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        let next = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(next.as_deref(), Some("java-1"));
        assert_eq!(table.available(Language::Java), 1);
    }

    #[tokio::test]
    async fn test_exclusive_pool_hands_out_distinct_environments() {
        let registry = registry_with(&["java-1", "java-2"]);
        let table = LeaseTable::new(&registry);
        let java = registry.get(Language::Java).unwrap();

        let a = table.acquire(java).await.unwrap();
        let b = table.acquire(java).await.unwrap();
        assert_ne!(a.environment_id(), b.environment_id());
        assert_eq!(table.available(Language::Java), 0);
    }

    #[tokio::test]
    async fn test_unknown_language_has_no_lease() {
        let registry = registry_with(&["java-1"]);
        let table = LeaseTable::new(&registry);
        assert!(table.acquire(&LanguageRecipe::builtin(Language::Cpp)).await.is_none());
    }
}

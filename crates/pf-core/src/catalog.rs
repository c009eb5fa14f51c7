use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use crate::types::TierLimits;

/// Read-mostly mapping from tier name to its limits snapshot.
///
/// Lookups clone an `Arc` under a shared read lock and therefore never
/// block admission; writers replace whole entries. Tier records are
/// snapshots — callers must not expect a held `Arc<TierLimits>` to change
/// when the catalog is updated.
pub struct TierCatalog {
    tiers: RwLock<HashMap<String, Arc<TierLimits>>>,
    fallback: Arc<TierLimits>,
}

impl TierCatalog {
    /// Create an empty catalog holding only the fallback limits.
    pub fn new() -> Self {
        Self {
            tiers: RwLock::new(HashMap::new()),
            fallback: Arc::new(default_limits()),
        }
    }

    /// Create a catalog seeded with the built-in free/standard/enterprise
    /// tiers.
    pub fn with_builtin_tiers() -> Self {
        let catalog = Self::new();
        for tier in builtin_tiers() {
            catalog.replace(tier);
        }
        catalog
    }

    /// Look up a tier by name.
    pub fn get(&self, name: &str) -> Option<Arc<TierLimits>> {
        let tiers = self.tiers.read().expect("tier catalog lock poisoned");
        tiers.get(name).cloned()
    }

    /// Safe fallback used when a principal cannot be resolved to a tier.
    pub fn default_limits(&self) -> Arc<TierLimits> {
        self.fallback.clone()
    }

    /// Resolve an optional tier name, falling back to the default limits.
    pub fn resolve(&self, name: Option<&str>) -> Arc<TierLimits> {
        name.and_then(|n| self.get(n))
            .unwrap_or_else(|| self.default_limits())
    }

    /// Install or replace a tier entry wholesale.
    pub fn replace(&self, tier: TierLimits) {
        let mut tiers = self.tiers.write().expect("tier catalog lock poisoned");
        tiers.insert(tier.name.clone(), Arc::new(tier));
    }

    /// Names of all known tiers.
    pub fn names(&self) -> Vec<String> {
        let tiers = self.tiers.read().expect("tier catalog lock poisoned");
        tiers.keys().cloned().collect()
    }
}

impl Default for TierCatalog {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Built-in tiers
// ---------------------------------------------------------------------------

/// The fallback limits handed to unresolvable principals.
pub fn default_limits() -> TierLimits {
    TierLimits {
        name: "default".to_string(),
        rate_per_minute: 10,
        rate_per_hour: 50,
        rate_per_day: 200,
        rate_per_month: 2_000,
        max_concurrent: 5,
        priority: 0,
        allowed_probe_intervals: BTreeSet::new(),
        allow_scheduled_probes: false,
        allow_api_access: false,
        allow_export: false,
        allow_alerts: false,
        allow_custom_intervals: false,
    }
}

const STANDARD_INTERVALS: [u32; 4] = [5, 15, 60, 1440];

/// The three tiers seeded at first boot.
pub fn builtin_tiers() -> Vec<TierLimits> {
    vec![
        TierLimits {
            name: "free".to_string(),
            rate_per_minute: 10,
            rate_per_hour: 100,
            rate_per_day: 500,
            rate_per_month: 10_000,
            max_concurrent: 5,
            priority: 0,
            allowed_probe_intervals: BTreeSet::new(),
            allow_scheduled_probes: false,
            allow_api_access: false,
            allow_export: false,
            allow_alerts: false,
            allow_custom_intervals: false,
        },
        TierLimits {
            name: "standard".to_string(),
            rate_per_minute: 30,
            rate_per_hour: 500,
            rate_per_day: 5_000,
            rate_per_month: 100_000,
            max_concurrent: 10,
            priority: 5,
            allowed_probe_intervals: STANDARD_INTERVALS.into_iter().collect(),
            allow_scheduled_probes: true,
            allow_api_access: true,
            allow_export: true,
            allow_alerts: true,
            allow_custom_intervals: false,
        },
        TierLimits {
            name: "enterprise".to_string(),
            rate_per_minute: 100,
            rate_per_hour: 2_000,
            rate_per_day: 20_000,
            rate_per_month: 400_000,
            max_concurrent: 25,
            priority: 10,
            allowed_probe_intervals: STANDARD_INTERVALS.into_iter().collect(),
            allow_scheduled_probes: true,
            allow_api_access: true,
            allow_export: true,
            allow_alerts: true,
            allow_custom_intervals: true,
        },
    ]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

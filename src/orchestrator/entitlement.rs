// =============================================================================
// Entitlement store (C10 collaborator) — tier/worker-limit policy
// =============================================================================

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::info;

use crate::config::EntitlementCfg;
use crate::types::{Entitlement, Tier};

pub struct EntitlementStore {
    entitlements: RwLock<HashMap<String, Entitlement>>,
}

impl EntitlementStore {
    pub fn new(cfg: &EntitlementCfg) -> Self {
        let seeded = cfg
            .entitlements_path
            .as_deref()
            .and_then(|path| std::fs::read_to_string(path).ok())
            .and_then(|raw| serde_json::from_str::<Vec<Entitlement>>(&raw).ok())
            .unwrap_or_default();

        let mut map = HashMap::new();
        for entitlement in seeded {
            map.insert(entitlement.user_id.clone(), entitlement);
        }
        Self { entitlements: RwLock::new(map) }
    }

    /// Resolve (or create, defaulting to free tier) a user's entitlement.
    pub fn resolve(&self, user_id: &str) -> Entitlement {
        let mut map = self.entitlements.write();
        map.entry(user_id.to_string()).or_insert_with(|| Entitlement::default_for(user_id)).clone()
    }

    /// Reject reasons: expired, inactive. `None` means the entitlement permits starting,
    /// subject to the caller separately checking the running-worker count against `max_workers`.
    pub fn check_startable(&self, user_id: &str) -> Result<Entitlement, String> {
        let entitlement = self.resolve(user_id);
        if !entitlement.is_active {
            return Err("entitlement is inactive".to_string());
        }
        if entitlement.is_expired(Utc::now()) {
            return Err("entitlement has expired".to_string());
        }
        Ok(entitlement)
    }

    /// Periodic sweep: flip expired non-lifetime entitlements to
    /// `{tier: free, isActive: false}`. Returns the affected user ids.
    pub fn downgrade_sweep(&self) -> Vec<String> {
        let now = Utc::now();
        let mut affected = Vec::new();
        let mut map = self.entitlements.write();
        for entitlement in map.values_mut() {
            if entitlement.expires_at.is_some() && entitlement.is_expired(now) && entitlement.is_active {
                entitlement.tier = Tier::Free;
                entitlement.max_workers = Tier::Free.max_workers();
                entitlement.is_active = false;
                affected.push(entitlement.user_id.clone());
            }
        }
        if !affected.is_empty() {
            info!(?affected, "downgraded expired entitlements to free tier");
        }
        affected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn unknown_user_resolves_to_free_tier_default() {
        let store = EntitlementStore::new(&EntitlementCfg::default());
        let e = store.resolve("new-user");
        assert_eq!(e.tier, Tier::Free);
        assert_eq!(e.max_workers, 1);
    }

    #[test]
    fn expired_entitlement_is_rejected() {
        let store = EntitlementStore::new(&EntitlementCfg::default());
        {
            let mut map = store.entitlements.write();
            let mut e = Entitlement::default_for("u1");
            e.expires_at = Some(Utc::now() - Duration::hours(1));
            map.insert("u1".to_string(), e);
        }
        assert!(store.check_startable("u1").is_err());
    }

    #[test]
    fn downgrade_sweep_flips_expired_entitlements_to_free() {
        let store = EntitlementStore::new(&EntitlementCfg::default());
        {
            let mut map = store.entitlements.write();
            let mut e = Entitlement::default_for("u1");
            e.tier = Tier::Pro;
            e.max_workers = Tier::Pro.max_workers();
            e.expires_at = Some(Utc::now() - Duration::hours(1));
            map.insert("u1".to_string(), e);
        }
        let affected = store.downgrade_sweep();
        assert_eq!(affected, vec!["u1".to_string()]);
        let after = store.resolve("u1");
        assert_eq!(after.tier, Tier::Free);
        assert!(!after.is_active);
    }

    #[test]
    fn lifetime_entitlement_with_no_expiry_is_never_swept() {
        let store = EntitlementStore::new(&EntitlementCfg::default());
        store.resolve("u1");
        let affected = store.downgrade_sweep();
        assert!(affected.is_empty());
    }
}

use crate::limiter::identity::Identity;
use crate::limiter::policy::Policy;
use dashmap::DashMap;
use std::collections::HashMap;

/// Read-only lookup from request credentials to (identity, policy).
///
/// Built once at startup from configuration. Token policies take strict
/// precedence over the default IP policy: a request carrying a known API
/// key is limited as that token, everything else is limited as its IP.
pub struct PolicyRegistry {
    ip_policy: Policy,
    token_policies: DashMap<String, Policy>,
}

impl PolicyRegistry {
    pub fn new(ip_policy: Policy, token_policies: HashMap<String, Policy>) -> Self {
        let map = DashMap::new();
        for (token, policy) in token_policies {
            map.insert(token, policy);
        }
        Self {
            ip_policy,
            token_policies: map,
        }
    }

    /// The default policy applied to IP identities.
    pub fn ip_policy(&self) -> Policy {
        self.ip_policy
    }

    /// The policy registered for `token`, if any.
    pub fn token_policy(&self, token: &str) -> Option<Policy> {
        self.token_policies.get(token).map(|entry| *entry.value())
    }

    pub fn token_count(&self) -> usize {
        self.token_policies.len()
    }

    /// Maps raw request inputs to the identity and policy to enforce.
    ///
    /// An unknown API key does NOT fall back to a token identity with the
    /// default policy; it falls back to the IP identity with the IP policy,
    /// so an identity is always chosen together with its policy.
    pub fn resolve(&self, client_ip: &str, api_key: &str) -> (Identity, Policy) {
        if !api_key.is_empty() {
            if let Some(policy) = self.token_policy(api_key) {
                return (Identity::token(api_key), policy);
            }
        }
        (Identity::ip(client_ip), self.ip_policy)
    }
}

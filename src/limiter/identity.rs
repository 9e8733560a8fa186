use std::fmt;

/// What a rate-limit subject is identified by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentityKind {
    /// Client IP address.
    Ip,
    /// Opaque API key from the `API_KEY` header.
    Token,
}

impl IdentityKind {
    /// Stable label used in storage keys, logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityKind::Ip => "ip",
            IdentityKind::Token => "token",
        }
    }
}

impl fmt::Display for IdentityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The (kind, value) pair naming a rate-limit subject.
///
/// All shared state for an identity lives under its [`storage_key`]
/// namespace, so two identities collide iff both fields match.
///
/// [`storage_key`]: Identity::storage_key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    kind: IdentityKind,
    value: String,
}

impl Identity {
    /// Creates an IP-based identity.
    pub fn ip(value: impl Into<String>) -> Self {
        Self {
            kind: IdentityKind::Ip,
            value: value.into(),
        }
    }

    /// Creates a token-based identity.
    pub fn token(value: impl Into<String>) -> Self {
        Self {
            kind: IdentityKind::Token,
            value: value.into(),
        }
    }

    pub fn kind(&self) -> IdentityKind {
        self.kind
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// An identity with an empty value must be rejected before it
    /// reaches the store.
    pub fn is_valid(&self) -> bool {
        !self.value.is_empty()
    }

    /// Canonical namespace prefix for this identity's shared state,
    /// e.g. `rate_limit:ip:192.168.1.1`.
    pub fn storage_key(&self) -> String {
        format!("rate_limit:{}:{}", self.kind, self.value)
    }
}

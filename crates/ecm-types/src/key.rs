use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::id::ProviderId;

/// Managed blob key as persisted in document properties.
///
/// The wire format is `providerId:backendKey`. The first colon is the only
/// delimiter; the backend key may itself contain colons. Keys written before
/// any dispatcher was configured carry no prefix and are resolved through a
/// default provider at read time.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlobKey {
    provider: Option<ProviderId>,
    backend_key: String,
}

impl BlobKey {
    /// A key qualified with the provider that stores it.
    pub fn prefixed(provider: ProviderId, backend_key: impl Into<String>) -> Self {
        Self {
            provider: Some(provider),
            backend_key: backend_key.into(),
        }
    }

    /// A bare legacy key.
    pub fn unprefixed(backend_key: impl Into<String>) -> Self {
        Self {
            provider: None,
            backend_key: backend_key.into(),
        }
    }

    /// Parse the wire format.
    pub fn parse(s: &str) -> Result<Self, TypeError> {
        if s.is_empty() {
            return Err(TypeError::InvalidBlobKey(s.to_string()));
        }
        match s.split_once(':') {
            None => Ok(Self::unprefixed(s)),
            Some((prefix, rest)) => {
                if rest.is_empty() {
                    return Err(TypeError::InvalidBlobKey(s.to_string()));
                }
                let provider =
                    ProviderId::new(prefix).map_err(|_| TypeError::InvalidBlobKey(s.to_string()))?;
                Ok(Self::prefixed(provider, rest))
            }
        }
    }

    /// The provider prefix, if any.
    pub fn provider(&self) -> Option<&ProviderId> {
        self.provider.as_ref()
    }

    /// The key inside the provider's backing store.
    pub fn backend_key(&self) -> &str {
        &self.backend_key
    }

    /// Returns `true` for keys without a provider prefix.
    pub fn is_legacy(&self) -> bool {
        self.provider.is_none()
    }
}

impl FromStr for BlobKey {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for BlobKey {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<BlobKey> for String {
    fn from(key: BlobKey) -> Self {
        key.to_string()
    }
}

impl fmt::Debug for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobKey({self})")
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.provider {
            Some(provider) => write!(f, "{provider}:{}", self.backend_key),
            None => f.write_str(&self.backend_key),
        }
    }
}

//! Driver Registry
//!
//! Filled once by an explicit registration phase at startup, then frozen.
//! Lookups on the frozen registry take no locks.

use crate::domain::ports::ResourceKind;
use crate::drivers::guest::{GuestDriver, GuestDriverRef};
use crate::drivers::provider::{ProviderDriver, ProviderDriverRef};
use crate::error::{Error, Result};
use indexmap::IndexMap;
use std::sync::Arc;
use tracing::info;

/// Driver resolved for a (resource kind, provider) pair
#[derive(Clone)]
pub enum DriverRef {
    Guest(GuestDriverRef),
    Provider(ProviderDriverRef),
}

impl DriverRef {
    pub fn provider(&self) -> &'static str {
        match self {
            DriverRef::Guest(d) => d.provider(),
            DriverRef::Provider(d) => d.provider(),
        }
    }

    /// Identity check, used to verify lookups are stable
    pub fn same_instance(&self, other: &DriverRef) -> bool {
        match (self, other) {
            (DriverRef::Guest(a), DriverRef::Guest(b)) => Arc::ptr_eq(a, b),
            (DriverRef::Provider(a), DriverRef::Provider(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl std::fmt::Debug for DriverRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverRef::Guest(d) => write!(f, "GuestDriver({})", d.provider()),
            DriverRef::Provider(d) => write!(f, "ProviderDriver({})", d.provider()),
        }
    }
}

/// Registration phase of the registry
#[derive(Default)]
pub struct DriverRegistryBuilder {
    guests: IndexMap<&'static str, GuestDriverRef>,
    providers: IndexMap<&'static str, ProviderDriverRef>,
}

impl DriverRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a guest driver; a second driver for the same provider panics
    pub fn register_guest_driver(&mut self, driver: Arc<dyn GuestDriver>) -> &mut Self {
        let key = driver.provider();
        if self.guests.contains_key(key) {
            panic!("guest driver for provider {} registered twice", key);
        }
        info!(provider = key, "Registered guest driver");
        self.guests.insert(key, driver);
        self
    }

    /// Register a cloud-account driver; a second driver for the same provider panics
    pub fn register_provider_driver(&mut self, driver: Arc<dyn ProviderDriver>) -> &mut Self {
        let key = driver.provider();
        if self.providers.contains_key(key) {
            panic!("provider driver for provider {} registered twice", key);
        }
        info!(provider = key, "Registered provider driver");
        self.providers.insert(key, driver);
        self
    }

    pub fn build(self) -> Arc<DriverRegistry> {
        Arc::new(DriverRegistry {
            guests: self.guests,
            providers: self.providers,
        })
    }
}

/// Frozen mapping from (resource kind, provider) to driver
pub struct DriverRegistry {
    guests: IndexMap<&'static str, GuestDriverRef>,
    providers: IndexMap<&'static str, ProviderDriverRef>,
}

pub type DriverRegistryRef = Arc<DriverRegistry>;

impl DriverRegistry {
    pub fn builder() -> DriverRegistryBuilder {
        DriverRegistryBuilder::new()
    }

    pub fn guest_driver(&self, provider: &str) -> Result<GuestDriverRef> {
        self.guests
            .get(provider)
            .cloned()
            .ok_or_else(|| Error::DriverNotFound {
                resource: ResourceKind::Guest.to_string(),
                provider: provider.to_string(),
            })
    }

    pub fn provider_driver(&self, provider: &str) -> Result<ProviderDriverRef> {
        self.providers
            .get(provider)
            .cloned()
            .ok_or_else(|| Error::DriverNotFound {
                resource: ResourceKind::CloudAccount.to_string(),
                provider: provider.to_string(),
            })
    }

    /// Guests and disks are served by guest drivers, cloud accounts by
    /// provider drivers; hosts have no driver
    pub fn resolve(&self, kind: ResourceKind, provider: &str) -> Result<DriverRef> {
        match kind {
            ResourceKind::Guest | ResourceKind::Disk => {
                self.guest_driver(provider).map(DriverRef::Guest)
            }
            ResourceKind::CloudAccount => self.provider_driver(provider).map(DriverRef::Provider),
            ResourceKind::Host => Err(Error::DriverNotFound {
                resource: kind.to_string(),
                provider: provider.to_string(),
            }),
        }
    }

    /// Registered (resource kind, provider) pairs in registration order
    pub fn registered(&self) -> Vec<(ResourceKind, &'static str)> {
        self.guests
            .keys()
            .map(|p| (ResourceKind::Guest, *p))
            .chain(self.providers.keys().map(|p| (ResourceKind::CloudAccount, *p)))
            .collect()
    }
}

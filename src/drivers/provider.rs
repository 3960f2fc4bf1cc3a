//! Cloud Account Capability Driver
//!
//! Identity-side operations of a provider (cloud users, SAML federation).

use crate::domain::ports::Credential;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Provider-specific cloud-account operations
#[async_trait]
pub trait ProviderDriver: Send + Sync {
    /// Registry key
    fn provider(&self) -> &'static str;

    fn is_support_saml_auth(&self) -> bool {
        false
    }

    /// Mirror the provider's cloud users into the local directory
    async fn request_sync_cloud_users(&self, _credential: &Credential, _account_id: &str) -> Result<()> {
        Err(Error::not_implemented(self.provider(), "request_sync_cloud_users"))
    }
}

pub type ProviderDriverRef = Arc<dyn ProviderDriver>;

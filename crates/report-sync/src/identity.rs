//! Identity resolution with anonymous fallback.
//!
//! The identity collaborator may be missing or failing (signed-out session,
//! auth backend down). Resolution never fails: the service falls back to an
//! anonymous identity that is unique to this process and stable for its
//! lifetime.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::ANONYMOUS_DISPLAY_NAME;
use crate::errors::Result;
use crate::utils::lock;

/// The acting user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: String,
    pub display_name: Option<String>,
    pub anonymous: bool,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, display_name: Option<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name,
            anonymous: false,
        }
    }

    /// Synthesizes a locally-unique anonymous identity.
    pub fn anonymous() -> Self {
        Self {
            user_id: format!("anonymous-{}", Uuid::new_v4()),
            display_name: Some(ANONYMOUS_DISPLAY_NAME.to_string()),
            anonymous: true,
        }
    }
}

/// Trait for the external identity collaborator.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn current_user_id(&self) -> Result<String>;

    async fn current_display_name(&self) -> Result<Option<String>> {
        Ok(None)
    }
}

pub(crate) struct IdentityService {
    resolver: Option<Arc<dyn IdentityResolver>>,
    anonymous: Identity,
    last_resolved: Mutex<Option<Identity>>,
}

impl IdentityService {
    pub fn new(resolver: Option<Arc<dyn IdentityResolver>>) -> Self {
        Self {
            resolver,
            anonymous: Identity::anonymous(),
            last_resolved: Mutex::new(None),
        }
    }

    /// Resolves the acting identity, falling back to the anonymous one.
    pub async fn resolve(&self) -> Identity {
        let identity = match &self.resolver {
            Some(resolver) => match resolver.current_user_id().await {
                Ok(user_id) => {
                    let display_name = resolver.current_display_name().await.unwrap_or_else(|e| {
                        debug!("Display name unavailable: {}", e);
                        None
                    });
                    Identity::new(user_id, display_name)
                }
                Err(e) => {
                    debug!("Using anonymous identity: {}", e);
                    self.anonymous.clone()
                }
            },
            None => self.anonymous.clone(),
        };

        *lock(&self.last_resolved) = Some(identity.clone());
        identity
    }

    /// Most recently resolved identity, if any resolution has completed.
    pub fn cached(&self) -> Option<Identity> {
        lock(&self.last_resolved).clone()
    }
}

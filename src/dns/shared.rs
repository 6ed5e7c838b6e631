use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use hickory_proto::op::{Message, Query};
use tracing::{info, warn};

use super::{LookupIps, LookupOptions, Resolver};
use crate::error::DnsError;

/// A swappable resolver slot.
///
/// Holders keep one `Arc<SharedResolver>` while the instance behind it is
/// replaced on reload. Serves as the bootstrap resolver handed to dialers.
pub struct SharedResolver {
    name: String,
    current: ArcSwapOption<Box<dyn Resolver>>,
}

impl SharedResolver {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            current: ArcSwapOption::empty(),
        }
    }

    /// Installs the result of a rebuild. A failed build keeps the previous
    /// instance, if any.
    pub fn update<R>(&self, built: Result<R, DnsError>)
    where
        R: Resolver + 'static,
    {
        match built {
            Ok(resolver) => {
                let previous = self.current.swap(Some(Arc::new(Box::new(resolver))));
                info!(target = "dns", resolver = %self.name, "resolver updated");
                if let Some(previous) = previous {
                    tokio::spawn(async move {
                        let _ = previous.close().await;
                    });
                }
            }
            Err(e) if self.current.load().is_some() => {
                warn!(target = "dns", resolver = %self.name, error = %e, "rebuild failed, keep previous resolver");
            }
            Err(e) => {
                warn!(target = "dns", resolver = %self.name, error = %e, "resolver unavailable");
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        self.current.load().is_some()
    }

    fn get(&self) -> Result<Arc<Box<dyn Resolver>>, DnsError> {
        self.current.load_full().ok_or_else(|| DnsError::Uninitialized {
            name: self.name.clone(),
        })
    }
}

#[async_trait]
impl Resolver for SharedResolver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn lookup_ip(&self, domain: &str, opts: &LookupOptions) -> Result<LookupIps, DnsError> {
        self.get()?.lookup_ip(domain, opts).await
    }

    async fn raw(&self, question: &Query) -> Result<Message, DnsError> {
        self.get()?.raw(question).await
    }

    async fn close(&self) -> Result<(), DnsError> {
        match self.current.swap(None) {
            Some(r) => r.close().await,
            None => Ok(()),
        }
    }
}

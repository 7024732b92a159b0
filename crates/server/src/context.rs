use std::sync::Arc;

use srs::{DomainTrie, Srs};

/// Everything a connection task needs to answer a rewrite request. Cheap to
/// clone (everything inside is already `Arc`); each accepted connection gets
/// its own clone rather than sharing a lock, since request handling never
/// mutates any of this state.
#[derive(Clone)]
pub struct Context {
    pub srs: Arc<Srs>,
    pub srs_domain: Arc<str>,
    pub local_domains: Arc<DomainTrie>,
    /// `Some` when `original-envelope = database`; each connection opens its
    /// own store handle from this URI rather than sharing one, matching the
    /// "one alias-store connection per worker" concurrency model.
    pub store_uri: Option<Arc<str>>,
}

impl Context {
    pub async fn open_store(&self) -> Option<Box<dyn store::AliasStore>> {
        let uri = self.store_uri.as_ref()?;
        match store::connect(uri).await {
            Ok(store) => Some(store),
            Err(e) => {
                trc::log(
                    trc::Level::Error,
                    trc::Event::StoreError {
                        backend: "alias-store",
                        error: e.to_string(),
                    },
                );
                None
            }
        }
    }

    pub fn now(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

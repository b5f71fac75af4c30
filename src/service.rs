//! Request-level entry point: validate, reconcile in one transaction, respond.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use crate::config::ServiceConfig;
use crate::error::{ReconcileError, ReconcileResult};
use crate::request::IdentifyRequest;
use crate::resolver::{ClusterResolver, ContactKey, ResolvedCluster};
use crate::response::{build_response, IdentifyResponse};
use crate::storage::ContactStore;

/// Cooperative cancellation flag shared between a caller and a running request.
///
/// Checked once, after the resolver finishes and before commit.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Identity reconciliation over a shared [`ContactStore`].
#[derive(Clone)]
pub struct IdentityService {
    store: Arc<dyn ContactStore>,
    resolver: ClusterResolver,
    config: ServiceConfig,
}

impl IdentityService {
    /// Create a service with the default configuration.
    #[must_use]
    pub fn new(store: Arc<dyn ContactStore>) -> Self {
        Self {
            store,
            resolver: ClusterResolver::new(),
            config: ServiceConfig::default(),
        }
    }

    /// Create a service with an explicit configuration.
    #[must_use]
    pub fn with_config(store: Arc<dyn ContactStore>, config: ServiceConfig) -> Self {
        Self {
            store,
            resolver: ClusterResolver::new(),
            config,
        }
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ContactStore> {
        &self.store
    }

    #[must_use]
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Reconcile one request and return the merged identity.
    pub fn identify(&self, request: IdentifyRequest) -> ReconcileResult<IdentifyResponse> {
        self.identify_with_cancel(request, &Cancellation::new())
    }

    /// Like [`identify`](Self::identify), but rolls back and returns
    /// [`ReconcileError::Cancelled`] if `cancel` fires before commit.
    pub fn identify_with_cancel(
        &self,
        request: IdentifyRequest,
        cancel: &Cancellation,
    ) -> ReconcileResult<IdentifyResponse> {
        let request_id = Uuid::new_v4();
        let span = info_span!("identify", %request_id);
        let _enter = span.enter();

        let key = request.into_key(&self.config).map_err(|e| {
            debug!(error = %e, "rejected identify request");
            ReconcileError::from(e)
        })?;

        let cluster = self.reconcile(&key, cancel)?;
        Ok(build_response(&cluster.primary, &cluster.secondaries).into())
    }

    /// Run the resolver for an already-validated key and commit the result.
    pub fn reconcile(
        &self,
        key: &ContactKey,
        cancel: &Cancellation,
    ) -> ReconcileResult<ResolvedCluster> {
        let mut tx = self.store.begin()?;

        let cluster = match self.resolver.reconcile(tx.as_mut(), key) {
            Ok(cluster) => cluster,
            Err(e) => {
                warn!(error = %e, "reconciliation failed, rolling back");
                return Err(e);
            }
        };

        if cancel.is_cancelled() {
            warn!("request cancelled before commit, rolling back");
            return Err(ReconcileError::Cancelled);
        }

        if let Err(e) = tx.commit() {
            warn!(error = %e, "commit failed");
            return Err(e.into());
        }

        info!(
            primary = %cluster.primary.id,
            secondaries = cluster.secondaries.len(),
            merged = cluster.outcome.merged(),
            "identity reconciled"
        );
        Ok(cluster)
    }
}

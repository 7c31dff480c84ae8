use std::sync::Arc;

use crate::controller::status::StatusManager;
use crate::health::HealthState;
use crate::provider::DatabaseProvider;
use crate::resources::DependentReconciler;
use crate::store::DatabaseStore;

/// Shared context for the controller
#[derive(Clone)]
pub struct Context {
    /// The single provider this process drives
    pub provider: Arc<dyn DatabaseProvider>,
    /// Create-or-update of the ConfigMap and Service
    pub dependents: DependentReconciler,
    /// Status writes
    pub status: StatusManager,
    /// Health state for metrics (optional)
    pub health_state: Option<Arc<HealthState>>,
}

impl Context {
    pub fn new(
        databases: Arc<dyn DatabaseStore>,
        provider: Arc<dyn DatabaseProvider>,
        dependents: DependentReconciler,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        Self {
            provider,
            dependents,
            status: StatusManager::new(databases),
            health_state,
        }
    }
}

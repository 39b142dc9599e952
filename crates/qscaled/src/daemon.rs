//! Subsystem assembly.

use std::sync::Arc;

use tracing::info;

use qscale_autoscale::Controller;
use qscale_broker::{BrokerConnector, BrokerProvider, BrokerRegistry, SecretResolver};
use qscale_rightsize::RightSizer;
use qscale_state::StateStore;

use crate::config::DaemonConfig;

/// Build the controller over `store`, connecting to brokers through `connector`.
pub fn assemble(
    config: &DaemonConfig,
    store: StateStore,
    connector: Arc<dyn BrokerConnector>,
) -> anyhow::Result<Arc<Controller>> {
    let store = Arc::new(store);

    let resolver = Arc::new(SecretResolver::new(store.clone()));
    let registry = Arc::new(BrokerRegistry::new(config.broker.failure_threshold));
    let brokers = Arc::new(BrokerProvider::new(
        store.clone(),
        resolver,
        registry,
        connector,
    ));
    info!(
        failure_threshold = config.broker.failure_threshold,
        "broker provider initialized"
    );

    let sizing = config.right_sizing();
    info!(
        threshold_percent = sizing.threshold_percent,
        oom_step_percent = sizing.oom_step_percent,
        "right-sizer initialized"
    );
    let sizer = Arc::new(RightSizer::new(store.clone(), sizing));

    let controller = Controller::new(
        store,
        brokers,
        sizer,
        config.reconciler()?,
        config.controller()?,
    );
    Ok(Arc::new(controller))
}

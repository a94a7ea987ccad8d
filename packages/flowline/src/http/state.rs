use std::sync::Arc;

use utils::telemetry::HttpMetrics;

use crate::{config::Config, dispatcher::Dispatcher, health::SharedHealthStatus};

#[derive(Clone)]
pub struct HttpState {
    pub config: Config,
    pub dispatcher: Arc<Dispatcher>,
    pub metrics: HttpMetrics,
    pub health_status: SharedHealthStatus,
}

impl HttpState {
    pub fn new(config: Config, dispatcher: Arc<Dispatcher>, metrics: HttpMetrics) -> Self {
        let health_status = dispatcher.health.clone();
        Self {
            config,
            dispatcher,
            metrics,
            health_status,
        }
    }
}

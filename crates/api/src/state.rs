//! Application state

use credmarket_billing::BillingService;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub billing: BillingService,
}

impl AppState {
    pub fn new(config: Config, billing: BillingService) -> Self {
        Self { config, billing }
    }
}

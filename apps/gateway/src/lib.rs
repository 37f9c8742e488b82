pub mod config;
pub mod error;
pub mod gateway;
pub mod routes;
pub mod store;

use std::sync::Arc;

use config::Config;
use gateway::Gateway;
use store::{AuthProvider, PersistenceStore};

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub gateway: Arc<Gateway>,
}

impl AppState {
    pub fn new(
        config: Config,
        auth: Arc<dyn AuthProvider>,
        store: Arc<dyn PersistenceStore>,
    ) -> Self {
        let config = Arc::new(config);
        let gateway = Arc::new(Gateway::new(config.clone(), auth, store));
        Self { config, gateway }
    }
}

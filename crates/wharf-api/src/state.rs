use std::sync::Arc;

use wharf_env::ServerCollection;

use crate::config::AppConfig;
use crate::dispatcher::PowerDispatcher;

#[derive(Clone)]
pub struct AppState {
    pub servers: ServerCollection,
    pub config: Arc<AppConfig>,
    pub dispatcher: PowerDispatcher,
}

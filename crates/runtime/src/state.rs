//! Shared state handed to all HTTP handlers.

use std::sync::Arc;

use tm_domain::Config;

use crate::sessions::SessionManager;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: Arc<SessionManager>,
}

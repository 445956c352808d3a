//! Shared agent state handed to every handler.

use std::sync::Arc;

use crate::aggregator::SnapshotCache;
use crate::hub::HubHandle;
use crate::providers::connections::ConnectionTable;
use crate::session::Gate;

#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    // Memoized snapshot JSON for /api/metrics and /api/export
    pub snapshots: Arc<SnapshotCache>,
    pub gate: Arc<Gate>,
    pub connections: Arc<ConnectionTable>,

    pub theme: Arc<str>,
    pub secure_cookies: bool,
    pub trust_proxy_headers: bool,
}

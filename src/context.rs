//! Process-wide state threaded into the supervisor and sessions.

use std::sync::Arc;

use xvp_backend::BackendFactory;
use xvp_config::Config;

/// Everything a session needs from its surroundings, snapshotted at
/// spawn time.  Reload builds a fresh context; running sessions keep
/// the one they started with.
pub struct ProxyContext {
    pub config: Arc<Config>,
    /// Seconds to wait before reconnecting after console loss; zero or
    /// negative means wait that long and then give up.
    pub reconnect_delay: i64,
    /// Packet-trace logging (additionally gated on verbose logging).
    pub trace: bool,
    pub factory: Arc<dyn BackendFactory>,
}

impl ProxyContext {
    /// The same policy knobs with a different configuration graph.
    pub fn with_config(&self, config: Config) -> Self {
        Self {
            config: Arc::new(config),
            reconnect_delay: self.reconnect_delay,
            trace: self.trace,
            factory: self.factory.clone(),
        }
    }
}

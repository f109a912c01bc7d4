//! Liveness monitor
//!
//! A once-per-second tick asking the registry owner to sweep heartbeat
//! deadlines: one warning at the soft timeout, eviction (reason `timeout`)
//! at the hard timeout. Only explicit `heartbeat` records count as
//! liveness; media traffic does not keep a participant alive.

use std::time::Duration;

use crate::registry::store::RegistryHandle;

/// Spawn the liveness ticker. Ends on its own once the registry is gone;
/// aborted at shutdown otherwise.
pub(crate) fn spawn(registry: RegistryHandle) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if registry.sweep_stale().await.is_err() {
                break;
            }
        }
    })
}

use crate::launch::{LaunchTarget, Liveness};
use crate::settings::Settings;
use crate::supervisor::{HandleTable, RuntimeHandle, Slot};

/// Keeps the handle table honest against what the OS reports.
#[derive(Debug, Clone)]
pub struct StatusReconciler {
    settings: Settings,
    table: HandleTable,
}

impl StatusReconciler {
    pub(crate) fn new(settings: Settings, table: HandleTable) -> Self {
        Self { settings, table }
    }

    /// Probes every live handle and drops the ones that are gone.
    /// Returns the names that were pruned.
    pub async fn reconcile(&self) -> Vec<String> {
        let snapshot: Vec<(String, u64, LaunchTarget)> = {
            let table = self.table.lock().await;
            table
                .iter()
                .filter_map(|(name, slot)| match slot {
                    Slot::Live(h) => Some((name.clone(), h.launch_id, h.target.clone())),
                    _ => None,
                })
                .collect()
        };
        if snapshot.is_empty() {
            return Vec::new();
        }

        // Probes may shell out; the table lock is not held across them.
        let mut dead = Vec::new();
        for (name, launch_id, target) in snapshot {
            let liveness = target.is_alive(&self.settings).await;
            if liveness == Liveness::Unknown {
                tracing::debug!(instance = %name, target = %target.describe(), "liveness unknown; keeping handle");
            }
            if !liveness.counts_as_alive() {
                dead.push((name, launch_id));
            }
        }

        let mut removed: Vec<(String, RuntimeHandle)> = Vec::new();
        {
            let mut table = self.table.lock().await;
            for (name, launch_id) in dead {
                // A relaunch between probe and removal owns the slot now.
                let current = matches!(table.get(&name), Some(Slot::Live(h)) if h.launch_id == launch_id);
                if current && let Some(Slot::Live(h)) = table.remove(&name) {
                    removed.push((name, h));
                }
            }
        }

        let mut names = Vec::with_capacity(removed.len());
        for (name, handle) in removed {
            if let Some(log) = &handle.log {
                log.close().await;
            }
            tracing::info!(instance = %name, target = %handle.target.describe(), "pruned stale handle");
            names.push(name);
        }
        names
    }
}

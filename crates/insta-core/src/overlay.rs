use insta_runtime::ContainerStatus;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tracing::debug;

/// A mutation that has been issued but may not be visible in the backend yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transition {
    Starting,
    Stopping,
}

impl Transition {
    /// Status reported while the transition is pending.
    pub fn status(self) -> ContainerStatus {
        match self {
            Self::Starting => ContainerStatus::Starting,
            Self::Stopping => ContainerStatus::Stopped,
        }
    }

    /// Whether `observed` shows the backend has caught up. `confirmed` is set
    /// when the observation was taken after the mutation returned; before
    /// that an exited or failed container is still its pre-start state.
    pub fn settled_by(self, observed: ContainerStatus, confirmed: bool) -> bool {
        match self {
            Self::Starting => {
                observed.is_running()
                    || observed == ContainerStatus::Starting
                    || (confirmed
                        && matches!(observed, ContainerStatus::Completed | ContainerStatus::Error))
            }
            Self::Stopping => observed.is_inactive(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pending {
    transition: Transition,
    /// Status epoch from which observations postdate the mutation.
    landed_at: Option<u64>,
}

/// Pending transitions by container identity. Takes precedence over polled
/// status until the backend reports a state that settles it, or until the
/// next mutation replaces it.
#[derive(Debug, Default)]
pub struct PendingTransitions {
    entries: RwLock<HashMap<String, Pending>>,
}

impl PendingTransitions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, container: &str, transition: Transition) {
        debug!("{container}: pending {transition:?}");
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                container.to_owned(),
                Pending {
                    transition,
                    landed_at: None,
                },
            );
    }

    /// Record that the backend call behind `transition` returned, so that
    /// observations from `epoch` on reflect it.
    pub fn land(&self, container: &str, transition: Transition, epoch: u64) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(pending) = entries.get_mut(container) {
            if pending.transition == transition && pending.landed_at.is_none() {
                pending.landed_at = Some(epoch);
            }
        }
    }

    pub fn clear(&self, container: &str) -> Option<Transition> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(container)
            .map(|p| p.transition)
    }

    pub fn get(&self, container: &str) -> Option<Transition> {
        self.entry(container).map(|p| p.transition)
    }

    fn entry(&self, container: &str) -> Option<Pending> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(container)
            .copied()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Combine a pending transition with what the backend reported in status
    /// epoch `observed_at`. A settled transition is cleared and the observed
    /// status returned.
    pub fn resolve(
        &self,
        container: &str,
        observed: ContainerStatus,
        observed_at: u64,
    ) -> ContainerStatus {
        let Some(pending) = self.entry(container) else {
            return observed;
        };
        let confirmed = pending.landed_at.is_some_and(|landed| observed_at >= landed);
        if pending.transition.settled_by(observed, confirmed) {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            // Only clear if no newer mutation replaced it meanwhile.
            if entries.get(container) == Some(&pending) {
                entries.remove(container);
                debug!("{container}: {:?} settled as {observed}", pending.transition);
            }
            observed
        } else {
            pending.transition.status()
        }
    }
}

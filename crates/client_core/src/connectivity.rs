use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone)]
pub struct Connectivity {
    online: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (online, _) = watch::channel(online);
        Self {
            online: Arc::new(online),
        }
    }

    pub fn online() -> Self {
        Self::new(true)
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Observers are only woken on an actual transition.
    pub fn set_online(&self, online: bool) {
        let changed = self.online.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });
        if changed {
            info!(online, "connectivity: changed");
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::online()
    }
}

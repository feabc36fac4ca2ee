//! Online/offline gate.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Process-wide connectivity state, fed by the host's network-status events.
///
/// Clones share the same state. Only real transitions notify listeners.
#[derive(Debug, Clone)]
pub struct Connectivity {
  tx: Arc<watch::Sender<bool>>,
}

impl Default for Connectivity {
  fn default() -> Self {
    Self::new(true)
  }
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    let (tx, _rx) = watch::channel(online);
    Self { tx: Arc::new(tx) }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Record the current network state. Returns `true` if it changed.
  pub fn set_online(&self, online: bool) -> bool {
    self.tx.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    })
  }

  /// A receiver that wakes on every transition.
  pub fn watch(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }

  /// Call `listener` with the new state on every transition.
  ///
  /// Abort the returned handle to unsubscribe. Must be called within a Tokio
  /// runtime.
  pub fn subscribe<F>(&self, listener: F) -> JoinHandle<()>
  where
    F: Fn(bool) + Send + 'static,
  {
    let mut rx = self.watch();
    tokio::spawn(async move {
      while rx.changed().await.is_ok() {
        let online = *rx.borrow_and_update();
        listener(online);
      }
    })
  }
}

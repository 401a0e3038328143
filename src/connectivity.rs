//! Connectivity monitor driving when the sync queue is flushed.

use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::cache::{CacheManager, ConfigPatch};

/// Platform signals the monitor reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
  /// Network became reachable
  Online,
  /// Network went away
  Offline,
  /// The host is shutting down; persist and stop
  Unload,
}

/// Watches connectivity and runs the periodic queue flush.
pub struct ConnectivityMonitor {
  cache: CacheManager,
  probe_offline: bool,
}

/// Running monitor task.
pub struct MonitorHandle {
  events: mpsc::UnboundedSender<ConnectivityEvent>,
  online: watch::Receiver<bool>,
  task: JoinHandle<()>,
}

impl MonitorHandle {
  /// Report an event. Returns `false` once the monitor has stopped.
  pub fn notify(&self, event: ConnectivityEvent) -> bool {
    self.events.send(event).is_ok()
  }

  /// Receiver tracking whether the cache is online, updated after each
  /// transition has been fully handled.
  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.online.clone()
  }

  /// Send [`ConnectivityEvent::Unload`] and wait for the monitor to stop.
  pub async fn shutdown(self) {
    let _ = self.events.send(ConnectivityEvent::Unload);
    let _ = self.task.await;
  }
}

impl ConnectivityMonitor {
  pub fn new(cache: CacheManager) -> Self {
    Self {
      cache,
      probe_offline: true,
    }
  }

  /// Whether to ping the remote on each tick while offline.
  pub fn with_probe(mut self, probe_offline: bool) -> Self {
    self.probe_offline = probe_offline;
    self
  }

  pub fn spawn(self) -> MonitorHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let (online_tx, online_rx) = watch::channel(self.cache.is_online());
    let task = tokio::spawn(self.run(rx, online_tx));

    MonitorHandle {
      events: tx,
      online: online_rx,
      task,
    }
  }

  async fn run(
    self,
    mut events: mpsc::UnboundedReceiver<ConnectivityEvent>,
    online: watch::Sender<bool>,
  ) {
    let mut period = self.cache.config().sync_interval;
    let mut ticker = sync_ticker(period);
    // Only go back online by probing if we went offline because of a signal
    let mut offline_by_signal = false;

    loop {
      tokio::select! {
        event = events.recv() => match event {
          Some(ConnectivityEvent::Online) => {
            offline_by_signal = false;
            self.go_online(&online).await;
          }
          Some(ConnectivityEvent::Offline) => {
            offline_by_signal = true;
            self.go_offline(&online);
          }
          Some(ConnectivityEvent::Unload) | None => {
            self.cache.persist_queue();
            debug!("connectivity monitor stopped");
            break;
          }
        },
        _ = ticker.tick() => {
          if self.cache.is_online() {
            self.cache.process_sync_queue().await;
          } else if offline_by_signal && self.probe_offline && self.probe().await {
            offline_by_signal = false;
            self.go_online(&online).await;
          }

          let configured = self.cache.config().sync_interval;
          if configured != period {
            period = configured;
            ticker = sync_ticker(period);
          }
        }
      }
    }
  }

  async fn go_online(&self, online: &watch::Sender<bool>) {
    info!("connection restored, flushing sync queue");
    self.cache.update_config(ConfigPatch {
      offline_mode: Some(false),
      ..Default::default()
    });
    self.cache.set_online(true);
    self.cache.process_sync_queue().await;
    online.send_replace(self.cache.is_online());
  }

  fn go_offline(&self, online: &watch::Sender<bool>) {
    info!("connection lost, switching to offline mode");
    self.cache.set_online(false);
    self.cache.update_config(ConfigPatch {
      offline_mode: Some(true),
      ..Default::default()
    });
    online.send_replace(false);
  }

  async fn probe(&self) -> bool {
    let remote = self.cache.remote();
    if !remote.is_available() {
      return false;
    }
    match remote.ping().await {
      Ok(()) => true,
      Err(e) => {
        debug!(error = %e, "remote still unreachable");
        false
      }
    }
  }
}

/// Interval whose first tick is one full period away.
fn sync_ticker(period: Duration) -> Interval {
  let mut ticker = time::interval_at(Instant::now() + period, period);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
  ticker
}

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument};

use crate::capabilities::ReachabilityProbe;
use crate::config::SyncConfig;
use crate::model::UnixTimeMs;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    pub fn is_online(self) -> bool {
        self == Connectivity::Online
    }

    fn from_reachable(reachable: bool) -> Self {
        if reachable {
            Connectivity::Online
        } else {
            Connectivity::Offline
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivitySnapshot {
    pub state: Connectivity,
    pub changed_at: UnixTimeMs,
}

/// Sole owner of the device's Online/Offline belief.
///
/// Inputs are the platform hint, a periodic reachability probe and explicit
/// failure reports from writers. A failure report holds the state Offline
/// for the configured cooldown; Online observations during the hold are
/// ignored.
pub struct ConnectivityMonitor {
    probe: Arc<dyn ReachabilityProbe>,
    probe_interval: Duration,
    probe_timeout: Duration,
    cooldown: Duration,
    state: watch::Sender<ConnectivitySnapshot>,
    hold_until: Mutex<Option<Instant>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectivityMonitor {
    pub fn new(probe: Arc<dyn ReachabilityProbe>, config: &SyncConfig) -> Self {
        let initial = ConnectivitySnapshot {
            state: Connectivity::from_reachable(config.start_online),
            changed_at: UnixTimeMs::now(),
        };
        Self {
            probe,
            probe_interval: config.probe_interval(),
            probe_timeout: config.probe_timeout(),
            cooldown: config.offline_cooldown(),
            state: watch::channel(initial).0,
            hold_until: Mutex::new(None),
            ticker: Mutex::new(None),
        }
    }

    pub fn state(&self) -> Connectivity {
        self.state.borrow().state
    }

    pub fn is_online(&self) -> bool {
        self.state().is_online()
    }

    pub fn snapshot(&self) -> ConnectivitySnapshot {
        *self.state.borrow()
    }

    /// Every change is published; receivers see the latest snapshot.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivitySnapshot> {
        self.state.subscribe()
    }

    /// A writer saw a network-class failure. Goes Offline now and stays
    /// there for the cooldown.
    pub fn force_offline(&self) {
        if !self.cooldown.is_zero() {
            *lock(&self.hold_until) = Some(Instant::now() + self.cooldown);
        }
        self.transition(Connectivity::Offline, "write failure");
    }

    pub fn is_held_offline(&self) -> bool {
        let mut hold = lock(&self.hold_until);
        match *hold {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                *hold = None;
                false
            }
            None => false,
        }
    }

    /// Platform online/offline event. Only a hint: the probe has the last word.
    pub fn report_platform_signal(&self, online: bool) {
        self.observe(online, "platform");
    }

    /// Runs one reachability probe. A timeout counts as unreachable. Never fails.
    #[instrument(skip(self))]
    pub async fn probe_once(&self) -> Connectivity {
        let reachable = match timeout(self.probe_timeout, self.probe.probe()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!(error = %e, "probe failed");
                false
            }
            Err(_) => {
                debug!(timeout_ms = self.probe_timeout.as_millis() as u64, "probe timed out");
                false
            }
        };
        self.observe(reachable, "probe");
        self.state()
    }

    /// Probes immediately, then once per interval, until `stop` or drop.
    pub fn start(self: &Arc<Self>) {
        let mut ticker = lock(&self.ticker);
        if ticker.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let monitor = Arc::downgrade(self);
        let period = self.probe_interval;
        *ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(monitor) = monitor.upgrade() else {
                    break;
                };
                monitor.probe_once().await;
            }
        }));
        info!(interval_ms = period.as_millis() as u64, "connectivity monitor started");
    }

    pub fn stop(&self) {
        if let Some(task) = lock(&self.ticker).take() {
            task.abort();
            info!("connectivity monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.ticker).as_ref().is_some_and(|t| !t.is_finished())
    }

    fn observe(&self, reachable: bool, source: &'static str) {
        if reachable && self.is_held_offline() {
            debug!(source, "ignoring online observation during offline hold");
            return;
        }
        self.transition(Connectivity::from_reachable(reachable), source);
    }

    fn transition(&self, next: Connectivity, source: &'static str) {
        let changed = self.state.send_if_modified(|snapshot| {
            if snapshot.state == next {
                return false;
            }
            *snapshot = ConnectivitySnapshot {
                state: next,
                changed_at: UnixTimeMs::now(),
            };
            true
        });
        if changed {
            info!(state = ?next, source, "connectivity changed");
        }
    }
}

impl Drop for ConnectivityMonitor {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.ticker).take() {
            task.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::ScriptedProbe;

    fn monitor(probe: Arc<ScriptedProbe>, start_online: bool) -> Arc<ConnectivityMonitor> {
        let config = SyncConfig {
            start_online,
            ..Default::default()
        };
        Arc::new(ConnectivityMonitor::new(probe, &config))
    }

    #[tokio::test]
    async fn test_initial_state_from_config() {
        let probe = Arc::new(ScriptedProbe::new(true));
        assert!(monitor(probe.clone(), true).is_online());
        assert!(!monitor(probe, false).is_online());
    }

    #[tokio::test]
    async fn test_probe_sets_state() {
        let probe = Arc::new(ScriptedProbe::new(false));
        let monitor = monitor(probe.clone(), true);

        assert_eq!(monitor.probe_once().await, Connectivity::Offline);
        probe.set_reachable(true);
        assert_eq!(monitor.probe_once().await, Connectivity::Online);
    }

    #[tokio::test]
    async fn test_changed_at_moves_only_on_transition() {
        let probe = Arc::new(ScriptedProbe::new(true));
        let monitor = monitor(probe, true);
        let initial = monitor.snapshot();

        std::thread::sleep(Duration::from_millis(5));
        monitor.report_platform_signal(false);
        let offline = monitor.snapshot();
        assert_eq!(offline.state, Connectivity::Offline);
        assert!(offline.changed_at > initial.changed_at);

        std::thread::sleep(Duration::from_millis(5));
        monitor.report_platform_signal(false);
        assert_eq!(monitor.snapshot(), offline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout_counts_as_offline() {
        let probe = Arc::new(ScriptedProbe::new(true));
        probe.set_delay(Duration::from_secs(10));
        let monitor = monitor(probe, true);

        assert_eq!(monitor.probe_once().await, Connectivity::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_offline_holds_for_cooldown() {
        let probe = Arc::new(ScriptedProbe::new(true));
        let monitor = monitor(probe, true);

        monitor.force_offline();
        assert!(!monitor.is_online());

        monitor.report_platform_signal(true);
        assert_eq!(monitor.probe_once().await, Connectivity::Offline);

        tokio::time::sleep(Duration::from_millis(20_001)).await;
        assert_eq!(monitor.probe_once().await, Connectivity::Online);
    }

    #[tokio::test]
    async fn test_zero_cooldown_does_not_hold() {
        let config = SyncConfig {
            offline_cooldown_ms: 0,
            ..Default::default()
        };
        let monitor = ConnectivityMonitor::new(Arc::new(ScriptedProbe::new(true)), &config);

        monitor.force_offline();
        assert!(!monitor.is_held_offline());
        monitor.report_platform_signal(true);
        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn test_platform_offline_is_immediate() {
        let monitor = monitor(Arc::new(ScriptedProbe::new(true)), true);
        monitor.report_platform_signal(false);
        assert_eq!(monitor.state(), Connectivity::Offline);
        monitor.report_platform_signal(true);
        assert_eq!(monitor.state(), Connectivity::Online);
    }

    #[tokio::test]
    async fn test_subscribers_see_transitions_only() {
        let monitor = monitor(Arc::new(ScriptedProbe::new(true)), false);
        let mut rx = monitor.subscribe();

        monitor.report_platform_signal(false);
        assert!(!rx.has_changed().unwrap());

        monitor.report_platform_signal(true);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().state, Connectivity::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_probes_immediately_then_on_interval() {
        let probe = Arc::new(ScriptedProbe::new(false));
        let monitor = monitor(probe.clone(), true);

        monitor.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(monitor.state(), Connectivity::Offline);
        assert_eq!(probe.probe_count(), 1);

        probe.set_reachable(true);
        tokio::time::sleep(Duration::from_millis(8_000)).await;
        assert_eq!(monitor.state(), Connectivity::Online);
        assert_eq!(probe.probe_count(), 2);

        monitor.stop();
        assert!(!monitor.is_running());
        tokio::time::sleep(Duration::from_millis(30_000)).await;
        assert_eq!(probe.probe_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_keeps_one_ticker() {
        let probe = Arc::new(ScriptedProbe::new(true));
        let monitor = monitor(probe.clone(), true);

        monitor.start();
        monitor.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(probe.probe_count(), 1);
    }
}

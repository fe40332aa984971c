//! iSCSI self-healing.
//!
//! A periodic task that walks the tracking records of staged block volumes,
//! asks the initiator about each session, and logs back in to sessions that
//! vanished or stayed unhealthy for longer than the stale-session wait.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::host::{HostAgent, IscsiTarget};
use super::tracking::TrackingStore;
use crate::error::PluginError;

/// Outcome of one pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HealReport {
    pub sessions_checked: usize,
    pub targets_healed: usize,
}

/// Stale-session wait actually used: never shorter than the healing interval.
pub fn effective_stale_wait(interval: Duration, stale_wait: Duration) -> Duration {
    if !interval.is_zero() && stale_wait < interval {
        interval.mul_f64(1.5)
    } else {
        stale_wait
    }
}

pub struct SelfHealer {
    host: Arc<dyn HostAgent>,
    tracking: TrackingStore,
    interval: Duration,
    stale_wait: Duration,
    unhealthy_since: Mutex<HashMap<String, Instant>>,
}

impl SelfHealer {
    pub fn new(host: Arc<dyn HostAgent>, tracking: TrackingStore, interval: Duration, stale_wait: Duration) -> Self {
        let effective = effective_stale_wait(interval, stale_wait);
        if effective != stale_wait {
            debug!(
                configured_secs = stale_wait.as_secs(),
                effective_secs = effective.as_secs(),
                "Stale session wait raised to 1.5x the self-healing interval"
            );
        }
        Self {
            host,
            tracking,
            interval,
            stale_wait: effective,
            unhealthy_since: Mutex::new(HashMap::new()),
        }
    }

    pub fn stale_wait(&self) -> Duration {
        self.stale_wait
    }

    /// True when the session should be restored now
    fn is_stale(&self, key: &str, listed: bool, healthy: bool) -> bool {
        let mut since = self.unhealthy_since.lock().unwrap_or_else(PoisonError::into_inner);
        if healthy {
            since.remove(key);
            return false;
        }
        if !listed {
            return true;
        }
        let first_seen = *since.entry(key.to_string()).or_insert_with(Instant::now);
        first_seen.elapsed() >= self.stale_wait
    }

    fn forget(&self, target: &IscsiTarget) {
        let mut since = self.unhealthy_since.lock().unwrap_or_else(PoisonError::into_inner);
        since.retain(|key, _| !key.starts_with(&format!("{}|", target.target_iqn)));
    }

    async fn heal(&self, volume_id: &str, target: &IscsiTarget) -> Result<(), PluginError> {
        info!(volume = %volume_id, target = %target.target_iqn, "Restoring stale iSCSI session");
        self.host.iscsi_login(target).await?;
        self.host.iscsi_rescan(target).await?;
        self.host.multipath_restore().await?;
        self.forget(target);
        Ok(())
    }

    /// Inspect every tracked session once and restore the stale ones
    pub async fn heal_once(&self) -> Result<HealReport, PluginError> {
        let mut report = HealReport::default();

        for record in self.tracking.list().await? {
            let Some(target) = &record.iscsi else {
                continue;
            };

            let mut stale = false;
            for portal in &target.portals {
                report.sessions_checked += 1;
                let health = match self.host.iscsi_session_health(&target.target_iqn, portal).await {
                    Ok(health) => health,
                    Err(e) => {
                        warn!(volume = %record.volume_id, portal = %portal, error = %e, "Could not inspect iSCSI session");
                        continue;
                    }
                };
                let key = format!("{}|{portal}", target.target_iqn);
                stale |= self.is_stale(&key, health.listed, health.is_healthy());
            }

            if stale {
                match self.heal(&record.volume_id, target).await {
                    Ok(()) => report.targets_healed += 1,
                    Err(e) => warn!(volume = %record.volume_id, error = %e, "iSCSI self-healing failed"),
                }
            }
        }

        debug!(checked = report.sessions_checked, healed = report.targets_healed, "iSCSI self-healing pass complete");
        Ok(report)
    }

    /// Tick until `shutdown` flips to true; a zero interval disables the loop
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if self.interval.is_zero() {
            info!("iSCSI self-healing disabled");
            return;
        }
        info!(
            interval_secs = self.interval.as_secs(),
            stale_wait_secs = self.stale_wait.as_secs(),
            "Starting iSCSI self-healing"
        );

        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.heal_once().await {
                        warn!(error = %e, "iSCSI self-healing pass failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("iSCSI self-healing stopped");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::host::SessionHealth;
    use crate::node::tracking::TrackingRecord;
    use crate::test_utils::FakeHostAgent;

    fn target() -> IscsiTarget {
        IscsiTarget {
            target_iqn: "iqn.1992-08.com.netapp:sn.1".into(),
            portals: vec!["10.0.0.1:3260".into()],
            lun: 0,
            chap: None,
        }
    }

    async fn setup(health: SessionHealth) -> (Arc<SelfHealer>, Arc<FakeHostAgent>, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let tracking = TrackingStore::new(dir.path());
        tracking
            .save(&TrackingRecord {
                volume_id: "vol-1".into(),
                iscsi: Some(target()),
                ..Default::default()
            })
            .await
            .expect("save");
        let host = Arc::new(FakeHostAgent::new());
        host.set_session_health(health);
        let healer = SelfHealer::new(host.clone(), tracking, Duration::from_secs(300), Duration::from_secs(420));
        (Arc::new(healer), host, dir)
    }

    #[test]
    fn test_stale_wait_is_clamped() {
        let interval = Duration::from_secs(300);
        assert_eq!(effective_stale_wait(interval, Duration::from_secs(60)), Duration::from_secs(450));
        assert_eq!(effective_stale_wait(interval, Duration::from_secs(420)), Duration::from_secs(420));
        assert_eq!(effective_stale_wait(Duration::ZERO, Duration::from_secs(1)), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_healthy_sessions_are_left_alone() {
        let (healer, host, _dir) = setup(SessionHealth { listed: true, logged_in: true }).await;
        let report = healer.heal_once().await.expect("pass");
        assert_eq!(report, HealReport { sessions_checked: 1, targets_healed: 0 });
        assert_eq!(host.logins(), 0);
    }

    #[tokio::test]
    async fn test_missing_session_is_restored_immediately() {
        let (healer, host, _dir) = setup(SessionHealth::default()).await;
        let report = healer.heal_once().await.expect("pass");
        assert_eq!(report.targets_healed, 1);
        assert_eq!(host.logins(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_session_waits_for_the_stale_threshold() {
        let (healer, host, _dir) = setup(SessionHealth { listed: true, logged_in: false }).await;

        assert_eq!(healer.heal_once().await.expect("pass").targets_healed, 0);
        tokio::time::advance(Duration::from_secs(300)).await;
        assert_eq!(healer.heal_once().await.expect("pass").targets_healed, 0);
        tokio::time::advance(Duration::from_secs(130)).await;
        assert_eq!(healer.heal_once().await.expect("pass").targets_healed, 1);
        assert_eq!(host.logins(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let (healer, _host, _dir) = setup(SessionHealth { listed: true, logged_in: true }).await;
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(Arc::clone(&healer).run(rx));
        tx.send(true).expect("send");
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("loop exits")
            .expect("no panic");
    }
}

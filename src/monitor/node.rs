/// Background health-check loop for one physical node
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::context::MonitorConnectionContext;
use crate::connection::{ConnectionHandler, ConnectionProxy, DataSource};
use crate::host::HostInfo;

/// Sleep between idle checks while no context is active
pub const INACTIVE_SLEEP: Duration = Duration::from_millis(100);

static NEXT_MONITOR_ID: AtomicU64 = AtomicU64::new(1);

/// Registry notified by monitors about their lifecycle
pub trait MonitorOwner: Send + Sync {
    /// The last context left; the monitor may be reused
    fn notify_unused(&self, monitor: &Arc<Monitor>);

    /// The monitor stopped and takes no more contexts
    fn notify_stopped(&self, monitor: &Arc<Monitor>);
}

/// Monitoring connection tagged with the target generation it was opened for
struct MonitoringConnection {
    generation: u64,
    connection: Arc<dyn ConnectionProxy>,
}

/// Health checks one node on behalf of every connection monitoring it.
///
/// The check interval is the smallest interval requested by the active
/// contexts. With no active context the monitor idles and stops itself
/// after `disposal_time`. A pooled monitor can be retargeted to another
/// node; the connection opened for the previous node is then dropped.
pub struct Monitor {
    id: u64,
    host: Mutex<HostInfo>,
    generation: AtomicU64,
    connection_handler: Arc<dyn ConnectionHandler>,
    datasource: DataSource,
    failure_detection_timeout: Duration,
    disposal_time: Duration,
    /// Also guards `stopped`: a context is never attached to a stopped monitor
    contexts: Mutex<Vec<Arc<MonitorConnectionContext>>>,
    connection: tokio::sync::Mutex<Option<MonitoringConnection>>,
    owner: Weak<dyn MonitorOwner>,
    cancel: CancellationToken,
    stopped: AtomicBool,
}

impl Monitor {
    pub fn new(
        host: HostInfo,
        connection_handler: Arc<dyn ConnectionHandler>,
        datasource: DataSource,
        failure_detection_timeout: Duration,
        disposal_time: Duration,
        owner: Weak<dyn MonitorOwner>,
    ) -> Self {
        Self {
            id: NEXT_MONITOR_ID.fetch_add(1, Ordering::Relaxed),
            host: Mutex::new(host),
            generation: AtomicU64::new(0),
            connection_handler,
            datasource: datasource.with_timeouts(failure_detection_timeout, failure_detection_timeout),
            failure_detection_timeout,
            disposal_time,
            contexts: Mutex::new(Vec::new()),
            connection: tokio::sync::Mutex::new(None),
            owner,
            cancel: CancellationToken::new(),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Node currently checked
    pub fn host(&self) -> HostInfo {
        self.host.lock().clone()
    }

    /// Point an idle monitor at another node. The next check opens a new
    /// monitoring connection.
    pub fn retarget(&self, host: &HostInfo) {
        let mut current = self.host.lock();
        if current.host_port_pair() == host.host_port_pair() {
            return;
        }
        debug!("Monitor {} retargeted from {} to {}", self.id, *current, host);
        *current = host.clone();
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn active_contexts(&self) -> usize {
        self.contexts.lock().iter().filter(|c| c.is_active()).count()
    }

    /// Contexts still registered, active or not
    pub fn context_count(&self) -> usize {
        self.contexts.lock().len()
    }

    /// Attach `context`; `false` when the monitor already stopped
    pub fn start_monitoring(self: &Arc<Self>, context: Arc<MonitorConnectionContext>) -> bool {
        let mut contexts = self.contexts.lock();
        if self.is_stopped() {
            return false;
        }
        context.set_start_monitor_time(Instant::now());
        context.set_monitor(self);
        contexts.push(context);
        true
    }

    pub fn stop_monitoring(self: &Arc<Self>, context: &Arc<MonitorConnectionContext>) {
        context.invalidate();
        let now_empty = {
            let mut contexts = self.contexts.lock();
            contexts.retain(|c| !Arc::ptr_eq(c, context));
            contexts.is_empty()
        };
        if now_empty {
            self.notify_unused();
        }
    }

    /// Drop every context at once
    pub fn clear_contexts(self: &Arc<Self>) {
        let removed: Vec<_> = self.contexts.lock().drain(..).collect();
        for context in &removed {
            context.invalidate();
        }
        self.notify_unused();
    }

    /// Stop the loop; contexts can no longer attach
    pub fn stop(&self) {
        {
            let _contexts = self.contexts.lock();
            self.stopped.store(true, Ordering::SeqCst);
        }
        self.cancel.cancel();
    }

    fn notify_unused(self: &Arc<Self>) {
        if let Some(owner) = self.owner.upgrade() {
            owner.notify_unused(self);
        }
    }

    /// Stop when no context is attached; decided under the contexts lock
    fn try_retire(&self) -> bool {
        let mut contexts = self.contexts.lock();
        contexts.retain(|c| c.is_active());
        if !contexts.is_empty() {
            return false;
        }
        self.stopped.store(true, Ordering::SeqCst);
        true
    }

    /// Monitor loop; returns once stopped or idle for `disposal_time`
    pub async fn run(self: Arc<Self>) {
        debug!("Monitor {} started for {}", self.id, self.host());
        let mut last_active = Instant::now();

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let contexts = self.take_active_contexts();
            let sleep_for = if contexts.is_empty() {
                if last_active.elapsed() >= self.disposal_time {
                    if self.try_retire() {
                        info!("Monitor {} for {} idle for {:?}, stopping", self.id, self.host(), self.disposal_time);
                        break;
                    }
                    // a context attached since the last look
                    continue;
                }
                INACTIVE_SLEEP
            } else {
                let check_start = Instant::now();
                let is_valid = self.check_connection_status().await;
                let check_end = Instant::now();

                for context in &contexts {
                    context.update_connection_status(check_start, check_end, is_valid);
                }

                let interval = contexts
                    .iter()
                    .map(|c| c.failure_detection_interval())
                    .min()
                    .unwrap_or(INACTIVE_SLEEP);
                last_active = Instant::now();
                interval.saturating_sub(check_end - check_start)
            };

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }

        // unregister before the first await so no caller can pick this monitor
        self.stop();
        if let Some(owner) = self.owner.upgrade() {
            owner.notify_stopped(&self);
        }
        if let Some(stale) = self.connection.lock().await.take() {
            stale.connection.close().await;
        }
        debug!("Monitor {} for {} stopped", self.id, self.host());
    }

    /// Active contexts; terminal ones are pruned from the list
    fn take_active_contexts(&self) -> Vec<Arc<MonitorConnectionContext>> {
        let mut contexts = self.contexts.lock();
        contexts.retain(|c| c.is_active());
        contexts.clone()
    }

    /// Connect when there is no usable monitoring connection, ping otherwise
    async fn check_connection_status(&self) -> bool {
        let generation = self.generation.load(Ordering::SeqCst);
        let host = self.host();
        let mut slot = self.connection.lock().await;

        if slot.as_ref().map_or(false, |c| c.generation != generation) {
            if let Some(stale) = slot.take() {
                debug!("Monitor {} dropping connection to its previous node", self.id);
                stale.connection.close().await;
            }
        }

        if let Some(current) = slot.as_ref() {
            if current.connection.is_connected() {
                let ok = matches!(
                    timeout(self.failure_detection_timeout, current.connection.ping()).await,
                    Ok(Ok(()))
                );
                if ok {
                    return true;
                }
                debug!("Monitor {} ping to {} failed", self.id, host);
            }
            if let Some(failed) = slot.take() {
                failed.connection.close().await;
            }
            return false;
        }

        let connected = timeout(
            self.failure_detection_timeout,
            self.connection_handler.connect(&host, Some(&self.datasource)),
        )
        .await;
        match connected {
            Ok(Some(connection)) => {
                *slot = Some(MonitoringConnection { generation, connection });
                true
            }
            _ => {
                debug!("Monitor {} could not connect to {}", self.id, host);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_host, MockConnection, MockConnectionHandler};
    use std::collections::HashSet;

    #[derive(Default)]
    struct CountingOwner {
        unused: AtomicU64,
        stopped: AtomicU64,
    }

    impl MonitorOwner for CountingOwner {
        fn notify_unused(&self, _monitor: &Arc<Monitor>) {
            self.unused.fetch_add(1, Ordering::SeqCst);
        }

        fn notify_stopped(&self, _monitor: &Arc<Monitor>) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn monitor(handler: Arc<MockConnectionHandler>, owner: &Arc<CountingOwner>, disposal: Duration) -> Arc<Monitor> {
        let owner: Arc<dyn MonitorOwner> = owner.clone();
        Arc::new(Monitor::new(
            test_host("node-1"),
            handler,
            DataSource::default(),
            Duration::from_millis(500),
            disposal,
            Arc::downgrade(&owner),
        ))
    }

    fn context(conn: Arc<MockConnection>) -> Arc<MonitorConnectionContext> {
        Arc::new(MonitorConnectionContext::new(
            conn,
            HashSet::from(["node-1".to_string()]),
            Duration::from_millis(100),
            Duration::from_millis(100),
            3,
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_declares_dead_node() {
        let handler = Arc::new(MockConnectionHandler::new());
        handler.add_host(&test_host("node-1").host().to_string(), Vec::new());
        let owner = Arc::new(CountingOwner::default());
        let monitor = monitor(handler.clone(), &owner, Duration::from_secs(60));

        let user_conn = Arc::new(MockConnection::new("user"));
        let ctx = context(user_conn.clone());
        monitor.start_monitoring(ctx.clone());
        let task = tokio::spawn(monitor.clone().run());

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(!ctx.is_node_unhealthy());
        assert_eq!(handler.attempts(test_host("node-1").host()), 1);

        // node goes away: pings fail, reconnects fail
        handler.set_available(test_host("node-1").host(), false);
        for conn in handler.opened(test_host("node-1").host()) {
            conn.set_ping_ok(false);
        }

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(ctx.is_node_unhealthy());
        assert_eq!(user_conn.socket_close_count(), 1);

        monitor.stop();
        task.await.unwrap();
        assert!(monitor.is_stopped());
        assert_eq!(owner.stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_monitor_stops_after_disposal_time() {
        let handler = Arc::new(MockConnectionHandler::new());
        let owner = Arc::new(CountingOwner::default());
        let monitor = monitor(handler, &owner, Duration::from_secs(1));

        let task = tokio::spawn(monitor.clone().run());
        tokio::time::sleep(Duration::from_millis(1500)).await;
        task.await.unwrap();

        assert!(monitor.is_stopped());
        assert_eq!(owner.stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_monitoring_last_context_notifies_owner() {
        let handler = Arc::new(MockConnectionHandler::new());
        let owner = Arc::new(CountingOwner::default());
        let monitor = monitor(handler, &owner, Duration::from_secs(60));

        let a = context(Arc::new(MockConnection::new("a")));
        let b = context(Arc::new(MockConnection::new("b")));
        monitor.start_monitoring(a.clone());
        monitor.start_monitoring(b.clone());
        assert_eq!(monitor.active_contexts(), 2);

        monitor.stop_monitoring(&a);
        assert!(!a.is_active());
        assert_eq!(owner.unused.load(Ordering::SeqCst), 0);

        monitor.stop_monitoring(&b);
        assert_eq!(monitor.active_contexts(), 0);
        assert_eq!(owner.unused.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retargeted_monitor_checks_new_node() {
        let handler = Arc::new(MockConnectionHandler::new());
        handler.add_host(test_host("node-1").host(), Vec::new());
        handler.add_host(test_host("node-2").host(), Vec::new());
        let owner = Arc::new(CountingOwner::default());
        let monitor = monitor(handler.clone(), &owner, Duration::from_secs(60));

        let first = context(Arc::new(MockConnection::new("a")));
        assert!(monitor.start_monitoring(first.clone()));
        let task = tokio::spawn(monitor.clone().run());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(handler.attempts(test_host("node-1").host()), 1);
        monitor.stop_monitoring(&first);

        // node-1 dies while the monitor moves on to node-2
        handler.set_available(test_host("node-1").host(), false);
        for conn in handler.opened(test_host("node-1").host()) {
            conn.set_ping_ok(false);
        }
        monitor.retarget(&test_host("node-2"));
        assert_eq!(monitor.host().host(), test_host("node-2").host());

        let user = Arc::new(MockConnection::new("b"));
        let second = context(user.clone());
        assert!(monitor.start_monitoring(second.clone()));
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(!second.is_node_unhealthy());
        assert_eq!(user.socket_close_count(), 0);
        assert_eq!(handler.attempts(test_host("node-2").host()), 1);
        assert_eq!(handler.opened(test_host("node-1").host())[0].close_count(), 1);

        monitor.stop();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_monitor_refuses_contexts() {
        let handler = Arc::new(MockConnectionHandler::new());
        let owner = Arc::new(CountingOwner::default());
        let monitor = monitor(handler, &owner, Duration::from_secs(1));

        let task = tokio::spawn(monitor.clone().run());
        tokio::time::sleep(Duration::from_millis(1500)).await;
        task.await.unwrap();

        let ctx = context(Arc::new(MockConnection::new("late")));
        assert!(!monitor.start_monitoring(ctx.clone()));
        assert_eq!(monitor.context_count(), 0);
        assert!(ctx.monitor().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_context_attached_before_disposal_keeps_monitor_alive() {
        let handler = Arc::new(MockConnectionHandler::new());
        handler.add_host(test_host("node-1").host(), Vec::new());
        let owner = Arc::new(CountingOwner::default());
        let monitor = monitor(handler.clone(), &owner, Duration::from_secs(1));
        let task = tokio::spawn(monitor.clone().run());

        tokio::time::sleep(Duration::from_millis(950)).await;
        let ctx = context(Arc::new(MockConnection::new("user")));
        assert!(monitor.start_monitoring(ctx.clone()));
        assert!(Arc::ptr_eq(&ctx.monitor().unwrap(), &monitor));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!monitor.is_stopped());
        assert!(handler.attempts(test_host("node-1").host()) >= 1);
        assert_eq!(owner.stopped.load(Ordering::SeqCst), 0);

        monitor.stop();
        task.await.unwrap();
    }
}

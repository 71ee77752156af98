/// Custom endpoint membership tracking
///
/// A custom endpoint groups an arbitrary set of cluster instances under one
/// DNS name. `CustomEndpointMonitor` polls the definition of one endpoint and
/// turns it into a host filter on the topology service whenever it changes.
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{DisposalHooks, ExpiringCache, SlidingExpirationCache};
use crate::config::CustomEndpointConfig;
use crate::error::{ClusterError, ClusterResult, ErrorSeverity};
use crate::topology::{HostFilter, TopologyServiceInterface};

/// Sweep period of the monitor registry
pub const MONITOR_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Instance roles a custom endpoint may route to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleType {
    Any,
    Reader,
    Writer,
}

/// How the member list of a custom endpoint is to be read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberListType {
    /// Only the listed instances belong to the endpoint
    StaticList,
    /// Every instance except the listed ones belongs to the endpoint
    ExclusionList,
}

/// Membership definition of one custom endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomEndpointInfo {
    pub endpoint_identifier: String,
    pub cluster_identifier: String,
    pub url: String,
    pub role_type: RoleType,
    pub members: BTreeSet<String>,
    pub member_list_type: MemberListType,
}

impl CustomEndpointInfo {
    pub fn static_members(&self) -> Option<&BTreeSet<String>> {
        match self.member_list_type {
            MemberListType::StaticList => Some(&self.members),
            MemberListType::ExclusionList => None,
        }
    }

    pub fn excluded_members(&self) -> Option<&BTreeSet<String>> {
        match self.member_list_type {
            MemberListType::StaticList => None,
            MemberListType::ExclusionList => Some(&self.members),
        }
    }

    /// Allow list for static endpoints, block list for exclusion endpoints
    pub fn to_host_filter(&self) -> HostFilter {
        match self.member_list_type {
            MemberListType::StaticList => HostFilter::allow(self.members.iter().cloned()),
            MemberListType::ExclusionList => HostFilter::block(self.members.iter().cloned()),
        }
    }
}

impl fmt::Display for CustomEndpointInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.member_list_type {
            MemberListType::StaticList => "static",
            MemberListType::ExclusionList => "excluded",
        };
        write!(
            f,
            "{} ({} {:?}, role {:?})",
            self.endpoint_identifier, kind, self.members, self.role_type
        )
    }
}

/// Source of custom endpoint definitions, usually the cloud control plane
#[async_trait]
pub trait CustomEndpointSource: Send + Sync {
    /// Current definition of `endpoint_identifier`, `None` if it does not exist
    async fn describe_endpoint(&self, endpoint_identifier: &str) -> ClusterResult<Option<CustomEndpointInfo>>;
}

/// First DNS label of a custom endpoint url
pub fn endpoint_identifier(url: &str) -> &str {
    url.split('.').next().unwrap_or(url)
}

/// Background poller of one custom endpoint
pub struct CustomEndpointMonitor {
    url: String,
    endpoint_identifier: String,
    source: Arc<dyn CustomEndpointSource>,
    topology_service: Arc<dyn TopologyServiceInterface>,
    info_cache: Arc<ExpiringCache<String, CustomEndpointInfo>>,
    refresh_rate: Duration,
    info_ttl: Duration,
    refreshing: AtomicBool,
    updates: AtomicU64,
    info_ready: Notify,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CustomEndpointMonitor {
    pub fn new(
        url: &str,
        source: Arc<dyn CustomEndpointSource>,
        topology_service: Arc<dyn TopologyServiceInterface>,
        info_cache: Arc<ExpiringCache<String, CustomEndpointInfo>>,
        refresh_rate: Duration,
        info_ttl: Duration,
    ) -> Self {
        Self {
            url: url.to_string(),
            endpoint_identifier: endpoint_identifier(url).to_string(),
            source,
            topology_service,
            info_cache,
            refresh_rate,
            info_ttl,
            refreshing: AtomicBool::new(false),
            updates: AtomicU64::new(0),
            info_ready: Notify::new(),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn has_custom_endpoint_info(&self) -> bool {
        self.info_cache.get(&self.url).is_some()
    }

    pub fn custom_endpoint_info(&self) -> Option<CustomEndpointInfo> {
        self.info_cache.get(&self.url)
    }

    /// A poll is in flight
    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::SeqCst)
    }

    /// Number of definition changes published so far
    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Poll the definition once; returns whether it changed
    pub async fn run_cycle(&self) -> ClusterResult<bool> {
        self.refreshing.store(true, Ordering::SeqCst);
        let described = self.source.describe_endpoint(&self.endpoint_identifier).await;
        let changed = match described {
            Ok(Some(info)) => Ok(self.apply(info)),
            Ok(None) => {
                warn!("Custom endpoint {} was not found", self.endpoint_identifier);
                Ok(false)
            }
            Err(e) => Err(e),
        };
        self.refreshing.store(false, Ordering::SeqCst);
        changed
    }

    fn apply(&self, info: CustomEndpointInfo) -> bool {
        if self.is_closed() || self.info_cache.get(&self.url).as_ref() == Some(&info) {
            return false;
        }

        info!("Custom endpoint {} changed: {}", self.url, info);
        self.topology_service.set_host_filter(info.to_host_filter());
        self.info_cache.put(self.url.clone(), info, self.info_ttl);
        self.updates.fetch_add(1, Ordering::Relaxed);
        self.info_ready.notify_waiters();
        true
    }

    /// Spawn the polling loop; no-op when already running or closed
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() || self.is_closed() {
            return;
        }
        *task = Some(tokio::spawn(self.clone().run()));
    }

    async fn run(self: Arc<Self>) {
        debug!("Custom endpoint monitor started for {}", self.url);
        loop {
            let started = Instant::now();
            if let Err(e) = self.run_cycle().await {
                match e.severity() {
                    ErrorSeverity::Critical | ErrorSeverity::Error => {
                        error!("Failed to refresh custom endpoint {} [{}]: {}", self.url, e.severity(), e)
                    }
                    _ => warn!("Failed to refresh custom endpoint {}: {}", self.url, e),
                }
                // unrecoverable errors end the monitor
                if !e.is_recoverable() {
                    self.close();
                    break;
                }
            }

            let sleep_for = self.refresh_rate.saturating_sub(started.elapsed());
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
        debug!("Custom endpoint monitor stopped for {}", self.url);
    }

    /// Stop polling and forget the cached definition
    pub fn close(&self) {
        self.cancel.cancel();
        self.info_cache.remove(&self.url);
        self.info_ready.notify_waiters();
    }

    /// Wait until a definition is cached, at most `timeout`
    pub async fn wait_for_info(&self, timeout: Duration) -> ClusterResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.info_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.has_custom_endpoint_info() {
                return Ok(());
            }
            if self.is_closed() {
                return Err(ClusterError::custom_endpoint(format!(
                    "monitor for {} was closed",
                    self.url
                )));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(ClusterError::timeout(format!(
                    "waiting {:?} for custom endpoint info of {}",
                    timeout, self.url
                )));
            }
        }
    }
}

/// Shared registry of custom endpoint monitors keyed by endpoint url.
///
/// Monitors nobody asked for during `monitor_expiration` are closed by the
/// registry's cleanup task, unless a poll is in flight.
pub struct CustomEndpointRegistry {
    monitors: Arc<SlidingExpirationCache<String, Arc<CustomEndpointMonitor>>>,
    info_cache: Arc<ExpiringCache<String, CustomEndpointInfo>>,
    source: Arc<dyn CustomEndpointSource>,
    config: CustomEndpointConfig,
}

impl CustomEndpointRegistry {
    pub fn new(source: Arc<dyn CustomEndpointSource>, config: CustomEndpointConfig) -> Self {
        Self::with_cleanup_interval(source, config, MONITOR_CLEANUP_INTERVAL)
    }

    pub fn with_cleanup_interval(
        source: Arc<dyn CustomEndpointSource>,
        config: CustomEndpointConfig,
        cleanup_interval: Duration,
    ) -> Self {
        let hooks = DisposalHooks {
            should_dispose: Some(Arc::new(|monitor: &Arc<CustomEndpointMonitor>| !monitor.is_refreshing())),
            on_dispose: Some(Arc::new(|monitor: &Arc<CustomEndpointMonitor>| {
                debug!("Disposing idle custom endpoint monitor for {}", monitor.url());
                monitor.close();
            })),
        };
        let (monitors, _cleanup) = SlidingExpirationCache::with_cleanup_task(cleanup_interval, hooks);
        Self {
            monitors,
            info_cache: Arc::new(ExpiringCache::new()),
            source,
            config,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Monitor for `url`, started on first request. `None` while custom
    /// endpoint tracking is disabled.
    pub fn create_monitor_if_absent(
        &self,
        url: &str,
        topology_service: Arc<dyn TopologyServiceInterface>,
    ) -> Option<Arc<CustomEndpointMonitor>> {
        if !self.config.enabled {
            debug!("Custom endpoint tracking is disabled, not monitoring {}", url);
            return None;
        }
        let monitor = self.monitors.get_or_compute(
            url.to_string(),
            |key| {
                Arc::new(CustomEndpointMonitor::new(
                    key,
                    self.source.clone(),
                    topology_service,
                    self.info_cache.clone(),
                    self.config.refresh_rate(),
                    self.config.info_expiration(),
                ))
            },
            self.config.monitor_expiration(),
        );
        monitor.start();
        Some(monitor)
    }

    /// Wait for the first definition of `url`, at most the configured
    /// `wait_for_info_timeout_ms`
    pub async fn wait_for_info(&self, url: &str) -> ClusterResult<()> {
        let monitor = self
            .monitors
            .get(&url.to_string(), self.config.monitor_expiration())
            .ok_or_else(|| ClusterError::custom_endpoint(format!("no monitor registered for {}", url)))?;
        monitor.wait_for_info(self.config.wait_for_info_timeout()).await
    }

    pub fn custom_endpoint_info(&self, url: &str) -> Option<CustomEndpointInfo> {
        self.info_cache.get(&url.to_string())
    }

    pub fn monitor_count(&self) -> usize {
        self.monitors.size()
    }

    /// Close every monitor
    pub fn close_all(&self) {
        self.monitors.clear();
    }
}

impl Drop for CustomEndpointRegistry {
    fn drop(&mut self) {
        self.monitors.stop_cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingTopologyService;

    const URL: &str = "analytics.cluster-custom-xyz.us-east-2.rds.amazonaws.com";

    #[derive(Clone, Copy)]
    enum Failure {
        Throttled,
        AccessDenied,
    }

    #[derive(Default)]
    struct ScriptedSource {
        info: Mutex<Option<CustomEndpointInfo>>,
        calls: AtomicU64,
        delay: Mutex<Duration>,
        failure: Mutex<Option<Failure>>,
    }

    impl ScriptedSource {
        fn set_members(&self, members: &[&str], member_list_type: MemberListType) {
            *self.info.lock() = Some(CustomEndpointInfo {
                endpoint_identifier: "analytics".to_string(),
                cluster_identifier: "my-cluster".to_string(),
                url: URL.to_string(),
                role_type: RoleType::Any,
                members: members.iter().map(|s| s.to_string()).collect(),
                member_list_type,
            });
        }

        fn calls(&self) -> u64 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CustomEndpointSource for ScriptedSource {
        async fn describe_endpoint(&self, endpoint_identifier: &str) -> ClusterResult<Option<CustomEndpointInfo>> {
            assert_eq!(endpoint_identifier, "analytics");
            self.calls.fetch_add(1, Ordering::SeqCst);
            let delay = *self.delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let failure = *self.failure.lock();
            match failure {
                Some(Failure::Throttled) => Err(ClusterError::custom_endpoint("rate exceeded")),
                Some(Failure::AccessDenied) => Err(ClusterError::config("not authorized to describe endpoints")),
                None => Ok(self.info.lock().clone()),
            }
        }
    }

    fn monitor(
        source: Arc<ScriptedSource>,
        topology: Arc<RecordingTopologyService>,
    ) -> (Arc<CustomEndpointMonitor>, Arc<ExpiringCache<String, CustomEndpointInfo>>) {
        let cache = Arc::new(ExpiringCache::new());
        let monitor = Arc::new(CustomEndpointMonitor::new(
            URL,
            source,
            topology,
            cache.clone(),
            Duration::from_secs(30),
            Duration::from_secs(300),
        ));
        (monitor, cache)
    }

    fn config() -> CustomEndpointConfig {
        CustomEndpointConfig {
            enabled: true,
            refresh_rate_ms: 30_000,
            info_expiration_sec: 300,
            monitor_expiration_sec: 60,
            wait_for_info_timeout_ms: 5_000,
        }
    }

    #[test]
    fn test_host_filter_from_info() {
        let source = ScriptedSource::default();
        source.set_members(&["i1", "i2"], MemberListType::StaticList);
        let info = source.info.lock().clone().unwrap();
        assert_eq!(info.to_host_filter(), HostFilter::allow(["i1", "i2"]));
        assert!(info.excluded_members().is_none());

        source.set_members(&["i3"], MemberListType::ExclusionList);
        let info = source.info.lock().clone().unwrap();
        assert_eq!(info.to_host_filter(), HostFilter::block(["i3"]));
        assert_eq!(info.excluded_members().unwrap().len(), 1);
        assert_eq!(endpoint_identifier(URL), "analytics");
    }

    #[tokio::test]
    async fn test_identical_polls_publish_once() {
        let source = Arc::new(ScriptedSource::default());
        source.set_members(&["i1", "i2"], MemberListType::StaticList);
        let topology = Arc::new(RecordingTopologyService::new());
        let (monitor, cache) = monitor(source.clone(), topology.clone());

        assert!(monitor.run_cycle().await.unwrap());
        assert_eq!(topology.filter_updates().len(), 1);

        for _ in 0..3 {
            assert!(!monitor.run_cycle().await.unwrap());
        }
        assert_eq!(topology.filter_updates().len(), 1);
        assert_eq!(monitor.updates(), 1);
        assert_eq!(source.calls(), 4);
        assert_eq!(cache.size(), 1);
    }

    #[tokio::test]
    async fn test_changed_definition_publishes_once() {
        let source = Arc::new(ScriptedSource::default());
        source.set_members(&["i1", "i2"], MemberListType::StaticList);
        let topology = Arc::new(RecordingTopologyService::new());
        let (monitor, cache) = monitor(source.clone(), topology.clone());
        monitor.run_cycle().await.unwrap();

        source.set_members(&["i1", "i3"], MemberListType::StaticList);
        assert!(monitor.run_cycle().await.unwrap());
        assert!(!monitor.run_cycle().await.unwrap());

        let updates = topology.filter_updates();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[1], HostFilter::allow(["i1", "i3"]));
        assert_eq!(monitor.updates(), 2);
        let cached = cache.get(&URL.to_string()).unwrap();
        assert!(cached.members.contains("i3"));
    }

    #[tokio::test]
    async fn test_missing_endpoint_is_not_an_update() {
        let source = Arc::new(ScriptedSource::default());
        let topology = Arc::new(RecordingTopologyService::new());
        let (monitor, _cache) = monitor(source, topology.clone());

        assert!(!monitor.run_cycle().await.unwrap());
        assert!(!monitor.has_custom_endpoint_info());
        assert!(topology.filter_updates().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_keeps_cadence_despite_slow_source() {
        let source = Arc::new(ScriptedSource::default());
        source.set_members(&["i1"], MemberListType::StaticList);
        *source.delay.lock() = Duration::from_secs(10);
        let topology = Arc::new(RecordingTopologyService::new());
        let (monitor, _cache) = monitor(source.clone(), topology);

        monitor.start();
        // polls start at 0s, 30s and 60s, each taking 10s
        tokio::time::sleep(Duration::from_secs(65)).await;
        assert_eq!(source.calls(), 3);

        monitor.close();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(source.calls(), 3);
        assert!(!monitor.has_custom_endpoint_info());
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_shares_monitor_and_waits_for_info() {
        let source = Arc::new(ScriptedSource::default());
        source.set_members(&["i1"], MemberListType::StaticList);
        *source.delay.lock() = Duration::from_secs(1);
        let registry = CustomEndpointRegistry::new(source.clone(), config());
        let topology = Arc::new(RecordingTopologyService::new());

        let first = registry.create_monitor_if_absent(URL, topology.clone()).unwrap();
        let second = registry.create_monitor_if_absent(URL, topology.clone()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.monitor_count(), 1);

        registry.wait_for_info(URL).await.unwrap();
        assert_eq!(registry.custom_endpoint_info(URL).unwrap().members.len(), 1);

        let missing = registry
            .wait_for_info("other.cluster-custom-xyz.us-east-2.rds.amazonaws.com")
            .await;
        assert!(matches!(missing, Err(ClusterError::CustomEndpoint { .. })));
        registry.close_all();
        assert!(first.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_info_times_out() {
        let source = Arc::new(ScriptedSource::default());
        let registry = CustomEndpointRegistry::new(source, config());
        registry.create_monitor_if_absent(URL, Arc::new(RecordingTopologyService::new()));

        let started = Instant::now();
        let result = registry.wait_for_info(URL).await;
        assert!(matches!(result, Err(ClusterError::Timeout { .. })));
        assert!(started.elapsed() >= Duration::from_secs(5));
        registry.close_all();
    }

    #[tokio::test]
    async fn test_disabled_registry_creates_no_monitor() {
        let source = Arc::new(ScriptedSource::default());
        source.set_members(&["i1"], MemberListType::StaticList);
        let config = CustomEndpointConfig {
            enabled: false,
            ..config()
        };
        let registry = CustomEndpointRegistry::new(source.clone(), config);

        assert!(!registry.is_enabled());
        assert!(registry
            .create_monitor_if_absent(URL, Arc::new(RecordingTopologyService::new()))
            .is_none());
        assert_eq!(registry.monitor_count(), 0);
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_source_errors_keep_polling() {
        let source = Arc::new(ScriptedSource::default());
        *source.failure.lock() = Some(Failure::Throttled);
        let topology = Arc::new(RecordingTopologyService::new());
        let (monitor, _cache) = monitor(source.clone(), topology);

        monitor.start();
        tokio::time::sleep(Duration::from_secs(65)).await;
        assert_eq!(source.calls(), 3);
        assert!(!monitor.is_closed());

        source.set_members(&["i1"], MemberListType::StaticList);
        *source.failure.lock() = None;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(monitor.has_custom_endpoint_info());
        monitor.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_source_request_stops_monitor() {
        let source = Arc::new(ScriptedSource::default());
        *source.failure.lock() = Some(Failure::AccessDenied);
        let topology = Arc::new(RecordingTopologyService::new());
        let (monitor, _cache) = monitor(source.clone(), topology);

        monitor.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(monitor.is_closed());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(source.calls(), 1);
        let waited = monitor.wait_for_info(Duration::from_secs(5)).await;
        assert!(matches!(waited, Err(ClusterError::CustomEndpoint { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_monitor_is_disposed() {
        let source = Arc::new(ScriptedSource::default());
        source.set_members(&["i1"], MemberListType::StaticList);
        let registry =
            CustomEndpointRegistry::with_cleanup_interval(source, config(), Duration::from_secs(10));
        let monitor = registry
            .create_monitor_if_absent(URL, Arc::new(RecordingTopologyService::new()))
            .unwrap();

        tokio::time::sleep(Duration::from_secs(90)).await;
        assert!(monitor.is_closed());
        assert_eq!(registry.monitor_count(), 0);
    }
}

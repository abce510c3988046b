//! In-memory collaborators for tests.
//!
//! Every fake records the calls it receives so tests can assert on the
//! exact traffic history (colors flipped, weights set).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use shipgate_core::{Color, HealthEndpoint, ImageRef};
use shipgate_health::{Classification, HealthCheckResult, Prober};

use crate::platform::{
    PlatformError, PlatformResult, ReconcilerHealth, Reconciler, SurgePolicy, SyncHealth,
    SyncStatus, TrafficRouter, WorkloadPlatform, WorkloadStatus,
};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Workloads become ready the moment their image is set.
#[derive(Default)]
pub struct FakePlatform {
    workloads: Mutex<HashMap<String, WorkloadStatus>>,
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    hanging: Mutex<HashSet<String>>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a running workload.
    pub fn with_workload(self, workload: &str, image: &str, replicas: u32) -> Self {
        lock(&self.workloads).insert(
            workload.to_string(),
            WorkloadStatus {
                image: image.to_string(),
                replicas,
                ready_replicas: replicas,
                updated_replicas: replicas,
            },
        );
        self
    }

    /// `set_image` on `workload` fails from now on.
    pub fn fail_set_image(&self, workload: &str) {
        lock(&self.failing).insert(workload.to_string());
    }

    pub fn heal(&self, workload: &str) {
        lock(&self.failing).remove(workload);
    }

    /// `set_image` on `workload` never returns.
    pub fn hang_set_image(&self, workload: &str) {
        lock(&self.hanging).insert(workload.to_string());
    }

    pub fn workload(&self, workload: &str) -> Option<WorkloadStatus> {
        lock(&self.workloads).get(workload).cloned()
    }

    pub fn image_of(&self, workload: &str) -> Option<String> {
        self.workload(workload).map(|w| w.image)
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl WorkloadPlatform for FakePlatform {
    async fn set_image(
        &self,
        workload: &str,
        image: &ImageRef,
        replicas: u32,
        _surge: SurgePolicy,
    ) -> PlatformResult<()> {
        lock(&self.calls).push(format!("set_image {workload} {image}"));
        if lock(&self.hanging).contains(workload) {
            std::future::pending::<()>().await;
        }
        if lock(&self.failing).contains(workload) {
            return Err(PlatformError::Command {
                command: format!("set image {workload}"),
                code: Some(1),
                stderr: "injected failure".to_string(),
            });
        }
        lock(&self.workloads).insert(
            workload.to_string(),
            WorkloadStatus {
                image: image.to_string(),
                replicas,
                ready_replicas: replicas,
                updated_replicas: replicas,
            },
        );
        Ok(())
    }

    async fn status(&self, workload: &str) -> PlatformResult<Option<WorkloadStatus>> {
        Ok(self.workload(workload))
    }

    async fn scale(&self, workload: &str, replicas: u32) -> PlatformResult<()> {
        lock(&self.calls).push(format!("scale {workload} {replicas}"));
        if let Some(status) = lock(&self.workloads).get_mut(workload) {
            status.replicas = replicas;
            status.ready_replicas = replicas;
            status.updated_replicas = replicas;
        }
        Ok(())
    }
}

/// Selector and weight store with full history.
#[derive(Default)]
pub struct FakeRouter {
    colors: Mutex<HashMap<String, Color>>,
    weights: Mutex<HashMap<String, u8>>,
    color_history: Mutex<Vec<Color>>,
    weight_history: Mutex<Vec<u8>>,
    fail_switch: Mutex<bool>,
}

impl FakeRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_active(self, service: &str, color: Color) -> Self {
        lock(&self.colors).insert(service.to_string(), color);
        self
    }

    /// Every selector and weight change fails from now on.
    pub fn fail_switches(&self) {
        *lock(&self.fail_switch) = true;
    }

    pub fn active(&self, service: &str) -> Option<Color> {
        lock(&self.colors).get(service).copied()
    }

    pub fn weight(&self, service: &str) -> u8 {
        lock(&self.weights).get(service).copied().unwrap_or(0)
    }

    pub fn color_history(&self) -> Vec<Color> {
        lock(&self.color_history).clone()
    }

    pub fn weight_history(&self) -> Vec<u8> {
        lock(&self.weight_history).clone()
    }

    fn check(&self, what: &str) -> PlatformResult<()> {
        if *lock(&self.fail_switch) {
            return Err(PlatformError::Command {
                command: what.to_string(),
                code: Some(1),
                stderr: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl TrafficRouter for FakeRouter {
    async fn active_color(&self, service: &str) -> PlatformResult<Option<Color>> {
        Ok(self.active(service))
    }

    async fn set_active_color(&self, service: &str, color: Color) -> PlatformResult<()> {
        self.check("set selector")?;
        lock(&self.colors).insert(service.to_string(), color);
        lock(&self.color_history).push(color);
        Ok(())
    }

    async fn canary_weight(&self, service: &str) -> PlatformResult<u8> {
        Ok(self.weight(service))
    }

    async fn set_canary_weight(&self, service: &str, weight: u8) -> PlatformResult<()> {
        self.check("set weight")?;
        lock(&self.weights).insert(service.to_string(), weight);
        lock(&self.weight_history).push(weight);
        Ok(())
    }
}

/// Reconciler that replays scripted sync/health reports.
pub struct FakeReconciler {
    desired: Mutex<HashMap<String, ImageRef>>,
    reports: Mutex<VecDeque<SyncHealth>>,
    last: Mutex<SyncHealth>,
    writes: Mutex<Vec<String>>,
}

impl FakeReconciler {
    /// Always synced and healthy unless scripted otherwise.
    pub fn new() -> Self {
        Self {
            desired: Mutex::new(HashMap::new()),
            reports: Mutex::new(VecDeque::new()),
            last: Mutex::new(SyncHealth {
                sync: SyncStatus::Synced,
                health: ReconcilerHealth::Healthy,
                revision: None,
            }),
            writes: Mutex::new(Vec::new()),
        }
    }

    pub fn with_desired(self, app: &str, image: &str) -> Self {
        if let Ok(image) = ImageRef::parse(image) {
            lock(&self.desired).insert(app.to_string(), image);
        }
        self
    }

    /// Queue reports; the last one repeats.
    pub fn script(&self, reports: impl IntoIterator<Item = (SyncStatus, ReconcilerHealth)>) {
        lock(&self.reports).extend(reports.into_iter().map(|(sync, health)| SyncHealth {
            sync,
            health,
            revision: None,
        }));
    }

    pub fn desired(&self, app: &str) -> Option<String> {
        lock(&self.desired).get(app).map(|i| i.to_string())
    }

    pub fn writes(&self) -> Vec<String> {
        lock(&self.writes).clone()
    }
}

impl Default for FakeReconciler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Reconciler for FakeReconciler {
    async fn desired_revision(&self, app: &str) -> PlatformResult<Option<ImageRef>> {
        Ok(lock(&self.desired).get(app).cloned())
    }

    async fn set_desired_revision(&self, app: &str, image: &ImageRef) -> PlatformResult<()> {
        lock(&self.desired).insert(app.to_string(), image.clone());
        lock(&self.writes).push(image.to_string());
        Ok(())
    }

    async fn sync_health(&self, _app: &str) -> PlatformResult<SyncHealth> {
        let next = lock(&self.reports).pop_front();
        let mut last = lock(&self.last);
        if let Some(report) = next {
            *last = report;
        }
        Ok(last.clone())
    }
}

/// Prober that replays a per-endpoint script; the last entry repeats and
/// unknown endpoints time out.
#[derive(Default)]
pub struct ScriptedProber {
    scripts: Mutex<HashMap<String, VecDeque<Classification>>>,
    probes: Mutex<Vec<String>>,
}

impl ScriptedProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, url: &str, readings: impl IntoIterator<Item = Classification>) -> Self {
        lock(&self.scripts).insert(url.to_string(), readings.into_iter().collect());
        self
    }

    /// Every probe of `url` is healthy.
    pub fn healthy(self, url: &str) -> Self {
        self.script(url, [Classification::Healthy])
    }

    /// URLs probed so far, in order.
    pub fn probes(&self) -> Vec<String> {
        lock(&self.probes).clone()
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn probe(&self, endpoint: &HealthEndpoint, _timeout: Duration) -> HealthCheckResult {
        lock(&self.probes).push(endpoint.url.clone());
        let mut scripts = lock(&self.scripts);
        let classification = match scripts.get_mut(&endpoint.url) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(Classification::UnknownTimeout),
            Some(queue) => queue.front().copied().unwrap_or(Classification::UnknownTimeout),
            None => Classification::UnknownTimeout,
        };
        HealthCheckResult {
            status_code: match classification {
                Classification::Healthy => Some(200),
                Classification::Unhealthy => Some(503),
                Classification::UnknownTimeout => None,
            },
            ..HealthCheckResult::synthetic(&endpoint.url, classification)
        }
    }
}

//! Docker Compose platform and file-based router.
//!
//! Images and replica counts live in an override file
//! (`shipgate.override.json`, JSON being valid compose YAML) layered over the
//! project's own compose file. `docker compose up -d --no-deps <service>`
//! then converges each service. The router writes active colors and canary
//! weights into a JSON route file that the reverse proxy watches.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use shipgate_core::{Color, ImageRef};
use shipgate_rollout::{
    PlatformError, PlatformResult, SurgePolicy, TrafficRouter, WorkloadPlatform, WorkloadStatus,
};

use crate::runner::{CommandRunner, display_command, parse_json};

pub const OVERRIDE_FILE: &str = "shipgate.override.json";

const COMPOSE_FILES: [&str; 4] = [
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

#[derive(Debug, Default, Serialize, Deserialize)]
struct Override {
    #[serde(default)]
    services: BTreeMap<String, ServiceOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ServiceOverride {
    image: String,
    deploy: Deploy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Deploy {
    replicas: u32,
}

/// One row of `docker compose ps --format json`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PsEntry {
    service: String,
    image: String,
    state: String,
    #[serde(default)]
    health: String,
}

impl PsEntry {
    fn is_ready(&self) -> bool {
        self.state == "running" && (self.health.is_empty() || self.health == "healthy")
    }
}

/// Older compose prints one JSON array, newer prints one object per line.
fn parse_ps(command: &str, stdout: &str) -> PlatformResult<Vec<PsEntry>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.starts_with('[') {
        return parse_json(command, trimmed);
    }
    trimmed
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| parse_json(command, line))
        .collect()
}

async fn read_json<T: Default + serde::de::DeserializeOwned>(path: &Path) -> PlatformResult<T> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => parse_json(&path.display().to_string(), &content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(source) => Err(PlatformError::Spawn {
            program: format!("read {}", path.display()),
            source,
        }),
    }
}

/// Write via a sibling temp file and rename, so readers never see half a file.
async fn write_json<T: Serialize>(path: &Path, value: &T) -> PlatformResult<()> {
    let body = serde_json::to_vec_pretty(value).map_err(|e| PlatformError::Parse {
        command: format!("encode {}", path.display()),
        reason: e.to_string(),
    })?;
    let tmp = path.with_extension("json.tmp");
    let io = |source| PlatformError::Spawn {
        program: format!("write {}", path.display()),
        source,
    };
    tokio::fs::write(&tmp, body).await.map_err(io)?;
    tokio::fs::rename(&tmp, path).await.map_err(io)?;
    Ok(())
}

/// Services of one compose project.
pub struct ComposePlatform {
    runner: Arc<dyn CommandRunner>,
    dir: PathBuf,
    /// Serializes read-modify-write of the override file.
    overrides: Mutex<()>,
}

impl ComposePlatform {
    pub fn new(runner: Arc<dyn CommandRunner>, dir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            dir: dir.into(),
            overrides: Mutex::new(()),
        }
    }

    fn override_path(&self) -> PathBuf {
        self.dir.join(OVERRIDE_FILE)
    }

    fn compose_args(&self, tail: &[&str]) -> Vec<String> {
        let mut args = vec!["compose".to_string()];
        if let Some(base) = COMPOSE_FILES.iter().find(|f| self.dir.join(f).is_file()) {
            args.push("-f".to_string());
            args.push((*base).to_string());
        }
        args.push("-f".to_string());
        args.push(OVERRIDE_FILE.to_string());
        args.extend(tail.iter().map(|a| a.to_string()));
        args
    }

    async fn compose(&self, tail: &[&str]) -> PlatformResult<String> {
        let args = self.compose_args(tail);
        self.runner.run("docker", &args, Some(&self.dir)).await
    }

    /// Update the override for `service` and converge it.
    async fn converge(
        &self,
        service: &str,
        update: impl FnOnce(Option<ServiceOverride>) -> Option<ServiceOverride>,
    ) -> PlatformResult<bool> {
        let _guard = self.overrides.lock().await;
        let path = self.override_path();
        let mut file: Override = read_json(&path).await?;
        let Some(next) = update(file.services.get(service).cloned()) else {
            return Ok(false);
        };
        file.services.insert(service.to_string(), next);
        write_json(&path, &file).await?;
        self.compose(&["up", "-d", "--no-deps", service]).await?;
        Ok(true)
    }
}

#[async_trait]
impl WorkloadPlatform for ComposePlatform {
    async fn set_image(
        &self,
        workload: &str,
        image: &ImageRef,
        replicas: u32,
        surge: SurgePolicy,
    ) -> PlatformResult<()> {
        debug!(%workload, max_surge = surge.max_surge, "compose recreates in place; surge ignored");
        let image = image.to_string();
        self.converge(workload, |_| {
            Some(ServiceOverride {
                image: image.clone(),
                deploy: Deploy { replicas },
            })
        })
        .await?;
        info!(%workload, %image, replicas, "compose service updated");
        Ok(())
    }

    async fn status(&self, workload: &str) -> PlatformResult<Option<WorkloadStatus>> {
        let file: Override = read_json(&self.override_path()).await?;
        let Some(desired) = file.services.get(workload) else {
            return Ok(None);
        };
        let args = self.compose_args(&["ps", "--format", "json", workload]);
        let stdout = self.runner.run("docker", &args, Some(&self.dir)).await?;
        let entries = parse_ps(&display_command("docker", &args), &stdout)?;

        let updated: Vec<&PsEntry> = entries
            .iter()
            .filter(|e| e.service == workload && e.image == desired.image)
            .collect();
        Ok(Some(WorkloadStatus {
            image: desired.image.clone(),
            replicas: desired.deploy.replicas,
            ready_replicas: updated.iter().filter(|e| e.is_ready()).count() as u32,
            updated_replicas: updated.len() as u32,
        }))
    }

    async fn scale(&self, workload: &str, replicas: u32) -> PlatformResult<()> {
        let scaled = self
            .converge(workload, |current| {
                current.map(|mut s| {
                    s.deploy.replicas = replicas;
                    s
                })
            })
            .await?;
        if scaled {
            info!(%workload, replicas, "scaled");
        } else {
            debug!(%workload, "no compose service to scale");
        }
        Ok(())
    }
}

/// Per-service routing state the proxy reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_color: Option<Color>,
    #[serde(default)]
    pub canary_weight: u8,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RouteTable {
    #[serde(default)]
    services: BTreeMap<String, Route>,
}

/// Router backed by a JSON route file.
pub struct FileRouter {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileRouter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub async fn route(&self, service: &str) -> PlatformResult<Route> {
        let table: RouteTable = read_json(&self.path).await?;
        Ok(table.services.get(service).cloned().unwrap_or_default())
    }

    async fn update(&self, service: &str, f: impl FnOnce(&mut Route)) -> PlatformResult<()> {
        let _guard = self.lock.lock().await;
        let mut table: RouteTable = read_json(&self.path).await?;
        f(table.services.entry(service.to_string()).or_default());
        write_json(&self.path, &table).await
    }
}

#[async_trait]
impl TrafficRouter for FileRouter {
    async fn active_color(&self, service: &str) -> PlatformResult<Option<Color>> {
        Ok(self.route(service).await?.active_color)
    }

    async fn set_active_color(&self, service: &str, color: Color) -> PlatformResult<()> {
        self.update(service, |r| r.active_color = Some(color)).await
    }

    async fn canary_weight(&self, service: &str) -> PlatformResult<u8> {
        Ok(self.route(service).await?.canary_weight)
    }

    async fn set_canary_weight(&self, service: &str, weight: u8) -> PlatformResult<()> {
        self.update(service, |r| r.canary_weight = weight.min(100)).await
    }
}

//! External provider health monitoring.
//!
//! A background loop probes each configured provider at a fixed interval and
//! caches the result in memory. [`ResourceMonitor::is_available`] is an O(1)
//! map read; the executor calls it before selecting a task whose model tier
//! or tools depend on that provider. Probes are cheap: an HTTP GET against a
//! known endpoint, a TCP connect fallback, or the mere presence of a
//! credential.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::Config;

/// Cached health of one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Online,
    Offline,
    /// Initial state before the first probe completes.
    Checking,
}

/// How a resource is probed.
#[derive(Debug, Clone)]
enum Probe {
    /// GET a known endpoint; 2xx means online. Falls back to a TCP connect
    /// when the HTTP check fails but the port accepts connections.
    Http { url: String, host: String, port: u16 },
    /// Online iff a credential is configured. No network I/O.
    Credential { configured: bool },
}

#[derive(Debug, Clone)]
struct ResourceDef {
    id: String,
    name: String,
    probe: Probe,
}

/// Health snapshot returned to callers.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceState {
    pub id: String,
    pub name: String,
    pub status: ResourceStatus,
    pub method: &'static str,
    pub details: Value,
}

fn host_port(url: &str, default_port: u16) -> (String, u16) {
    let trimmed = url
        .trim_start_matches("http://")
        .trim_start_matches("https://");
    let authority = trimmed.split('/').next().unwrap_or(trimmed);
    match authority.rsplit_once(':') {
        Some((host, port)) => (
            host.to_string(),
            port.parse().unwrap_or(default_port),
        ),
        None => (authority.to_string(), default_port),
    }
}

/// Periodically checks resource health and caches results.
pub struct ResourceMonitor {
    resources: Vec<ResourceDef>,
    states: RwLock<HashMap<String, ResourceState>>,
    http: reqwest::Client,
    interval: Duration,
    probe_timeout: Duration,
    shutdown: CancellationToken,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ResourceMonitor {
    /// Build resource definitions from configuration.
    pub fn from_config(config: &Config) -> Self {
        let mut resources = Vec::new();

        let (host, port) = host_port(&config.ollama_host, 11434);
        resources.push(ResourceDef {
            id: "ollama_local".to_string(),
            name: "Local inference".to_string(),
            probe: Probe::Http {
                url: format!("{}/api/tags", config.ollama_host.trim_end_matches('/')),
                host,
                port,
            },
        });

        if let Some(image_host) = &config.image_host {
            let (host, port) = host_port(image_host, 8188);
            resources.push(ResourceDef {
                id: "image_service".to_string(),
                name: "Image generation".to_string(),
                probe: Probe::Http {
                    url: format!("{}/system_stats", image_host.trim_end_matches('/')),
                    host,
                    port,
                },
            });
        }

        resources.push(ResourceDef {
            id: "anthropic_api".to_string(),
            name: "Hosted model API".to_string(),
            probe: Probe::Credential {
                configured: !config.api_key.is_empty(),
            },
        });

        let states = resources
            .iter()
            .map(|r| {
                (
                    r.id.clone(),
                    ResourceState {
                        id: r.id.clone(),
                        name: r.name.clone(),
                        status: ResourceStatus::Checking,
                        method: "none",
                        details: json!({}),
                    },
                )
            })
            .collect();

        Self {
            resources,
            states: RwLock::new(states),
            http: reqwest::Client::new(),
            interval: config.resource_check_interval,
            probe_timeout: config.health_probe_timeout,
            shutdown: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    async fn check_http(&self, url: &str) -> bool {
        match self
            .http
            .get(url)
            .timeout(self.probe_timeout)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    async fn check_tcp(&self, host: &str, port: u16) -> bool {
        matches!(
            tokio::time::timeout(
                self.probe_timeout,
                tokio::net::TcpStream::connect((host, port)),
            )
            .await,
            Ok(Ok(_))
        )
    }

    async fn check_resource(&self, def: &ResourceDef) -> ResourceState {
        let (status, method, details) = match &def.probe {
            Probe::Credential { configured } => {
                let status = if *configured {
                    ResourceStatus::Online
                } else {
                    ResourceStatus::Offline
                };
                (status, "api_key", json!({ "key_configured": configured }))
            }
            Probe::Http { url, host, port } => {
                if self.check_http(url).await {
                    (ResourceStatus::Online, "http", json!({}))
                } else if self.check_tcp(host, *port).await {
                    (ResourceStatus::Online, "tcp", json!({}))
                } else {
                    (ResourceStatus::Offline, "none", json!({}))
                }
            }
        };
        ResourceState {
            id: def.id.clone(),
            name: def.name.clone(),
            status,
            method,
            details,
        }
    }

    /// Probe every resource concurrently and refresh the cache.
    pub async fn check_all(&self) -> Vec<ResourceState> {
        let checks = self.resources.iter().map(|def| self.check_resource(def));
        let results = join_all(checks).await;
        let mut states = self.states.write().unwrap();
        for state in &results {
            states.insert(state.id.clone(), state.clone());
        }
        results
    }

    /// Cached snapshot of every resource (no I/O).
    pub fn all(&self) -> Vec<ResourceState> {
        self.states.read().unwrap().values().cloned().collect()
    }

    /// Cached state of one resource.
    pub fn get(&self, resource_id: &str) -> Option<ResourceState> {
        self.states.read().unwrap().get(resource_id).cloned()
    }

    /// Non-blocking availability query. Unknown resources are unavailable.
    pub fn is_available(&self, resource_id: &str) -> bool {
        self.states
            .read()
            .unwrap()
            .get(resource_id)
            .map(|s| s.status == ResourceStatus::Online)
            .unwrap_or(false)
    }

    /// Start the background probe loop.
    pub async fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return;
        }
        let monitor = Arc::clone(self);
        *handle = Some(tokio::spawn(async move {
            loop {
                monitor.check_all().await;
                tokio::select! {
                    _ = monitor.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(monitor.interval) => {}
                }
            }
        }));
    }

    /// Stop the probe loop.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

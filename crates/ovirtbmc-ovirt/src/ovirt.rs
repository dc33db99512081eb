//! oVirt / RHV engine REST client
//!
//! Talks to the engine's v4 JSON API:
//!
//! | Operation | Request |
//! |-----------|---------|
//! | find by name | `GET /vms?search=name=<name>` |
//! | status, boot device | `GET /vms/<id>` |
//! | start / stop / shutdown / reset | `POST /vms/<id>/<action>` |
//! | set boot device | `PUT /vms/<id>` |

use crate::client::VmLifecycle;
use crate::error::{LifecycleError, Result};
use crate::types::{BootDevice, VmIdentity, VmStatus};
use async_trait::async_trait;
use reqwest::{header, Client, Method, RequestBuilder, Response};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// Default HTTP timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection settings for the engine
#[derive(Clone)]
pub struct OvirtConfig {
    /// API root URL
    pub endpoint: String,
    pub username: String,
    pub password: String,
    /// Skip TLS certificate verification
    pub insecure: bool,
    pub timeout: Duration,
}

impl std::fmt::Debug for OvirtConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OvirtConfig")
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .field("insecure", &self.insecure)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl OvirtConfig {
    /// Create a config from an engine FQDN or a full API URL
    pub fn new(
        fqdn_or_url: impl AsRef<str>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: api_url(fqdn_or_url.as_ref()),
            username: username.into(),
            password: password.into(),
            insecure: true,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set whether TLS verification is skipped
    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    /// Set the HTTP timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// API root for an engine FQDN; values with a scheme are used as-is
pub fn api_url(fqdn_or_url: &str) -> String {
    let value = fqdn_or_url.trim();
    if value.contains("://") {
        value.trim_end_matches('/').to_string()
    } else {
        format!("https://{}/ovirt-engine/api", value)
    }
}

#[derive(Debug, Deserialize)]
struct VmList {
    #[serde(default)]
    vm: Vec<VmRecord>,
}

#[derive(Debug, Deserialize)]
struct VmRecord {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    os: Option<OsRecord>,
}

#[derive(Debug, Deserialize)]
struct OsRecord {
    #[serde(default)]
    boot: Option<BootRecord>,
}

#[derive(Debug, Deserialize)]
struct BootRecord {
    #[serde(default)]
    devices: Option<DeviceList>,
}

#[derive(Debug, Deserialize)]
struct DeviceList {
    #[serde(default)]
    device: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Fault {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    detail: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FaultBody {
    #[serde(default)]
    fault: Option<Fault>,
    #[serde(flatten)]
    top: Fault,
}

/// Pooled client for one engine
pub struct OvirtClient {
    http: Client,
    base: Url,
    username: String,
    password: String,
}

impl OvirtClient {
    /// Build the HTTP client and probe the API root
    ///
    /// Bad credentials or an unreachable engine fail here rather than on
    /// the first IPMI command.
    pub async fn connect(config: OvirtConfig) -> Result<Self> {
        let base = Url::parse(&config.endpoint).map_err(|e| {
            LifecycleError::InvalidConfig(format!("invalid engine URL {}: {}", config.endpoint, e))
        })?;

        let http = Client::builder()
            .danger_accept_invalid_certs(config.insecure)
            .timeout(config.timeout)
            .build()
            .map_err(|e| LifecycleError::InvalidConfig(format!("failed to build HTTP client: {}", e)))?;

        let client = Self {
            http,
            base,
            username: config.username,
            password: config.password,
        };

        client.probe().await?;
        info!(endpoint = %client.base, insecure = config.insecure, "Connected to oVirt engine");
        Ok(client)
    }

    async fn probe(&self) -> Result<()> {
        let url = self.url(&[])?;
        let response = self.request(Method::GET, url).send().await?;
        check(response).await?;
        Ok(())
    }

    /// Build a URL below the API root
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| LifecycleError::InvalidConfig(format!("{} cannot be a base URL", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http
            .request(method, url)
            .basic_auth(&self.username, Some(&self.password))
            .header("Version", "4")
            .header(header::ACCEPT, "application/json")
    }

    async fn get_vm(&self, id: &str) -> Result<VmRecord> {
        let url = self.url(&["vms", id])?;
        let response = check(self.request(Method::GET, url).send().await?).await?;
        Ok(response.json::<VmRecord>().await?)
    }

    async fn action(&self, id: &str, action: &str) -> Result<()> {
        let url = self.url(&["vms", id, action])?;
        debug!(vm_id = %id, action, "Issuing VM action");
        let response = self
            .request(Method::POST, url)
            .json(&serde_json::json!({}))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }
}

#[async_trait]
impl VmLifecycle for OvirtClient {
    async fn find_by_name(&self, name: &str) -> Result<VmIdentity> {
        let mut url = self.url(&["vms"])?;
        url.query_pairs_mut()
            .append_pair("search", &format!("name={}", name));

        let response = check(self.request(Method::GET, url).send().await?).await?;
        let list = response.json::<VmList>().await?;

        // The search matches on wildcards and prefixes; keep exact names only
        let matches: Vec<VmRecord> = list.vm.into_iter().filter(|vm| vm.name == name).collect();
        match matches.len() {
            0 => Err(LifecycleError::NotFound(name.to_string())),
            1 => {
                let vm = &matches[0];
                Ok(VmIdentity::new(vm.name.clone(), vm.id.clone()))
            }
            count => Err(LifecycleError::Ambiguous {
                name: name.to_string(),
                count,
            }),
        }
    }

    async fn get_status(&self, id: &str) -> Result<VmStatus> {
        let vm = self.get_vm(id).await?;
        let status = vm
            .status
            .ok_or_else(|| LifecycleError::InvalidResponse(format!("VM {} has no status", id)))?;
        Ok(VmStatus::from_remote(&status))
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.action(id, "start").await
    }

    async fn stop(&self, id: &str) -> Result<()> {
        self.action(id, "stop").await
    }

    async fn shutdown(&self, id: &str) -> Result<()> {
        self.action(id, "shutdown").await
    }

    async fn reset(&self, id: &str) -> Result<()> {
        self.action(id, "reset").await
    }

    async fn set_boot_device(&self, id: &str, device: &BootDevice) -> Result<()> {
        if let BootDevice::Unsupported(name) = device {
            return Err(LifecycleError::InvalidConfig(format!(
                "cannot set unsupported boot device {}",
                name
            )));
        }

        let url = self.url(&["vms", id])?;
        let body = serde_json::json!({
            "os": { "boot": { "devices": { "device": [device.as_remote()] } } }
        });
        debug!(vm_id = %id, device = %device, "Updating boot device");
        check(self.request(Method::PUT, url).json(&body).send().await?).await?;
        Ok(())
    }

    async fn get_boot_device(&self, id: &str) -> Result<BootDevice> {
        let vm = self.get_vm(id).await?;
        let first = vm
            .os
            .and_then(|os| os.boot)
            .and_then(|boot| boot.devices)
            .and_then(|devices| devices.device.into_iter().next());
        Ok(match first {
            Some(device) => BootDevice::from_remote(&device),
            None => BootDevice::Unsupported("none".to_string()),
        })
    }
}

/// Turn a non-success response into an error
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify(status.as_u16(), &body))
}

fn classify(status: u16, body: &str) -> LifecycleError {
    let message = fault_message(body);
    match status {
        401 | 403 => LifecycleError::Auth(message),
        404 => LifecycleError::NotFound(message),
        400 | 409 if is_state_conflict(&message) => LifecycleError::Conflict(message),
        _ => LifecycleError::Api { status, message },
    }
}

/// Extract the fault detail from an error body
fn fault_message(body: &str) -> String {
    let parsed: FaultBody = serde_json::from_str(body).unwrap_or_default();
    let fault = parsed.fault.unwrap_or(parsed.top);
    match (fault.reason, fault.detail) {
        (_, Some(detail)) => detail.trim_matches(|c| c == '[' || c == ']').to_string(),
        (Some(reason), None) => reason,
        (None, None) if !body.trim().is_empty() => body.trim().to_string(),
        (None, None) => "no detail".to_string(),
    }
}

/// Faults the engine raises when the VM is already in the target state
const STATE_CONFLICTS: &[&str] = &[
    "vm is running",
    "vm is already running",
    "vm is not running",
    "vm is down",
    "vm is already down",
];

/// Whether a fault says the VM is already in the target state
///
/// The engine answers every failed validation with 400 or 409, so the
/// status code alone says nothing about the VM's state.
fn is_state_conflict(message: &str) -> bool {
    let lower = message.to_lowercase();
    STATE_CONFLICTS.iter().any(|pattern| lower.contains(pattern))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, Query, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Engine {
        status: Mutex<String>,
        boot: Mutex<Vec<String>>,
        actions: Mutex<Vec<String>>,
        start_fault: Mutex<Option<String>>,
    }

    fn authorized(headers: &HeaderMap) -> bool {
        // "admin@internal:secret"
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(|v| v == "Basic YWRtaW5AaW50ZXJuYWw6c2VjcmV0")
            .unwrap_or(false)
    }

    async fn root(headers: HeaderMap) -> (StatusCode, Json<Value>) {
        if !authorized(&headers) {
            return (StatusCode::UNAUTHORIZED, Json(json!({ "detail": "Unauthorized" })));
        }
        (StatusCode::OK, Json(json!({ "product_info": { "name": "oVirt Engine" } })))
    }

    async fn list_vms(Query(query): Query<HashMap<String, String>>) -> Json<Value> {
        let vms = match query.get("search").map(String::as_str) {
            Some("name=vmA") => json!([
                { "id": "id-a", "name": "vmA", "status": "down" },
                { "id": "id-a2", "name": "vmA2", "status": "up" }
            ]),
            Some("name=twin") => json!([
                { "id": "id-1", "name": "twin" },
                { "id": "id-2", "name": "twin" }
            ]),
            _ => return Json(json!({})),
        };
        Json(json!({ "vm": vms }))
    }

    async fn show_vm(State(engine): State<Arc<Engine>>, Path(id): Path<String>) -> (StatusCode, Json<Value>) {
        if id != "id-a" {
            return (StatusCode::NOT_FOUND, Json(json!({ "detail": "Entity not found" })));
        }
        let status = engine.status.lock().unwrap().clone();
        let devices = engine.boot.lock().unwrap().clone();
        (
            StatusCode::OK,
            Json(json!({
                "id": "id-a",
                "name": "vmA",
                "status": status,
                "os": { "boot": { "devices": { "device": devices } } }
            })),
        )
    }

    async fn update_vm(State(engine): State<Arc<Engine>>, Json(body): Json<Value>) -> Json<Value> {
        let devices = body["os"]["boot"]["devices"]["device"]
            .as_array()
            .map(|d| d.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();
        *engine.boot.lock().unwrap() = devices;
        Json(json!({}))
    }

    async fn vm_action(
        State(engine): State<Arc<Engine>>,
        Path((_id, action)): Path<(String, String)>,
    ) -> (StatusCode, Json<Value>) {
        engine.actions.lock().unwrap().push(action.clone());
        if action == "start" {
            if let Some(detail) = engine.start_fault.lock().unwrap().clone() {
                return (
                    StatusCode::CONFLICT,
                    Json(json!({
                        "status": "failed",
                        "fault": { "reason": "Operation Failed", "detail": detail }
                    })),
                );
            }
        }
        let mut status = engine.status.lock().unwrap();
        match (action.as_str(), status.as_str()) {
            ("start", "up") => (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "status": "failed",
                    "fault": { "reason": "Operation Failed", "detail": "[Cannot run VM. VM is running.]" }
                })),
            ),
            ("start", _) => {
                *status = "up".to_string();
                (StatusCode::OK, Json(json!({ "status": "complete" })))
            }
            ("stop", _) => {
                *status = "down".to_string();
                (StatusCode::OK, Json(json!({ "status": "complete" })))
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "detail": "boom" }))),
        }
    }

    async fn spawn_engine(engine: Arc<Engine>) -> String {
        let app = Router::new()
            .route("/ovirt-engine/api", get(root))
            .route("/ovirt-engine/api/vms", get(list_vms))
            .route("/ovirt-engine/api/vms/{id}", get(show_vm).put(update_vm))
            .route("/ovirt-engine/api/vms/{id}/{action}", post(vm_action))
            .with_state(engine);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/ovirt-engine/api", addr)
    }

    async fn connect(endpoint: &str) -> OvirtClient {
        OvirtClient::connect(OvirtConfig::new(endpoint, "admin@internal", "secret"))
            .await
            .unwrap()
    }

    #[test]
    fn test_api_url() {
        assert_eq!(
            api_url("engine.example.com"),
            "https://engine.example.com/ovirt-engine/api"
        );
        assert_eq!(
            api_url("https://engine.example.com/ovirt-engine/api/"),
            "https://engine.example.com/ovirt-engine/api"
        );
    }

    #[test]
    fn test_classify() {
        let body = r#"{"status":"failed","fault":{"reason":"Operation Failed","detail":"[Cannot stop VM. VM is not running.]"}}"#;
        assert!(classify(400, body).is_conflict());
        assert!(matches!(classify(401, ""), LifecycleError::Auth(_)));
        assert!(matches!(classify(404, r#"{"detail":"Entity not found"}"#), LifecycleError::NotFound(m) if m == "Entity not found"));
        assert!(matches!(
            classify(400, r#"{"detail":"[Invalid disk interface]"}"#),
            LifecycleError::Api { status: 400, .. }
        ));
        assert!(matches!(classify(502, "<html>bad gateway</html>"), LifecycleError::Api { status: 502, message } if message.contains("bad gateway")));
    }

    #[test]
    fn test_classify_validation_failures_are_not_conflicts() {
        let running = r#"{"fault":{"reason":"Operation Failed","detail":"[Cannot run VM. VM is running.]"}}"#;
        assert!(classify(409, running).is_conflict());

        let scheduling = r#"{"fault":{"reason":"Operation Failed","detail":"[Cannot run VM. There is no host that satisfies current scheduling constraints.]"}}"#;
        assert!(matches!(
            classify(409, scheduling),
            LifecycleError::Api { status: 409, message } if message.contains("scheduling constraints")
        ));

        let migrating = r#"{"fault":{"reason":"Operation Failed","detail":"[Cannot shutdown VM. The VM is already being migrated.]"}}"#;
        assert!(!classify(400, migrating).is_conflict());
        assert!(!classify(409, migrating).is_conflict());
    }

    #[test]
    fn test_vm_list_without_vm_key() {
        let list: VmList = serde_json::from_str("{}").unwrap();
        assert!(list.vm.is_empty());
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_credentials() {
        let endpoint = spawn_engine(Arc::new(Engine::default())).await;
        let result = OvirtClient::connect(OvirtConfig::new(&endpoint, "admin@internal", "wrong")).await;
        assert!(matches!(result, Err(LifecycleError::Auth(_))));
    }

    #[tokio::test]
    async fn test_find_by_name() {
        let endpoint = spawn_engine(Arc::new(Engine::default())).await;
        let client = connect(&endpoint).await;

        let vm = client.find_by_name("vmA").await.unwrap();
        assert_eq!(vm, VmIdentity::new("vmA", "id-a"));

        assert!(matches!(
            client.find_by_name("missing").await,
            Err(LifecycleError::NotFound(_))
        ));
        assert!(matches!(
            client.find_by_name("twin").await,
            Err(LifecycleError::Ambiguous { count: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_status_and_actions() {
        let engine = Arc::new(Engine::default());
        *engine.status.lock().unwrap() = "down".to_string();
        let endpoint = spawn_engine(engine.clone()).await;
        let client = connect(&endpoint).await;

        assert_eq!(client.get_status("id-a").await.unwrap(), VmStatus::Down);
        client.start("id-a").await.unwrap();
        assert_eq!(client.get_status("id-a").await.unwrap(), VmStatus::Up);

        let err = client.start("id-a").await.unwrap_err();
        assert!(err.is_conflict());

        assert!(matches!(
            client.reset("id-a").await,
            Err(LifecycleError::Api { status: 500, .. })
        ));
        assert!(matches!(
            client.get_status("id-b").await,
            Err(LifecycleError::NotFound(_))
        ));
        assert_eq!(
            *engine.actions.lock().unwrap(),
            vec!["start".to_string(), "start".to_string(), "reset".to_string()]
        );
    }

    #[tokio::test]
    async fn test_start_refused_by_scheduler() {
        let engine = Arc::new(Engine::default());
        *engine.status.lock().unwrap() = "down".to_string();
        *engine.start_fault.lock().unwrap() = Some(
            "[Cannot run VM. There is no host that satisfies current scheduling constraints.]"
                .to_string(),
        );
        let endpoint = spawn_engine(engine.clone()).await;
        let client = connect(&endpoint).await;

        let err = client.start("id-a").await.unwrap_err();
        assert!(!err.is_conflict());
        assert!(matches!(err, LifecycleError::Api { status: 409, .. }));
        assert_eq!(client.get_status("id-a").await.unwrap(), VmStatus::Down);
    }

    #[tokio::test]
    async fn test_boot_device() {
        let engine = Arc::new(Engine::default());
        *engine.status.lock().unwrap() = "down".to_string();
        let endpoint = spawn_engine(engine.clone()).await;
        let client = connect(&endpoint).await;

        assert_eq!(
            client.get_boot_device("id-a").await.unwrap(),
            BootDevice::Unsupported("none".to_string())
        );

        client.set_boot_device("id-a", &BootDevice::Network).await.unwrap();
        assert_eq!(*engine.boot.lock().unwrap(), vec!["network".to_string()]);
        assert_eq!(client.get_boot_device("id-a").await.unwrap(), BootDevice::Network);

        *engine.boot.lock().unwrap() = vec!["cdrom".to_string(), "hd".to_string()];
        assert_eq!(
            client.get_boot_device("id-a").await.unwrap(),
            BootDevice::Unsupported("cdrom".to_string())
        );
    }
}

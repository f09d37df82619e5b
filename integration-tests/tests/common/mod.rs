use serde_json::json;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const GITHUB_TOKEN: &str = "gh-test-token";
pub const OPERATOR_EMAIL: &str = "ops@example.com";
pub const OPERATOR_PASSWORD: &str = "correct-horse-battery";

/// Find a free TCP port by binding to port 0
pub fn find_free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind to port 0");
    listener.local_addr().unwrap().port()
}

/// Wait for a TCP port to accept connections
pub async fn wait_for_port(port: u16, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if tokio::time::Instant::now() > deadline {
            panic!("Timed out waiting for port {} to be ready", port);
        }
        if tokio::net::TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Poll `check` until it returns `Some`, panicking after `timeout`.
pub async fn eventually<T, F, Fut>(what: &str, timeout: Duration, mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(v) = check().await {
            return v;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("Timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

/// Get the path to a compiled binary in the target directory
pub fn cargo_bin(name: &str) -> PathBuf {
    // Look for the binary in target/debug (standard cargo test location)
    let mut path = std::env::current_exe()
        .expect("Failed to get current exe")
        .parent()
        .expect("No parent")
        .parent()
        .expect("No grandparent")
        .to_path_buf();
    path.push(name);
    if path.exists() {
        return path;
    }

    // Fallback: try target/debug directly
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.pop(); // integration-tests -> workspace root
    path.push("target");
    path.push("debug");
    path.push(name);
    if path.exists() {
        return path;
    }

    panic!(
        "Binary '{}' not found. Run `cargo build --workspace` first.",
        name
    );
}

/// Serve the GitHub endpoints deployment creation walks through for
/// `acme/demo` on branch `main`.
async fn fake_github() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/repos/acme/demo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 42,
            "name": "demo",
            "full_name": "acme/demo",
            "owner": { "login": "acme" },
            "private": false,
            "clone_url": "https://github.com/acme/demo.git",
            "default_branch": "main",
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/repos/acme/demo/branches/main"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "main", "protected": false, "commit": { "sha": "0123abcd" }
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/repos/acme/demo/contents/Dockerfile"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;
    server
}

fn spawn_control(port: u16, db_path: &Path, github_url: &str) -> Child {
    Command::new(cargo_bin("deployer-control"))
        .args(["--bind", &format!("127.0.0.1:{}", port)])
        .args(["--db-path", db_path.to_str().unwrap()])
        .args(["--log-level", "debug"])
        .args(["--cluster-backend", "simulated"])
        .args(["--github-api-url", github_url])
        .args(["--liveness-window-secs", "3"])
        .args(["--sweep-interval-secs", "1"])
        .args(["--cluster-interval-secs", "1"])
        .args(["--deployment-interval-secs", "1"])
        .args(["--backoff-base-ms", "50"])
        .args(["--backoff-cap-ms", "200"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("Failed to start control plane")
}

/// A control plane on an ephemeral port plus any agents started against it
pub struct TestCluster {
    pub control_port: u16,
    pub client: reqwest::Client,
    control: Child,
    agents: Vec<Child>,
    github: MockServer,
    temp_dir: TempDir,
    db_path: PathBuf,
}

impl TestCluster {
    /// Start a control plane on an ephemeral port
    pub async fn new() -> Self {
        let port = find_free_port();
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("control.db");
        let github = fake_github().await;

        let control = spawn_control(port, &db_path, &github.uri());
        wait_for_port(port, Duration::from_secs(10)).await;

        Self {
            control_port: port,
            client: reqwest::Client::new(),
            control,
            agents: Vec::new(),
            github,
            db_path,
            temp_dir,
        }
    }

    /// Get the control plane base URL
    pub fn control_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.control_port)
    }

    pub fn api(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.control_url(), path)
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Start an agent that reports as `name` with the given hardware address
    pub async fn add_agent(&mut self, name: &str, mac: &str) {
        let agent = Command::new(cargo_bin("deployer-agent"))
            .args(["--control-plane", &self.control_url()])
            .args(["--name", name])
            .args(["--mac-address", mac])
            .args(["--public-ip", "127.0.0.1"])
            .args(["--heartbeat-interval-secs", "1"])
            .args(["--log-level", "debug"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("Failed to start agent");
        self.agents.push(agent);

        let url = self.api("/nodes");
        let token = self.login().await;
        let client = self.client.clone();
        let name = name.to_string();
        eventually("agent registration", Duration::from_secs(10), || {
            let (client, url, token, name) = (client.clone(), url.clone(), token.clone(), name.clone());
            async move {
                let resp = client.get(&url).bearer_auth(&token).send().await.ok()?;
                let list = resp.json::<ListNodesResponse>().await.ok()?;
                list.nodes.into_iter().find(|n| n.name == name).map(|_| ())
            }
        })
        .await;
    }

    /// Get a mutable reference to an agent process
    pub fn agent_mut(&mut self, index: usize) -> &mut Child {
        &mut self.agents[index]
    }

    pub fn control_mut(&mut self) -> &mut Child {
        &mut self.control
    }

    /// Restart the control plane (same DB path, new port)
    pub async fn restart_control(&mut self) -> u16 {
        let _ = self.control.kill();
        let _ = self.control.wait();

        let port = find_free_port();
        self.control = spawn_control(port, &self.db_path, &self.github.uri());
        wait_for_port(port, Duration::from_secs(10)).await;

        self.control_port = port;
        port
    }

    /// Register the operator account if needed and return a fresh session token
    pub async fn login(&self) -> String {
        let _ = self
            .client
            .post(self.api("/auth/register"))
            .json(&json!({
                "email": OPERATOR_EMAIL,
                "username": "operator",
                "password": OPERATOR_PASSWORD,
                "fullName": "Test Operator"
            }))
            .send()
            .await
            .expect("Failed to register operator");

        let resp = self
            .client
            .post(self.api("/auth/login"))
            .json(&json!({ "email": OPERATOR_EMAIL, "password": OPERATOR_PASSWORD }))
            .send()
            .await
            .expect("Failed to log in");
        assert!(resp.status().is_success(), "login failed: {}", resp.status());
        resp.json::<LoginResponse>()
            .await
            .expect("Failed to parse login response")
            .token
    }

    /// Register a node directly, as an agent would
    pub async fn register_node(&self, name: &str, mac: &str) -> RegisterNodeResponse {
        self.client
            .post(self.api("/nodes/register"))
            .json(&register_body(name, mac))
            .send()
            .await
            .expect("Failed to register")
            .json::<RegisterNodeResponse>()
            .await
            .expect("Failed to parse response")
    }

    pub async fn list_nodes(&self, token: &str) -> ListNodesResponse {
        self.client
            .get(self.api("/nodes"))
            .bearer_auth(token)
            .send()
            .await
            .expect("Failed to list nodes")
            .json::<ListNodesResponse>()
            .await
            .expect("Failed to parse response")
    }

    pub async fn get_deployment(&self, token: &str, id: &str) -> Deployment {
        self.client
            .get(self.api(&format!("/deployments/{}", id)))
            .bearer_auth(token)
            .send()
            .await
            .expect("Failed to get deployment")
            .json::<Deployment>()
            .await
            .expect("Failed to parse deployment")
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        for agent in &mut self.agents {
            let _ = agent.kill();
            let _ = agent.wait();
        }
        let _ = self.control.kill();
        let _ = self.control.wait();
    }
}

pub fn register_body(name: &str, mac: &str) -> serde_json::Value {
    json!({
        "name": name,
        "macAddress": mac,
        "publicIp": "127.0.0.1",
        "capacity": { "cpuCores": 4, "memoryBytes": 8_589_934_592u64, "podsCapacity": 110 },
        "clusterInfo": { "clusterName": "test" },
        "metadata": { "osType": "linux" }
    })
}

/// Deliver SIGINT, which every binary treats as a shutdown request
#[cfg(unix)]
pub fn interrupt(child: &Child) {
    unsafe {
        libc::kill(child.id() as i32, libc::SIGINT);
    }
}

/// Wait for a child process to exit on its own
pub async fn wait_exit(child: &mut Child, timeout: Duration) -> Option<std::process::ExitStatus> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait().expect("try_wait failed") {
            return Some(status);
        }
        if tokio::time::Instant::now() > deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Response types for deserialization
#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    pub name: String,
    pub mac_address: String,
    pub status: String,
}

#[derive(Debug, serde::Deserialize)]
pub struct ListNodesResponse {
    pub nodes: Vec<Node>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterNodeResponse {
    pub node_id: String,
    pub status: String,
    pub created: bool,
}

#[derive(Debug, serde::Deserialize)]
pub struct LoginResponse {
    pub token: String,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub id: String,
    pub node_id: String,
    pub name: String,
    pub context_path: String,
    pub status: String,
    pub status_reason: Option<String>,
}

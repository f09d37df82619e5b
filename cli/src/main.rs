mod config;
mod error;
mod http_client;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::header::HeaderMap;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use config::{default_config_path, Profile};
use error::CliError;
use http_client::{header_kv, Client};

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8080";
const GITHUB_TOKEN_HEADER: &str = "x-github-token";

#[derive(Parser, Debug)]
#[command(name = "deployctl")]
#[command(about = "Operate the node deployer control plane", long_about = None)]
struct Cli {
    /// Control plane URL (defaults to the saved profile)
    #[arg(long, env = "DEPLOYCTL_URL", global = true)]
    base_url: Option<String>,

    /// Profile file
    #[arg(long, env = "DEPLOYCTL_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// GitHub token sent per request; never saved
    #[arg(long, env = "DEPLOYCTL_GITHUB_TOKEN", global = true, hide_env_values = true)]
    github_token: Option<String>,

    #[arg(long, env = "DEPLOYCTL_TIMEOUT_SECS", default_value_t = 30, global = true)]
    timeout_secs: u64,

    /// Retries for idempotent requests
    #[arg(long, env = "DEPLOYCTL_RETRIES", default_value_t = 2, global = true)]
    retries: u32,

    #[arg(long, env = "DEPLOYCTL_LOG_LEVEL", default_value = "warn", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an account
    Register {
        #[arg(long)]
        email: String,
        #[arg(long)]
        username: String,
        #[arg(long, env = "DEPLOYCTL_PASSWORD", hide_env_values = true)]
        password: String,
        #[arg(long, default_value = "")]
        full_name: String,
    },
    /// Log in and save the session token
    Login {
        #[arg(long)]
        email: String,
        #[arg(long, env = "DEPLOYCTL_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// End the session and forget the saved token
    Logout,
    /// Show the user behind the saved session
    Whoami,
    /// Control plane liveness
    Health,
    #[command(subcommand)]
    Nodes(NodesCommand),
    #[command(subcommand)]
    Deployments(DeploymentsCommand),
    #[command(subcommand)]
    Github(GithubCommand),
    #[command(subcommand)]
    K8s(K8sCommand),
    #[command(subcommand)]
    Metrics(MetricsCommand),
}

#[derive(Subcommand, Debug)]
enum NodesCommand {
    List {
        #[arg(long)]
        status: Option<String>,
        /// Only nodes within --radius-km of this `lat,lon`
        #[arg(long, requires = "radius_km", allow_hyphen_values = true)]
        near: Option<String>,
        #[arg(long, requires = "near")]
        radius_km: Option<f64>,
    },
    Stats,
    Get {
        id: String,
    },
    Update {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        public_ip: Option<String>,
        #[arg(long)]
        private_ip: Option<String>,
        /// Replace the node's tags (repeatable, or comma-separated)
        #[arg(long = "tag", value_delimiter = ',')]
        tags: Option<Vec<String>>,
    },
    /// Force a node status (online, offline, maintenance)
    SetStatus {
        id: String,
        status: String,
    },
    Remove {
        id: String,
    },
}

#[derive(Subcommand, Debug)]
enum DeploymentsCommand {
    Create(CreateArgs),
    /// Deployments owned by the current user
    List {
        #[arg(long)]
        node_id: Option<String>,
        #[arg(long)]
        status: Option<String>,
    },
    Stats {
        #[arg(long)]
        node_id: Option<String>,
    },
    /// Deployments bound to one node
    OnNode {
        node_id: String,
    },
    Get {
        id: String,
    },
    Update(UpdateArgs),
    Scale {
        id: String,
        replicas: i64,
    },
    Restart {
        id: String,
    },
    Delete {
        id: String,
        /// Remove the record once the cluster objects are gone
        #[arg(long)]
        purge: bool,
    },
}

#[derive(Args, Debug)]
struct CreateArgs {
    #[arg(long)]
    node_id: String,
    #[arg(long)]
    owner: String,
    #[arg(long)]
    repo: String,
    #[arg(long, default_value = "main")]
    branch: String,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    context_path: Option<String>,
    #[arg(long)]
    namespace: Option<String>,
    #[arg(long)]
    replicas: Option<i64>,
    #[arg(long)]
    container_port: Option<i64>,
    /// KEY=VALUE, repeatable
    #[arg(long = "env")]
    env: Vec<String>,
    /// JSON file with the full configuration object; flags override it
    #[arg(long)]
    configuration: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct UpdateArgs {
    id: String,
    #[arg(long)]
    replicas: Option<i64>,
    /// KEY=VALUE, repeatable; replaces the whole environment
    #[arg(long = "env")]
    env: Vec<String>,
    #[arg(long)]
    cpu_request: Option<String>,
    #[arg(long)]
    cpu_limit: Option<String>,
    #[arg(long)]
    memory_request: Option<String>,
    #[arg(long)]
    memory_limit: Option<String>,
}

#[derive(Subcommand, Debug)]
enum GithubCommand {
    Repos {
        #[arg(long)]
        page: Option<u32>,
        #[arg(long)]
        per_page: Option<u32>,
    },
    Repo {
        owner: String,
        repo: String,
    },
    Branches {
        owner: String,
        repo: String,
    },
    Search {
        query: String,
    },
    /// Hand a GitHub token to the control plane for this session
    Token {
        #[arg(env = "DEPLOYCTL_GITHUB_TOKEN", hide_env_values = true)]
        token: String,
    },
}

#[derive(Subcommand, Debug)]
enum K8sCommand {
    Info,
    Namespaces,
    Pods {
        #[arg(long)]
        namespace: Option<String>,
    },
    Logs {
        namespace: String,
        pod: String,
        #[arg(long)]
        tail: Option<u32>,
    },
    Services {
        #[arg(long)]
        namespace: Option<String>,
    },
    Nodes,
    Events {
        #[arg(long)]
        namespace: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum MetricsCommand {
    Cluster,
    Pods {
        #[arg(long)]
        namespace: Option<String>,
    },
    Deployment {
        namespace: String,
        name: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    token: String,
    expires_at: i64,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(log_level.into()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut profile = match Profile::load(&path) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("error: {:#}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(cli, &mut profile, &path).await {
        if matches!(e.downcast_ref::<CliError>(), Some(CliError::Unauthorized)) {
            if profile.token.is_some() {
                if let Err(save_err) = profile.clear_session(&path) {
                    eprintln!("warning: {:#}", save_err);
                }
            }
            eprintln!("Session is missing or expired. Run `deployctl login` again.");
        } else {
            eprintln!("error: {:#}", e);
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli, profile: &mut Profile, path: &std::path::Path) -> Result<()> {
    let base_url = cli
        .base_url
        .clone()
        .or_else(|| profile.base_url.clone())
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
    let timeout = Duration::from_secs(cli.timeout_secs);
    let client = Client::new(&base_url, profile.token.clone(), timeout, cli.retries)?;

    let mut github_headers = HeaderMap::new();
    if let Some(token) = &cli.github_token {
        let (k, v) = header_kv(GITHUB_TOKEN_HEADER, token)?;
        github_headers.insert(k, v);
    }

    match cli.command {
        Command::Register {
            email,
            username,
            password,
            full_name,
        } => {
            let body = json!({
                "email": email,
                "username": username,
                "password": password,
                "fullName": full_name,
            });
            client
                .send_json(Method::POST, "/auth/register", HeaderMap::new(), Some(body))
                .await
        }
        Command::Login { email, password } => {
            let resp: LoginResponse = client
                .post_typed(
                    "/auth/login",
                    json!({ "email": email, "password": password }),
                )
                .await
                .map_err(|e| match e.downcast_ref::<CliError>() {
                    Some(CliError::Unauthorized) => anyhow::anyhow!("Invalid email or password"),
                    _ => e,
                })?;
            profile.base_url = Some(base_url);
            profile.token = Some(resp.token);
            profile.save(path)?;
            println!("Logged in; session expires at {} (unix seconds)", resp.expires_at);
            Ok(())
        }
        Command::Logout => {
            let result = client
                .send_json_bytes(Method::POST, "/auth/logout", HeaderMap::new(), None)
                .await;
            profile.clear_session(path)?;
            match result {
                Err(e) if !matches!(e.downcast_ref::<CliError>(), Some(CliError::Unauthorized)) => {
                    Err(e)
                }
                _ => {
                    println!("Logged out");
                    Ok(())
                }
            }
        }
        Command::Whoami => get(&client, "/auth/validate").await,
        Command::Health => get(&client, "/health").await,
        Command::Nodes(cmd) => nodes(&client, cmd).await,
        Command::Deployments(cmd) => deployments(&client, github_headers, cmd).await,
        Command::Github(cmd) => github(&client, github_headers, cmd).await,
        Command::K8s(cmd) => k8s(&client, cmd).await,
        Command::Metrics(cmd) => metrics(&client, cmd).await,
    }
}

async fn get(client: &Client, path: &str) -> Result<()> {
    client
        .send_json(Method::GET, path, HeaderMap::new(), None)
        .await
}

async fn nodes(client: &Client, cmd: NodesCommand) -> Result<()> {
    match cmd {
        NodesCommand::List {
            status,
            near,
            radius_km,
        } => {
            let path = with_query(
                "/nodes",
                &[
                    ("status", status),
                    ("near", near),
                    ("radiusKm", radius_km.map(|r| r.to_string())),
                ],
            );
            get(client, &path).await
        }
        NodesCommand::Stats => get(client, "/nodes/stats").await,
        NodesCommand::Get { id } => get(client, &format!("/nodes/{}", encode(&id))).await,
        NodesCommand::Update {
            id,
            name,
            public_ip,
            private_ip,
            tags,
        } => {
            let mut body = Map::new();
            insert_opt(&mut body, "name", name);
            insert_opt(&mut body, "publicIp", public_ip);
            insert_opt(&mut body, "privateIp", private_ip);
            insert_opt(&mut body, "tags", tags);
            client
                .send_json(
                    Method::PUT,
                    &format!("/nodes/{}", encode(&id)),
                    HeaderMap::new(),
                    Some(Value::Object(body)),
                )
                .await
        }
        NodesCommand::SetStatus { id, status } => {
            client
                .send_json(
                    Method::PUT,
                    &format!("/nodes/{}/status", encode(&id)),
                    HeaderMap::new(),
                    Some(json!({ "status": status })),
                )
                .await
        }
        NodesCommand::Remove { id } => {
            client
                .send_json(
                    Method::DELETE,
                    &format!("/nodes/{}", encode(&id)),
                    HeaderMap::new(),
                    None,
                )
                .await
        }
    }
}

async fn deployments(client: &Client, github: HeaderMap, cmd: DeploymentsCommand) -> Result<()> {
    match cmd {
        DeploymentsCommand::Create(args) => {
            let path = with_query("/deployments", &[("nodeId", Some(args.node_id.clone()))]);
            let body = create_body(&args)?;
            client.send_json(Method::POST, &path, github, Some(body)).await
        }
        DeploymentsCommand::List { node_id, status } => {
            let path = with_query("/deployments", &[("nodeId", node_id), ("status", status)]);
            get(client, &path).await
        }
        DeploymentsCommand::Stats { node_id } => {
            let path = with_query("/deployments/stats", &[("nodeId", node_id)]);
            get(client, &path).await
        }
        DeploymentsCommand::OnNode { node_id } => {
            get(client, &format!("/deployments/node/{}", encode(&node_id))).await
        }
        DeploymentsCommand::Get { id } => {
            get(client, &format!("/deployments/{}", encode(&id))).await
        }
        DeploymentsCommand::Update(args) => {
            let body = update_body(&args)?;
            client
                .send_json(
                    Method::PUT,
                    &format!("/deployments/{}", encode(&args.id)),
                    HeaderMap::new(),
                    Some(body),
                )
                .await
        }
        DeploymentsCommand::Scale { id, replicas } => {
            client
                .send_json(
                    Method::POST,
                    &format!("/deployments/{}/scale", encode(&id)),
                    HeaderMap::new(),
                    Some(json!({ "replicas": replicas })),
                )
                .await
        }
        DeploymentsCommand::Restart { id } => {
            client
                .send_json(
                    Method::POST,
                    &format!("/deployments/{}/restart", encode(&id)),
                    github,
                    None,
                )
                .await
        }
        DeploymentsCommand::Delete { id, purge } => {
            let base = format!("/deployments/{}", encode(&id));
            let path = if purge {
                with_query(&base, &[("purge", Some("true".to_string()))])
            } else {
                base
            };
            client
                .send_json(Method::DELETE, &path, HeaderMap::new(), None)
                .await
        }
    }
}

async fn github(client: &Client, github: HeaderMap, cmd: GithubCommand) -> Result<()> {
    match cmd {
        GithubCommand::Repos { page, per_page } => {
            let path = with_query(
                "/github/repos",
                &[
                    ("page", page.map(|p| p.to_string())),
                    ("perPage", per_page.map(|p| p.to_string())),
                ],
            );
            client.send_json(Method::GET, &path, github, None).await
        }
        GithubCommand::Repo { owner, repo } => {
            let path = format!("/github/repos/{}/{}", encode(&owner), encode(&repo));
            client.send_json(Method::GET, &path, github, None).await
        }
        GithubCommand::Branches { owner, repo } => {
            let path = format!(
                "/github/repos/{}/{}/branches",
                encode(&owner),
                encode(&repo)
            );
            client.send_json(Method::GET, &path, github, None).await
        }
        GithubCommand::Search { query } => {
            let path = with_query("/github/search", &[("q", Some(query))]);
            client.send_json(Method::GET, &path, github, None).await
        }
        GithubCommand::Token { token } => {
            client
                .send_json(
                    Method::POST,
                    "/github/token",
                    HeaderMap::new(),
                    Some(json!({ "token": token })),
                )
                .await
        }
    }
}

async fn k8s(client: &Client, cmd: K8sCommand) -> Result<()> {
    let path = match cmd {
        K8sCommand::Info => "/k8s/cluster/info".to_string(),
        K8sCommand::Namespaces => "/k8s/namespaces".to_string(),
        K8sCommand::Pods { namespace } => with_query("/k8s/pods", &[("namespace", namespace)]),
        K8sCommand::Logs {
            namespace,
            pod,
            tail,
        } => with_query(
            &format!("/k8s/pods/{}/{}/logs", encode(&namespace), encode(&pod)),
            &[("tail", tail.map(|t| t.to_string()))],
        ),
        K8sCommand::Services { namespace } => {
            with_query("/k8s/services", &[("namespace", namespace)])
        }
        K8sCommand::Nodes => "/k8s/nodes".to_string(),
        K8sCommand::Events { namespace } => with_query("/k8s/events", &[("namespace", namespace)]),
    };
    get(client, &path).await
}

async fn metrics(client: &Client, cmd: MetricsCommand) -> Result<()> {
    let path = match cmd {
        MetricsCommand::Cluster => "/metrics/cluster".to_string(),
        MetricsCommand::Pods { namespace } => {
            with_query("/metrics/pods", &[("namespace", namespace)])
        }
        MetricsCommand::Deployment { namespace, name } => {
            format!("/metrics/deployments/{}/{}", encode(&namespace), encode(&name))
        }
    };
    get(client, &path).await
}

fn create_body(args: &CreateArgs) -> Result<Value> {
    let mut configuration = match &args.configuration {
        Some(file) => {
            let bytes = std::fs::read(file)
                .with_context(|| format!("Failed to read configuration {:?}", file))?;
            match serde_json::from_slice::<Value>(&bytes)
                .with_context(|| format!("Failed to parse {:?}", file))?
            {
                Value::Object(map) => map,
                _ => anyhow::bail!("Configuration file {:?} must hold a JSON object", file),
            }
        }
        None => Map::new(),
    };
    insert_opt(&mut configuration, "replicas", args.replicas);
    insert_opt(&mut configuration, "containerPort", args.container_port);
    if !args.env.is_empty() {
        configuration.insert("environmentVars".to_string(), json!(parse_env_pairs(&args.env)?));
    }

    let mut body = Map::new();
    insert_opt(&mut body, "name", args.name.clone());
    insert_opt(&mut body, "contextPath", args.context_path.clone());
    insert_opt(&mut body, "namespace", args.namespace.clone());
    body.insert(
        "githubRepo".to_string(),
        json!({ "owner": args.owner, "name": args.repo, "branch": args.branch }),
    );
    body.insert("configuration".to_string(), Value::Object(configuration));
    Ok(Value::Object(body))
}

fn update_body(args: &UpdateArgs) -> Result<Value> {
    let mut body = Map::new();
    insert_opt(&mut body, "replicas", args.replicas);
    if !args.env.is_empty() {
        body.insert("environmentVars".to_string(), json!(parse_env_pairs(&args.env)?));
    }
    insert_opt(&mut body, "cpuRequest", args.cpu_request.clone());
    insert_opt(&mut body, "cpuLimit", args.cpu_limit.clone());
    insert_opt(&mut body, "memoryRequest", args.memory_request.clone());
    insert_opt(&mut body, "memoryLimit", args.memory_limit.clone());
    if body.is_empty() {
        anyhow::bail!("Nothing to update; pass at least one field");
    }
    Ok(Value::Object(body))
}

fn parse_env_pairs(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    pairs
        .iter()
        .map(|pair| {
            let (k, v) = pair
                .split_once('=')
                .with_context(|| format!("Expected KEY=VALUE, got {:?}", pair))?;
            Ok((k.to_string(), v.to_string()))
        })
        .collect()
}

fn insert_opt<T: Into<Value>>(map: &mut Map<String, Value>, key: &str, value: Option<T>) {
    if let Some(v) = value {
        map.insert(key.to_string(), v.into());
    }
}

fn encode(segment: &str) -> String {
    utf8_percent_encode(segment, NON_ALPHANUMERIC).to_string()
}

fn with_query(path: &str, params: &[(&str, Option<String>)]) -> String {
    let query: Vec<String> = params
        .iter()
        .filter_map(|(k, v)| v.as_ref().map(|v| format!("{}={}", k, encode(v))))
        .collect();
    if query.is_empty() {
        path.to_string()
    } else {
        format!("{}?{}", path, query.join("&"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_query_skips_absent_values() {
        assert_eq!(with_query("/nodes", &[("status", None)]), "/nodes");
        assert_eq!(
            with_query(
                "/github/search",
                &[("q", Some("node api".to_string())), ("page", None)]
            ),
            "/github/search?q=node%20api"
        );
    }

    #[test]
    fn test_parse_env_pairs() {
        let env = parse_env_pairs(&["A=1".to_string(), "URL=http://x?y=z".to_string()]).unwrap();
        assert_eq!(env["A"], "1");
        assert_eq!(env["URL"], "http://x?y=z");
        assert!(parse_env_pairs(&["NOPE".to_string()]).is_err());
    }

    #[test]
    fn test_create_body_shape() {
        let args = CreateArgs {
            node_id: "n-1".to_string(),
            owner: "acme".to_string(),
            repo: "api".to_string(),
            branch: "main".to_string(),
            name: None,
            context_path: Some("/api".to_string()),
            namespace: None,
            replicas: Some(3),
            container_port: None,
            env: vec!["PORT=3000".to_string()],
            configuration: None,
        };
        let body = create_body(&args).unwrap();
        assert_eq!(body["githubRepo"]["owner"], "acme");
        assert_eq!(body["contextPath"], "/api");
        assert_eq!(body["configuration"]["replicas"], 3);
        assert_eq!(body["configuration"]["environmentVars"]["PORT"], "3000");
        assert!(body.get("name").is_none());
    }

    #[test]
    fn test_create_body_merges_configuration_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("cfg.json");
        std::fs::write(&file, br#"{"replicas": 1, "cpuLimit": "1"}"#).unwrap();
        let args = CreateArgs {
            node_id: "n-1".to_string(),
            owner: "acme".to_string(),
            repo: "api".to_string(),
            branch: "dev".to_string(),
            name: Some("api".to_string()),
            context_path: None,
            namespace: None,
            replicas: Some(4),
            container_port: None,
            env: vec![],
            configuration: Some(file),
        };
        let body = create_body(&args).unwrap();
        assert_eq!(body["configuration"]["replicas"], 4);
        assert_eq!(body["configuration"]["cpuLimit"], "1");
    }

    #[test]
    fn test_empty_update_is_refused() {
        let args = UpdateArgs {
            id: "d-1".to_string(),
            replicas: None,
            env: vec![],
            cpu_request: None,
            cpu_limit: None,
            memory_request: None,
            memory_limit: None,
        };
        assert!(update_body(&args).is_err());
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from([
            "deployctl",
            "deployments",
            "delete",
            "d-1",
            "--purge",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Command::Deployments(DeploymentsCommand::Delete { purge: true, .. })
        ));
    }
}

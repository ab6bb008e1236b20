//! Standalone bootstrap for the ingress proxy subsystem: parses a JSON
//! static-config file into the in-memory [`vhostgate::config::ConfigStore`]
//! (the persisted store itself is out of scope, §1), wires up the shared
//! admission singletons, and binds every configured listener.
//!
//! Grounded on the reference codebase's `main.rs`: `clap::Parser` for CLI
//! arguments, `mimalloc` as the global allocator, and a `before_starting_server`-shaped
//! config load that fails fast with a fatal log line on a startup error
//! (§7's `ConfigError` kind).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use mimalloc::MiMalloc;
use serde::Deserialize;

use vhostgate::auth::ip_cache;
use vhostgate::bridge::{Bridge, DirectDialBridge};
use vhostgate::challenge::ChallengeServer;
use vhostgate::config::{Client, ConfigStore, Flow, Glob, Host, HostScheme, InMemoryConfigStore, Tunnel, TunnelMode};
use vhostgate::forward_proxy::ForwardProxyServer;
use vhostgate::https::HttpsReverseProxy;
use vhostgate::logging::{start_logger, LogLevel};
use vhostgate::tcp_tunnel::TcpTunnelServer;
use vhostgate::util::ip_set::IpSet;
use vhostgate::vhost::{VhostProxy, VhostProxyConfig};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// The ingress proxy subsystem, run standalone against a static JSON config.
#[derive(Parser, Debug)]
#[command(name = "vhostgate")]
#[command(version, about, long_about = None)]
struct Args {
  /// Path to the static JSON config (clients, tunnels, hosts, globals).
  #[arg(short, long, default_value_t = String::from("./vhostgate.json"))]
  config: String,

  /// HTTP virtual-host reverse-proxy listen address.
  #[arg(long, default_value_t = String::from("0.0.0.0:80"))]
  http_addr: String,

  /// HTTPS virtual-host reverse-proxy listen address.
  #[arg(long, default_value_t = String::from("0.0.0.0:443"))]
  https_addr: String,

  /// Auth-challenge web endpoint listen address.
  #[arg(long, default_value_t = String::from("0.0.0.0:8080"))]
  web_addr: String,

  /// Minimum log level written to stderr.
  #[arg(long, default_value_t = String::from("info"))]
  log_level: String,
}

/// On-disk shape of the static config file. Distinct from the runtime
/// [`Client`]/[`Tunnel`]/[`Host`] types, which hold non-serializable atomic
/// flow counters and pre-compiled IP sets (§10.3's DTO seam).
#[derive(Debug, Deserialize)]
struct StaticConfig {
  #[serde(default)]
  global: Glob,
  #[serde(default)]
  clients: Vec<ClientDto>,
  #[serde(default)]
  tunnels: Vec<TunnelDto>,
  #[serde(default)]
  hosts: Vec<HostDto>,
}

#[derive(Debug, Deserialize)]
struct ClientDto {
  id: u64,
  verify_key: String,
  #[serde(default)]
  rate_limit_bytes_per_sec: u64,
  #[serde(default)]
  flow_limit_mib: u64,
  #[serde(default)]
  max_connections: u64,
  #[serde(default)]
  max_tunnel_count: u64,
  #[serde(default)]
  black_ip_list: Vec<String>,
  #[serde(default)]
  basic_auth: Option<(String, String)>,
  #[serde(default)]
  crypt: bool,
  #[serde(default)]
  compress: bool,
}

#[derive(Debug, Deserialize)]
struct TunnelDto {
  id: u64,
  mode: String,
  server_ip: String,
  port: u16,
  targets: Vec<String>,
  #[serde(default)]
  local_proxy: bool,
  client_id: u64,
  #[serde(default)]
  bypass_global_password: bool,
  #[serde(default)]
  flow_limit_mib: u64,
}

#[derive(Debug, Deserialize)]
struct HostDto {
  id: u64,
  host_pattern: String,
  #[serde(default)]
  path_location: Option<String>,
  #[serde(default = "default_scheme")]
  scheme: String,
  targets: Vec<String>,
  #[serde(default)]
  header_rewrites: Vec<(String, String)>,
  #[serde(default)]
  host_rewrite: Option<String>,
  client_id: u64,
  #[serde(default)]
  cert_pem_path: Option<String>,
  #[serde(default)]
  key_pem_path: Option<String>,
  #[serde(default)]
  auto_https: bool,
  #[serde(default)]
  bypass_global_password: bool,
  #[serde(default)]
  use_cache: bool,
  #[serde(default)]
  flow_limit_mib: u64,
}

fn default_scheme() -> String {
  "all".to_string()
}

fn load_static_config(path: &str) -> anyhow::Result<StaticConfig> {
  let raw = std::fs::read_to_string(path)?;
  Ok(serde_json::from_str(&raw)?)
}

fn build_store(cfg: StaticConfig) -> anyhow::Result<InMemoryConfigStore> {
  let store = InMemoryConfigStore::new();
  store.set_global(cfg.global);

  for dto in cfg.clients {
    store.add_client(Client::new(
      dto.id,
      dto.verify_key,
      dto.rate_limit_bytes_per_sec,
      Flow {
        flow_limit_mib: dto.flow_limit_mib,
        ..Default::default()
      },
      dto.max_connections,
      dto.max_tunnel_count,
      IpSet::load_from_vec(&dto.black_ip_list),
      dto.basic_auth,
      dto.crypt,
      dto.compress,
    ));
  }

  for dto in cfg.tunnels {
    let mode = match dto.mode.as_str() {
      "tcp" => TunnelMode::Tcp,
      "httpProxy" | "http_proxy" => TunnelMode::HttpProxy,
      other => anyhow::bail!("unsupported tunnel mode: {other}"),
    };
    store.add_tunnel(Tunnel {
      id: dto.id,
      mode,
      server_ip: dto.server_ip,
      port: dto.port,
      targets: dto.targets,
      local_proxy: dto.local_proxy,
      client_id: dto.client_id,
      bypass_global_password: dto.bypass_global_password,
      flow: Flow {
        flow_limit_mib: dto.flow_limit_mib,
        ..Default::default()
      },
    });
  }

  for dto in cfg.hosts {
    let scheme = match dto.scheme.as_str() {
      "http" => HostScheme::Http,
      "https" => HostScheme::Https,
      "all" => HostScheme::All,
      other => anyhow::bail!("unsupported host scheme: {other}"),
    };
    let cert_pem = dto.cert_pem_path.as_deref().map(std::fs::read).transpose()?;
    let key_pem = dto.key_pem_path.as_deref().map(std::fs::read).transpose()?;
    store.add_host(Host {
      id: dto.id,
      host_pattern: dto.host_pattern,
      path_location: dto.path_location,
      scheme,
      targets: dto.targets,
      header_rewrites: dto.header_rewrites,
      host_rewrite: dto.host_rewrite,
      client_id: dto.client_id,
      cert_pem,
      key_pem,
      auto_https: dto.auto_https,
      bypass_global_password: dto.bypass_global_password,
      use_cache: dto.use_cache,
      flow: Flow {
        flow_limit_mib: dto.flow_limit_mib,
        ..Default::default()
      },
    });
  }

  Ok(store)
}

fn parse_log_level(s: &str) -> LogLevel {
  match s.to_ascii_lowercase().as_str() {
    "trace" => LogLevel::Trace,
    "debug" => LogLevel::Debug,
    "notice" => LogLevel::Notice,
    "warn" => LogLevel::Warn,
    "error" => LogLevel::Error,
    _ => LogLevel::Info,
  }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let args = Args::parse();
  let logger = start_logger(parse_log_level(&args.log_level));

  let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

  let cfg = match load_static_config(&args.config) {
    Ok(cfg) => cfg,
    Err(err) => {
      logger.log(format!("fatal: cannot load config \"{}\": {err}", args.config)).await;
      std::process::exit(1);
    }
  };
  let store: Arc<dyn ConfigStore> = match build_store(cfg) {
    Ok(store) => Arc::new(store),
    Err(err) => {
      logger.log(format!("fatal: invalid config: {err}")).await;
      std::process::exit(1);
    }
  };
  let bridge: Arc<dyn Bridge> = Arc::new(DirectDialBridge);
  let ip_auth_cache = ip_cache::init_global(Duration::from_secs(3600), Duration::from_secs(300), logger.clone());

  let http_addr: SocketAddr = args.http_addr.parse()?;
  let https_addr: SocketAddr = args.https_addr.parse()?;
  let web_addr: SocketAddr = args.web_addr.parse()?;
  let web_port = web_addr.port();

  let vhost_config = || VhostProxyConfig {
    tolerate_method_corruption: true,
    web_port,
    response_cache_capacity: 256,
  };

  let mut tasks: Vec<tokio::task::JoinHandle<()>> = Vec::new();

  {
    let proxy = Arc::new(VhostProxy::new(
      store.clone(),
      bridge.clone(),
      ip_auth_cache.clone(),
      logger.clone(),
      vhost_config(),
    ));
    let tcp_listener = vhostgate::listener::bind(http_addr).await?;
    let logger = logger.clone();
    tasks.push(tokio::spawn(async move {
      vhostgate::listener::serve(tcp_listener, logger.clone(), move |stream, peer_addr| {
        let proxy = proxy.clone();
        async move {
          vhostgate::vhost::handle_connection(proxy, stream, peer_addr.ip(), false).await;
        }
      })
      .await;
    }));
  }

  {
    let https_proxy = HttpsReverseProxy {
      store: store.clone(),
      bridge: bridge.clone(),
      ip_auth_cache: ip_auth_cache.clone(),
      logger: logger.clone(),
      config: vhost_config(),
    };
    let logger = logger.clone();
    tasks.push(tokio::spawn(async move {
      if let Err(err) = https_proxy.run(https_addr).await {
        logger.log(format!("https reverse proxy exited: {err}")).await;
      }
    }));
  }

  {
    let challenge_server = Arc::new(ChallengeServer {
      store: store.clone(),
      ip_auth_cache: ip_auth_cache.clone(),
      logger: logger.clone(),
    });
    let logger = logger.clone();
    tasks.push(tokio::spawn(async move {
      if let Err(err) = challenge_server.run(web_addr).await {
        logger.log(format!("auth challenge endpoint exited: {err}")).await;
      }
    }));
  }

  for tunnel_id in store.tunnel_ids() {
    let Some(tunnel) = store.tunnel(tunnel_id) else { continue };
    match tunnel.mode {
      TunnelMode::Tcp => {
        let server = Arc::new(TcpTunnelServer {
          store: store.clone(),
          bridge: bridge.clone(),
          ip_auth_cache: ip_auth_cache.clone(),
          logger: logger.clone(),
          tunnel_id,
        });
        let logger = logger.clone();
        tasks.push(tokio::spawn(async move {
          if let Err(err) = server.run().await {
            logger.log(format!("tcp tunnel {tunnel_id} exited: {err}")).await;
          }
        }));
      }
      TunnelMode::HttpProxy => {
        let server = Arc::new(ForwardProxyServer {
          store: store.clone(),
          bridge: bridge.clone(),
          ip_auth_cache: ip_auth_cache.clone(),
          logger: logger.clone(),
          tunnel_id,
        });
        let logger = logger.clone();
        tasks.push(tokio::spawn(async move {
          if let Err(err) = server.run().await {
            logger.log(format!("http forward proxy {tunnel_id} exited: {err}")).await;
          }
        }));
      }
    }
  }

  logger.notice("vhostgate: all listeners started").await;
  for task in tasks {
    let _ = task.await;
  }
  Ok(())
}

//! Server configuration: TOML file + CLI overrides.

use crate::auth::{AclRule, AllowAll, Authorizer, InMemorySessionStore, TopicAcl};
use crate::hooks::{Collaborators, LabPortTable};
use crate::hub::HubSettings;
use crate::proxy::TunnelSettings;
use rtd_core::codec::JsonCodec;
use rtd_core::{AccessType, CodecRegistry, FrameLimits, Identity, RtdError, RtdResult};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub proxy: ProxySection,
    #[serde(default)]
    pub subscriptions: SubscriptionsSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub acl: AclSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cert: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default = "default_initial_buffer_size")]
    pub initial_buffer_size: usize,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            cert: None,
            key: None,
            initial_buffer_size: default_initial_buffer_size(),
            max_message_size: default_max_message_size(),
            send_timeout_ms: default_send_timeout_ms(),
        }
    }
}

/// `[[auth.sessions]]`: session cookie → secret.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SessionSeed {
    pub cookie: String,
    pub secret: String,
}

/// `[[auth.users]]`: secret → user.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UserSeed {
    pub secret: String,
    pub id: String,
    #[serde(default)]
    pub email: String,
}

/// `[auth]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    #[serde(default)]
    pub sessions: Vec<SessionSeed>,
    #[serde(default)]
    pub users: Vec<UserSeed>,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            cookie_name: default_cookie_name(),
            sessions: Vec::new(),
            users: Vec::new(),
        }
    }
}

/// `[[proxy.labs]]`: backend port allocated to a workflow for one session.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LabSeed {
    pub cookie: String,
    pub workflow: String,
    pub port: u16,
}

/// `[proxy]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxySection {
    #[serde(default = "default_proxy_prefix")]
    pub prefix: String,
    #[serde(default = "default_public_host")]
    pub public_host: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub wrap_envelope_replies: bool,
    #[serde(default)]
    pub labs: Vec<LabSeed>,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            prefix: default_proxy_prefix(),
            public_host: default_public_host(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
            wrap_envelope_replies: true,
            labs: Vec::new(),
        }
    }
}

/// `[subscriptions]` section of the config TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionsSection {
    #[serde(default)]
    pub identity_ttl_secs: Option<u64>,
}

/// `[store]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_store_class")]
    pub class: String,
    /// CRUD `ValueType` names whose values are decoded as JSON.
    #[serde(default)]
    pub json_types: Vec<String>,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            class: default_store_class(),
            json_types: Vec::new(),
        }
    }
}

/// `[acl]` section of the config TOML. No rules means every topic is open.
#[derive(Debug, Clone, Deserialize)]
pub struct AclSection {
    #[serde(default = "default_access")]
    pub default: AccessType,
    #[serde(default)]
    pub rules: Vec<AclRule>,
}

impl Default for AclSection {
    fn default() -> Self {
        Self {
            default: default_access(),
            rules: Vec::new(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_initial_buffer_size() -> usize {
    FrameLimits::default().initial_buffer_size
}
fn default_max_message_size() -> usize {
    FrameLimits::default().max_message_size
}
fn default_send_timeout_ms() -> u64 {
    10_000
}
fn default_cookie_name() -> String {
    "coflows".to_string()
}
fn default_proxy_prefix() -> String {
    "/lab/".to_string()
}
fn default_public_host() -> String {
    "coflows.quant.app".to_string()
}
fn default_max_retries() -> u32 {
    10
}
fn default_retry_backoff_ms() -> u64 {
    250
}
fn default_connect_timeout_secs() -> u64 {
    30
}
fn default_store_class() -> String {
    "Kernel.M".to_string()
}
fn default_access() -> AccessType {
    AccessType::Write
}
fn default_true() -> bool {
    true
}

/// Values given on the command line; each replaces its config file value.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub port: Option<u16>,
    pub bind: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
}

/// Resolved server configuration (all paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub limits: FrameLimits,
    pub send_timeout: Duration,
    pub cookie_name: String,
    pub sessions: Vec<SessionSeed>,
    pub users: Vec<UserSeed>,
    pub proxy: ProxySection,
    pub identity_ttl: Option<Duration>,
    pub store_class: String,
    pub json_types: Vec<String>,
    pub acl: AclSection,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: &CliOverrides) -> RtdResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse_config(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file_config, overrides)
    }

    /// Merge a parsed config file with CLI overrides and validate the result.
    pub fn resolve(file: ConfigFile, overrides: &CliOverrides) -> RtdResult<Self> {
        let server = file.server;
        let cert = overrides.cert.clone().or(server.cert);
        let key = overrides.key.clone().or(server.key);
        if cert.is_some() != key.is_some() {
            return Err(RtdError::Config(
                "TLS needs both a certificate and a key".into(),
            ));
        }

        let limits = FrameLimits {
            initial_buffer_size: server.initial_buffer_size,
            max_message_size: server.max_message_size,
        };
        if limits.initial_buffer_size == 0
            || limits.initial_buffer_size > limits.max_message_size
        {
            return Err(RtdError::Config(format!(
                "initial_buffer_size {} must be between 1 and max_message_size {}",
                limits.initial_buffer_size, limits.max_message_size
            )));
        }

        if server.send_timeout_ms == 0 {
            return Err(RtdError::Config("send_timeout_ms must be positive".into()));
        }

        Ok(Self {
            bind: overrides.bind.clone().unwrap_or(server.bind),
            port: overrides.port.unwrap_or(server.port),
            cert_path: cert.as_deref().map(expand_tilde_str),
            key_path: key.as_deref().map(expand_tilde_str),
            limits,
            send_timeout: Duration::from_millis(server.send_timeout_ms),
            cookie_name: file.auth.cookie_name,
            sessions: file.auth.sessions,
            users: file.auth.users,
            proxy: file.proxy,
            identity_ttl: file.subscriptions.identity_ttl_secs.map(Duration::from_secs),
            store_class: file.store.class,
            json_types: file.store.json_types,
            acl: file.acl,
        })
    }

    pub fn listen_addr(&self) -> RtdResult<SocketAddr> {
        let ip: IpAddr = self
            .bind
            .parse()
            .map_err(|e| RtdError::Config(format!("invalid bind address {}: {e}", self.bind)))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn hub_settings(&self) -> HubSettings {
        HubSettings {
            limits: self.limits,
            cookie_name: self.cookie_name.clone(),
            proxy_prefix: self.proxy.prefix.clone(),
            wrap_envelope_replies: self.proxy.wrap_envelope_replies,
            store_class: self.store_class.clone(),
            identity_ttl: self.identity_ttl,
            send_timeout: self.send_timeout,
            tunnels: TunnelSettings {
                max_retries: self.proxy.max_retries,
                retry_backoff: Duration::from_millis(self.proxy.retry_backoff_ms),
                connect_timeout: Duration::from_secs(self.proxy.connect_timeout_secs),
                public_host: self.proxy.public_host.clone(),
                limits: self.limits,
            },
        }
    }

    /// In-memory collaborators seeded from the config file.
    pub fn collaborators(&self) -> Collaborators {
        let sessions = InMemorySessionStore::new();
        for seed in &self.sessions {
            sessions.insert_session(&seed.cookie, &seed.secret);
        }
        for seed in &self.users {
            sessions.insert_user(&seed.secret, Identity::new(&seed.id, &seed.email));
        }

        let labs = LabPortTable::new();
        for seed in &self.proxy.labs {
            labs.insert(&seed.cookie, &seed.workflow, seed.port);
        }

        let authorizer: Arc<dyn Authorizer> = if self.acl.rules.is_empty() {
            Arc::new(AllowAll)
        } else {
            Arc::new(TopicAcl::from_rules(&self.acl.rules, self.acl.default))
        };

        let mut codecs = CodecRegistry::new();
        for type_name in &self.json_types {
            codecs.register(type_name.as_str(), Arc::new(JsonCodec));
        }

        info!(
            sessions = self.sessions.len(),
            users = self.users.len(),
            labs = self.proxy.labs.len(),
            acl_rules = self.acl.rules.len(),
            json_types = self.json_types.len(),
            "seeded in-memory collaborators"
        );

        Collaborators {
            sessions: Arc::new(sessions),
            authorizer,
            labs: Arc::new(labs),
            codecs,
            ..Collaborators::default()
        }
    }
}

pub fn parse_config(content: &str) -> RtdResult<ConfigFile> {
    toml::from_str(content).map_err(|e| RtdError::Config(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SessionStore;
    use crate::hooks::LabPorts;
    use crate::testing::user;

    fn resolved(toml: &str) -> ServerConfig {
        ServerConfig::resolve(parse_config(toml).unwrap(), &CliOverrides::default()).unwrap()
    }

    const FULL: &str = r#"
        [server]
        bind = "127.0.0.1"
        port = 9000
        initial_buffer_size = 1024
        max_message_size = 65536
        send_timeout_ms = 2500

        [auth]
        cookie_name = "session"
        [[auth.sessions]]
        cookie = "c-1"
        secret = "s-1"
        [[auth.users]]
        secret = "s-1"
        id = "u1"
        email = "u1@example.com"

        [proxy]
        public_host = "hub.example.com"
        max_retries = 3
        retry_backoff_ms = 50
        wrap_envelope_replies = false
        [[proxy.labs]]
        cookie = "c-1"
        workflow = "w1"
        port = 9001

        [subscriptions]
        identity_ttl_secs = 60

        [store]
        json_types = ["Portfolio"]

        [acl]
        default = 1
        [[acl.rules]]
        topic = "secret"
        user = "*"
        access = -1
    "#;

    #[test]
    fn empty_file_gives_defaults() {
        let config = resolved("");
        assert_eq!(config.port, 8080);
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.limits, FrameLimits::default());
        assert_eq!(config.cookie_name, "coflows");
        assert_eq!(config.proxy.prefix, "/lab/");
        assert_eq!(config.proxy.max_retries, 10);
        assert!(config.proxy.wrap_envelope_replies);
        assert_eq!(config.store_class, "Kernel.M");
        assert_eq!(config.identity_ttl, None);
        assert_eq!(config.send_timeout, Duration::from_secs(10));
        assert!(config.json_types.is_empty());
        assert!(config.cert_path.is_none());
    }

    #[test]
    fn full_file_parsed() {
        let config = resolved(FULL);
        assert_eq!(config.listen_addr().unwrap(), "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.limits.initial_buffer_size, 1024);
        assert_eq!(config.cookie_name, "session");
        assert_eq!(config.users[0].email, "u1@example.com");
        assert_eq!(config.proxy.labs[0].port, 9001);
        assert_eq!(config.identity_ttl, Some(Duration::from_secs(60)));
        assert_eq!(config.acl.default, AccessType::Read);
        assert_eq!(config.acl.rules[0].access, AccessType::Denied);

        let settings = config.hub_settings();
        assert_eq!(settings.tunnels.max_retries, 3);
        assert_eq!(settings.tunnels.retry_backoff, Duration::from_millis(50));
        assert_eq!(settings.tunnels.public_host, "hub.example.com");
        assert!(!settings.wrap_envelope_replies);
        assert_eq!(settings.send_timeout, Duration::from_millis(2500));
    }

    #[test]
    fn cli_overrides_win() {
        let overrides = CliOverrides {
            port: Some(7000),
            bind: Some("::1".into()),
            ..CliOverrides::default()
        };
        let config = ServerConfig::resolve(parse_config(FULL).unwrap(), &overrides).unwrap();
        assert_eq!(config.listen_addr().unwrap(), "[::1]:7000".parse().unwrap());
        assert_eq!(config.limits.initial_buffer_size, 1024);
    }

    #[test]
    fn cert_without_key_rejected() {
        let overrides = CliOverrides {
            cert: Some("/tmp/cert.pem".into()),
            ..CliOverrides::default()
        };
        assert!(matches!(
            ServerConfig::resolve(ConfigFile::default(), &overrides),
            Err(RtdError::Config(_))
        ));
    }

    #[test]
    fn buffer_larger_than_cap_rejected() {
        let file = parse_config("[server]\ninitial_buffer_size = 10\nmax_message_size = 5");
        assert!(ServerConfig::resolve(file.unwrap(), &CliOverrides::default()).is_err());
    }

    #[test]
    fn zero_send_timeout_rejected() {
        let file = parse_config("[server]\nsend_timeout_ms = 0").unwrap();
        assert!(matches!(
            ServerConfig::resolve(file, &CliOverrides::default()),
            Err(RtdError::Config(_))
        ));
    }

    #[test]
    fn malformed_toml_is_config_error() {
        assert!(matches!(parse_config("[server"), Err(RtdError::Config(_))));
    }

    #[test]
    fn collaborators_seeded_from_file() {
        let config = resolved(FULL);
        let collaborators = config.collaborators();

        let identity = collaborators.sessions.resolve("c-1").unwrap();
        assert_eq!(identity.id, "u1");
        assert_eq!(collaborators.labs.backend_port("c-1", "w1"), Some(9001));
        assert_eq!(
            collaborators.authorizer.authorize("secret", &user("anyone")),
            AccessType::Denied
        );
        assert_eq!(
            collaborators.authorizer.authorize("public", &user("anyone")),
            AccessType::Read
        );
        assert!(collaborators.codecs.contains("Portfolio"));
        assert!(!collaborators.codecs.contains("Order"));
    }

    #[test]
    fn missing_file_uses_defaults() {
        let config = ServerConfig::load(
            Some(Path::new("/nonexistent/rtd/config.toml")),
            &CliOverrides::default(),
        )
        .unwrap();
        assert_eq!(config.port, 8080);
    }

    #[test]
    fn tilde_expanded() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde(Path::new("~/.rtd/x")), home.join(".rtd/x"));
        }
        assert_eq!(expand_tilde(Path::new("/abs")), PathBuf::from("/abs"));
    }
}

//! Configuration types.
//!
//! These are plain Rust structs meant to be constructed directly by an
//! embedder (library-first; CLI/flag/envvar/config-file layering is left
//! to callers). `Config::build` performs all validation up front so that
//! a successfully constructed `Config` can never violate a core invariant
//! later.

use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;

use camino::Utf8PathBuf;

use crate::error::ConfigError;
use crate::instance_id::InstanceId;

/// Default TCP listen address.
pub const DEFAULT_TCP_ADDRESS: &str = "127.0.0.1";
/// Default base TCP port; subsequent bindings increment from here.
pub const DEFAULT_TCP_PORT: u16 = 5432;
/// Literal final path segment of a PostgreSQL unix-socket.
pub const PGSQL_SOCKET_SUFFIX: &str = ".s.PGSQL.5432";
pub const DEFAULT_HEALTH_PORT: u16 = 9090;
pub const DEFAULT_ADMIN_PORT: u16 = 9091;

/// Where a [`SocketMount`](crate::mount::SocketMount) binds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenSpec {
    Tcp { address: IpAddr, port: u16 },
    Unix { dir: Utf8PathBuf },
}

/// Per-binding overrides parsed from the `?k=v&...` suffix on an instance
/// connection string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingOverrides {
    pub address: Option<IpAddr>,
    pub port: Option<u16>,
    pub unix_socket: Option<Utf8PathBuf>,
}

impl BindingOverrides {
    /// Parses a `?address=...&port=...&unix-socket=...` query string.
    /// Rejects duplicate keys and an address/port vs unix-socket conflict.
    pub fn parse(instance: &InstanceId, query: &str) -> Result<Self, ConfigError> {
        let mut overrides = BindingOverrides::default();
        let mut seen = HashSet::new();

        for pair in query.split('&').filter(|s| !s.is_empty()) {
            let (key, value) = pair.split_once('=').ok_or_else(|| ConfigError::MalformedOverride {
                instance: instance.clone(),
                query: query.to_string(),
                reason: format!("missing '=' in {pair:?}"),
            })?;

            if !seen.insert(key.to_string()) {
                return Err(ConfigError::DuplicateOverrideKey {
                    instance: instance.clone(),
                    key: key.to_string(),
                });
            }

            match key {
                "address" => {
                    let addr = value.parse::<IpAddr>().map_err(|e| ConfigError::MalformedOverride {
                        instance: instance.clone(),
                        query: query.to_string(),
                        reason: format!("invalid address {value:?}: {e}"),
                    })?;
                    overrides.address = Some(addr);
                }
                "port" => {
                    let port = value.parse::<u16>().map_err(|e| ConfigError::MalformedOverride {
                        instance: instance.clone(),
                        query: query.to_string(),
                        reason: format!("invalid port {value:?}: {e}"),
                    })?;
                    overrides.port = Some(port);
                }
                "unix-socket" => {
                    overrides.unix_socket = Some(Utf8PathBuf::from(value));
                }
                other => {
                    return Err(ConfigError::MalformedOverride {
                        instance: instance.clone(),
                        query: query.to_string(),
                        reason: format!("unrecognized key {other:?}"),
                    });
                }
            }
        }

        if overrides.unix_socket.is_some() && (overrides.address.is_some() || overrides.port.is_some())
        {
            return Err(ConfigError::ConflictingListenSpec {
                instance: instance.clone(),
            });
        }

        Ok(overrides)
    }
}

/// One configured remote instance and where its local endpoint lives.
#[derive(Debug, Clone)]
pub struct InstanceBinding {
    pub id: InstanceId,
    pub overrides: BindingOverrides,
}

impl InstanceBinding {
    pub fn new(id: InstanceId) -> Self {
        Self {
            id,
            overrides: BindingOverrides::default(),
        }
    }

    pub fn with_overrides(id: InstanceId, overrides: BindingOverrides) -> Self {
        Self { id, overrides }
    }
}

/// Global defaults applied to bindings that don't override them.
#[derive(Debug, Clone)]
pub struct GlobalDefaults {
    pub tcp_address: IpAddr,
    pub tcp_port_base: u16,
    pub unix_dir: Option<Utf8PathBuf>,
    pub max_connections: u64,
    pub wait_on_close: Duration,
    pub dial_timeout: Duration,
}

impl Default for GlobalDefaults {
    fn default() -> Self {
        Self {
            tcp_address: DEFAULT_TCP_ADDRESS.parse().unwrap(),
            tcp_port_base: DEFAULT_TCP_PORT,
            unix_dir: None,
            max_connections: 0,
            wait_on_close: Duration::ZERO,
            dial_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub address: IpAddr,
    pub port: u16,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_TCP_ADDRESS.parse().unwrap(),
            port: DEFAULT_HEALTH_PORT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdminConfig {
    pub port: u16,
    pub quit_enabled: bool,
    pub profiling_enabled: bool,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_ADMIN_PORT,
            quit_enabled: false,
            profiling_enabled: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FuseConfig {
    pub mount_root: Utf8PathBuf,
    pub socket_dir: Utf8PathBuf,
}

/// Strict-priority credential source; exactly one must be populated.
#[derive(Debug, Clone)]
pub enum CredentialSource {
    BearerToken(String),
    ServiceAccountKeyFile(Utf8PathBuf),
    ServiceAccountKeyJson(String),
    InteractiveLoginToken(String),
    AmbientDefault,
}

/// A chain of service accounts to impersonate, final entry is the
/// effective identity. Must be non-empty.
#[derive(Debug, Clone)]
pub struct ImpersonationChain(Vec<String>);

impl ImpersonationChain {
    pub fn new(chain: Vec<String>) -> Result<Self, ConfigError> {
        if chain.is_empty() {
            return Err(ConfigError::EmptyImpersonationChain);
        }
        Ok(Self(chain))
    }

    pub fn effective_identity(&self) -> &str {
        self.0.last().expect("non-empty by construction")
    }

    pub fn delegates(&self) -> &[String] {
        &self.0[..self.0.len() - 1]
    }
}

/// Top-level, validated configuration for one proxy process.
#[derive(Debug, Clone)]
pub struct Config {
    pub instances: Vec<InstanceBinding>,
    pub global: GlobalDefaults,
    pub health: Option<HealthConfig>,
    pub admin: Option<AdminConfig>,
    pub credentials: CredentialSource,
    pub impersonation: Option<ImpersonationChain>,
    pub fuse: Option<FuseConfig>,
}

impl Config {
    /// Validates the configuration, in particular the port-allocation
    /// invariant: explicit per-binding port overrides are
    /// applied first; remaining bindings consume `global_port,
    /// global_port+1, ...` in declared order, skipping ports already taken.
    pub fn build(
        instances: Vec<InstanceBinding>,
        global: GlobalDefaults,
        health: Option<HealthConfig>,
        admin: Option<AdminConfig>,
        credentials: CredentialSource,
        impersonation: Option<ImpersonationChain>,
        fuse: Option<FuseConfig>,
    ) -> Result<Self, ConfigError> {
        let cfg = Config {
            instances,
            global,
            health,
            admin,
            credentials,
            impersonation,
            fuse,
        };
        cfg.resolved_listen_specs()?;
        Ok(cfg)
    }

    /// Computes the effective [`ListenSpec`] for every binding, applying
    /// overrides and the auto-incrementing port allocation. Returns an
    /// error on any duplicate bind target.
    pub fn resolved_listen_specs(&self) -> Result<Vec<ListenSpec>, ConfigError> {
        if let Some(fuse) = &self.fuse {
            let _ = fuse;
            return Ok(Vec::new());
        }

        let mut taken_ports: HashSet<u16> = HashSet::new();
        let mut taken_paths: HashSet<Utf8PathBuf> = HashSet::new();

        // Pass 1: explicit overrides are applied first and claim their slot.
        let mut specs: Vec<Option<ListenSpec>> = vec![None; self.instances.len()];
        for (i, binding) in self.instances.iter().enumerate() {
            let o = &binding.overrides;
            // `BindingOverrides::parse` already rejects this combination
            // when the override comes from a query string, but `overrides`
            // is constructible directly (all fields are `pub`), so the
            // same invariant is re-checked here rather than trusted.
            if o.unix_socket.is_some() && (o.address.is_some() || o.port.is_some()) {
                return Err(ConfigError::ConflictingListenSpec {
                    instance: binding.id.clone(),
                });
            }
            if let Some(dir) = o.unix_socket.as_ref().or(self.global.unix_dir.as_ref()) {
                if o.address.is_none() && o.port.is_none() {
                    let path = dir.join(binding.id.short_form()).join(PGSQL_SOCKET_SUFFIX);
                    if !taken_paths.insert(path.clone()) {
                        return Err(ConfigError::DuplicateListenAddress(path.to_string()));
                    }
                    specs[i] = Some(ListenSpec::Unix { dir: dir.clone() });
                    continue;
                }
            }
            if let Some(port) = o.port {
                taken_ports.insert(port);
                let address = o.address.unwrap_or(self.global.tcp_address);
                specs[i] = Some(ListenSpec::Tcp { address, port });
            } else if let Some(address) = o.address {
                // address overridden without port: still participates in
                // auto-increment below, but pre-reserve nothing here.
                let _ = address;
            }
        }

        // Pass 2: remaining bindings consume global_port, global_port+1, ...
        // in declared order, skipping ports already taken.
        let mut next_port = self.global.tcp_port_base;
        for (i, binding) in self.instances.iter().enumerate() {
            if specs[i].is_some() {
                continue;
            }
            while taken_ports.contains(&next_port) {
                next_port += 1;
            }
            let port = next_port;
            taken_ports.insert(port);
            next_port += 1;

            let address = binding.overrides.address.unwrap_or(self.global.tcp_address);
            specs[i] = Some(ListenSpec::Tcp { address, port });
        }

        let mut seen_tcp = HashSet::new();
        let result: Vec<ListenSpec> = specs.into_iter().map(|s| s.expect("filled above")).collect();
        for spec in &result {
            if let ListenSpec::Tcp { address, port } = spec {
                if !seen_tcp.insert((*address, *port)) {
                    return Err(ConfigError::DuplicateListenAddress(format!("{address}:{port}")));
                }
            }
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: &str) -> InstanceId {
        InstanceId::parse(&format!(
            "projects/p/locations/r/clusters/c/instances/{n}"
        ))
        .unwrap()
    }

    #[test]
    fn auto_increments_ports_for_two_instances() {
        let cfg = Config::build(
            vec![InstanceBinding::new(id("a")), InstanceBinding::new(id("b"))],
            GlobalDefaults::default(),
            None,
            None,
            CredentialSource::AmbientDefault,
            None,
            None,
        )
        .unwrap();
        let specs = cfg.resolved_listen_specs().unwrap();
        assert_eq!(
            specs,
            vec![
                ListenSpec::Tcp {
                    address: DEFAULT_TCP_ADDRESS.parse().unwrap(),
                    port: 5432
                },
                ListenSpec::Tcp {
                    address: DEFAULT_TCP_ADDRESS.parse().unwrap(),
                    port: 5433
                },
            ]
        );
    }

    #[test]
    fn per_instance_override_does_not_affect_global_defaults() {
        let overrides = BindingOverrides::parse(&id("inst1"), "address=0.0.0.0&port=6000").unwrap();
        let cfg = Config::build(
            vec![
                InstanceBinding::with_overrides(id("inst1"), overrides),
                InstanceBinding::new(id("inst2")),
            ],
            GlobalDefaults::default(),
            None,
            None,
            CredentialSource::AmbientDefault,
            None,
            None,
        )
        .unwrap();
        let specs = cfg.resolved_listen_specs().unwrap();
        assert_eq!(
            specs[0],
            ListenSpec::Tcp {
                address: "0.0.0.0".parse().unwrap(),
                port: 6000
            }
        );
        assert_eq!(
            specs[1],
            ListenSpec::Tcp {
                address: DEFAULT_TCP_ADDRESS.parse().unwrap(),
                port: 5432
            }
        );
    }

    #[test]
    fn auto_increment_skips_explicitly_taken_ports() {
        let first_overrides = BindingOverrides::parse(&id("a"), "port=5432").unwrap();
        let cfg = Config::build(
            vec![
                InstanceBinding::with_overrides(id("a"), first_overrides),
                InstanceBinding::new(id("b")),
            ],
            GlobalDefaults::default(),
            None,
            None,
            CredentialSource::AmbientDefault,
            None,
            None,
        )
        .unwrap();
        let specs = cfg.resolved_listen_specs().unwrap();
        // b would naturally want 5432 first, but it's taken, so it gets 5433.
        assert_eq!(
            specs[1],
            ListenSpec::Tcp {
                address: DEFAULT_TCP_ADDRESS.parse().unwrap(),
                port: 5433
            }
        );
    }

    #[test]
    fn address_and_unix_socket_conflict_is_rejected() {
        let err = BindingOverrides::parse(&id("a"), "address=0.0.0.0&unix-socket=/tmp/x").unwrap_err();
        assert!(matches!(err, ConfigError::ConflictingListenSpec { .. }));
    }

    #[test]
    fn conflicting_overrides_built_directly_are_still_rejected() {
        // `BindingOverrides` fields are all `pub`, so an embedder can build
        // a conflicting combination without going through `::parse`. The
        // same invariant must still be enforced by `Config::build`.
        let overrides = BindingOverrides {
            address: Some("0.0.0.0".parse().unwrap()),
            port: None,
            unix_socket: Some(Utf8PathBuf::from("/tmp/x")),
        };
        let err = Config::build(
            vec![InstanceBinding::with_overrides(id("a"), overrides)],
            GlobalDefaults::default(),
            None,
            None,
            CredentialSource::AmbientDefault,
            None,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ConflictingListenSpec { .. }));
    }

    #[test]
    fn duplicate_query_key_is_rejected() {
        let err = BindingOverrides::parse(&id("a"), "port=1&port=2").unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateOverrideKey { .. }));
    }
}

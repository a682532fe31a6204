//! Static configuration for the controller process
//!
//! Flags (each with an environment fallback) are parsed by clap into
//! [`LaunchArgs`], combined with the resolved cluster connection, validated, and
//! frozen into a [`Configuration`]. After a successful load the configuration
//! is shared read-only behind an `Arc`.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use clap::Args;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::api::networking::v1::{Ingress, IngressClass};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::GroupVersionKind;

use crate::{Error, Result};

/// Default liveness/readiness bind address
pub const DEFAULT_PROBE_ADDR: &str = ":10254";

/// Default metrics bind address
pub const DEFAULT_METRICS_ADDR: &str = ":10255";

/// Default Lease name used for leader election
pub const DEFAULT_ELECTION_ID: &str = "keel-ingress-leader";

/// Default ingress class served by this controller
pub const DEFAULT_INGRESS_CLASS: &str = "haproxy";

/// Maximum length of a Lease name (DNS-1123 subdomain)
const MAX_LEASE_NAME_LEN: usize = 253;

/// Address a listener binds to, or disabled
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindAddress {
    /// Listener is not started (flag value `0`)
    Disabled,
    /// Listener binds to this socket address
    Addr(SocketAddr),
}

impl BindAddress {
    /// Socket address to bind, if enabled
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Disabled => None,
            Self::Addr(addr) => Some(*addr),
        }
    }
}

impl FromStr for BindAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s == "0" {
            return Ok(Self::Disabled);
        }
        // ":port" binds every interface
        if let Some(port) = s.strip_prefix(':') {
            let port: u16 = port
                .parse()
                .map_err(|_| Error::config(format!("invalid port in bind address {s:?}")))?;
            return Ok(Self::Addr(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))));
        }
        s.parse::<SocketAddr>()
            .map(Self::Addr)
            .map_err(|e| Error::config(format!("invalid bind address {s:?}: {e}")))
    }
}

impl fmt::Display for BindAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => f.write_str("0"),
            Self::Addr(addr) => write!(f, "{addr}"),
        }
    }
}

/// Registry of the resource kinds this process works with
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Scheme {
    kinds: Vec<GroupVersionKind>,
}

impl Scheme {
    /// Create an empty scheme
    pub fn new() -> Self {
        Self::default()
    }

    /// Scheme with every kind the ingress controller reads or writes
    pub fn ingress_default() -> Self {
        Self {
            kinds: vec![
                gvk_of::<Service>(),
                gvk_of::<EndpointSlice>(),
                gvk_of::<Secret>(),
                gvk_of::<ConfigMap>(),
                gvk_of::<Pod>(),
                gvk_of::<Ingress>(),
                gvk_of::<IngressClass>(),
                gvk_of::<Lease>(),
            ],
        }
    }

    /// Register a typed resource
    pub fn register<K: k8s_openapi::Resource>(&mut self) -> Result<()> {
        self.register_gvk(gvk_of::<K>())
    }

    /// Register a kind by group/version/kind, rejecting duplicates
    pub fn register_gvk(&mut self, gvk: GroupVersionKind) -> Result<()> {
        if self.kinds.contains(&gvk) {
            return Err(Error::scheme(format!(
                "{}/{} {} registered twice",
                gvk.group, gvk.version, gvk.kind
            )));
        }
        self.kinds.push(gvk);
        Ok(())
    }

    /// Whether a typed resource is registered
    pub fn contains<K: k8s_openapi::Resource>(&self) -> bool {
        self.kinds
            .iter()
            .any(|k| k.group == K::GROUP && k.version == K::VERSION && k.kind == K::KIND)
    }

    /// Registered kinds in registration order
    pub fn kinds(&self) -> &[GroupVersionKind] {
        &self.kinds
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

fn gvk_of<K: k8s_openapi::Resource>() -> GroupVersionKind {
    GroupVersionKind::gvk(K::GROUP, K::VERSION, K::KIND)
}

/// Longest lease the Lease API can represent (`leaseDurationSeconds` is an int32)
pub const MAX_LEASE_DURATION: Duration = Duration::from_secs(i32::MAX as u64);

/// Leader-election lease timing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeaseTiming {
    /// How long a lease is valid without renewal
    pub lease_duration: Duration,
    /// How long the leader keeps trying to renew before giving up
    pub renew_deadline: Duration,
    /// Interval between acquire/renew attempts
    pub retry_period: Duration,
}

impl Default for LeaseTiming {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }
}

impl LeaseTiming {
    /// Check the ordering `retry_period < renew_deadline < lease_duration`
    ///
    /// A renew deadline shorter than the lease duration means a leader stops
    /// acting before any other replica may take the lease over.
    pub fn validate(&self) -> Result<()> {
        if self.retry_period.is_zero() {
            return Err(Error::config_field("retry-period", "must be positive"));
        }
        if self.lease_duration > MAX_LEASE_DURATION {
            return Err(Error::config_field(
                "lease-duration",
                format!("must not exceed {} seconds", MAX_LEASE_DURATION.as_secs()),
            ));
        }
        if self.renew_deadline >= self.lease_duration {
            return Err(Error::config_field(
                "renew-deadline",
                "must be shorter than lease-duration",
            ));
        }
        if self.retry_period >= self.renew_deadline {
            return Err(Error::config_field(
                "retry-period",
                "must be shorter than renew-deadline",
            ));
        }
        // A leader notices a failed renewal up to one retry period late.
        if self.renew_deadline + self.retry_period > self.lease_duration {
            return Err(Error::config_field(
                "renew-deadline",
                "renew-deadline plus retry-period must not exceed lease-duration",
            ));
        }
        Ok(())
    }
}

/// Command-line flags for the controller process
#[derive(Args, Debug, Clone)]
pub struct LaunchArgs {
    /// Path to a kubeconfig file (in-cluster config is used when unset)
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use
    #[arg(long, env = "KEEL_KUBE_CONTEXT")]
    pub kube_context: Option<String>,

    /// Enable leader election so only one replica reconciles
    #[arg(long, env = "KEEL_ELECTION")]
    pub election: bool,

    /// Name of the Lease used for leader election
    #[arg(long, env = "KEEL_ELECTION_ID", default_value = DEFAULT_ELECTION_ID)]
    pub election_id: String,

    /// Namespace of the election Lease (defaults to the pod namespace)
    #[arg(long, env = "POD_NAMESPACE")]
    pub election_namespace: Option<String>,

    /// Lease duration in seconds
    #[arg(long, env = "KEEL_LEASE_DURATION", default_value_t = 15)]
    pub lease_duration: u64,

    /// Renew deadline in seconds
    #[arg(long, env = "KEEL_RENEW_DEADLINE", default_value_t = 10)]
    pub renew_deadline: u64,

    /// Retry period in seconds
    #[arg(long, env = "KEEL_RETRY_PERIOD", default_value_t = 2)]
    pub retry_period: u64,

    /// Address serving /healthz and /readyz (`0` disables)
    #[arg(long, env = "KEEL_HEALTH_PROBE_BIND_ADDRESS", default_value = DEFAULT_PROBE_ADDR)]
    pub health_probe_bind_address: String,

    /// Address serving /metrics (`0` disables)
    #[arg(long, env = "KEEL_METRICS_BIND_ADDRESS", default_value = DEFAULT_METRICS_ADDR)]
    pub metrics_bind_address: String,

    /// Seconds to wait for subsystems to stop after a termination signal
    #[arg(long, env = "KEEL_GRACEFUL_SHUTDOWN_TIMEOUT", default_value_t = 30)]
    pub graceful_shutdown_timeout: u64,

    /// Ingress class handled by this controller
    #[arg(long, env = "KEEL_INGRESS_CLASS", default_value = DEFAULT_INGRESS_CLASS)]
    pub ingress_class: String,

    /// Restrict watches to one namespace (all namespaces when unset)
    #[arg(long, env = "KEEL_WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,
}

impl LaunchArgs {
    /// Combine the flags with a resolved cluster connection and validate
    pub fn into_configuration(self, cluster: kube::Config) -> Result<Configuration> {
        let election_namespace = self
            .election_namespace
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| cluster.default_namespace.clone());

        let config = Configuration {
            probe_addr: self.health_probe_bind_address.parse()?,
            metrics_addr: self.metrics_bind_address.parse()?,
            cluster,
            election: self.election,
            election_id: self.election_id,
            election_namespace,
            lease_timing: LeaseTiming {
                lease_duration: Duration::from_secs(self.lease_duration),
                renew_deadline: Duration::from_secs(self.renew_deadline),
                retry_period: Duration::from_secs(self.retry_period),
            },
            scheme: Scheme::ingress_default(),
            graceful_shutdown_timeout: Duration::from_secs(self.graceful_shutdown_timeout),
            ingress_class: self.ingress_class,
            watch_namespace: self.watch_namespace.filter(|ns| !ns.is_empty()),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Fully validated, immutable process configuration
#[derive(Clone, Debug)]
pub struct Configuration {
    /// Cluster connection descriptor
    pub cluster: kube::Config,
    /// Whether leader election is enabled
    pub election: bool,
    /// Lease name for leader election
    pub election_id: String,
    /// Namespace holding the election Lease
    pub election_namespace: String,
    /// Lease timing
    pub lease_timing: LeaseTiming,
    /// Health probe bind address
    pub probe_addr: BindAddress,
    /// Metrics bind address
    pub metrics_addr: BindAddress,
    /// Registered resource kinds
    pub scheme: Scheme,
    /// Bound on how long shutdown waits for subsystems
    pub graceful_shutdown_timeout: Duration,
    /// Ingress class served by the reconciler
    pub ingress_class: String,
    /// Optional namespace restriction for watches
    pub watch_namespace: Option<String>,
}

impl Configuration {
    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.election {
            validate_lease_name(&self.election_id)?;
            if self.election_namespace.is_empty() {
                return Err(Error::config_field(
                    "election-namespace",
                    "required when leader election is enabled",
                ));
            }
            self.lease_timing.validate()?;
        }
        if self.ingress_class.is_empty() {
            return Err(Error::config_field("ingress-class", "must not be empty"));
        }
        Ok(())
    }
}

fn validate_lease_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::config_field(
            "election-id",
            "required when leader election is enabled",
        ));
    }
    if name.len() > MAX_LEASE_NAME_LEN {
        return Err(Error::config_field(
            "election-id",
            format!("longer than {MAX_LEASE_NAME_LEN} characters"),
        ));
    }
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.');
    let valid_ends = name.starts_with(|c: char| c.is_ascii_alphanumeric())
        && name.ends_with(|c: char| c.is_ascii_alphanumeric());
    if !valid_chars || !valid_ends {
        return Err(Error::config_field(
            "election-id",
            format!("{name:?} is not a valid lease name"),
        ));
    }
    Ok(())
}

/// Source of the process configuration
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConfigLoader: Send + Sync {
    /// Load and validate the configuration
    async fn load(&self) -> Result<Configuration>;
}

/// Loads configuration from parsed command-line flags
pub struct ArgsConfigLoader {
    args: LaunchArgs,
}

impl ArgsConfigLoader {
    /// Create a loader over already-parsed flags
    pub fn new(args: LaunchArgs) -> Self {
        Self { args }
    }

    async fn resolve_cluster(&self) -> Result<kube::Config> {
        let options = KubeConfigOptions {
            context: self.args.kube_context.clone(),
            ..Default::default()
        };

        match (&self.args.kubeconfig, &self.args.kube_context) {
            (Some(path), _) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    Error::config_field(
                        "kubeconfig",
                        format!("invalid connection descriptor {}: {e}", path.display()),
                    )
                })?;
                kube::Config::from_custom_kubeconfig(kubeconfig, &options)
                    .await
                    .map_err(|e| {
                        Error::config_field("kubeconfig", format!("invalid connection descriptor: {e}"))
                    })
            }
            (None, Some(_)) => kube::Config::from_kubeconfig(&options).await.map_err(|e| {
                Error::config_field("kube-context", format!("invalid connection descriptor: {e}"))
            }),
            (None, None) => kube::Config::infer()
                .await
                .map_err(|e| Error::config(format!("invalid connection descriptor: {e}"))),
        }
    }
}

#[async_trait]
impl ConfigLoader for ArgsConfigLoader {
    async fn load(&self) -> Result<Configuration> {
        let cluster = self.resolve_cluster().await?;
        self.args.clone().into_configuration(cluster)
    }
}

//! Isolation-mode and namespace resolution.
//!
//! Everything here is a pure function of its inputs: process-wide overrides
//! arrive through [`RunEnvironment`] and the defaults file through
//! [`KilnConfig`], both read once by the caller.

use crate::error::RunError;
use config_loader::{KilnConfig, RunEnvironment};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// How the contained process is separated from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Isolation {
    /// Full namespace isolation through an OCI runtime.
    #[default]
    Oci,
    /// OCI runtime isolation inside a private user namespace.
    OciRootless,
    /// Changed root only; the host's namespaces are shared.
    Chroot,
}

impl Isolation {
    pub fn parse(text: &str) -> Result<Self, RunError> {
        match text.trim().to_ascii_lowercase().as_str() {
            "oci" | "default" => Ok(Isolation::Oci),
            "rootless" | "oci-rootless" => Ok(Isolation::OciRootless),
            "chroot" => Ok(Isolation::Chroot),
            other => Err(RunError::invalid_configuration(format!(
                "unrecognized isolation type {other:?}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Isolation::Oci => "oci",
            Isolation::OciRootless => "rootless",
            Isolation::Chroot => "chroot",
        }
    }
}

impl fmt::Display for Isolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceKind {
    Cgroup,
    Ipc,
    Network,
    Pid,
    User,
    Uts,
}

impl NamespaceKind {
    /// Maps a command-line flag name (without dashes) to the namespace it controls.
    pub fn from_flag(name: &str) -> Option<Self> {
        match name {
            "cgroupns" => Some(NamespaceKind::Cgroup),
            "ipc" => Some(NamespaceKind::Ipc),
            "network" | "net" => Some(NamespaceKind::Network),
            "pid" => Some(NamespaceKind::Pid),
            "userns" => Some(NamespaceKind::User),
            "uts" => Some(NamespaceKind::Uts),
            _ => None,
        }
    }

    /// Namespace type name as used in an OCI runtime spec.
    pub fn oci_type(&self) -> &'static str {
        match self {
            NamespaceKind::Cgroup => "cgroup",
            NamespaceKind::Ipc => "ipc",
            NamespaceKind::Network => "network",
            NamespaceKind::Pid => "pid",
            NamespaceKind::User => "user",
            NamespaceKind::Uts => "uts",
        }
    }
}

impl fmt::Display for NamespaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.oci_type())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Disposition {
    /// Share the host's namespace.
    Host,
    /// Create a new namespace for the process.
    Private,
    /// Join the namespace at this path.
    Path(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NetworkPolicy {
    /// No network flag given; the engine decides.
    #[default]
    Default,
    /// Private namespace with only loopback.
    Disabled,
    /// Private namespace that gets configured.
    Enabled,
    /// The host network is shared; nothing to configure.
    Host,
    /// An existing namespace is joined as-is.
    Custom,
}

/// A namespace flag exactly as the user typed it, e.g. `("net", "host")`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceFlag {
    pub name: String,
    pub value: String,
}

impl NamespaceFlag {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NamespacePolicy {
    dispositions: BTreeMap<NamespaceKind, Disposition>,
    network: NetworkPolicy,
}

impl NamespacePolicy {
    pub fn get(&self, kind: NamespaceKind) -> Option<&Disposition> {
        self.dispositions.get(&kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = (NamespaceKind, &Disposition)> {
        self.dispositions.iter().map(|(kind, disp)| (*kind, disp))
    }

    pub fn network(&self) -> NetworkPolicy {
        self.network
    }

    pub fn is_empty(&self) -> bool {
        self.dispositions.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIsolation {
    pub isolation: Isolation,
    pub namespaces: NamespacePolicy,
}

/// Picks the isolation mode: flag text, then `KILN_ISOLATION`, then the
/// defaults file, then [`Isolation::Oci`]. Blank text at any level falls
/// through to the next one.
pub fn resolve_isolation(
    flag: Option<&str>,
    env: &RunEnvironment,
    defaults: &KilnConfig,
) -> Result<Isolation, RunError> {
    let candidates = [
        ("--isolation", flag),
        ("KILN_ISOLATION", env.isolation.as_deref()),
        ("defaults file", defaults.isolation.as_deref()),
    ];

    for (source, text) in candidates {
        let Some(text) = text.filter(|t| !t.trim().is_empty()) else {
            continue;
        };
        return Isolation::parse(text)
            .map(|isolation| {
                debug!(%isolation, source, "resolved isolation");
                isolation
            })
            .map_err(|err| match err {
                RunError::InvalidConfiguration { message } => RunError::InvalidConfiguration {
                    message: format!("{message} (from {source})"),
                },
                other => other,
            });
    }

    Ok(Isolation::default())
}

/// Reconciles namespace flags with each other and with the isolation mode.
pub fn resolve_namespaces(
    isolation: Isolation,
    flags: &[NamespaceFlag],
) -> Result<NamespacePolicy, RunError> {
    let mut policy = NamespacePolicy::default();
    let mut network_source: Option<&NamespaceFlag> = None;

    for flag in flags {
        let kind = NamespaceKind::from_flag(&flag.name).ok_or_else(|| {
            RunError::invalid_configuration(format!("unknown namespace flag --{}", flag.name))
        })?;
        let (disposition, network) = parse_disposition(kind, &flag.value)?;

        if let Some(existing) = policy.dispositions.get(&kind) {
            let same_network = kind != NamespaceKind::Network || network == policy.network;
            if *existing != disposition || !same_network {
                let earlier = network_source
                    .filter(|_| kind == NamespaceKind::Network)
                    .map(|f| format!("--{}={}", f.name, f.value))
                    .unwrap_or_else(|| format!("an earlier --{} flag", flag.name));
                return Err(RunError::invalid_configuration(format!(
                    "--{}={} contradicts {} for the {} namespace",
                    flag.name, flag.value, earlier, kind
                )));
            }
            continue;
        }

        if kind == NamespaceKind::Network {
            policy.network = network;
            network_source = Some(flag);
        }
        policy.dispositions.insert(kind, disposition);
    }

    check_compatibility(isolation, &policy)?;
    debug!(%isolation, network = ?policy.network, "resolved namespace options");
    Ok(policy)
}

pub fn resolve(
    isolation_flag: Option<&str>,
    namespace_flags: &[NamespaceFlag],
    env: &RunEnvironment,
    defaults: &KilnConfig,
) -> Result<ResolvedIsolation, RunError> {
    let isolation = resolve_isolation(isolation_flag, env, defaults)?;
    let namespaces = resolve_namespaces(isolation, namespace_flags)?;
    Ok(ResolvedIsolation {
        isolation,
        namespaces,
    })
}

fn parse_disposition(
    kind: NamespaceKind,
    value: &str,
) -> Result<(Disposition, NetworkPolicy), RunError> {
    let value = value.trim();
    let resolved = match value {
        "host" => (Disposition::Host, NetworkPolicy::Host),
        "" | "private" | "container" => (Disposition::Private, NetworkPolicy::Enabled),
        "none" if kind == NamespaceKind::Network => (Disposition::Private, NetworkPolicy::Disabled),
        path if path.starts_with('/') => {
            (Disposition::Path(Path::new(path).to_path_buf()), NetworkPolicy::Custom)
        }
        other => {
            return Err(RunError::invalid_configuration(format!(
                "invalid value {other:?} for the {kind} namespace: expected host, private or an absolute path"
            )))
        }
    };
    Ok(resolved)
}

fn check_compatibility(isolation: Isolation, policy: &NamespacePolicy) -> Result<(), RunError> {
    match isolation {
        Isolation::Oci => Ok(()),
        Isolation::OciRootless => match policy.get(NamespaceKind::User) {
            Some(Disposition::Host) => Err(RunError::invalid_configuration(
                "rootless isolation requires a private user namespace; it cannot share the host's",
            )),
            _ => Ok(()),
        },
        Isolation::Chroot => {
            for (kind, disposition) in policy.iter() {
                let unsupported = match disposition {
                    Disposition::Host => false,
                    Disposition::Path(_) => true,
                    Disposition::Private => matches!(
                        kind,
                        NamespaceKind::Network | NamespaceKind::User | NamespaceKind::Cgroup
                    ),
                };
                if unsupported {
                    return Err(RunError::invalid_configuration(format!(
                        "chroot isolation cannot create or join a {kind} namespace; share the host's or pick another isolation"
                    )));
                }
            }
            Ok(())
        }
    }
}

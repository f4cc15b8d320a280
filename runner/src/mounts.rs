//! Volume and mount parsing.
//!
//! Two syntaxes describe the same thing:
//!
//! * volumes: `source:destination[:opt,opt...]`
//! * mounts: `type=bind,source=...,destination=...,ro`
//!
//! Both are parsed into [`Mount`] and merged into one [`MountSpec`] in which
//! every destination appears once. Volumes come first, then mounts, each in
//! the order given.

use crate::error::RunError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountType {
    Bind,
    Tmpfs,
}

impl MountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MountType::Bind => "bind",
            MountType::Tmpfs => "tmpfs",
        }
    }
}

/// SELinux relabeling requested with `z` (shared) or `Z` (private).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Relabel {
    Shared,
    Private,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Propagation {
    Private,
    Rprivate,
    Shared,
    Rshared,
    Slave,
    Rslave,
}

impl Propagation {
    fn parse(text: &str) -> Option<Self> {
        match text {
            "private" => Some(Propagation::Private),
            "rprivate" => Some(Propagation::Rprivate),
            "shared" => Some(Propagation::Shared),
            "rshared" => Some(Propagation::Rshared),
            "slave" => Some(Propagation::Slave),
            "rslave" => Some(Propagation::Rslave),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Propagation::Private => "private",
            Propagation::Rprivate => "rprivate",
            Propagation::Shared => "shared",
            Propagation::Rshared => "rshared",
            Propagation::Slave => "slave",
            Propagation::Rslave => "rslave",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountOptions {
    pub read_only: bool,
    pub relabel: Option<Relabel>,
    pub propagation: Option<Propagation>,
    /// `rbind` rather than `bind`; only meaningful for bind mounts.
    pub recursive: bool,
    /// `nosuid`, `nodev`, `noexec` and their positive forms, in input order.
    pub flags: Vec<String>,
    pub tmpfs_size: Option<String>,
    pub tmpfs_mode: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
    #[serde(rename = "type")]
    pub kind: MountType,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub options: MountOptions,
}

impl Mount {
    /// Option strings in the form an OCI runtime spec expects.
    ///
    /// Relabeling is not a kernel mount option, so it is not included.
    pub fn oci_options(&self) -> Vec<String> {
        let mut out = Vec::new();
        match self.kind {
            MountType::Bind => {
                out.push(if self.options.recursive { "rbind" } else { "bind" }.to_string());
            }
            MountType::Tmpfs => {
                out.push("nosuid".to_string());
                out.push("nodev".to_string());
            }
        }
        out.push(if self.options.read_only { "ro" } else { "rw" }.to_string());
        if let Some(propagation) = self.options.propagation {
            out.push(propagation.as_str().to_string());
        }
        for flag in &self.options.flags {
            if !out.contains(flag) {
                out.push(flag.clone());
            }
        }
        if let Some(size) = &self.options.tmpfs_size {
            out.push(format!("size={size}"));
        }
        if let Some(mode) = self.options.tmpfs_mode {
            out.push(format!("mode={mode:o}"));
        }
        out
    }
}

impl fmt::Display for Mount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {} ({})",
            self.kind.as_str(),
            self.source.display(),
            self.destination.display(),
            self.oci_options().join(",")
        )
    }
}

/// Merged, duplicate-free mount list.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MountSpec(Vec<Mount>);

impl MountSpec {
    pub fn iter(&self) -> std::slice::Iter<'_, Mount> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<Mount> {
        self.0
    }
}

impl<'a> IntoIterator for &'a MountSpec {
    type Item = &'a Mount;
    type IntoIter = std::slice::Iter<'a, Mount>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Parses and merges volumes and mounts. Relative bind sources resolve
/// against `context_dir`; without one they are rejected.
pub fn merge(
    volumes: &[String],
    mounts: &[String],
    context_dir: Option<&Path>,
) -> Result<MountSpec, RunError> {
    let mut merged = Vec::with_capacity(volumes.len() + mounts.len());
    let mut seen: HashMap<PathBuf, String> = HashMap::new();

    let parsed_volumes = volumes
        .iter()
        .map(|spec| parse_volume(spec, context_dir).map(|m| (format!("--volume {spec}"), m)));
    let parsed_mounts = mounts
        .iter()
        .map(|spec| parse_mount(spec, context_dir).map(|m| (format!("--mount {spec}"), m)));

    for parsed in parsed_volumes.chain(parsed_mounts) {
        let (origin, mount) = parsed?;
        if let Some(previous) = seen.get(&mount.destination) {
            return Err(RunError::invalid_mount(format!(
                "duplicate mount destination {}: {} conflicts with {}",
                mount.destination.display(),
                origin,
                previous
            )));
        }
        seen.insert(mount.destination.clone(), origin);
        merged.push(mount);
    }

    debug!(count = merged.len(), "merged volumes and mounts");
    Ok(MountSpec(merged))
}

pub fn parse_volume(spec: &str, context_dir: Option<&Path>) -> Result<Mount, RunError> {
    let parts: Vec<&str> = spec.split(':').collect();
    let (source, destination, options) = match parts.as_slice() {
        [source, destination] => (*source, *destination, None),
        [source, destination, options] => (*source, *destination, Some(*options)),
        _ => {
            return Err(RunError::invalid_mount(format!(
                "volume {spec:?}: expected source:destination[:options]"
            )))
        }
    };
    if source.is_empty() {
        return Err(RunError::invalid_mount(format!(
            "volume {spec:?}: source path is empty"
        )));
    }

    let mut set = OptionSet::default();
    for option in options.into_iter().flat_map(|o| o.split(',')) {
        let option = option.trim();
        if option.is_empty() {
            continue;
        }
        if !set.apply_flag(option).map_err(|msg| volume_error(spec, &msg))? {
            return Err(volume_error(spec, &format!("unknown option {option:?}")));
        }
    }

    Ok(Mount {
        kind: MountType::Bind,
        source: resolve_source(source, context_dir).map_err(|msg| volume_error(spec, &msg))?,
        destination: normalize_destination(destination)
            .map_err(|msg| volume_error(spec, &msg))?,
        options: set.finish(),
    })
}

pub fn parse_mount(spec: &str, context_dir: Option<&Path>) -> Result<Mount, RunError> {
    let mut kind: Option<MountType> = None;
    let mut source: Option<&str> = None;
    let mut destination: Option<&str> = None;
    let mut set = OptionSet::default();
    let mut bind_only: Option<&str> = None;
    let mut tmpfs_only: Option<&str> = None;

    for field in spec.split(',') {
        let field = field.trim();
        if field.is_empty() {
            continue;
        }
        let (key, value) = match field.split_once('=') {
            Some((key, value)) => (key.trim(), Some(value.trim())),
            None => (field, None),
        };
        let err = |msg: String| mount_error(spec, &msg);

        match (key, value) {
            ("type", Some(value)) => {
                let parsed = match value {
                    "bind" => MountType::Bind,
                    "tmpfs" => MountType::Tmpfs,
                    other => return Err(err(format!("unsupported mount type {other:?}"))),
                };
                set_once(&mut kind, parsed, "type").map_err(err)?;
            }
            ("source" | "src", Some(value)) if !value.is_empty() => {
                set_once(&mut source, value, "source").map_err(err)?;
            }
            ("destination" | "dst" | "target", Some(value)) if !value.is_empty() => {
                set_once(&mut destination, value, "destination").map_err(err)?;
            }
            ("ro" | "readonly", value) => {
                let read_only = match value {
                    None | Some("true") | Some("1") => true,
                    Some("false") | Some("0") => false,
                    Some(other) => return Err(err(format!("invalid {key} value {other:?}"))),
                };
                set.set_read_only(read_only).map_err(err)?;
            }
            ("bind-propagation", Some(value)) => {
                let propagation = Propagation::parse(value)
                    .ok_or_else(|| err(format!("invalid bind-propagation {value:?}")))?;
                set.set_propagation(propagation).map_err(err)?;
                bind_only.get_or_insert(key);
            }
            ("relabel", Some(value)) => {
                let relabel = match value {
                    "shared" => Relabel::Shared,
                    "private" => Relabel::Private,
                    other => return Err(err(format!("invalid relabel value {other:?}"))),
                };
                set.set_relabel(relabel).map_err(err)?;
                bind_only.get_or_insert(key);
            }
            ("bind-nonrecursive", None) => {
                set.set_recursive(false).map_err(err)?;
                bind_only.get_or_insert(key);
            }
            ("tmpfs-size", Some(value)) if !value.is_empty() => {
                set_once(&mut set.tmpfs_size, value.to_string(), key).map_err(err)?;
                tmpfs_only.get_or_insert(key);
            }
            ("tmpfs-mode", Some(value)) => {
                let mode = u32::from_str_radix(value, 8)
                    .map_err(|_| err(format!("invalid tmpfs-mode {value:?}: expected octal")))?;
                set_once(&mut set.tmpfs_mode, mode, key).map_err(err)?;
                tmpfs_only.get_or_insert(key);
            }
            (flag, None) => {
                if !set.apply_flag(flag).map_err(err)? {
                    return Err(err(format!("unknown option {flag:?}")));
                }
                if matches!(flag, "z" | "Z" | "bind" | "rbind") {
                    bind_only.get_or_insert(flag);
                }
            }
            (key, Some(value)) => {
                return Err(err(format!("unknown or empty option {key}={value}")));
            }
        }
    }

    let kind = kind.unwrap_or(MountType::Bind);
    let destination = destination.ok_or_else(|| mount_error(spec, "destination is required"))?;
    let destination = normalize_destination(destination).map_err(|msg| mount_error(spec, &msg))?;

    let source = match kind {
        MountType::Bind => {
            if let Some(option) = tmpfs_only {
                return Err(mount_error(spec, &format!("{option} only applies to tmpfs mounts")));
            }
            let source = source.ok_or_else(|| mount_error(spec, "bind mounts need a source"))?;
            resolve_source(source, context_dir).map_err(|msg| mount_error(spec, &msg))?
        }
        MountType::Tmpfs => {
            if source.is_some() {
                return Err(mount_error(spec, "tmpfs mounts do not take a source"));
            }
            if let Some(option) = bind_only {
                return Err(mount_error(spec, &format!("{option} only applies to bind mounts")));
            }
            PathBuf::from("tmpfs")
        }
    };

    Ok(Mount {
        kind,
        source,
        destination,
        options: set.finish(),
    })
}

/// Cleans a container-side path: must be absolute, `.` segments and
/// trailing slashes are dropped, `..` is refused.
pub fn normalize_destination(raw: &str) -> Result<PathBuf, String> {
    let path = Path::new(raw);
    if !path.is_absolute() {
        return Err(format!("destination {raw:?} must be an absolute path"));
    }
    let mut normalized = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(part) => normalized.push(part),
            Component::ParentDir | Component::Prefix(_) => {
                return Err(format!("destination {raw:?} cannot contain '..'"))
            }
        }
    }
    Ok(normalized)
}

fn resolve_source(raw: &str, context_dir: Option<&Path>) -> Result<PathBuf, String> {
    let path = Path::new(raw);
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    match context_dir {
        Some(dir) => Ok(dir.join(path)),
        None => Err(format!(
            "relative source {raw:?} needs a context directory to resolve against"
        )),
    }
}

fn volume_error(spec: &str, message: &str) -> RunError {
    RunError::invalid_mount(format!("volume {spec:?}: {message}"))
}

fn mount_error(spec: &str, message: &str) -> RunError {
    RunError::invalid_mount(format!("mount {spec:?}: {message}"))
}

fn set_once<T: PartialEq>(slot: &mut Option<T>, value: T, name: &str) -> Result<(), String> {
    match slot {
        Some(existing) if *existing != value => Err(format!("{name} specified more than once")),
        _ => {
            *slot = Some(value);
            Ok(())
        }
    }
}

/// Collects options while rejecting contradictions such as `ro,rw`.
#[derive(Debug, Default)]
struct OptionSet {
    read_only: Option<bool>,
    relabel: Option<Relabel>,
    propagation: Option<Propagation>,
    recursive: Option<bool>,
    flags: Vec<String>,
    tmpfs_size: Option<String>,
    tmpfs_mode: Option<u32>,
}

impl OptionSet {
    /// Applies a bare option word. Returns `Ok(false)` if it is not one.
    fn apply_flag(&mut self, option: &str) -> Result<bool, String> {
        match option {
            "ro" => self.set_read_only(true)?,
            "rw" => self.set_read_only(false)?,
            "z" => self.set_relabel(Relabel::Shared)?,
            "Z" => self.set_relabel(Relabel::Private)?,
            "bind" => self.set_recursive(false)?,
            "rbind" => self.set_recursive(true)?,
            "nosuid" | "suid" | "nodev" | "dev" | "noexec" | "exec" => self.add_flag(option)?,
            other => match Propagation::parse(other) {
                Some(propagation) => self.set_propagation(propagation)?,
                None => return Ok(false),
            },
        }
        Ok(true)
    }

    fn set_read_only(&mut self, read_only: bool) -> Result<(), String> {
        set_once(&mut self.read_only, read_only, "ro/rw")
            .map_err(|_| "ro and rw are mutually exclusive".to_string())
    }

    fn set_relabel(&mut self, relabel: Relabel) -> Result<(), String> {
        set_once(&mut self.relabel, relabel, "relabel")
            .map_err(|_| "z and Z are mutually exclusive".to_string())
    }

    fn set_propagation(&mut self, propagation: Propagation) -> Result<(), String> {
        set_once(&mut self.propagation, propagation, "propagation")
            .map_err(|_| "only one propagation mode may be given".to_string())
    }

    fn set_recursive(&mut self, recursive: bool) -> Result<(), String> {
        set_once(&mut self.recursive, recursive, "bind")
            .map_err(|_| "bind and rbind are mutually exclusive".to_string())
    }

    fn add_flag(&mut self, flag: &str) -> Result<(), String> {
        let opposite = match flag.strip_prefix("no") {
            Some(positive) => positive.to_string(),
            None => format!("no{flag}"),
        };
        if self.flags.contains(&opposite) {
            return Err(format!("{flag} and {opposite} are mutually exclusive"));
        }
        if !self.flags.iter().any(|f| f == flag) {
            self.flags.push(flag.to_string());
        }
        Ok(())
    }

    fn finish(self) -> MountOptions {
        MountOptions {
            read_only: self.read_only.unwrap_or(false),
            relabel: self.relabel,
            propagation: self.propagation,
            recursive: self.recursive.unwrap_or(true),
            flags: self.flags,
            tmpfs_size: self.tmpfs_size,
            tmpfs_mode: self.tmpfs_mode,
        }
    }
}

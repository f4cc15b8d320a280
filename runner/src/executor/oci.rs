use super::{ExecError, Executor};
use crate::container::ContainerRecord;
use crate::isolation::{Disposition, Isolation, NamespaceKind};
use crate::mounts::{Mount, MountType};
use crate::options::{RunOptions, TerminalMode};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use tempfile::TempDir;
use tracing::debug;

const DEFAULT_PATH: &str = "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

const DEFAULT_CAPABILITIES: &[&str] = &[
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_FOWNER",
    "CAP_FSETID",
    "CAP_KILL",
    "CAP_NET_BIND_SERVICE",
    "CAP_SETFCAP",
    "CAP_SETGID",
    "CAP_SETPCAP",
    "CAP_SETUID",
    "CAP_SYS_CHROOT",
];

const ALL_CAPABILITIES: &[&str] = &[
    "CAP_AUDIT_CONTROL",
    "CAP_AUDIT_READ",
    "CAP_AUDIT_WRITE",
    "CAP_BLOCK_SUSPEND",
    "CAP_BPF",
    "CAP_CHECKPOINT_RESTORE",
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_DAC_READ_SEARCH",
    "CAP_FOWNER",
    "CAP_FSETID",
    "CAP_IPC_LOCK",
    "CAP_IPC_OWNER",
    "CAP_KILL",
    "CAP_LEASE",
    "CAP_LINUX_IMMUTABLE",
    "CAP_MAC_ADMIN",
    "CAP_MAC_OVERRIDE",
    "CAP_MKNOD",
    "CAP_NET_ADMIN",
    "CAP_NET_BIND_SERVICE",
    "CAP_NET_BROADCAST",
    "CAP_NET_RAW",
    "CAP_PERFMON",
    "CAP_SETFCAP",
    "CAP_SETGID",
    "CAP_SETPCAP",
    "CAP_SETUID",
    "CAP_SYSLOG",
    "CAP_SYS_ADMIN",
    "CAP_SYS_BOOT",
    "CAP_SYS_CHROOT",
    "CAP_SYS_MODULE",
    "CAP_SYS_NICE",
    "CAP_SYS_PACCT",
    "CAP_SYS_PTRACE",
    "CAP_SYS_RAWIO",
    "CAP_SYS_RESOURCE",
    "CAP_SYS_TIME",
    "CAP_SYS_TTY_CONFIG",
    "CAP_WAKE_ALARM",
];

/// Runs commands through an OCI runtime binary (`runc`, `crun`, ...).
///
/// Each run writes a throwaway bundle whose `config.json` points at the
/// container's rootfs, then calls `<runtime> [flags] run --bundle <dir> <name>`
/// with the caller's stdio.
#[derive(Debug, Clone, Default)]
pub struct OciExecutor;

impl OciExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Executor for OciExecutor {
    fn run(
        &self,
        container: &ContainerRecord,
        command: &[String],
        options: &RunOptions,
    ) -> Result<(), ExecError> {
        let bundle = TempDir::new().map_err(|err| ExecError::Bundle {
            message: format!("Failed to create bundle directory: {}", err),
        })?;

        let spec = build_spec(container, command, options)?;
        let config_path = bundle.path().join("config.json");
        let json = serde_json::to_vec_pretty(&spec).map_err(|err| ExecError::Bundle {
            message: format!("Failed to serialize runtime spec: {}", err),
        })?;
        fs::write(&config_path, json).map_err(|err| ExecError::Bundle {
            message: format!("Failed to write {}: {}", config_path.display(), err),
        })?;

        let mut cmd = Command::new(options.runtime());
        configure_command(&mut cmd, container, options, bundle.path());
        debug!(cmdline = %command_line_string(&cmd), "invoking container runtime");

        let status = cmd.status().map_err(|source| ExecError::RuntimeSpawn {
            runtime: options.runtime().to_string(),
            source,
        })?;
        check_status(options.runtime(), status)
    }
}

fn check_status(runtime: &str, status: ExitStatus) -> Result<(), ExecError> {
    match status.code() {
        Some(0) => Ok(()),
        Some(code) => Err(ExecError::Exited {
            runtime: runtime.to_string(),
            code,
        }),
        None => Err(ExecError::Signaled {
            runtime: runtime.to_string(),
        }),
    }
}

fn configure_command(
    command: &mut Command,
    container: &ContainerRecord,
    options: &RunOptions,
    bundle: &Path,
) {
    for flag in options.runtime_args() {
        command.arg(flag);
    }
    command.arg("run");
    command.arg("--bundle").arg(bundle);
    if options.no_pivot() {
        command.arg("--no-pivot");
    }
    command.arg(runtime_container_name(container));

    command.stdin(Stdio::inherit());
    command.stdout(Stdio::inherit());
    command.stderr(Stdio::inherit());
}

/// Name the runtime registers the transient container under.
fn runtime_container_name(container: &ContainerRecord) -> String {
    format!("kiln-{}-{}", container.id, std::process::id())
}

fn build_spec(
    container: &ContainerRecord,
    command: &[String],
    options: &RunOptions,
) -> Result<Value, ExecError> {
    let user_spec = options.user().or(container.config.user.as_deref());
    let (uid, gid) = resolve_user(&container.rootfs, user_spec)?;

    let cwd = options
        .working_dir()
        .or(container.config.working_dir.as_deref())
        .unwrap_or("/");

    let hostname = options
        .hostname()
        .or(container.config.hostname.as_deref())
        .map(str::to_string);

    let capabilities = capability_set(options);

    let mut spec = json!({
        "ociVersion": "1.0.2",
        "process": {
            "terminal": allocate_terminal(options.terminal()),
            "user": { "uid": uid, "gid": gid },
            "args": command,
            "env": merge_env(&container.config.env, options.env()),
            "cwd": cwd,
            "capabilities": {
                "bounding": capabilities,
                "effective": capabilities,
                "permitted": capabilities,
            },
        },
        "root": {
            "path": container.rootfs,
            "readonly": false,
        },
        "mounts": mounts(options),
        "linux": {
            "namespaces": namespaces(options),
        },
    });

    if !options.shares_host_uts() {
        if let Some(hostname) = hostname {
            spec["hostname"] = Value::String(hostname);
        }
    }

    if options.isolation() == Isolation::OciRootless {
        let (host_uid, host_gid) = host_ids();
        spec["linux"]["uidMappings"] = json!([{ "containerID": 0, "hostID": host_uid, "size": 1 }]);
        spec["linux"]["gidMappings"] = json!([{ "containerID": 0, "hostID": host_gid, "size": 1 }]);
    }

    Ok(spec)
}

fn allocate_terminal(mode: TerminalMode) -> bool {
    match mode {
        TerminalMode::Enabled => true,
        TerminalMode::Disabled => false,
        TerminalMode::Inherit => atty::is(atty::Stream::Stdin),
    }
}

/// Container env first, then run env; a later `KEY=` replaces an earlier one.
fn merge_env(base: &[String], overrides: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = Vec::new();
    for assignment in base.iter().chain(overrides) {
        let key = assignment.split('=').next().unwrap_or(assignment);
        merged.retain(|existing| existing.split('=').next() != Some(key));
        merged.push(assignment.clone());
    }
    if !merged.iter().any(|a| a.starts_with("PATH=")) {
        merged.insert(0, DEFAULT_PATH.to_string());
    }
    merged
}

fn capability_set(options: &RunOptions) -> Vec<String> {
    let drops = options.drop_capabilities();
    let adds = options.add_capabilities();

    let mut caps: BTreeSet<String> = if drops.iter().any(|c| c == "ALL") {
        BTreeSet::new()
    } else {
        DEFAULT_CAPABILITIES
            .iter()
            .filter(|cap| !drops.iter().any(|d| d == *cap))
            .map(|cap| cap.to_string())
            .collect()
    };

    for cap in adds {
        if cap == "ALL" {
            caps.extend(ALL_CAPABILITIES.iter().map(|c| c.to_string()));
        } else {
            caps.insert(cap.clone());
        }
    }
    caps.into_iter().collect()
}

fn namespaces(options: &RunOptions) -> Vec<Value> {
    let isolated: &[NamespaceKind] = match options.isolation() {
        Isolation::Oci => &[
            NamespaceKind::Ipc,
            NamespaceKind::Network,
            NamespaceKind::Pid,
            NamespaceKind::Uts,
        ],
        Isolation::OciRootless => &[
            NamespaceKind::Ipc,
            NamespaceKind::Network,
            NamespaceKind::Pid,
            NamespaceKind::User,
            NamespaceKind::Uts,
        ],
        Isolation::Chroot => &[],
    };

    let mut out = vec![json!({ "type": "mount" })];
    let kinds = [
        NamespaceKind::Cgroup,
        NamespaceKind::Ipc,
        NamespaceKind::Network,
        NamespaceKind::Pid,
        NamespaceKind::User,
        NamespaceKind::Uts,
    ];
    for kind in kinds {
        let private_by_default = isolated.contains(&kind);
        match options.namespaces().get(kind) {
            Some(Disposition::Host) => {}
            Some(Disposition::Path(path)) => {
                out.push(json!({ "type": kind.oci_type(), "path": path }));
            }
            Some(Disposition::Private) => out.push(json!({ "type": kind.oci_type() })),
            None if private_by_default => out.push(json!({ "type": kind.oci_type() })),
            None => {}
        }
    }
    out
}

fn mounts(options: &RunOptions) -> Vec<Value> {
    let mut out: Vec<Value> = default_mounts()
        .into_iter()
        .filter(|(destination, _)| {
            !options
                .mounts()
                .iter()
                .any(|m| m.destination == Path::new(destination))
        })
        .map(|(_, value)| value)
        .collect();
    out.extend(options.mounts().iter().map(mount_value));
    out
}

fn mount_value(mount: &Mount) -> Value {
    json!({
        "destination": mount.destination,
        "type": match mount.kind {
            MountType::Bind => "bind",
            MountType::Tmpfs => "tmpfs",
        },
        "source": mount.source,
        "options": mount.oci_options(),
    })
}

fn default_mounts() -> Vec<(&'static str, Value)> {
    vec![
        (
            "/proc",
            json!({ "destination": "/proc", "type": "proc", "source": "proc" }),
        ),
        (
            "/dev",
            json!({
                "destination": "/dev", "type": "tmpfs", "source": "tmpfs",
                "options": ["nosuid", "strictatime", "mode=755", "size=65536k"],
            }),
        ),
        (
            "/dev/pts",
            json!({
                "destination": "/dev/pts", "type": "devpts", "source": "devpts",
                "options": ["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620"],
            }),
        ),
        (
            "/dev/shm",
            json!({
                "destination": "/dev/shm", "type": "tmpfs", "source": "shm",
                "options": ["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"],
            }),
        ),
        (
            "/sys",
            json!({
                "destination": "/sys", "type": "sysfs", "source": "sysfs",
                "options": ["nosuid", "noexec", "nodev", "ro"],
            }),
        ),
    ]
}

/// Resolves `user[:group]` to numeric ids, consulting the rootfs's
/// `/etc/passwd` and `/etc/group` for names.
fn resolve_user(rootfs: &Path, spec: Option<&str>) -> Result<(u32, u32), ExecError> {
    let Some(spec) = spec.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok((0, 0));
    };
    let (user, group) = match spec.split_once(':') {
        Some((user, group)) => (user, Some(group)),
        None => (spec, None),
    };
    let err = |message: String| ExecError::User {
        user: spec.to_string(),
        message,
    };

    let passwd = read_db(&rootfs.join("etc/passwd"));
    let passwd_entry = passwd.iter().find(|fields| {
        fields.first().map(String::as_str) == Some(user)
            || fields.get(2).map(String::as_str) == Some(user)
    });

    let uid = match user.parse::<u32>() {
        Ok(uid) => uid,
        Err(_) => passwd_entry
            .and_then(|fields| fields.get(2))
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| err(format!("no user named {user:?} in the container")))?,
    };

    let gid = match group {
        Some(group) => match group.parse::<u32>() {
            Ok(gid) => gid,
            Err(_) => read_db(&rootfs.join("etc/group"))
                .iter()
                .find(|fields| fields.first().map(String::as_str) == Some(group))
                .and_then(|fields| fields.get(2))
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| err(format!("no group named {group:?} in the container")))?,
        },
        None => passwd_entry
            .and_then(|fields| fields.get(3))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
    };

    Ok((uid, gid))
}

fn read_db(path: &Path) -> Vec<Vec<String>> {
    fs::read_to_string(path)
        .map(|content| {
            content
                .lines()
                .filter(|line| !line.trim().is_empty() && !line.starts_with('#'))
                .map(|line| line.split(':').map(str::to_string).collect())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(unix)]
fn host_ids() -> (u32, u32) {
    let uid = unsafe { libc::geteuid() };
    let gid = unsafe { libc::getegid() };
    (uid, gid)
}

#[cfg(not(unix))]
fn host_ids() -> (u32, u32) {
    (65534, 65534)
}

fn shell_escape(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }
    let escaped = arg.replace('\'', "'\\''");
    format!("'{}'", escaped)
}

fn command_line_string(cmd: &Command) -> String {
    let mut s = String::new();
    s.push_str(&cmd.get_program().to_string_lossy());
    for a in cmd.get_args() {
        s.push(' ');
        let a = a.to_string_lossy();
        if a.is_empty() || a.contains(' ') || a.contains('"') || a.contains('\'') {
            s.push_str(&shell_escape(&a));
        } else {
            s.push_str(&a);
        }
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ContainerConfig;
    use crate::isolation::NamespaceFlag;
    use crate::options::{plan, RunRequest};
    use config_loader::{KilnConfig, RunEnvironment};

    fn strings(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn record(rootfs: &Path) -> ContainerRecord {
        ContainerRecord {
            id: "abc".to_string(),
            name: "ctr".to_string(),
            rootfs: rootfs.to_path_buf(),
            config: ContainerConfig {
                shell: vec![],
                user: None,
                working_dir: Some("/app".to_string()),
                env: strings(&["LANG=C", "MODE=image"]),
                hostname: None,
            },
            history: vec![],
        }
    }

    fn options(req: RunRequest) -> RunOptions {
        plan(&req, &RunEnvironment::default(), &KilnConfig::default())
            .unwrap()
            .options
    }

    fn request(extra: impl FnOnce(&mut RunRequest)) -> RunRequest {
        let mut req = RunRequest {
            args: strings(&["ctr", "echo", "hi"]),
            ..Default::default()
        };
        extra(&mut req);
        req
    }

    #[test]
    fn spec_merges_container_defaults_with_run_options() {
        let rootfs = tempfile::tempdir().unwrap();
        let opts = options(request(|r| {
            r.env = strings(&["MODE=run"]);
            r.terminal = Some(false);
            r.hostname = Some("builder".to_string());
        }));
        let spec = build_spec(&record(rootfs.path()), &strings(&["echo", "hi"]), &opts).unwrap();

        assert_eq!(spec["process"]["args"], json!(["echo", "hi"]));
        assert_eq!(spec["process"]["cwd"], json!("/app"));
        assert_eq!(spec["process"]["terminal"], json!(false));
        assert_eq!(spec["hostname"], json!("builder"));
        assert_eq!(
            spec["process"]["env"],
            json!([DEFAULT_PATH, "LANG=C", "MODE=run"])
        );
        assert_eq!(spec["root"]["path"], json!(rootfs.path()));
    }

    #[test]
    fn namespaces_follow_policy_and_isolation() {
        let opts = options(request(|r| {
            r.namespaces = vec![
                NamespaceFlag::new("network", "host"),
                NamespaceFlag::new("ipc", "/proc/7/ns/ipc"),
            ];
        }));
        let ns = namespaces(&opts);
        let types: Vec<&str> = ns.iter().map(|v| v["type"].as_str().unwrap()).collect();
        assert_eq!(types, vec!["mount", "ipc", "pid", "uts"]);
        assert_eq!(ns[1]["path"], json!("/proc/7/ns/ipc"));

        let chroot = options(request(|r| r.isolation = Some("chroot".to_string())));
        let types: Vec<Value> = namespaces(&chroot).into_iter().map(|v| v["type"].clone()).collect();
        assert_eq!(types, vec![json!("mount")]);
    }

    #[test]
    fn rootless_maps_root_to_invoking_user() {
        let rootfs = tempfile::tempdir().unwrap();
        let opts = options(request(|r| r.isolation = Some("rootless".to_string())));
        let spec = build_spec(&record(rootfs.path()), &strings(&["id"]), &opts).unwrap();
        assert_eq!(spec["linux"]["uidMappings"][0]["containerID"], json!(0));
        assert!(namespaces(&opts).iter().any(|v| v["type"] == json!("user")));
    }

    #[test]
    fn user_mounts_replace_defaults_at_same_destination() {
        let opts = options(request(|r| {
            r.mounts = strings(&["type=tmpfs,dst=/dev/shm,tmpfs-size=1g"]);
            r.volumes = strings(&["/srv:/srv:ro"]);
        }));
        let all = mounts(&opts);
        let shm: Vec<&Value> = all
            .iter()
            .filter(|m| m["destination"] == json!("/dev/shm"))
            .collect();
        assert_eq!(shm.len(), 1);
        assert_eq!(shm[0]["source"], json!("tmpfs"));
        assert!(all
            .iter()
            .any(|m| m["destination"] == json!("/srv") && m["options"] == json!(["rbind", "ro"])));
    }

    #[test]
    fn capabilities_apply_drops_then_adds() {
        let opts = options(request(|r| {
            r.cap_drop = strings(&["all"]);
            r.cap_add = strings(&["net_raw"]);
        }));
        assert_eq!(capability_set(&opts), strings(&["CAP_NET_RAW"]));

        let opts = options(request(|r| r.cap_drop = strings(&["chown"])));
        let caps = capability_set(&opts);
        assert!(!caps.contains(&"CAP_CHOWN".to_string()));
        assert!(caps.contains(&"CAP_KILL".to_string()));
    }

    #[test]
    fn users_resolve_through_rootfs_databases() {
        let rootfs = tempfile::tempdir().unwrap();
        fs::create_dir_all(rootfs.path().join("etc")).unwrap();
        fs::write(
            rootfs.path().join("etc/passwd"),
            "root:x:0:0:root:/root:/bin/sh\nbuilder:x:1000:1001::/home/builder:/bin/sh\n",
        )
        .unwrap();
        fs::write(rootfs.path().join("etc/group"), "root:x:0:\nwheel:x:10:builder\n").unwrap();

        assert_eq!(resolve_user(rootfs.path(), None).unwrap(), (0, 0));
        assert_eq!(resolve_user(rootfs.path(), Some("builder")).unwrap(), (1000, 1001));
        assert_eq!(resolve_user(rootfs.path(), Some("builder:wheel")).unwrap(), (1000, 10));
        assert_eq!(resolve_user(rootfs.path(), Some("1000")).unwrap(), (1000, 1001));
        assert_eq!(resolve_user(rootfs.path(), Some("42:7")).unwrap(), (42, 7));
        assert!(matches!(
            resolve_user(rootfs.path(), Some("ghost")),
            Err(ExecError::User { .. })
        ));
    }

    #[test]
    fn container_hostname_is_dropped_with_host_uts() {
        let rootfs = tempfile::tempdir().unwrap();
        let mut container = record(rootfs.path());
        container.config.hostname = Some("image-host".to_string());

        let opts = options(request(|r| r.namespaces = vec![NamespaceFlag::new("uts", "host")]));
        let spec = build_spec(&container, &strings(&["true"]), &opts).unwrap();
        assert!(spec.get("hostname").is_none());

        let spec = build_spec(&container, &strings(&["true"]), &options(request(|_| {}))).unwrap();
        assert_eq!(spec["hostname"], json!("image-host"));
    }

    #[test]
    fn command_places_runtime_flags_before_run() {
        let rootfs = tempfile::tempdir().unwrap();
        let opts = options(request(|r| {
            r.runtime_flags = strings(&["debug"]);
            r.no_pivot = true;
        }));
        let mut cmd = Command::new(opts.runtime());
        configure_command(&mut cmd, &record(rootfs.path()), &opts, Path::new("/tmp/bundle"));
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert_eq!(&args[..5], &strings(&["--debug", "run", "--bundle", "/tmp/bundle", "--no-pivot"])[..]);
        assert!(args[5].starts_with("kiln-abc-"));
        assert!(command_line_string(&cmd).starts_with("runc --debug run"));
    }

    #[test]
    fn nonzero_exit_surfaces_code() {
        let rootfs = tempfile::tempdir().unwrap();
        let opts = options(request(|r| r.runtime = Some("false".to_string())));
        let err = OciExecutor::new()
            .run(&record(rootfs.path()), &strings(&["true"]), &opts)
            .unwrap_err();
        assert_eq!(err.exit_code(), Some(1));
    }

    #[test]
    fn missing_runtime_is_a_spawn_error() {
        let rootfs = tempfile::tempdir().unwrap();
        let opts = options(request(|r| {
            r.runtime = Some("/nonexistent/kiln-runtime".to_string())
        }));
        let err = OciExecutor::new()
            .run(&record(rootfs.path()), &strings(&["true"]), &opts)
            .unwrap_err();
        assert!(matches!(err, ExecError::RuntimeSpawn { .. }));
    }
}

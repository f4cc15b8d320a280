//! `kilnctl run`: flag collection and exit-code mapping around `runner::run`.

use clap::Args;
use runner::error::EXIT_RUN_FAILURE;
use runner::{NamespaceFlag, RunRequest};
use std::path::PathBuf;
use tracing::debug;

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Record the command in the container's history
    #[arg(
        long,
        value_name = "BOOL",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true"
    )]
    pub add_history: Option<bool>,

    /// Add a capability (repeatable, comma-separated)
    #[arg(long, value_name = "CAP")]
    pub cap_add: Vec<String>,

    /// Drop a capability (repeatable, comma-separated)
    #[arg(long, value_name = "CAP")]
    pub cap_drop: Vec<String>,

    /// Directory relative volume sources resolve against (default: current directory)
    #[arg(long, value_name = "DIR")]
    pub contextdir: Option<PathBuf>,

    /// Set an environment variable, KEY=VALUE
    #[arg(short = 'e', long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    #[arg(long)]
    pub hostname: Option<String>,

    /// oci, rootless or chroot
    #[arg(long, value_name = "TYPE")]
    pub isolation: Option<String>,

    /// Path of the OCI runtime binary
    #[arg(long, value_name = "PATH")]
    pub runtime: Option<String>,

    /// Global flag passed to the runtime, without the leading dashes
    #[arg(long = "runtime-flag", value_name = "FLAG")]
    pub runtime_flags: Vec<String>,

    /// Do not use pivot_root to enter the rootfs
    #[arg(long)]
    pub no_pivot: bool,

    /// Allocate a pseudo-terminal (-t, or --terminal=false to refuse one)
    #[arg(
        short = 't',
        long,
        value_name = "BOOL",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true"
    )]
    pub terminal: Option<bool>,

    /// Bind mount, SOURCE:DEST[:OPTIONS]
    #[arg(short = 'v', long = "volume", value_name = "VOLUME")]
    pub volumes: Vec<String>,

    /// Structured mount, type=...,src=...,dst=...
    #[arg(long = "mount", value_name = "MOUNT")]
    pub mounts: Vec<String>,

    #[arg(long, value_name = "DIR")]
    pub workingdir: Option<String>,

    /// user[:group] to run as
    #[arg(short = 'u', long)]
    pub user: Option<String>,

    /// host, private, none or a namespace path
    #[arg(long, value_name = "MODE")]
    pub network: Vec<String>,

    /// Alias for --network
    #[arg(long, value_name = "MODE")]
    pub net: Vec<String>,

    #[arg(long, value_name = "MODE")]
    pub ipc: Vec<String>,

    #[arg(long, value_name = "MODE")]
    pub pid: Vec<String>,

    #[arg(long, value_name = "MODE")]
    pub uts: Vec<String>,

    #[arg(long, value_name = "MODE")]
    pub userns: Vec<String>,

    #[arg(long, value_name = "MODE")]
    pub cgroupns: Vec<String>,

    /// CONTAINER [--] COMMAND [ARGS...]
    #[arg(
        value_name = "ARGS",
        num_args = 0..,
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub args: Vec<String>,
}

impl RunArgs {
    fn namespace_flags(&self) -> Vec<NamespaceFlag> {
        let groups: [(&str, &Vec<String>); 7] = [
            ("network", &self.network),
            ("net", &self.net),
            ("ipc", &self.ipc),
            ("pid", &self.pid),
            ("uts", &self.uts),
            ("userns", &self.userns),
            ("cgroupns", &self.cgroupns),
        ];
        groups
            .into_iter()
            .flat_map(|(name, values)| values.iter().map(move |v| NamespaceFlag::new(name, v.as_str())))
            .collect()
    }

    pub fn into_request(self) -> RunRequest {
        let namespaces = self.namespace_flags();
        let context_dir = self
            .contextdir
            .or_else(|| std::env::current_dir().ok());
        RunRequest {
            args: self.args,
            isolation: self.isolation,
            namespaces,
            env: self.env,
            cap_add: self.cap_add,
            cap_drop: self.cap_drop,
            volumes: self.volumes,
            mounts: self.mounts,
            context_dir,
            runtime: self.runtime,
            runtime_flags: self.runtime_flags,
            hostname: self.hostname,
            working_dir: self.workingdir,
            user: self.user,
            terminal: self.terminal,
            no_pivot: self.no_pivot,
            add_history: self.add_history,
        }
    }
}

/// Runs the command and returns the process exit code to report.
pub fn execute(args: RunArgs) -> i32 {
    let (env, defaults) = match super::load_settings() {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            return EXIT_RUN_FAILURE;
        }
    };

    let request = args.into_request();
    match runner::run(&request, &env, &defaults) {
        Ok(entry) => {
            if let Some(entry) = entry {
                debug!(created_by = %entry.created_by, "history entry committed");
            }
            0
        }
        Err(err) => {
            eprintln!("Error: {}", err);
            err.exit_code()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        run: RunArgs,
    }

    fn parse(argv: &[&str]) -> RunArgs {
        TestCli::try_parse_from(std::iter::once("run").chain(argv.iter().copied()))
            .unwrap()
            .run
    }

    #[test]
    fn command_flags_pass_through_after_container() {
        let args = parse(&["--isolation", "chroot", "ctr", "ls", "-l", "--all"]);
        assert_eq!(args.isolation.as_deref(), Some("chroot"));
        assert_eq!(args.args, vec!["ctr", "ls", "-l", "--all"]);
    }

    #[test]
    fn separator_after_container_is_kept_for_splitting() {
        let args = parse(&["ctr", "--", "sh", "-c", "echo hi"]);
        assert_eq!(args.args, vec!["ctr", "--", "sh", "-c", "echo hi"]);
    }

    #[test]
    fn terminal_is_tri_state() {
        assert_eq!(parse(&["ctr", "sh"]).terminal, None);
        assert_eq!(parse(&["-t", "ctr", "sh"]).terminal, Some(true));
        assert_eq!(parse(&["--terminal=false", "ctr", "sh"]).terminal, Some(false));
        assert_eq!(parse(&["--add-history", "ctr", "sh"]).add_history, Some(true));
    }

    #[test]
    fn namespace_flags_keep_their_names() {
        let args = parse(&["--net", "host", "--network", "host", "--pid=private", "ctr", "sh"]);
        let flags = args.namespace_flags();
        assert_eq!(
            flags,
            vec![
                NamespaceFlag::new("network", "host"),
                NamespaceFlag::new("net", "host"),
                NamespaceFlag::new("pid", "private"),
            ]
        );
    }

    #[test]
    fn request_defaults_context_dir_to_cwd() {
        let request = parse(&["ctr", "sh"]).into_request();
        assert_eq!(request.context_dir, std::env::current_dir().ok());

        let request = parse(&["--contextdir", "/ctx", "ctr", "sh"]).into_request();
        assert_eq!(request.context_dir, Some(PathBuf::from("/ctx")));
    }
}

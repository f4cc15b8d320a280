//! Splits positional `run` arguments into a container reference and the
//! command to execute inside it.

use crate::error::RunError;

/// Token that may separate the container reference from its command.
pub const SEPARATOR: &str = "--";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub container: String,
    pub command: Vec<String>,
}

pub fn split_args(args: &[String]) -> Result<Invocation, RunError> {
    let Some((container, rest)) = args.split_first() else {
        return Err(RunError::invalid_arguments("container ID must be specified"));
    };
    if container.trim().is_empty() {
        return Err(RunError::invalid_arguments("container ID must be specified"));
    }

    let command = match rest.split_first() {
        Some((first, tail)) if first == SEPARATOR => tail,
        _ => rest,
    };
    if command.is_empty() {
        return Err(RunError::invalid_arguments("command must be specified"));
    }

    Ok(Invocation {
        container: container.clone(),
        command: command.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_args_need_a_container() {
        let err = split_args(&[]).unwrap_err();
        assert!(matches!(err, RunError::InvalidArguments { .. }));
    }

    #[test]
    fn separator_is_optional() {
        let with = split_args(&strings(&["ctr", "--", "ps", "-a"])).unwrap();
        let without = split_args(&strings(&["ctr", "ps", "-a"])).unwrap();
        assert_eq!(with, without);
        assert_eq!(with.container, "ctr");
        assert_eq!(with.command, strings(&["ps", "-a"]));
    }

    #[test]
    fn only_the_leading_separator_is_dropped() {
        let inv = split_args(&strings(&["ctr", "--", "sh", "--", "x"])).unwrap();
        assert_eq!(inv.command, strings(&["sh", "--", "x"]));
    }

    #[test]
    fn container_without_command_is_rejected() {
        for args in [strings(&["ctr"]), strings(&["ctr", "--"])] {
            let err = split_args(&args).unwrap_err();
            assert!(matches!(err, RunError::InvalidArguments { .. }));
            assert!(err.to_string().contains("command must be specified"));
        }
    }

    #[test]
    fn blank_container_is_rejected() {
        let err = split_args(&strings(&[" ", "ls"])).unwrap_err();
        assert!(matches!(err, RunError::InvalidArguments { .. }));
    }
}

//! Jailer (spec component C5): arranges that all TCP from the child
//! lands on the proxy and injects the environment the child needs to
//! trust the boundary CA. Three variants (Linux-privileged,
//! macOS-privileged, Unprivileged) share the same trait and the same
//! common-environment construction; platform specifics live in their
//! own submodules.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{BoundaryError, Result};
use crate::user::InvokingUser;

#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(target_os = "macos")]
pub mod macos;
pub mod unprivileged;

/// Everything the orchestrator needs to spawn the child: argv split into
/// program/args, a full environment, and the platform-specific extras
/// `apply_to_command` below needs to finish the job.
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    /// macOS: spawn the child under this restricted GID.
    pub run_as_gid: Option<u32>,
    /// Linux: unshare user+net+mount namespaces before exec, via
    /// `configure_child_namespace` installed as a `pre_exec` hook.
    pub unshare_namespaces: bool,
}

pub trait Jailer: Send + Sync {
    /// Pre-exec setup: install redirection (veth/iptables on Linux, PF
    /// anchor on macOS). A no-op for the unprivileged variant.
    fn prepare(&mut self) -> Result<()>;

    /// Build the argv/env/extras the orchestrator spawns the child with.
    fn build_child_command(&self, argv: &[String]) -> Result<CommandSpec>;

    /// Post-exec finishing touches once the child's PID is known. Linux
    /// only: moves the jail-side veth into the child's netns and brings
    /// its interface up. A no-op elsewhere.
    fn attach(&mut self, child_pid: u32) -> Result<()>;

    /// Idempotent teardown. Errors are logged and do not prevent other
    /// cleanup steps from running.
    fn close(&mut self) -> Result<()>;
}

/// Environment additions common to every variant (spec 4.5 "Common"):
/// CA trust material pointed at the boundary CA, plus the invoking
/// user's identity restored so `$HOME`/`$USER`/`$LOGNAME` are correct
/// even when boundary itself runs elevated.
pub fn common_env(
    ca_cert_path: &std::path::Path,
    config_dir: &std::path::Path,
    who: &InvokingUser,
) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars().collect();
    let cert = ca_cert_path.display().to_string();
    for key in [
        "SSL_CERT_FILE",
        "CURL_CA_BUNDLE",
        "GIT_SSL_CAINFO",
        "REQUESTS_CA_BUNDLE",
        "NODE_EXTRA_CA_CERTS",
    ] {
        env.insert(key.to_string(), cert.clone());
    }
    env.insert("SSL_CERT_DIR".to_string(), config_dir.display().to_string());
    env.insert("HOME".to_string(), who.home.clone());
    env.insert("USER".to_string(), who.user.clone());
    env.insert("LOGNAME".to_string(), who.logname.clone());
    env
}

pub(crate) fn split_argv(argv: &[String]) -> Result<(String, Vec<String>)> {
    let mut iter = argv.iter().cloned();
    let program = iter.next().ok_or_else(|| BoundaryError::InvalidSpec {
        spec: String::new(),
        reason: "no command given after --".into(),
    })?;
    Ok((program, iter.collect()))
}

/// Select the jailer variant: `--unprivileged` forces the env-only
/// fallback; otherwise the host OS decides. Any OS other than Linux or
/// macOS fails fast with `UnsupportedPlatform` (spec 4.5.4).
pub fn select(
    unprivileged_flag: bool,
    proxy_port: u16,
    ca_cert_path: PathBuf,
    config_dir: PathBuf,
    who: InvokingUser,
) -> Result<Box<dyn Jailer>> {
    if unprivileged_flag {
        // Spec 4.5.4/9: the unprivileged variant is only valid on Linux;
        // macOS (and anything else) must fail fast at startup rather than
        // silently run with no redirection at all.
        #[cfg(not(target_os = "linux"))]
        {
            return Err(BoundaryError::UnsupportedPlatform(format!(
                "--unprivileged is only supported on Linux, not {}",
                std::env::consts::OS
            )));
        }
        #[cfg(target_os = "linux")]
        {
            return Ok(Box::new(unprivileged::UnprivilegedJailer::new(
                proxy_port,
                ca_cert_path,
                config_dir,
                who,
            )));
        }
    }

    #[cfg(target_os = "linux")]
    {
        return Ok(Box::new(linux::LinuxJailer::new(
            proxy_port,
            ca_cert_path,
            config_dir,
            who,
        )));
    }

    #[cfg(target_os = "macos")]
    {
        return Ok(Box::new(macos::MacosJailer::new(
            proxy_port,
            ca_cert_path,
            config_dir,
            who,
        )));
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        Err(BoundaryError::UnsupportedPlatform(std::env::consts::OS.to_string()))
    }
}

#[cfg(all(test, target_os = "macos"))]
mod tests {
    use super::*;

    #[test]
    fn unprivileged_flag_is_rejected_on_macos() {
        let who = InvokingUser {
            uid: 501,
            gid: 20,
            home: "/Users/tester".into(),
            user: "tester".into(),
            logname: "tester".into(),
        };
        let result = select(true, 8080, "/tmp/ca.pem".into(), "/tmp/cfg".into(), who);
        assert!(matches!(result, Err(BoundaryError::UnsupportedPlatform(_))));
    }
}

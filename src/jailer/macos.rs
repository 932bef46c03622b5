//! macOS jailer (spec 4.5.2): a restricted group plus PF `rdr`/`pass`
//! rules under a named anchor redirect the child's outbound TCP to the
//! proxy. The child itself is spawned with its GID swapped to the
//! restricted group; everything else about its identity is unchanged.

use std::path::PathBuf;
use std::process::Command;

use tracing::warn;

use crate::error::{BoundaryError, Result};
use crate::user::InvokingUser;

use super::{common_env, split_argv, CommandSpec, Jailer};

const GROUP_NAME: &str = "_boundary_restricted";
const ANCHOR_NAME: &str = "boundary";

pub struct MacosJailer {
    proxy_port: u16,
    ca_cert_path: PathBuf,
    config_dir: PathBuf,
    who: InvokingUser,
    gid: Option<u32>,
    rules_path: Option<PathBuf>,
}

impl MacosJailer {
    pub fn new(proxy_port: u16, ca_cert_path: PathBuf, config_dir: PathBuf, who: InvokingUser) -> Self {
        Self {
            proxy_port,
            ca_cert_path,
            config_dir,
            who,
            gid: None,
            rules_path: None,
        }
    }
}

impl Jailer for MacosJailer {
    fn prepare(&mut self) -> Result<()> {
        let gid = ensure_restricted_group()?;
        self.gid = Some(gid);

        let default_iface = default_outbound_interface()?;
        let rules = format!(
            "rdr pass on lo0 inet proto tcp from any to any -> 127.0.0.1 port {port}\n\
             pass out route-to (lo0 127.0.0.1) inet proto tcp from any to any group {gid} keep state\n\
             pass out route-to ({iface} 127.0.0.1) inet proto tcp from any to any group {gid} keep state\n\
             pass on lo0 all\n",
            port = self.proxy_port,
            gid = gid,
            iface = default_iface,
        );

        let rules_path = self.config_dir.join("boundary.pf.rules");
        std::fs::write(&rules_path, &rules).map_err(|source| BoundaryError::JailerSystemError {
            step: "write PF anchor rules",
            source,
        })?;

        run("pfctl", &["-a", ANCHOR_NAME, "-f", rules_path.to_str().unwrap_or_default()])?;
        // Enabling PF can fail with "already enabled"; that is not a
        // setup failure.
        let _ = Command::new("pfctl").arg("-E").status();

        self.rules_path = Some(rules_path);
        Ok(())
    }

    fn build_child_command(&self, argv: &[String]) -> Result<CommandSpec> {
        let (program, args) = split_argv(argv)?;
        let env = common_env(&self.ca_cert_path, &self.config_dir, &self.who);
        Ok(CommandSpec {
            program,
            args,
            env,
            run_as_gid: self.gid,
            unshare_namespaces: false,
        })
    }

    fn attach(&mut self, _child_pid: u32) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Err(err) = Command::new("pfctl").args(["-a", ANCHOR_NAME, "-F", "all"]).status() {
            warn!(error = %err, "failed to flush PF anchor during cleanup (ignored, idempotent teardown)");
        }
        if let Some(path) = self.rules_path.take() {
            let _ = std::fs::remove_file(path);
        }
        Ok(())
    }
}

fn ensure_restricted_group() -> Result<u32> {
    let check = Command::new("dseditgroup")
        .args(["-o", "read", GROUP_NAME])
        .output()
        .map_err(|source| BoundaryError::JailerSystemError {
            step: "dseditgroup read",
            source,
        })?;

    if !check.status.success() {
        run(
            "dseditgroup",
            &["-o", "create", "-r", "boundary restricted egress group", GROUP_NAME],
        )?;
    }

    let describe = Command::new("dseditgroup")
        .args(["-o", "read", GROUP_NAME])
        .output()
        .map_err(|source| BoundaryError::JailerSystemError {
            step: "dseditgroup read (post-create)",
            source,
        })?;
    let text = String::from_utf8_lossy(&describe.stdout);
    text.lines()
        .find_map(|line| line.trim().strip_prefix("PrimaryGroupID:"))
        .map(|v| v.trim())
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| BoundaryError::JailerSystemError {
            step: "parse restricted group GID",
            source: std::io::Error::other("dseditgroup did not report a PrimaryGroupID"),
        })
}

fn default_outbound_interface() -> Result<String> {
    let output = Command::new("route")
        .args(["-n", "get", "default"])
        .output()
        .map_err(|source| BoundaryError::JailerSystemError {
            step: "route -n get default",
            source,
        })?;
    let text = String::from_utf8_lossy(&output.stdout);
    text.lines()
        .find_map(|line| line.trim().strip_prefix("interface:"))
        .map(|v| v.trim().to_string())
        .ok_or_else(|| BoundaryError::JailerSystemError {
            step: "determine default outbound interface",
            source: std::io::Error::other("route(8) did not report a default interface"),
        })
}

fn run(program: &str, args: &[&str]) -> Result<()> {
    let status = Command::new(program)
        .args(args)
        .status()
        .map_err(|source| BoundaryError::JailerSystemError {
            step: "spawn macOS network helper",
            source,
        })?;
    if !status.success() {
        return Err(BoundaryError::JailerSystemError {
            step: "macOS network helper",
            source: std::io::Error::other(format!("{program} {args:?} exited with {status}")),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_child_command_runs_with_restricted_gid_once_prepared() {
        let who = InvokingUser {
            uid: 501,
            gid: 20,
            home: "/Users/tester".into(),
            user: "tester".into(),
            logname: "tester".into(),
        };
        let mut jailer = MacosJailer::new(8080, "/tmp/ca.pem".into(), "/tmp/cfg".into(), who);
        jailer.gid = Some(4242);
        let spec = jailer
            .build_child_command(&["curl".into(), "https://example.com".into()])
            .unwrap();
        assert_eq!(spec.run_as_gid, Some(4242));
        assert!(!spec.unshare_namespaces);
    }
}

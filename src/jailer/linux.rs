//! Linux jailer (spec 4.5.1): a veth pair plus REDIRECT/MASQUERADE
//! iptables rules route the child's TCP onto the proxy, and the child
//! itself starts in a fresh user+network+mount namespace so only that
//! traffic is affected. iptables rule tracking and reverse-order
//! teardown follow the pack's own iptables-wrapper pattern; the
//! namespace/uid-map plumbing follows the `nix`-based unshare/setns
//! idiom used elsewhere in the pack for per-process network isolation.

use std::path::PathBuf;
use std::process::Command;

use nix::mount::{mount, MsFlags};
use nix::sched::{unshare, CloneFlags};
use rand::Rng;
use tracing::warn;

use crate::error::{BoundaryError, Result};
use crate::user::InvokingUser;

use super::{common_env, split_argv, CommandSpec, Jailer};

const SUBNET_HOST_IP: &str = "192.168.100.1";
const SUBNET_JAIL_IP: &str = "192.168.100.2";
const SUBNET_CIDR: &str = "192.168.100.0/24";
const SUBNET_PREFIX: &str = "24";
const RESOLVERS: &[&str] = &["8.8.8.8", "1.1.1.1", "9.9.9.9"];

#[derive(Clone)]
struct IptablesRule {
    table: &'static str,
    chain: &'static str,
    spec: String,
}

pub struct LinuxJailer {
    proxy_port: u16,
    ca_cert_path: PathBuf,
    config_dir: PathBuf,
    who: InvokingUser,
    veth_host: String,
    veth_jail: String,
    installed_rules: Vec<IptablesRule>,
    /// Set the moment `ip link add` for the veth pair succeeds, independent
    /// of whether later steps in `prepare()` go on to fail. `close()` uses
    /// this (not an overall "did prepare() return Ok" flag) to decide
    /// whether there is a veth to remove, so a partial `prepare()` failure
    /// still tears down whatever was actually created.
    veth_created: bool,
}

impl LinuxJailer {
    pub fn new(proxy_port: u16, ca_cert_path: PathBuf, config_dir: PathBuf, who: InvokingUser) -> Self {
        let id = unique_id();
        Self {
            proxy_port,
            ca_cert_path,
            config_dir,
            who,
            veth_host: format!("veth_h_{id}"),
            veth_jail: format!("veth_n_{id}"),
            installed_rules: Vec::new(),
            veth_created: false,
        }
    }

    fn install_iptables_rules(&mut self) -> Result<()> {
        let ipt = iptables::new(false).map_err(|source| iptables_err("init", source))?;

        let rules = [
            ("nat", "POSTROUTING", format!("-s {SUBNET_CIDR} -j MASQUERADE")),
            (
                "nat",
                "PREROUTING",
                format!(
                    "-i {} -p tcp -j REDIRECT --to-ports {}",
                    self.veth_host, self.proxy_port
                ),
            ),
            (
                "filter",
                "FORWARD",
                format!("-i {} -s {SUBNET_CIDR} -j ACCEPT", self.veth_host),
            ),
            (
                "filter",
                "FORWARD",
                format!("-o {} -d {SUBNET_CIDR} -j ACCEPT", self.veth_host),
            ),
        ];

        for (table, chain, spec) in rules {
            ipt.append(table, chain, &spec)
                .map_err(|source| iptables_err("append rule", source))?;
            self.installed_rules.push(IptablesRule { table, chain, spec });
        }
        Ok(())
    }
}

impl Jailer for LinuxJailer {
    fn prepare(&mut self) -> Result<()> {
        run_ip(&[
            "link", "add", &self.veth_host, "type", "veth", "peer", "name", &self.veth_jail,
        ])?;
        // The veth pair now exists on the host; record that immediately so
        // a failure in any step below still leaves `close()` able to find
        // and remove it.
        self.veth_created = true;
        run_ip(&["addr", "add", &format!("{SUBNET_HOST_IP}/{SUBNET_PREFIX}"), "dev", &self.veth_host])?;
        run_ip(&["link", "set", &self.veth_host, "up"])?;

        std::fs::write("/proc/sys/net/ipv4/ip_forward", b"1").map_err(|source| {
            BoundaryError::JailerSystemError {
                step: "enable ip_forward",
                source,
            }
        })?;

        self.install_iptables_rules()?;
        Ok(())
    }

    fn build_child_command(&self, argv: &[String]) -> Result<CommandSpec> {
        let (program, args) = split_argv(argv)?;
        let env = common_env(&self.ca_cert_path, &self.config_dir, &self.who);
        Ok(CommandSpec {
            program,
            args,
            env,
            run_as_gid: None,
            unshare_namespaces: true,
        })
    }

    fn attach(&mut self, child_pid: u32) -> Result<()> {
        run_ip(&["link", "set", &self.veth_jail, "netns", &child_pid.to_string()])?;
        let pid = child_pid.to_string();
        run_nsenter(&pid, &["ip", "link", "set", "lo", "up"])?;
        run_nsenter(
            &pid,
            &[
                "ip",
                "addr",
                "add",
                &format!("{SUBNET_JAIL_IP}/{SUBNET_PREFIX}"),
                "dev",
                &self.veth_jail,
            ],
        )?;
        run_nsenter(&pid, &["ip", "link", "set", &self.veth_jail, "up"])?;
        run_nsenter(&pid, &["ip", "route", "add", "default", "via", SUBNET_HOST_IP])?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        // Cleanup is driven by what was actually tracked as created, not by
        // whether `prepare()` as a whole returned `Ok`: a `prepare()` call
        // that failed partway through can still have left rules installed
        // and the veth pair on the host, and a repeat `close()` call must
        // be a no-op once both are already gone.
        if !self.installed_rules.is_empty() {
            match iptables::new(false) {
                Ok(ipt) => {
                    for rule in self.installed_rules.drain(..).rev() {
                        if let Err(err) = ipt.delete(rule.table, rule.chain, &rule.spec) {
                            warn!(
                                table = rule.table,
                                chain = rule.chain,
                                spec = %rule.spec,
                                error = %err,
                                "failed to remove iptables rule during cleanup (ignored, idempotent teardown)"
                            );
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, "iptables unavailable during jailer teardown");
                }
            }
        }
        if self.veth_created {
            let _ = Command::new("ip").args(["link", "delete", &self.veth_host]).status();
            self.veth_created = false;
        }
        Ok(())
    }
}

fn unique_id() -> String {
    let mut rng = rand::rng();
    let value: u32 = rng.random_range(0..0x1000_0000);
    format!("{value:07x}")
}

fn iptables_err(step: &'static str, source: Box<dyn std::error::Error>) -> BoundaryError {
    BoundaryError::JailerSystemError {
        step,
        source: std::io::Error::other(source.to_string()),
    }
}

fn run_ip(args: &[&str]) -> Result<()> {
    run("ip", args)
}

fn run_nsenter(pid: &str, args: &[&str]) -> Result<()> {
    let mut full = vec!["-t", pid, "-n", "--"];
    full.extend_from_slice(args);
    run("nsenter", &full)
}

fn run(program: &str, args: &[&str]) -> Result<()> {
    let status = Command::new(program)
        .args(args)
        .status()
        .map_err(|source| BoundaryError::JailerSystemError {
            step: "spawn network helper",
            source,
        })?;
    if !status.success() {
        return Err(BoundaryError::JailerSystemError {
            step: "network helper",
            source: std::io::Error::other(format!("{program} {args:?} exited with {status}")),
        });
    }
    Ok(())
}

/// Installed as a `pre_exec` hook by the orchestrator when
/// `CommandSpec::unshare_namespaces` is set. Runs in the freshly forked
/// child, before exec: unshares into a new user, network, and mount
/// namespace, maps the invoking identity 1:1 into the new user
/// namespace (so the child is still "itself", just isolated), and
/// bind-mounts a private `resolv.conf` pointing at public resolvers.
/// The jail-side veth is not present yet at this point; it is moved in
/// by `attach` once the parent learns this process's PID.
pub fn configure_child_namespace(uid: u32, gid: u32) -> std::io::Result<()> {
    unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNET | CloneFlags::CLONE_NEWNS)
        .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))?;

    // Owning the new user namespace (as its creator) grants full
    // capabilities within it, including CAP_NET_ADMIN, without an
    // explicit prctl/capset dance.
    std::fs::write("/proc/self/setgroups", b"deny")?;
    std::fs::write("/proc/self/uid_map", format!("{uid} {uid} 1").as_bytes())?;
    std::fs::write("/proc/self/gid_map", format!("{gid} {gid} 1").as_bytes())?;

    mount_private_resolv_conf()
}

fn mount_private_resolv_conf() -> std::io::Result<()> {
    let pid = std::process::id();
    let stub_path = std::env::temp_dir().join(format!("boundary-resolv-{pid}.conf"));
    let mut contents = String::new();
    for resolver in RESOLVERS {
        contents.push_str(&format!("nameserver {resolver}\n"));
    }
    contents.push_str("options timeout:2 attempts:2\n");
    std::fs::write(&stub_path, contents)?;

    mount(
        Some(stub_path.as_path()),
        "/etc/resolv.conf",
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn veth_names_are_unique_and_within_interface_name_limits() {
        let who = InvokingUser {
            uid: 1000,
            gid: 1000,
            home: "/home/tester".into(),
            user: "tester".into(),
            logname: "tester".into(),
        };
        let a = LinuxJailer::new(8080, "/tmp/ca.pem".into(), "/tmp/cfg".into(), who.clone());
        let b = LinuxJailer::new(8080, "/tmp/ca.pem".into(), "/tmp/cfg".into(), who);
        assert_ne!(a.veth_host, b.veth_host);
        assert!(a.veth_host.len() <= 15, "interface names must fit IFNAMSIZ");
        assert!(a.veth_jail.len() <= 15);
        assert!(a.veth_host.starts_with("veth_h_"));
        assert!(a.veth_jail.starts_with("veth_n_"));
    }

    #[test]
    fn close_tears_down_partial_state_and_is_idempotent() {
        // Simulate a `prepare()` that created the veth and one iptables
        // rule, then failed before the rest of `install_iptables_rules`
        // ran; `close()` must still attempt to remove both, then leave
        // the jailer in a state where a second `close()` is a no-op.
        let who = InvokingUser {
            uid: 1000,
            gid: 1000,
            home: "/home/tester".into(),
            user: "tester".into(),
            logname: "tester".into(),
        };
        let mut jailer = LinuxJailer::new(8080, "/tmp/ca.pem".into(), "/tmp/cfg".into(), who);
        jailer.veth_created = true;
        jailer.installed_rules.push(IptablesRule {
            table: "nat",
            chain: "POSTROUTING",
            spec: "-s 192.168.100.0/24 -j MASQUERADE".into(),
        });

        jailer.close().unwrap();
        assert!(jailer.installed_rules.is_empty());
        assert!(!jailer.veth_created);

        jailer.close().unwrap();
        assert!(jailer.installed_rules.is_empty());
        assert!(!jailer.veth_created);
    }

    #[test]
    fn build_child_command_requests_namespace_isolation() {
        let who = InvokingUser {
            uid: 1000,
            gid: 1000,
            home: "/home/tester".into(),
            user: "tester".into(),
            logname: "tester".into(),
        };
        let jailer = LinuxJailer::new(8080, "/tmp/ca.pem".into(), "/tmp/cfg".into(), who);
        let spec = jailer.build_child_command(&["echo".into(), "hi".into()]).unwrap();
        assert!(spec.unshare_namespaces);
        assert!(spec.run_as_gid.is_none());
    }
}

//! Orchestrator (spec component C6): wires C1-C5 together, drives the
//! child's lifecycle, and owns shutdown sequencing. This is the one
//! component with no direct teacher analogue (the teacher is a bare
//! proxy binary with no child-process supervision), so its shape is
//! grounded in spec section 4.6's sequence description directly, using
//! `tokio::process` and `tokio::signal` the way the rest of this crate
//! already uses the rest of `tokio`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::os::unix::process::ExitStatusExt;
use std::sync::Arc;

use tokio::process::Command as TokioCommand;
use tracing::{info, warn};

use crate::audit::{default_jsonl_path, Auditor, JsonlFileSink, StderrSink};
use crate::ca::CertificateAuthority;
use crate::cli::Cli;
use crate::error::{BoundaryError, Result};
use crate::jailer::{self, Jailer};
use crate::proxy::ProxyServer;
use crate::rules::RuleSet;
use crate::user::InvokingUser;

const DEFAULT_PROXY_PORT: u16 = 8080;

pub struct Orchestrator {
    cli: Cli,
}

impl Orchestrator {
    pub fn new(cli: Cli) -> Self {
        Self { cli }
    }

    /// Runs the full lifecycle described in spec 4.6 and returns the
    /// child's exit code. Startup failures (before the child spawns)
    /// are returned as errors so `main` can exit non-zero without a
    /// bogus exit code standing in for them.
    pub async fn run(self) -> Result<i32> {
        let who = InvokingUser::resolve();

        if self.cli.allow.is_empty() {
            warn!("no --allow rules given; every request will be denied");
        }
        let rules = Arc::new(RuleSet::from_specs(&self.cli.allow)?);

        // config_dir is derived from the invoking user, not the current
        // process's own environment. Under `sudo` (the normal way to get
        // the Linux jailer's CAP_NET_ADMIN) the process's own $HOME is
        // root's, so resolving a config directory from it would land
        // under `/root`, somewhere the real invoking user can't even
        // traverse into.
        let config_dir = std::path::PathBuf::from(&who.home).join(".config").join("boundary");

        let auditor = Arc::new(
            Auditor::new()
                .with_sink(Box::new(StderrSink))
                .with_sink(Box::new(JsonlFileSink::new(default_jsonl_path(&config_dir)))),
        );

        let ca_setup = CertificateAuthority::setup(&config_dir, &who)?;

        let listen_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), DEFAULT_PROXY_PORT);
        let proxy = Arc::new(ProxyServer::new(
            listen_addr,
            rules,
            auditor,
            ca_setup.tls_config.clone(),
        ));

        let mut jailer = jailer::select(
            self.cli.unprivileged,
            DEFAULT_PROXY_PORT,
            ca_setup.ca_cert_path.clone(),
            config_dir.clone(),
            who,
        )?;

        proxy.start().await?;
        info!(port = DEFAULT_PROXY_PORT, "proxy listening");

        let outcome = self.spawn_and_wait(jailer.as_mut()).await;

        if let Err(err) = jailer.close() {
            warn!(error = %err, "jailer teardown reported an error (ignored)");
        }
        proxy.stop().await;

        outcome
    }

    async fn spawn_and_wait(&self, jailer: &mut dyn Jailer) -> Result<i32> {
        jailer.prepare()?;

        let spec = jailer.build_child_command(&self.cli.command)?;
        let mut cmd = TokioCommand::new(&spec.program);
        cmd.args(&spec.args);
        cmd.env_clear();
        cmd.envs(&spec.env);
        cmd.kill_on_drop(true);

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            if let Some(gid) = spec.run_as_gid {
                cmd.gid(gid);
            }
            if spec.unshare_namespaces {
                let who = InvokingUser::resolve();
                let uid = who.uid;
                let gid = who.gid;
                #[cfg(target_os = "linux")]
                unsafe {
                    cmd.pre_exec(move || crate::jailer::linux::configure_child_namespace(uid, gid));
                }
            }
        }

        let mut child = cmd.spawn().map_err(|source| BoundaryError::JailerSystemError {
            step: "spawn child",
            source,
        })?;

        if let Some(pid) = child.id() {
            jailer.attach(pid)?;
        }

        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .map_err(|source| BoundaryError::JailerSystemError {
                step: "install SIGINT handler",
                source,
            })?;
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .map_err(|source| BoundaryError::JailerSystemError {
                step: "install SIGTERM handler",
                source,
            })?;

        let mut signaled_once = false;
        loop {
            tokio::select! {
                status = child.wait() => {
                    let status = status.map_err(|source| BoundaryError::JailerSystemError {
                        step: "wait for child",
                        source,
                    })?;
                    return Ok(exit_code(status));
                }
                _ = sigint.recv() => {
                    if !forward_signal(&mut child, signaled_once) { return Ok(130); }
                    signaled_once = true;
                }
                _ = sigterm.recv() => {
                    if !forward_signal(&mut child, signaled_once) { return Ok(143); }
                    signaled_once = true;
                }
            }
        }
    }
}

/// Forwards a signal to the child on the first occurrence (graceful);
/// a second signal escalates to an immediate kill and tells the caller
/// to stop waiting. Returns `true` to keep waiting on `child.wait()`.
fn forward_signal(child: &mut tokio::process::Child, already_signaled: bool) -> bool {
    if already_signaled {
        warn!("second signal received; killing child immediately");
        let _ = child.start_kill();
        return false;
    }
    if let Some(pid) = child.id() {
        // SAFETY: pid is a valid process id owned by this `child`;
        // SIGTERM is the conventional graceful-shutdown request.
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
    true
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

//! Unprivileged jailer (spec 4.5.3): no system mutation. The child gets
//! `HTTP_PROXY`/`HTTPS_PROXY` pointed at the proxy port and is trusted
//! to honor them; anything that ignores the proxy environment bypasses
//! boundary entirely. This is the fallback used when `--unprivileged` is
//! passed or (per 4.5.4) forced on non-Linux/macOS hosts elsewhere in
//! the call chain before `UnsupportedPlatform` would otherwise fire.

use std::path::PathBuf;

use crate::error::Result;
use crate::user::InvokingUser;

use super::{common_env, split_argv, CommandSpec, Jailer};

pub struct UnprivilegedJailer {
    proxy_port: u16,
    ca_cert_path: PathBuf,
    config_dir: PathBuf,
    who: InvokingUser,
}

impl UnprivilegedJailer {
    pub fn new(proxy_port: u16, ca_cert_path: PathBuf, config_dir: PathBuf, who: InvokingUser) -> Self {
        Self {
            proxy_port,
            ca_cert_path,
            config_dir,
            who,
        }
    }
}

impl Jailer for UnprivilegedJailer {
    fn prepare(&mut self) -> Result<()> {
        Ok(())
    }

    fn build_child_command(&self, argv: &[String]) -> Result<CommandSpec> {
        let (program, args) = split_argv(argv)?;
        let mut env = common_env(&self.ca_cert_path, &self.config_dir, &self.who);
        let proxy_url = format!("http://127.0.0.1:{}", self.proxy_port);
        for key in ["HTTP_PROXY", "HTTPS_PROXY", "http_proxy", "https_proxy"] {
            env.insert(key.to_string(), proxy_url.clone());
        }
        Ok(CommandSpec {
            program,
            args,
            env,
            run_as_gid: None,
            unshare_namespaces: false,
        })
    }

    fn attach(&mut self, _child_pid: u32) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injects_proxy_env_and_preserves_invoking_identity() {
        let who = InvokingUser {
            uid: 1000,
            gid: 1000,
            home: "/home/tester".into(),
            user: "tester".into(),
            logname: "tester".into(),
        };
        let jailer = UnprivilegedJailer::new(8080, "/tmp/ca-cert.pem".into(), "/tmp/cfg".into(), who);
        let spec = jailer
            .build_child_command(&["curl".into(), "-s".into(), "http://example.com".into()])
            .unwrap();
        assert_eq!(spec.program, "curl");
        assert_eq!(spec.args, vec!["-s", "http://example.com"]);
        assert_eq!(spec.env.get("HTTPS_PROXY").unwrap(), "http://127.0.0.1:8080");
        assert_eq!(spec.env.get("HOME").unwrap(), "/home/tester");
        assert!(spec.run_as_gid.is_none());
    }
}

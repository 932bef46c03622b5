//! Resolution of "the invoking user", the identity CA material and child
//! environment variables must be attributed to even when boundary itself
//! runs with elevated privileges (root, via sudo, or ambient capabilities).

use std::ffi::CStr;

/// Snapshot of the user boundary was invoked as, independent of whatever
/// privilege the current process holds.
#[derive(Debug, Clone)]
pub struct InvokingUser {
    pub uid: u32,
    pub gid: u32,
    pub home: String,
    pub user: String,
    pub logname: String,
}

impl InvokingUser {
    /// Prefer `SUDO_UID`/`SUDO_GID`/`SUDO_USER` (set by `sudo`) over the
    /// current effective identity, so CA material ends up owned by the
    /// person who ran `boundary`, not by root.
    pub fn resolve() -> Self {
        if let (Some(uid), Some(gid)) = (
            std::env::var("SUDO_UID").ok().and_then(|v| v.parse().ok()),
            std::env::var("SUDO_GID").ok().and_then(|v| v.parse().ok()),
        ) {
            let user = std::env::var("SUDO_USER").unwrap_or_default();
            let home = lookup_home(uid).unwrap_or_else(|| format!("/home/{user}"));
            return Self {
                uid,
                gid,
                home,
                user: user.clone(),
                logname: user,
            };
        }

        // SAFETY: getuid/getgid take no arguments and cannot fail.
        let uid = unsafe { libc::getuid() };
        let gid = unsafe { libc::getgid() };
        let (user, home) = lookup_passwd(uid).unwrap_or_else(|| ("root".to_string(), "/root".to_string()));
        Self {
            uid,
            gid,
            home,
            logname: user.clone(),
            user,
        }
    }
}

fn lookup_home(uid: u32) -> Option<String> {
    lookup_passwd(uid).map(|(_, home)| home)
}

fn lookup_passwd(uid: u32) -> Option<(String, String)> {
    const BUF_LEN: usize = 4096;
    let mut buf = vec![0_i8; BUF_LEN];
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();

    // SAFETY: buf stays alive for the duration of the call; pwd and
    // result are valid output pointers sized per getpwuid_r's contract.
    let rc = unsafe {
        libc::getpwuid_r(
            uid,
            &mut pwd,
            buf.as_mut_ptr(),
            buf.len(),
            &mut result,
        )
    };
    if rc != 0 || result.is_null() {
        return None;
    }
    // SAFETY: getpwuid_r populated pwd.pw_name / pw_dir as valid
    // NUL-terminated C strings on success.
    let name = unsafe { CStr::from_ptr(pwd.pw_name) }
        .to_string_lossy()
        .into_owned();
    let home = unsafe { CStr::from_ptr(pwd.pw_dir) }
        .to_string_lossy()
        .into_owned();
    Some((name, home))
}

/// chown a path to the invoking user, ignoring failures when the process
/// lacks permission to do so (e.g. running fully unprivileged already).
pub fn chown_to_invoking_user(path: &std::path::Path, who: &InvokingUser) {
    let Ok(c_path) = std::ffi::CString::new(path.as_os_str().as_encoded_bytes()) else {
        return;
    };
    // SAFETY: c_path is a valid NUL-terminated string for the lifetime of
    // the call; a failing chown is reported via errno and ignored here.
    unsafe {
        libc::chown(c_path.as_ptr(), who.uid, who.gid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_never_panics() {
        let who = InvokingUser::resolve();
        assert!(!who.home.is_empty());
    }
}

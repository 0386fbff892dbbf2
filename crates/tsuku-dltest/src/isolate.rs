//! Best-effort confinement applied before anything is loaded.
//!
//! Any step may fail on a given host. Loading goes ahead regardless.

/// Disable core dumps, cap CPU time, and on Linux drop the ability to gain
/// privileges and try to leave the network. With `verbose`, a missing
/// network sandbox is reported on stderr.
pub(crate) fn apply(cpu_limit_secs: Option<u64>, verbose: bool) {
    set_limit(Limit::Core, 0);
    if let Some(secs) = cpu_limit_secs {
        set_limit(Limit::Cpu, secs);
    }

    #[cfg(target_os = "linux")]
    {
        no_new_privs();
        if let Some(note) = sandbox_note(verbose, &unshare_network()) {
            eprintln!("{note}");
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = verbose;
}

/// The stderr line for a failed best-effort step, if it should be shown.
#[cfg(any(target_os = "linux", test))]
fn sandbox_note(verbose: bool, result: &std::io::Result<()>) -> Option<String> {
    match result {
        Err(e) if verbose => Some(format!(
            "tsuku-dltest: network isolation unavailable (unshare: {e})"
        )),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy)]
enum Limit {
    Core,
    Cpu,
}

fn set_limit(limit: Limit, value: u64) {
    let value = libc::rlim_t::from(u32::try_from(value).unwrap_or(u32::MAX));
    let rlim = libc::rlimit {
        rlim_cur: value,
        rlim_max: value,
    };

    // SAFETY: `rlim` is a valid, initialized rlimit that setrlimit(2) only
    // reads.
    #[allow(unsafe_code)]
    let rc = unsafe {
        match limit {
            Limit::Core => libc::setrlimit(libc::RLIMIT_CORE, &raw const rlim),
            Limit::Cpu => libc::setrlimit(libc::RLIMIT_CPU, &raw const rlim),
        }
    };
    if rc != 0 {
        eprintln!(
            "tsuku-dltest: setrlimit({limit:?}) failed: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(target_os = "linux")]
fn no_new_privs() {
    let on: libc::c_ulong = 1;
    let unused: libc::c_ulong = 0;
    // SAFETY: PR_SET_NO_NEW_PRIVS takes integer arguments only.
    #[allow(unsafe_code)]
    let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, on, unused, unused, unused) };
    if rc != 0 {
        eprintln!(
            "tsuku-dltest: PR_SET_NO_NEW_PRIVS failed: {}",
            std::io::Error::last_os_error()
        );
    }
}

/// A fresh user namespace makes the network namespace unprivileged to
/// create. The process is single-threaded here, which unshare requires.
/// Commonly refused inside containers.
#[cfg(target_os = "linux")]
fn unshare_network() -> std::io::Result<()> {
    // SAFETY: unshare(2) takes flags only and affects this process alone.
    #[allow(unsafe_code)]
    let rc = unsafe { libc::unshare(libc::CLONE_NEWUSER | libc::CLONE_NEWNET) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};

    #[test]
    fn unshare_failure_is_reported_only_when_verbose() {
        let refused = || Err(Error::new(ErrorKind::PermissionDenied, "operation not permitted"));
        let note = sandbox_note(true, &refused()).unwrap();
        assert!(note.contains("network isolation unavailable"), "{note}");
        assert!(note.contains("operation not permitted"));
        assert_eq!(sandbox_note(false, &refused()), None);
        assert_eq!(sandbox_note(true, &Ok(())), None);
    }
}

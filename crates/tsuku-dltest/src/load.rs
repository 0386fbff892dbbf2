//! The actual `dlopen` calls.

use std::ffi::{CStr, CString, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use tsuku_schema::dltest::{LoadOutcome, LoadResult, LoadTarget, TargetKind};

use crate::classify::Classifier;

const FLAGS: libc::c_int = libc::RTLD_NOW | libc::RTLD_LOCAL;

/// Load one target. Never panics on loader failure.
pub(crate) fn load_target(target: &LoadTarget, classifier: &Classifier) -> LoadResult {
    let outcome = match target.kind {
        TargetKind::Library => open(target.path.as_os_str(), classifier),
        TargetKind::Executable => load_executable(target, classifier),
    };
    LoadResult {
        path: target.path.clone(),
        outcome,
    }
}

/// An executable is never run. Its dependencies are loaded in declaration
/// order and the first failure is reported.
fn load_executable(target: &LoadTarget, classifier: &Classifier) -> LoadOutcome {
    if let Err(outcome) = check_executable(&target.path) {
        return outcome;
    }
    for dep in &target.dependencies {
        let outcome = open(OsStr::new(dep), classifier);
        if !outcome.is_loaded() {
            return outcome;
        }
    }
    LoadOutcome::Loaded
}

fn check_executable(path: &Path) -> Result<(), LoadOutcome> {
    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| LoadOutcome::Failed {
        detail: format!("{}: path contains a NUL byte", path.display()),
    })?;

    // SAFETY: `c_path` is a valid NUL-terminated string that outlives the
    // call; access(2) only reads it.
    #[allow(unsafe_code)]
    let rc = unsafe { libc::access(c_path.as_ptr(), libc::X_OK) };
    if rc == 0 {
        return Ok(());
    }

    let err = std::io::Error::last_os_error();
    let detail = format!("{}: {err}", path.display());
    Err(match err.kind() {
        std::io::ErrorKind::PermissionDenied => LoadOutcome::PermissionDenied { detail },
        _ => LoadOutcome::Failed { detail },
    })
}

fn open(name: &OsStr, classifier: &Classifier) -> LoadOutcome {
    let Ok(c_name) = CString::new(name.as_bytes()) else {
        return LoadOutcome::Failed {
            detail: format!("{}: name contains a NUL byte", name.to_string_lossy()),
        };
    };

    // SAFETY: `c_name` is a valid NUL-terminated string. Loading runs the
    // library's initializers; containing their effects is the reason this
    // process exists.
    #[allow(unsafe_code)]
    let handle = unsafe { libc::dlopen(c_name.as_ptr(), FLAGS) };
    if handle.is_null() {
        return classifier.classify(&last_error());
    }
    // Handles stay open until the process exits.
    LoadOutcome::Loaded
}

fn last_error() -> String {
    // SAFETY: dlerror returns NULL or a NUL-terminated string that stays
    // valid until the next dl* call on this thread. It is copied before
    // returning.
    #[allow(unsafe_code)]
    unsafe {
        let msg = libc::dlerror();
        if msg.is_null() {
            return "unknown loader error".to_string();
        }
        CStr::from_ptr(msg).to_string_lossy().into_owned()
    }
}

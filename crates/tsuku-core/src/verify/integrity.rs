//! Tier 4: content checksums against the install-time baseline.

use tsuku_schema::Sha256Digest;

use super::report::{Finding, FindingKind, Tier, TierResult};
use crate::state::InstalledArtifact;

/// Recompute and compare every recorded checksum of `artifact`.
///
/// With `skip_integrity`, mismatches are reported as warnings.
pub fn check(artifact: &InstalledArtifact, skip_integrity: bool) -> TierResult {
    let remediation = format!(
        "Run 'tsuku install {} --reinstall' to restore original.",
        artifact.name()
    );
    let mut findings = Vec::new();
    let mut checked = 0usize;

    for meta in artifact.files() {
        let Some(expected) = &meta.checksum else {
            continue;
        };
        checked += 1;
        let name = meta.display_name();
        let path = artifact.file_path(meta);

        let message = match Sha256Digest::compute_file(&path) {
            Ok(got) if expected.matches(&got) => {
                tracing::debug!(file = %path.display(), "checksum ok");
                continue;
            }
            Ok(got) => format!(
                "Integrity check failed: {name} checksum mismatch\nExpected: {expected}\nGot: {got}"
            ),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                format!("Integrity check failed: {name} missing")
            }
            Err(e) => format!("Integrity check failed: {name} unreadable: {e}"),
        };

        let finding = Finding::new(FindingKind::IntegrityMismatch, message)
            .with_file(&meta.path)
            .with_remediation(remediation.clone());
        findings.push(if skip_integrity {
            finding.downgraded()
        } else {
            finding
        });
    }

    if checked == 0 {
        findings.push(Finding::new(
            FindingKind::IntegritySkipped,
            "Integrity check skipped: no checksums recorded at install time",
        ));
    }

    TierResult::from_findings(Tier::Integrity, findings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{FixtureFile, InstallFixture};
    use crate::paths::TsukuHome;
    use crate::state::InstallState;
    use crate::verify::report::{Severity, TierStatus};
    use tsuku_schema::{Arch, LibcFlavor, Os, Platform};

    fn linux() -> Platform {
        Platform::new(Os::Linux, Arch::X86_64, LibcFlavor::Glibc)
    }

    fn load(dir: &std::path::Path) -> InstalledArtifact {
        InstallState::load(&TsukuHome::new(dir))
            .find("libfoo", None)
            .cloned()
            .unwrap()
    }

    #[test]
    fn unmodified_files_pass() {
        let dir = tempfile::tempdir().unwrap();
        InstallFixture::library("libfoo", "1.0.0", linux())
            .file(FixtureFile::new("lib/libfoo.so.1", b"original".to_vec()).soname("libfoo.so.1"))
            .write(dir.path())
            .unwrap();
        let result = check(&load(dir.path()), false);
        assert_eq!(result.status, TierStatus::Passed);
    }

    #[test]
    fn overwritten_file_reports_both_digests() {
        let dir = tempfile::tempdir().unwrap();
        let install = InstallFixture::library("libfoo", "1.0.0", linux())
            .file(
                FixtureFile::new("lib/libfoo.so.1", b"original".to_vec())
                    .soname("libfoo.so.1")
                    .checksum("abc123"),
            )
            .write(dir.path())
            .unwrap();
        std::fs::write(install.join("lib/libfoo.so.1"), b"tampered").unwrap();

        let result = check(&load(dir.path()), false);
        assert!(result.is_fatal());
        let got = Sha256Digest::compute(b"tampered");
        assert_eq!(
            result.findings[0].message,
            format!(
                "Integrity check failed: libfoo.so.1 checksum mismatch\nExpected: abc123\nGot: {got}"
            )
        );
        assert_eq!(
            result.findings[0].remediation.as_deref(),
            Some("Run 'tsuku install libfoo --reinstall' to restore original.")
        );
    }

    #[test]
    fn single_byte_flip_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let content = vec![0x5a; 200_000];
        let install = InstallFixture::library("libfoo", "1.0.0", linux())
            .file(FixtureFile::new("lib/libfoo.so.1", content.clone()))
            .write(dir.path())
            .unwrap();
        let mut flipped = content;
        flipped[123_456] ^= 1;
        std::fs::write(install.join("lib/libfoo.so.1"), flipped).unwrap();

        assert!(check(&load(dir.path()), false).is_fatal());
    }

    #[test]
    fn override_downgrades_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let install = InstallFixture::library("libfoo", "1.0.0", linux())
            .file(FixtureFile::new("lib/libfoo.so.1", b"a".to_vec()))
            .write(dir.path())
            .unwrap();
        std::fs::write(install.join("lib/libfoo.so.1"), b"b").unwrap();

        let result = check(&load(dir.path()), true);
        assert_eq!(result.status, TierStatus::Warning);
        assert_eq!(result.findings[0].kind, FindingKind::IntegrityMismatch);
        assert_eq!(result.findings[0].severity, Severity::Warning);
    }

    #[test]
    fn missing_file_and_uppercase_hex() {
        let dir = tempfile::tempdir().unwrap();
        let upper = Sha256Digest::compute(b"keep").as_str().to_uppercase();
        let install = InstallFixture::library("libfoo", "1.0.0", linux())
            .file(FixtureFile::new("lib/keep.so", b"keep".to_vec()).checksum(&upper))
            .file(FixtureFile::new("lib/gone.so", b"gone".to_vec()))
            .write(dir.path())
            .unwrap();
        std::fs::remove_file(install.join("lib/gone.so")).unwrap();

        let result = check(&load(dir.path()), false);
        assert_eq!(result.findings.len(), 1);
        assert_eq!(result.findings[0].message, "Integrity check failed: gone.so missing");
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_hash_their_target() {
        let dir = tempfile::tempdir().unwrap();
        let install = InstallFixture::library("libfoo", "1.0.0", linux())
            .file(FixtureFile::new("lib/libfoo.so.1.2", b"real".to_vec()))
            .file(FixtureFile::new("lib/libfoo.so.1", b"real".to_vec()))
            .write(dir.path())
            .unwrap();
        let link = install.join("lib/libfoo.so.1");
        std::fs::remove_file(&link).unwrap();
        std::os::unix::fs::symlink("libfoo.so.1.2", &link).unwrap();

        assert_eq!(check(&load(dir.path()), false).status, TierStatus::Passed);
    }

    #[test]
    fn no_checksums_is_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        InstallFixture::library("libfoo", "1.0.0", linux())
            .file(FixtureFile::new("lib/libfoo.so.1", b"x".to_vec()).no_checksum())
            .write(dir.path())
            .unwrap();
        let result = check(&load(dir.path()), false);
        assert_eq!(result.status, TierStatus::Warning);
        assert_eq!(result.findings[0].kind, FindingKind::IntegritySkipped);
    }
}

//! Exit codes and output of the `tsuku` binary against synthetic installs.
#![cfg(target_os = "linux")]

use std::path::Path;
use std::process::{Command, Output};
use tsuku_core::fixtures::{ElfBuilder, FixtureFile, InstallFixture};
use tsuku_schema::Arch;

fn library(name: &str, file: FixtureFile) -> InstallFixture {
    InstallFixture::library(name, "1.0.0", tsuku_core::host::detect()).file(file)
}

fn shared_object(soname: &str) -> ElfBuilder {
    ElfBuilder::shared_object(Arch::current()).soname(soname)
}

fn tsuku(home: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_tsuku"))
        .arg("--home")
        .arg(home)
        .args(args)
        .env_remove("TSUKU_HOME")
        .env_remove("TSUKU_VERIFY_WORKERS")
        .env_remove("TSUKU_DLTEST")
        .env("NO_COLOR", "1")
        .output()
        .unwrap()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn clean_install_exits_zero() {
    let home = tempfile::tempdir().unwrap();
    library(
        "libfoo",
        FixtureFile::new("lib/libfoo.so.1", shared_object("libfoo.so.1").build())
            .soname("libfoo.so.1"),
    )
    .write(home.path())
    .unwrap();

    let out = tsuku(home.path(), &["verify", "libfoo", "--skip-dlopen"]);
    assert_eq!(out.status.code(), Some(0), "{}", stdout(&out));
    assert!(stdout(&out).contains("libfoo@1.0.0 passed"));
    assert!(stdout(&out).contains("1 artifact: 1 passed, 0 with warnings, 0 failed"));
}

#[test]
fn tampered_install_exits_one() {
    let home = tempfile::tempdir().unwrap();
    library(
        "libfoo",
        FixtureFile::new("lib/libfoo.so.1", shared_object("libfoo.so.1").build())
            .soname("libfoo.so.1")
            .checksum("abc123"),
    )
    .write(home.path())
    .unwrap();

    let out = tsuku(home.path(), &["verify", "libfoo@1.0.0", "--skip-dlopen"]);
    assert_eq!(out.status.code(), Some(1));
    let text = stdout(&out);
    assert!(text.contains("Integrity check failed: libfoo.so.1 checksum mismatch"), "{text}");
    assert!(text.contains("hint: Run 'tsuku install libfoo --reinstall' to restore original."));
}

#[test]
fn skip_integrity_downgrades_to_warning() {
    let home = tempfile::tempdir().unwrap();
    library(
        "libfoo",
        FixtureFile::new("lib/libfoo.so.1", shared_object("libfoo.so.1").build())
            .soname("libfoo.so.1")
            .checksum("abc123"),
    )
    .write(home.path())
    .unwrap();

    let out = tsuku(
        home.path(),
        &["verify", "libfoo", "--skip-dlopen", "--skip-integrity"],
    );
    assert_eq!(out.status.code(), Some(0));
    assert!(stdout(&out).contains("libfoo@1.0.0 passed with warnings"));
}

#[test]
fn warnings_do_not_change_exit_code() {
    let home = tempfile::tempdir().unwrap();
    library(
        "libfoo",
        FixtureFile::new(
            "lib/libfoo.so.1",
            shared_object("libfoo.so.1").needed("libweird.so.3").build(),
        )
        .soname("libfoo.so.1")
        .unknown_dep("libweird.so.3"),
    )
    .write(home.path())
    .unwrap();

    let out = tsuku(home.path(), &["verify", "libfoo", "--skip-dlopen"]);
    assert_eq!(out.status.code(), Some(0));
    assert!(stdout(&out).contains("libweird.so.3"));
}

#[test]
fn unknown_artifact_is_an_error() {
    let home = tempfile::tempdir().unwrap();
    let out = tsuku(home.path(), &["verify", "nope", "--skip-dlopen"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).contains("nope is not installed"));
}

#[test]
fn missing_arguments_are_usage_errors() {
    let home = tempfile::tempdir().unwrap();
    assert_eq!(tsuku(home.path(), &["verify"]).status.code(), Some(2));
    assert_eq!(
        tsuku(home.path(), &["verify", "x", "--target-family", "gentoo"])
            .status
            .code(),
        Some(2)
    );
}

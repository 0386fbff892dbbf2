//! Tier 2: dependency classification, ABI flavor and drift.

use std::collections::BTreeSet;
use std::path::Path;
use tsuku_schema::{DependencyClass, LibcFlavor, LibraryMetadata, Os, Platform};

use super::InspectedFile;
use super::report::{DependencyRecord, Finding, FindingKind, Tier, TierResult};
use super::rpath::{ExpandError, SearchContext, is_path_variable};
use crate::registry::SystemLibraryRegistry;
use crate::state::{InstalledArtifact, SonameIndex};

/// Shown once per artifact installed before dependency tracking existed.
pub const LEGACY_MESSAGE: &str =
    "Library installed before Tier 2 support — limited validation available";

fn basename(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

fn reinstall_hint(name: &str) -> String {
    format!("Run 'tsuku install {name} --reinstall' to restore original.")
}

/// The single warning that stands in for Tiers 2 and 3 on legacy artifacts.
pub fn legacy_result(artifact: &InstalledArtifact) -> TierResult {
    let finding = Finding::new(FindingKind::LegacyMetadata, LEGACY_MESSAGE).with_remediation(
        format!(
            "Run 'tsuku install {} --reinstall' to record dependency metadata.",
            artifact.name()
        ),
    );
    TierResult::from_findings(Tier::Dependencies, vec![finding])
}

/// Classification of one declared dependency.
#[derive(Debug)]
struct Classified {
    record: DependencyRecord,
    /// Why a variable expansion was rejected
    reason: Option<ExpandError>,
}

/// Read-only inputs shared by every artifact in a run.
pub struct Resolver<'a> {
    pub platform: &'a Platform,
    pub platform_is_host: bool,
    pub registry: &'a SystemLibraryRegistry,
    pub index: &'a SonameIndex,
    pub root: &'a Path,
}

impl Resolver<'_> {
    /// Classify every declared dependency of `files` and judge the result.
    pub fn check(
        &self,
        artifact: &InstalledArtifact,
        files: &[InspectedFile],
    ) -> (TierResult, Vec<DependencyRecord>) {
        let mut findings = Vec::new();
        let mut records = Vec::new();

        for file in files {
            if let Some(finding) = self.check_abi(artifact, file) {
                findings.push(finding);
            }

            let ctx = SearchContext::new(&file.path, &file.info.rpaths, self.root);
            let classified: Vec<Classified> = file
                .info
                .needed
                .iter()
                .map(|dep| self.classify(file, dep, &ctx))
                .collect();

            findings.extend(self.judge(artifact, &file.meta, &classified));
            records.extend(classified.into_iter().map(|c| c.record));
        }

        tracing::debug!(
            artifact = %artifact.id(),
            dependencies = records.len(),
            findings = findings.len(),
            "dependencies classified"
        );
        (TierResult::from_findings(Tier::Dependencies, findings), records)
    }

    fn classify(
        &self,
        file: &InspectedFile,
        dep: &str,
        ctx: &Result<SearchContext, ExpandError>,
    ) -> Classified {
        let mut record = DependencyRecord {
            file: file.meta.path.clone(),
            soname: dep.to_string(),
            class: DependencyClass::Unknown,
            resolved: None,
            provider: None,
        };

        if is_path_variable(dep) {
            let expanded = ctx.as_ref().map_err(Clone::clone).and_then(|c| c.expand(dep));
            match expanded {
                Ok(path) => {
                    let entry = self.index.lookup(basename(dep));
                    if path.exists() || entry.is_some() {
                        record.class = DependencyClass::Managed;
                        record.provider = entry.map(|e| e.artifact.clone());
                        record.resolved = Some(if path.exists() {
                            path
                        } else {
                            entry.map_or(path, |e| e.path.clone())
                        });
                    }
                }
                Err(reason) => {
                    return Classified {
                        record,
                        reason: Some(reason),
                    };
                }
            }
            return Classified {
                record,
                reason: None,
            };
        }

        if let Some(entry) = self.index.lookup(dep) {
            record.class = DependencyClass::Managed;
            record.resolved = Some(entry.path.clone());
            record.provider = Some(entry.artifact.clone());
        } else if self.registry.is_system_library(dep, self.platform.os) {
            record.class = DependencyClass::System;
        }
        Classified {
            record,
            reason: None,
        }
    }

    fn judge(
        &self,
        artifact: &InstalledArtifact,
        meta: &LibraryMetadata,
        classified: &[Classified],
    ) -> Vec<Finding> {
        let mut findings = Vec::new();
        let mut missing: BTreeSet<String> = BTreeSet::new();

        // Promised at install time, gone now.
        for snap in meta
            .dependencies
            .iter()
            .filter(|s| s.class == DependencyClass::Managed)
        {
            let present = self
                .index
                .lookup(&snap.soname)
                .is_some_and(|e| e.path.exists());
            if !present && missing.insert(snap.soname.clone()) {
                let provider = snap.provider.as_deref().unwrap_or(artifact.name());
                findings.push(missing_managed(&snap.soname, &meta.path, provider));
            }
        }

        for c in classified {
            let r = &c.record;
            let gone = r.class == DependencyClass::Managed
                && r.resolved.as_deref().is_some_and(|p| !p.exists());
            if gone {
                if missing.insert(r.soname.clone()) {
                    let provider = r
                        .provider
                        .as_ref()
                        .map_or(artifact.name(), |p| p.name.as_str());
                    findings.push(missing_managed(&r.soname, &meta.path, provider));
                }
                continue;
            }
            if missing.contains(&r.soname) {
                continue;
            }

            if r.class == DependencyClass::Unknown {
                let message = match &c.reason {
                    Some(reason) => {
                        format!("Dependency validation failed: {} - UNKNOWN ({reason})", r.soname)
                    }
                    None => format!("Dependency validation failed: {} - UNKNOWN", r.soname),
                };
                findings.push(
                    Finding::new(FindingKind::DependencyUnknown, message).with_file(&meta.path),
                );
            }

            let recorded = meta
                .dependencies
                .iter()
                .any(|s| s.soname == r.soname || basename(&s.soname) == basename(&r.soname));
            if !recorded {
                findings.push(
                    Finding::new(
                        FindingKind::DependencyDrift,
                        format!(
                            "Dependency drift: {} is required now but was not recorded at install",
                            r.soname
                        ),
                    )
                    .with_file(&meta.path)
                    .with_remediation(reinstall_hint(artifact.name())),
                );
            }
        }
        findings
    }

    /// Interpreter flavor and presence, for dynamically linked Linux ELF.
    fn check_abi(&self, artifact: &InstalledArtifact, file: &InspectedFile) -> Option<Finding> {
        if self.platform.os != Os::Linux || !file.info.format.starts_with("ELF") {
            return None;
        }
        let interp = file.info.interpreter.as_deref()?;
        let expected = self.platform.libc;

        let message = match LibcFlavor::from_interpreter(interp) {
            Some(flavor) if flavor != expected => format!(
                "ABI validation failed: interpreter {interp} requires {flavor}, host provides {expected}"
            ),
            _ if self.platform_is_host && !Path::new(interp).exists() => {
                format!("ABI validation failed: interpreter {interp} not found")
            }
            _ => return None,
        };
        Some(
            Finding::new(FindingKind::AbiMismatch, message)
                .with_file(&file.meta.path)
                .with_remediation(format!(
                    "Install a build of {} for {}.",
                    artifact.name(),
                    self.platform
                )),
        )
    }
}

fn missing_managed(soname: &str, file: &Path, provider: &str) -> Finding {
    Finding::new(
        FindingKind::DependencyMissingManaged,
        format!("Dependency validation failed: {soname} not found (TSUKU_MANAGED)"),
    )
    .with_file(file)
    .with_remediation(reinstall_hint(provider))
}

/// Sonames and paths an executable's load test should bind, in
/// declaration order: managed libraries by absolute path, everything else
/// by name.
pub fn load_list(records: &[DependencyRecord], file: &Path) -> Vec<String> {
    records
        .iter()
        .filter(|r| r.file == file)
        .map(|r| match (&r.class, &r.resolved) {
            (DependencyClass::Managed, Some(path)) => path.to_string_lossy().into_owned(),
            _ => r.soname.clone(),
        })
        .collect()
}

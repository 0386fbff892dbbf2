//! `tsuku verify`

use anyhow::{Context, Result, anyhow};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tsuku_core::verify::RunOutcome;
use tsuku_core::{TsukuHome, Verifier, VerifyConfig, host};

use crate::VerifyArgs;
use crate::ui::{ProgressReporter, Renderer, Theme};

fn resolve_home(home: Option<&Path>) -> Result<TsukuHome> {
    match home {
        Some(dir) => {
            let dir = std::path::absolute(dir)
                .with_context(|| format!("invalid home directory {}", dir.display()))?;
            Ok(TsukuHome::new(dir))
        }
        None => TsukuHome::discover()
            .ok_or_else(|| anyhow!("could not determine home directory; set TSUKU_HOME")),
    }
}

fn build_config(home: TsukuHome, args: &VerifyArgs) -> Result<VerifyConfig> {
    let mut platform = host::detect();
    let overridden = args.target_family.is_some();
    if let Some(family) = args.target_family {
        platform = platform.with_family(family);
    }

    let mut config = VerifyConfig::load(home, platform).context("failed to load configuration")?;
    config.platform_is_host = !overridden;
    if let Some(workers) = args.workers {
        config.workers = workers.get();
    }
    config.skip_integrity = args.skip_integrity;
    config.skip_dlopen = args.skip_dlopen;
    Ok(config)
}

/// Verify the requested artifacts and their closure, printing the report to
/// stdout. Progress goes to stderr.
pub async fn verify(home: Option<&Path>, args: &VerifyArgs) -> Result<RunOutcome> {
    let config = build_config(resolve_home(home)?, args)?;
    tracing::debug!(
        home = %config.home.root().display(),
        platform = %config.platform,
        workers = config.workers,
        "verify configuration"
    );

    let progress_theme = Theme::detect_stderr();
    let verifier = Verifier::open(config)
        .context("failed to prepare verification")?
        .with_reporter(Arc::new(ProgressReporter::new(args.verbose, progress_theme)));

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted, stopping workers...");
            on_interrupt.cancel();
        }
    });

    eprintln!(
        "tsuku verify ({})",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    let result = verifier.run(&args.artifacts, cancel).await;
    watcher.abort();
    let summary = result?;

    let renderer = Renderer::new(args.verbose, Theme::detect());
    let mut out = std::io::stdout().lock();
    renderer.summary(&mut out, &summary)?;
    out.flush()?;

    Ok(summary.outcome())
}

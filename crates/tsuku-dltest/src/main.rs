//! `tsuku-dltest` - loads installed binaries in a disposable process.
//!
//! Loading a shared library runs its initializers, so `tsuku verify` never
//! does it in-process. It writes a JSON `LoadRequest` to this helper's stdin
//! and reads a JSON `LoadResponse` from stdout. The exit status is part of
//! the protocol:
//!
//! | code | meaning |
//! |------|---------|
//! | 0 | every target loaded |
//! | 1 | at least one target failed, response complete |
//! | 2 | the request could not be read |
//!
//! Anything else, including death by signal, is treated as a crash by the
//! supervisor.

mod classify;
mod isolate;
mod load;

use anyhow::{Context, Result};
use std::io::{Read, Write};
use tsuku_schema::dltest::{
    EXIT_ALL_LOADED, EXIT_SOME_FAILED, EXIT_USAGE, LoadRequest, LoadResponse,
};

use crate::classify::Classifier;

fn read_request() -> Result<LoadRequest> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("failed to read request from stdin")?;
    serde_json::from_str(&input).context("invalid load request")
}

fn run(request: &LoadRequest) -> Result<i32> {
    let classifier = Classifier::new().context("failed to compile error patterns")?;
    isolate::apply(request.cpu_limit_secs, request.verbose);

    let results: Vec<_> = request
        .targets
        .iter()
        .map(|t| load::load_target(t, &classifier))
        .collect();
    let all_loaded = results.iter().all(|r| r.outcome.is_loaded());

    let mut out = std::io::stdout().lock();
    serde_json::to_writer(&mut out, &LoadResponse { results })
        .context("failed to write response")?;
    out.write_all(b"\n")?;
    out.flush()?;

    Ok(if all_loaded {
        EXIT_ALL_LOADED
    } else {
        EXIT_SOME_FAILED
    })
}

fn main() {
    let code = match read_request().and_then(|req| run(&req)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("tsuku-dltest: {e:#}");
            EXIT_USAGE
        }
    };
    std::process::exit(code);
}

//! `fusion-stub-engine`: the deterministic worker used by default and in
//! tests. Stdout carries the protocol, so logs go to stderr.

use std::io;
use std::process::ExitCode;

use fusion_worker::stub::{run_stub, StubExit, StubKnobs, CRASH_EXIT_CODE};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fusion_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let knobs = match StubKnobs::from_env() {
        Ok(knobs) => knobs,
        Err(e) => {
            tracing::error!(error = %e, "Invalid stub engine configuration");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(pid = std::process::id(), ?knobs, "Stub engine started");

    match run_stub(io::stdin().lock(), io::stdout().lock(), &knobs) {
        Ok(StubExit::Stopped | StubExit::EndOfInput) => ExitCode::SUCCESS,
        Ok(StubExit::Crashed) => ExitCode::from(CRASH_EXIT_CODE),
        Err(e) => {
            tracing::error!(error = %e, "Stub engine I/O failed");
            ExitCode::FAILURE
        }
    }
}

//! The main entrypoint for sysimage, which just performs global initialization, and then
//! calls out into the library.
use std::io::Write as _;

use anyhow::Result;
use owo_colors::OwoColorize;

/// The code called after we've done process global init and created
/// an async runtime.
async fn async_main() -> Result<()> {
    sysimage_utils::initialize_tracing();
    tracing::trace!("starting {}", env!("CARGO_PKG_NAME"));
    sysimage_lib::cli::run_from_iter(std::env::args()).await
}

/// Create an async runtime and do the rest of the work there.
fn run() -> Result<()> {
    // Everything blocking happens on a dedicated thread; the runtime
    // itself only has to wait for it and for signals.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main())
}

fn main() {
    if let Err(e) = run() {
        let mut stderr = anstream::stderr();
        // Don't panic if writing fails
        let _ = writeln!(stderr, "{}{:#}", "error: ".red(), e);
        std::process::exit(1);
    }
}

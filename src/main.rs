use beacon_logger::app::{Options, PlatformSource, ScanController};
use clap::Parser;
use log::{error, info};
use std::panic::{self, PanicHookInfo};

/// Exit codes for the application
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_PANIC: i32 = 2;

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();
}

/// Resolves on Ctrl-C. If the signal handler cannot be installed, never resolves.
async fn ctrl_c() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Set up panic hook to ensure clean exit codes for process managers
    panic::set_hook(Box::new(move |info: &PanicHookInfo| {
        eprintln!("Panic! {}", info);
        std::process::exit(EXIT_PANIC);
    }));

    let options = Options::parse();
    init_logging(options.verbose);

    info!(
        "recording manufacturer 0x{:04X} advertisements for {:?} to {} ({}, {} backend)",
        options.manufacturer_id,
        options.duration,
        options.output.display(),
        options.format,
        options.backend
    );

    let mut controller = ScanController::from_options(&options);
    match controller
        .run(&options.output, options.format, &PlatformSource, ctrl_c())
        .await
    {
        Ok(summary) => {
            info!("scan finished: {summary}");
            std::process::exit(EXIT_SUCCESS);
        }
        Err(why) => {
            error!("{why}");
            std::process::exit(EXIT_ERROR);
        }
    }
}

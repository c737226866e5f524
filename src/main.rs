use clap::Parser;
use std::process::ExitCode;

use slotmux::cli::{self, Cli};

fn main() -> ExitCode {
    let cli = Cli::parse();
    cli::init_tracing(cli.log_json);

    // One run, start to finish, on a single thread.
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(error = %err, "failed to start async runtime");
            return ExitCode::FAILURE;
        }
    };

    ExitCode::from(runtime.block_on(cli::run(cli)))
}

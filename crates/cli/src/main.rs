// replica CLI entry point: maintenance over the file-backed document store.

use std::path::PathBuf;
use std::process;

use clap::Parser;

mod commands;
mod exit_code;
mod output;

use exit_code::ExitCode;
use output::OutputFormat;

#[derive(Parser)]
#[command(name = "replica", about = "Inspect and maintain a replica document store")]
struct Cli {
    /// Store directory (defaults to `storage.data_dir` in ~/.replica/engine.toml, then ~/.replica/store).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Force JSON output.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: commands::Command,
}

fn main() -> process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let format = OutputFormat::detect(cli.json);
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            output::print_error(format, "RUNTIME", &format!("failed to start runtime: {error}"));
            return ExitCode::Error.into();
        }
    };

    match runtime.block_on(commands::run(cli.command, cli.data_dir, format)) {
        Ok(()) => ExitCode::Success.into(),
        Err(error) => {
            let code = ExitCode::from_error(&error);
            output::print_anyhow_error(format, &error);
            code.into()
        }
    }
}

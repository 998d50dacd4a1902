use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use tutorhost_core::GlobalOptions;

mod cli;
mod dispatch;
mod output;
mod progress;
mod style;

use cli::TutorhostCli;

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = TutorhostCli::parse();
    init_tracing(cli.trace, cli.verbose, cli.quiet);

    let global = GlobalOptions {
        quiet: cli.quiet,
        verbose: cli.verbose,
        trace: cli.trace,
        json: cli.json,
        offline: cli.offline,
        root: cli.root.clone(),
    };

    let info = dispatch::command_info(&cli.command);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let outcome = runtime
        .block_on(dispatch::execute(&global, &cli.command))
        .map_err(|err| eyre!("{err:?}"))?;
    let code = output::emit_output(&cli, info, &outcome)?;
    drop(runtime);

    if code == 0 {
        Ok(())
    } else {
        std::process::exit(code);
    }
}

fn init_tracing(trace: bool, verbose: u8, quiet: bool) {
    let level = if trace {
        "trace"
    } else if quiet {
        "warn"
    } else {
        match verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };

    let filter = format!("tutorhost={level},tutorhost_core={level},tutorhost_store={level}");
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

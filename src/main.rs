mod cli;
mod handlers;
mod printer;

use anyhow::Result;
use cli::Command;
use sandbox_worker::config::Config;
use sandbox_worker::logging;
use tracing::debug;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    // Load config; CLI flags override it
    let mut cfg = Config::load();
    if let Some(python) = &args.python {
        cfg.set("PYTHON_BIN", python.display().to_string());
    }
    logging::init_tracing(&cfg, args.verbose);
    debug!(config = %cfg.config_path.display(), "configuration loaded");

    match args.command {
        Command::Serve { eager, packages } => handlers::serve::run(&cfg, eager, packages).await,
        Command::Exec {
            path,
            packages,
            vars,
            json,
            timeout,
            out_dir,
        } => {
            let opts = handlers::exec::ExecOptions {
                path,
                packages,
                vars,
                json,
                timeout,
                out_dir,
            };
            if !handlers::exec::run(&cfg, opts).await? {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

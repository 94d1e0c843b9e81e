/*!
 * Nietzsche Server Main Entry Point
 *
 * Loads configuration from the environment, binds the listeners, installs
 * the SIGINT/SIGTERM handlers and runs the server until shutdown.
 */

use anyhow::{Context, Result};
use log::{error, info};
use nietzsche::{signal, Config, Server};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> Result<()> {
    // RUST_LOG controls verbosity, e.g. RUST_LOG=debug
    env_logger::init();

    let config = Config::from_env().context("invalid configuration")?;
    let server = Server::bind(config)?;

    let signals = signal::install_shutdown_signals().context("cannot install signal handlers")?;
    let coordinator = server.coordinator();
    std::thread::Builder::new()
        .name("shutdown".into())
        .spawn(move || {
            if let Err(e) = signals.wait() {
                error!("signal pipe failed: {}", e);
                return;
            }
            info!("shutdown requested, waiting for engines to go idle");
            // later signals land in the pipe and are never read
            if coordinator.shutdown() {
                info!("bye");
                std::process::exit(0);
            }
        })
        .context("cannot spawn shutdown thread")?;

    info!("nietzsche listening on {}", server.local_addr());
    server.run()
}

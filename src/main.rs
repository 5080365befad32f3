//! The `offload` server: accepts clients and drives the compile and game workers.

use {
    clap::Parser,
    log::{info, warn},
    offload::{
        config::ServerConfig,
        server::{watch_console, Server, CLOSE_COMMAND},
    },
    signal_hook::{
        consts::{SIGINT, SIGTERM},
        iterator::Signals,
    },
    std::{io, thread},
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::parse();
    info!(
        "starting offload on {} (claim mode {:?})",
        config.socket_addr_string(),
        config.claim_mode
    );

    let mut server = Server::bind(config)?;
    server.spawn_workers()?;
    let handle = server.shutdown_handle()?;

    let console = handle.clone();
    thread::spawn(move || {
        info!("type `{CLOSE_COMMAND}` to stop the server");
        watch_console(io::stdin().lock(), &console);
    });

    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let on_signal = handle.clone();
    thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            warn!("received signal {signal}");
            on_signal.trigger();
        }
    });

    server.run()?;
    Ok(())
}

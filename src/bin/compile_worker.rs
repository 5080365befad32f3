use {
    clap::Parser,
    log::info,
    offload::{
        compile::{CommandCompiler, CompileWorker},
        config::CompileWorkerConfig,
        mailbox::{ClaimMode, Mailbox},
        shutdown::Shutdown,
    },
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = CompileWorkerConfig::parse();
    let token = Shutdown::from_signals()?;
    let ipc = &config.ipc;

    // the consumer never claims, the mode only matters to producers
    let mailbox = Mailbox::open(
        &ipc.ipc_dir,
        ipc.mailbox_id,
        ipc.handshake_id,
        ipc.mailbox_capacity,
        ClaimMode::Atomic,
    )?;
    info!(
        "compile worker attached to mailbox {} in {} using {}",
        ipc.mailbox_id,
        ipc.ipc_dir.display(),
        config.compiler
    );

    CompileWorker::new(mailbox, CommandCompiler::new(config.compiler.clone())).run(&token)?;
    Ok(())
}

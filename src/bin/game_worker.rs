use {
    clap::Parser,
    log::info,
    offload::{
        config::GameWorkerConfig, game_worker::GameWorker, session_queue::SessionQueues,
        shutdown::Shutdown,
    },
    rand::{rngs::StdRng, SeedableRng},
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = GameWorkerConfig::parse();
    let token = Shutdown::from_signals()?;
    let ipc = &config.ipc;

    let queues = SessionQueues::open(&ipc.ipc_dir, ipc.inbound_queue_id, ipc.outbound_queue_id)?;
    let rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    info!(
        "game worker attached to queues {}/{} in {}",
        ipc.inbound_queue_id,
        ipc.outbound_queue_id,
        ipc.ipc_dir.display()
    );

    GameWorker::new(queues, rng).run(&token)?;
    Ok(())
}

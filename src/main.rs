use canopen_link::config::{parse_or_usage_exit, RuntimeConfig};
use canopen_link::orchestrator::Orchestrator;
use canopen_link::protocol::NullProtocolStack;
use canopen_link::storage::StorageEngine;

fn main() {
    let cli = parse_or_usage_exit();
    let config = RuntimeConfig::from_cli(cli);

    canopen_link::logging::init(true, "canopen-link");

    let storage = StorageEngine::new();
    let mut orchestrator = Orchestrator::new(config, storage);

    if let Err(e) = orchestrator.install_signal_handlers() {
        log::error!("fatal: failed to install signal handlers: {}", e);
        std::process::exit(1);
    }

    let code = orchestrator.run(Box::new(NullProtocolStack));
    std::process::exit(code);
}

pub mod kv;

use huck_core::error::Result;
use huck_raft::client::RaftClient;
use huck_raft::config::RaftConfig;
use huck_raft::HuckRaft;

#[macro_use]
extern crate slog;
#[macro_use]
extern crate serde_derive;

pub async fn huck<P: AsRef<std::path::Path>>(
    config_path: P,
    shutdown: (
        tokio::sync::broadcast::Sender<()>,
        tokio::sync::broadcast::Receiver<()>,
    ),
) -> Result<()> {
    let config = huck_raft::config::config(config_path)?;
    run(config, shutdown).await
}

pub async fn run(
    config: RaftConfig,
    shutdown: (
        tokio::sync::broadcast::Sender<()>,
        tokio::sync::broadcast::Receiver<()>,
    ),
) -> Result<()> {
    let logger = huck_core::logger::get_root_logger().new(o!());
    info!(logger, "starting"; "id" => config.id, "addr" => config.addr().to_string());

    let (client_tx, client_rx) = tokio::sync::mpsc::unbounded_channel();
    // held so the client channel stays open for tooling built on top
    let _client = RaftClient::new(client_tx);

    let raft = HuckRaft::new(config);
    raft.run(kv::KvStore::new(), client_rx, shutdown).await
}

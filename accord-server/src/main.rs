use accord_common::config::{load_config, ClusterConfig};
use accord_core::raft::{
    FileStorage, InMemoryNetwork, KeyValueStore, KvCommand, KvResponse, MemoryStorage, NodeRole,
    RaftConfig, RaftHandle, RaftNode, RaftServer, Storage,
};
use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const LEADER_WAIT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            load_config(&path).with_context(|| format!("loading config from {}", path))?
        }
        None => ClusterConfig::with_members(["n1", "n2", "n3"]),
    };
    tracing::info!(members = ?config.members, "Starting cluster");

    let network = InMemoryNetwork::new();
    let mut handles = Vec::new();
    for id in &config.members {
        handles.push(start_member(&config, &network, id)?);
    }

    let leader = wait_for_leader(&handles).await?;
    tracing::info!(leader = %leader.id(), "Leader elected");

    let commands = [
        KvCommand::Set("greeting".into(), "hello".into()),
        KvCommand::Get("greeting".into()),
        KvCommand::Delete("greeting".into()),
        KvCommand::Get("greeting".into()),
    ];
    for command in commands {
        let output = leader.propose(command.encode()).await?;
        tracing::info!(?command, response = ?KvResponse::decode(&output), "Applied");
    }

    for handle in &handles {
        let status = handle.status().await?;
        tracing::info!(
            node = %status.id,
            role = ?status.role,
            term = status.current_term,
            commit = status.commit_index,
            "Status"
        );
    }

    tracing::info!("Running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    for handle in &handles {
        handle.shutdown().await?;
    }
    Ok(())
}

fn start_member(config: &ClusterConfig, network: &InMemoryNetwork, id: &str) -> Result<RaftHandle> {
    let raft_config = RaftConfig::for_member(config, id)?;

    let storage: Box<dyn Storage> = match &config.data_dir {
        Some(dir) => {
            let node_dir = dir.join(id);
            std::fs::create_dir_all(&node_dir)
                .with_context(|| format!("creating {}", node_dir.display()))?;
            Box::new(FileStorage::new(node_dir.join("state.bin")))
        }
        None => Box::new(MemoryStorage::new()),
    };

    let node = RaftNode::new(raft_config, storage, Box::new(KeyValueStore::default()))?;
    let inbox = network.register(id);
    let transport = Arc::new(network.transport_for(id));
    Ok(RaftServer::spawn(node, transport, inbox))
}

async fn wait_for_leader(handles: &[RaftHandle]) -> Result<RaftHandle> {
    let deadline = tokio::time::Instant::now() + LEADER_WAIT;
    while tokio::time::Instant::now() < deadline {
        for handle in handles {
            if handle.status().await?.role == NodeRole::Leader {
                return Ok(handle.clone());
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    bail!("no leader elected within {:?}", LEADER_WAIT)
}

use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use taskmesh::cluster::membership::{ClusterMembership, StaticMembership};
use taskmesh::cluster::types::{HeartBeat, NodeIdentity};
use taskmesh::config::Config;
use taskmesh::rpc::registry::TaskHandlerRegistry;
use taskmesh::rpc::service::MeshService;
use taskmesh::rpc::types::now_ms;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        eprintln!("Usage: {} --bind <addr:port> [--peer <addr:port>]", args[0]);
        eprintln!("Example: {} --bind 127.0.0.1:5000", args[0]);
        eprintln!(
            "Example: {} --bind 127.0.0.1:5001 --peer 127.0.0.1:5000",
            args[0]
        );

        std::process::exit(1);
    }

    let mut bind_addr: Option<SocketAddr> = None;
    let mut peers: Vec<SocketAddr> = vec![];

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" => {
                bind_addr = Some(args[i + 1].parse()?);
                i += 2;
            }
            "--peer" => {
                peers.push(args[i + 1].parse()?);
                i += 2;
            }
            _ => {
                i += 1;
            }
        }
    }

    let bind_addr = bind_addr.expect("--bind is required");
    let std::net::IpAddr::V4(bind_ip) = bind_addr.ip() else {
        anyhow::bail!("--bind must be an IPv4 address");
    };

    tracing::info!("Starting node on {}", bind_addr);

    // 1. Task handlers:
    let handlers = TaskHandlerRegistry::new();
    handlers.register("echo", |body| async move { Ok(body) });
    handlers.on_acknowledged("echo", |task_id| {
        tracing::trace!("Task {} fully acknowledged", task_id);
    });

    // 2. Membership view (static, from the peer list):
    let membership = StaticMembership::new();

    // 3. Engine:
    let service = MeshService::bind(
        Some(bind_ip),
        bind_addr.port(),
        membership.clone() as Arc<dyn ClusterMembership>,
        handlers,
        Config::default(),
    )
    .await?;

    membership.join(
        service.identity(),
        HeartBeat {
            boot_millis: now_ms(),
            ..Default::default()
        },
    );

    let mut peer_identities = Vec::new();
    for peer in &peers {
        let std::net::IpAddr::V4(ip) = peer.ip() else {
            anyhow::bail!("--peer must be an IPv4 address");
        };
        let identity = NodeIdentity::new(ip, peer.port());
        membership.join(identity, HeartBeat::default());
        peer_identities.push(identity);
    }

    service.start()?;

    // 4. Demo driver: periodically round-trip an echo task to each peer.
    for peer in peer_identities {
        let service = service.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            let mut seq = 0u64;
            loop {
                interval.tick().await;
                seq += 1;
                let body = json!({ "from": service.identity().to_string(), "seq": seq });
                match service.submit_and_await(peer, "echo", body).await {
                    Ok(reply) => tracing::info!("Echo from {}: {}", peer, reply),
                    Err(e) => tracing::warn!("Echo to {} failed: {}", peer, e),
                }
            }
        });
    }

    tracing::info!("Press Ctrl+C to shutdown");
    tokio::signal::ctrl_c().await?;
    service.shutdown();

    Ok(())
}

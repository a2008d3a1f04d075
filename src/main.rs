//! Relay NetVar Demo
//!
//! Hosts a session on the in-memory relay, joins it from a second
//! participant and replicates a shared step counter plus one name per
//! player.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use relay_netvar::{
    network::loopback::{LoopbackConfig, LoopbackTransport},
    replication::EntityId,
    EstablisherConfig, InMemoryRelay, NetworkEntity, ParticipantId, PlayerName, ReplicationConfig,
    ReplicationHub, RpcPolicy, SessionEstablisher, VERSION,
};

/// Entity holding the shared step counter.
const COUNTER_ENTITY: EntityId = EntityId(0);

/// Player entities are numbered from here by participant id.
const PLAYER_ENTITY_BASE: u64 = 100;

fn player_entity(participant: ParticipantId) -> EntityId {
    EntityId(PLAYER_ENTITY_BASE + participant.raw())
}

/// Declare the demo entities in the same order on every participant.
fn spawn_world(
    hub: &Arc<ReplicationHub>,
    participants: &[ParticipantId],
) -> Vec<NetworkEntity> {
    let mut entities = Vec::new();

    let counter = NetworkEntity::spawn(hub.clone(), COUNTER_ENTITY, ParticipantId::AUTHORITY);
    entities.push(counter);

    for participant in participants {
        let player = NetworkEntity::spawn(hub.clone(), player_entity(*participant), *participant);
        entities.push(player);
    }
    entities
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Relay NetVar demo v{}", VERSION);

    let relay = InMemoryRelay::new(LoopbackConfig::from_env());
    let config = EstablisherConfig::from_env();
    let replication = ReplicationConfig::from_env();

    // Host
    let host: SessionEstablisher<InMemoryRelay, LoopbackTransport> =
        SessionEstablisher::new(config.clone(), relay.clone(), relay.transport())
            .with_user_name(PlayerName::new("Host"));
    let (code, host_ctx) = host.host(config.max_participants).await?;
    info!("Share this join code: {}", code);

    // Joiner
    let joiner: SessionEstablisher<InMemoryRelay, LoopbackTransport> =
        SessionEstablisher::new(config.clone(), relay.clone(), relay.transport())
            .with_user_name(PlayerName::new("Ada"));
    let mut joiner_failures = joiner.on_transport_failure();
    let joiner_ctx = joiner.join(&code.as_str().to_lowercase()).await?;

    let participants = [host_ctx.participant_id, joiner_ctx.participant_id];
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Authority side
    let (host_hub, host_rx) = ReplicationHub::new(host_ctx.clone(), replication.clone());
    let mut host_world = spawn_world(&host_hub, &participants);
    let host_steps = host_world[0].variable(0u32)?;
    let host_names = host_world[1..]
        .iter_mut()
        .map(|e| e.variable_with_policy(PlayerName::default(), RpcPolicy::OwnerOnly))
        .collect::<Result<Vec<_>, _>>()?;
    let host_task = tokio::spawn(host_hub.clone().run(
        host.transport().clone(),
        host_rx,
        shutdown_tx.subscribe(),
    ));

    // Peer side
    let (peer_hub, peer_rx) = ReplicationHub::new(joiner_ctx.clone(), replication);
    let mut peer_world = spawn_world(&peer_hub, &participants);
    let peer_steps = peer_world[0].variable(0u32)?;
    let peer_names = peer_world[1..]
        .iter_mut()
        .map(|e| e.variable_with_policy(PlayerName::default(), RpcPolicy::OwnerOnly))
        .collect::<Result<Vec<_>, _>>()?;
    let peer_task = tokio::spawn(peer_hub.clone().run(
        joiner.transport().clone(),
        peer_rx,
        shutdown_tx.subscribe(),
    ));

    let _steps_display = peer_steps.on_change_with_current(|prev, new| {
        info!("[peer] steps: {} -> {}", prev, new);
    });
    let _name_displays: Vec<_> = peer_names
        .iter()
        .map(|name| {
            let id = name.id();
            name.on_change(move |prev, new| {
                info!(
                    "[peer] name of entity {}: {:?} -> {:?}",
                    id.entity.0,
                    prev.as_str(),
                    new.as_str()
                );
            })
        })
        .collect();

    // Each owner pushes its locally entered name.
    let host_rpc = host_hub.rpc();
    let peer_rpc = peer_hub.rpc();
    if let Some(name) = host_ctx.local_user_name.clone() {
        host_world[1].push_initial(&host_rpc, &host_names[0], name, |n| !n.is_empty())?;
    }
    if let Some(name) = joiner_ctx.local_user_name.clone() {
        peer_world[2].push_initial(&peer_rpc, &peer_names[1], name, |n| !n.is_empty())?;
    }

    // The authority writes; the peer asks.
    host_steps.set_if_authority(42)?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    peer_rpc.request(&peer_steps, peer_steps.get() + 1)?;

    // A direct write from the peer is refused locally.
    if let Err(e) = peer_steps.set_if_authority(1000) {
        info!("[peer] direct write refused: {}", e);
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    info!(
        "Final: host steps = {}, peer steps = {}, names = {:?}",
        host_steps.get(),
        peer_steps.get(),
        host_names.iter().map(|n| n.get().to_string()).collect::<Vec<_>>()
    );

    if let Ok(failure) = joiner_failures.try_recv() {
        info!("Joiner saw a transport failure: {}", failure);
    }

    let _ = shutdown_tx.send(());
    host_task.await?;
    peer_task.await?;

    drop(peer_world);
    drop(host_world);
    info!("Demo complete");
    Ok(())
}

//! Demo: degrade a simulated group, watch the rebuild run to completion.

use anyhow::Result;
use fer_engine::rebuild::ReplacementKind;
use fer_engine::service::{Collaborators, ExtentStateView, RecoveryService};
use fer_engine::{RecoveryConfig, TracingAuditSink, TracingFaultSink};
use fer_harness::{SimArray, SimPeer};
use fer_state::persist::MemStore;
use fer_types::{ChunkIndex, ObjectId, PositionIndex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let array = Arc::new(SimArray::new());
    let peer = Arc::new(SimPeer::new());
    let service = Arc::new(RecoveryService::open(
        RecoveryConfig {
            blocks_per_chunk: 8,
            chunks_per_tick: 2,
            peer_sync_interval: Duration::from_millis(200),
            ..RecoveryConfig::default()
        },
        Arc::new(MemStore::new()),
        Collaborators {
            lifecycle: array.clone(),
            resync: array.clone(),
            quiesce: array.clone(),
            verify_media: array.clone(),
            drive_media: array.clone(),
            peer: peer.clone(),
            faults: Arc::new(TracingFaultSink),
            audit: Arc::new(TracingAuditSink),
        },
    )?);

    let group = ObjectId(1);
    let position = PositionIndex(1);
    service.create_group(group, 512, 3)?;
    let events = service.subscribe(group)?;

    // Degrade the position, log a few writes, then restore the drive.
    service.drive_removed(group, position)?;
    for chunk in [3, 17, 42, 55] {
        service.mark_write_logged(group, position, ChunkIndex(chunk))?;
    }
    service.drive_replaced(group, position, ReplacementKind::Restored)?;

    let runner = RecoveryService::spawn(Arc::clone(&service));

    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if let Ok(event) = events.recv_timeout(Duration::from_millis(100)) {
            info!(?event.phase, percent = event.percent, "reconstruction");
            if event.percent == 100 {
                break;
            }
        }
    }

    if let ExtentStateView::Group { positions, .. } = service.extent_state(group)? {
        info!(checkpoint = %positions[1].checkpoint, "final position state");
    }
    info!(
        resynced = ?array.resynced_chunks(group, position),
        peer_batches = peer.batches(),
        "demo complete"
    );

    runner.shutdown();
    Ok(())
}

// Background fetch loops feeding the overlay engine.
//
// Vehicles are polled on a fixed interval. Routes and stops are fetched at
// start-up and again each time the validation generation changes. A fetch is
// awaited before the next tick is taken, so at most one request per kind is
// ever in flight.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::engine::OverlayHandle;
use crate::error::FetchFailure;
use crate::models::{EntityKind, Snapshot};
use crate::source::SnapshotSource;

pub const STATIC_KINDS: [EntityKind; 2] = [EntityKind::Route, EntityKind::Stop];

/// Runs a blocking fetch on the blocking pool.
pub async fn fetch(source: Arc<dyn SnapshotSource>, kind: EntityKind) -> Result<Snapshot, FetchFailure> {
    match tokio::task::spawn_blocking(move || source.fetch_snapshot(kind)).await {
        Ok(outcome) => outcome,
        Err(e) => Err(FetchFailure::Network(format!("fetch task failed: {}", e))),
    }
}

async fn fetch_and_submit(source: &Arc<dyn SnapshotSource>, handle: &OverlayHandle, kind: EntityKind) -> bool {
    let outcome = fetch(source.clone(), kind).await;
    match &outcome {
        Ok(snapshot) => debug!(%kind, entities = snapshot.len(), "poller.fetched"),
        Err(err) => warn!(%kind, error = %err, "poller.fetch_failed"),
    }
    handle.submit(kind, outcome).await.is_ok()
}

/// Races a fetch against shutdown. A fetch still running on the blocking pool
/// when shutdown arrives is abandoned and its result never submitted. Returns
/// false once the loop should stop.
async fn fetch_until_shutdown(
    source: &Arc<dyn SnapshotSource>,
    handle: &OverlayHandle,
    kind: EntityKind,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    tokio::select! {
        submitted = fetch_and_submit(source, handle, kind) => submitted,
        _ = shutdown.changed() => {
            debug!(%kind, "poller.fetch_abandoned");
            false
        }
    }
}

/// Polls vehicles every `period` until shutdown or the engine goes away.
pub async fn poll_vehicles(
    source: Arc<dyn SnapshotSource>,
    handle: OverlayHandle,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(period_ms = period.as_millis() as u64, "poller.vehicles_started");

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        if !fetch_until_shutdown(&source, &handle, EntityKind::Vehicle, &mut shutdown).await {
            break;
        }
    }
    info!("poller.vehicles_stopped");
}

/// Fetches routes and stops now, then again on every validation generation
/// change.
pub async fn sync_static_geometry(
    source: Arc<dyn SnapshotSource>,
    handle: OverlayHandle,
    mut generation: watch::Receiver<u64>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let current = *generation.borrow_and_update();
        info!(generation = current, "poller.static_sync");
        for kind in STATIC_KINDS {
            if !fetch_until_shutdown(&source, &handle, kind, &mut shutdown).await {
                info!("poller.static_stopped");
                return;
            }
        }

        tokio::select! {
            changed = generation.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    info!("poller.static_stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OverlayConfig;
    use crate::engine::{self, OverlayCommand};
    use crate::models::{Entity, LngLat, StopAttributes};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct CountingSource {
        calls: AtomicUsize,
    }

    impl SnapshotSource for CountingSource {
        fn fetch_snapshot(&self, kind: EntityKind) -> Result<Snapshot, FetchFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match kind {
                EntityKind::Stop => Ok(Snapshot::new(
                    kind,
                    vec![Entity::stop("S1", LngLat::new(0.0, 0.0), StopAttributes::default())],
                )),
                _ => Err(FetchFailure::NotValidated),
            }
        }
    }

    async fn next_snapshot(rx: &mut mpsc::Receiver<OverlayCommand>) -> (EntityKind, Result<Snapshot, FetchFailure>) {
        loop {
            match rx.recv().await {
                Some(OverlayCommand::Snapshot { kind, outcome, .. }) => return (kind, outcome),
                Some(_) => continue,
                None => panic!("engine channel closed"),
            }
        }
    }

    #[tokio::test]
    async fn static_geometry_refetches_on_generation_change() {
        let source = Arc::new(CountingSource::default());
        let (handle, mut rx) = engine::channel();
        let (generation_tx, generation_rx) = watch::channel(0u64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(sync_static_geometry(
            source.clone(),
            handle,
            generation_rx,
            shutdown_rx,
        ));

        let (kind, outcome) = next_snapshot(&mut rx).await;
        assert_eq!(kind, EntityKind::Route);
        assert_eq!(outcome.unwrap_err(), FetchFailure::NotValidated);
        let (kind, outcome) = next_snapshot(&mut rx).await;
        assert_eq!(kind, EntityKind::Stop);
        assert_eq!(outcome.unwrap().len(), 1);

        generation_tx.send_modify(|g| *g += 1);
        let (kind, _) = next_snapshot(&mut rx).await;
        assert_eq!(kind, EntityKind::Route);
        let (kind, _) = next_snapshot(&mut rx).await;
        assert_eq!(kind, EntityKind::Stop);
        assert_eq!(source.calls.load(Ordering::SeqCst), 4);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    /// Blocks inside the fetch until the test is long gone.
    struct StalledSource {
        started: Arc<tokio::sync::Notify>,
    }

    impl SnapshotSource for StalledSource {
        fn fetch_snapshot(&self, kind: EntityKind) -> Result<Snapshot, FetchFailure> {
            self.started.notify_one();
            std::thread::sleep(Duration::from_secs(2));
            Ok(Snapshot::new(kind, Vec::new()))
        }
    }

    #[tokio::test]
    async fn shutdown_abandons_an_in_flight_vehicle_fetch() {
        let started = Arc::new(tokio::sync::Notify::new());
        let source = Arc::new(StalledSource { started: started.clone() });
        let (handle, mut rx) = engine::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(poll_vehicles(source, handle, Duration::from_millis(5), shutdown_rx));
        started.notified().await;
        shutdown_tx.send(true).unwrap();

        time::timeout(Duration::from_millis(500), task)
            .await
            .expect("poller should stop without waiting for the fetch")
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn shutdown_abandons_an_in_flight_static_fetch() {
        let started = Arc::new(tokio::sync::Notify::new());
        let source = Arc::new(StalledSource { started: started.clone() });
        let (handle, mut rx) = engine::channel();
        let (_generation_tx, generation_rx) = watch::channel(0u64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(sync_static_geometry(source, handle, generation_rx, shutdown_rx));
        started.notified().await;
        shutdown_tx.send(true).unwrap();

        time::timeout(Duration::from_millis(500), task)
            .await
            .expect("static sync should stop without waiting for the fetch")
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn vehicle_poller_stops_on_shutdown() {
        let source = Arc::new(CountingSource::default());
        let (handle, mut rx) = engine::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = OverlayConfig {
            vehicle_poll_interval_ms: 5,
            ..OverlayConfig::default()
        };
        let period = config.vehicle_poll_interval();

        let task = tokio::spawn(poll_vehicles(source.clone(), handle, period, shutdown_rx));

        for _ in 0..3 {
            let (kind, outcome) = next_snapshot(&mut rx).await;
            assert_eq!(kind, EntityKind::Vehicle);
            assert!(outcome.is_err());
        }

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
        assert!(source.calls.load(Ordering::SeqCst) >= 3);
    }
}

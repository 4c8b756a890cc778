//! Change inference: diff each completed snapshot against its
//! predecessor on the same camera.
//!
//! Completion order does not match submission order (decode latencies
//! vary), so the predecessor is always re-read from the store by
//! `detected_at` at diff time; nothing relies on in-memory ordering.
//! Snapshots sharing a `detected_at` order by id.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use parkwatch_store::{NewChangeRecord, Store};
use parkwatch_types::{change_type_for, ChangeType, Snapshot, SpaceState};

use crate::Result;

/// Backoff schedule for transient store failures.
const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(3),
    Duration::from_secs(9),
];

#[derive(Clone)]
pub struct ChangeEngine {
    store: Arc<Store>,
}

/// Spawn the change worker; it drains snapshot ids until every sender
/// is dropped.
pub fn start(store: Arc<Store>, mut rx: mpsc::Receiver<i64>) -> tokio::task::JoinHandle<()> {
    let engine = ChangeEngine { store };
    tokio::spawn(async move {
        while let Some(snapshot_id) = rx.recv().await {
            engine.process_with_retries(snapshot_id).await;
        }
        debug!("change engine input closed");
    })
}

impl ChangeEngine {
    pub fn new(store: Arc<Store>) -> Self {
        ChangeEngine { store }
    }

    async fn process_with_retries(&self, snapshot_id: i64) {
        for (i, delay) in RETRY_DELAYS.iter().enumerate() {
            match self.process_blocking(snapshot_id).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(snapshot_id, attempt = i + 1, "change write failed: {e}");
                    tokio::time::sleep(*delay).await;
                }
            }
        }
        match self.process_blocking(snapshot_id).await {
            Ok(()) => {}
            Err(e) => {
                // The snapshot stays queryable; its change_count keeps
                // the default 0 and no change rows exist.
                error!(snapshot_id, "abandoning change inference: {e}");
            }
        }
    }

    /// [ChangeEngine::process] on the blocking pool; the store reads
    /// and the change transaction must not pin a runtime worker.
    async fn process_blocking(&self, snapshot_id: i64) -> Result<()> {
        let engine = self.clone();
        tokio::task::spawn_blocking(move || engine.process(snapshot_id)).await?
    }

    /// One inference pass. Idempotent: a snapshot that already has
    /// change rows is skipped.
    pub fn process(&self, snapshot_id: i64) -> Result<()> {
        let Some(snapshot) = self.store.get_snapshot(snapshot_id)? else {
            warn!(snapshot_id, "change job for unknown snapshot");
            return Ok(());
        };
        if self.store.has_changes(snapshot_id)? {
            debug!(snapshot_id, "changes already written; skipping");
            return Ok(());
        }
        let states = self.store.space_states(snapshot_id)?;
        let prev = self.store.previous_snapshot(&snapshot)?;

        let (rows, change_count) = match &prev {
            None => first_snapshot_rows(&states),
            Some(prev) => {
                let prev_states = self.store.space_states(prev.id)?;
                diff_rows(prev, &prev_states, &states)
            }
        };

        self.store.write_changes(&snapshot, change_count, &rows)?;
        debug!(
            snapshot_id,
            combo = %snapshot.channel,
            changes = change_count,
            "change inference written"
        );
        Ok(())
    }
}

/// The first snapshot of a combo: every space gets a row with no
/// previous state and no change type.
fn first_snapshot_rows(states: &[SpaceState]) -> (Vec<NewChangeRecord>, u32) {
    let rows = states
        .iter()
        .map(|s| NewChangeRecord {
            prev_snapshot_id: None,
            space_id: s.space_id.clone(),
            prev_occupied: None,
            curr_occupied: s.occupied,
            change_type: None,
            detection_confidence: s.confidence,
        })
        .collect();
    (rows, 0)
}

fn diff_rows(
    prev: &Snapshot,
    prev_states: &[SpaceState],
    curr_states: &[SpaceState],
) -> (Vec<NewChangeRecord>, u32) {
    let mut rows = Vec::with_capacity(curr_states.len());
    let mut change_count = 0u32;
    for curr in curr_states {
        // A space absent from the previous snapshot diffs as unknown
        // prior state.
        let prev_occupied = prev_states
            .iter()
            .find(|p| p.space_id == curr.space_id)
            .and_then(|p| p.occupied);
        let change_type = change_type_for(prev_occupied, curr.occupied);
        if matches!(
            change_type,
            Some(ChangeType::Arrive) | Some(ChangeType::Leave) | Some(ChangeType::Unknown)
        ) {
            change_count += 1;
        }
        rows.push(NewChangeRecord {
            prev_snapshot_id: Some(prev.id),
            space_id: curr.space_id.clone(),
            prev_occupied,
            curr_occupied: curr.occupied,
            change_type,
            detection_confidence: curr.confidence,
        });
    }
    (rows, change_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use parkwatch_store::{NewSnapshot, NewSpaceState, NewTask, NewTaskConfig};
    use parkwatch_types::ChannelCode;

    fn chan() -> ChannelCode {
        ChannelCode::parse("c1").unwrap()
    }

    fn seed_tasks(store: &Store, n: u32) {
        let cfg = NewTaskConfig {
            date: "2025-12-19".into(),
            rtsp_base: "rtsp://u:p@10.0.0.1:554".into(),
            channel: chan(),
            interval_minutes: 10,
            day_start_ts: 0,
            day_end_ts: 86399,
        };
        let tasks: Vec<NewTask> = (0..n)
            .map(|i| {
                let start = (i as i64) * 600;
                NewTask {
                    date: "2025-12-19".into(),
                    index: i,
                    start_ts: start,
                    end_ts: start + 599,
                    rtsp_url: format!("rtsp://u:p@10.0.0.1:554/c1/b{start}/e{}/replay/s1", start + 599),
                    ip: "10.0.0.1".into(),
                    channel: chan(),
                }
            })
            .collect();
        store.insert_plan(&cfg, &tasks, Utc::now()).unwrap();
    }

    /// Complete one task with the given space states at the given
    /// detection time and return its snapshot id.
    fn complete(store: &Store, task_id: i64, at_ms: i64, states: &[(&str, Option<bool>, Option<f64>)]) -> i64 {
        let now = Utc::now();
        store.claim_task(task_id, now).unwrap().unwrap();
        let states: Vec<NewSpaceState> = states
            .iter()
            .map(|(id, occ, conf)| NewSpaceState {
                space_id: (*id).into(),
                occupied: *occ,
                confidence: *conf,
            })
            .collect();
        let snap = NewSnapshot {
            ip: "10.0.0.1".into(),
            channel: chan(),
            image_path: format!("2025-12-19/t{task_id}.jpg"),
            detected_image_path: format!("2025-12-19/t{task_id}_detected.jpg"),
            detected_at: Utc.timestamp_millis_opt(at_ms).unwrap(),
        };
        store
            .complete_task(task_id, &snap.image_path.clone(), &snap, &states, now)
            .unwrap()
            .unwrap()
    }

    #[test]
    fn first_snapshot_emits_null_changes() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        seed_tasks(&store, 1);
        let s1 = complete(&store, 1, 1000, &[("A", Some(false), Some(0.9)), ("B", None, None)]);

        ChangeEngine::new(store.clone()).process(s1).unwrap();

        let snap = store.get_snapshot(s1).unwrap().unwrap();
        assert_eq!(snap.change_count, 0);
        let rows = store.changes_for_snapshot(s1).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.change_type.is_none()));
        assert!(rows.iter().all(|r| r.prev_snapshot_id.is_none()));
        assert!(rows.iter().all(|r| r.prev_occupied.is_none()));
    }

    #[test]
    fn arrival_between_consecutive_snapshots() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        seed_tasks(&store, 2);
        let engine = ChangeEngine::new(store.clone());

        let s1 = complete(&store, 1, 1000, &[("A", Some(false), Some(0.9))]);
        engine.process(s1).unwrap();
        let s2 = complete(&store, 2, 2000, &[("A", Some(true), Some(0.8))]);
        engine.process(s2).unwrap();

        let snap2 = store.get_snapshot(s2).unwrap().unwrap();
        assert_eq!(snap2.change_count, 1);
        let rows = store.changes_for_snapshot(s2).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].change_type, Some(ChangeType::Arrive));
        assert_eq!(rows[0].prev_snapshot_id, Some(s1));
        assert_eq!(rows[0].prev_occupied, Some(false));
        assert_eq!(rows[0].curr_occupied, Some(true));
    }

    #[test]
    fn unknown_prior_state_yields_unknown_change() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        seed_tasks(&store, 2);
        let engine = ChangeEngine::new(store.clone());

        let s1 = complete(&store, 1, 1000, &[("A", None, None)]);
        engine.process(s1).unwrap();
        let s2 = complete(&store, 2, 2000, &[("A", Some(true), Some(0.7))]);
        engine.process(s2).unwrap();

        let rows = store.changes_for_snapshot(s2).unwrap();
        assert_eq!(rows[0].change_type, Some(ChangeType::Unknown));
        assert_eq!(store.get_snapshot(s2).unwrap().unwrap().change_count, 1);
    }

    #[test]
    fn no_transition_between_equal_known_states() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        seed_tasks(&store, 2);
        let engine = ChangeEngine::new(store.clone());

        let s1 = complete(&store, 1, 1000, &[("A", Some(true), Some(0.9))]);
        engine.process(s1).unwrap();
        let s2 = complete(&store, 2, 2000, &[("A", Some(true), Some(0.95))]);
        engine.process(s2).unwrap();

        let rows = store.changes_for_snapshot(s2).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].change_type, None);
        assert_eq!(store.get_snapshot(s2).unwrap().unwrap().change_count, 0);
    }

    #[test]
    fn diff_uses_detected_at_order_not_completion_order() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        seed_tasks(&store, 3);
        let engine = ChangeEngine::new(store.clone());

        // Tasks complete out of order: the later window finishes first.
        let s_late = complete(&store, 2, 3000, &[("A", Some(true), Some(0.9))]);
        let s_early = complete(&store, 1, 1000, &[("A", Some(false), Some(0.9))]);
        engine.process(s_late).unwrap();
        engine.process(s_early).unwrap();

        // The late snapshot's predecessor is the early one.
        let rows = store.changes_for_snapshot(s_late).unwrap();
        assert_eq!(rows[0].prev_snapshot_id, Some(s_early));
        assert_eq!(rows[0].change_type, Some(ChangeType::Arrive));

        // The early snapshot had no predecessor.
        let rows = store.changes_for_snapshot(s_early).unwrap();
        assert!(rows[0].prev_snapshot_id.is_none());
    }

    #[test]
    fn reprocessing_is_idempotent() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        seed_tasks(&store, 1);
        let engine = ChangeEngine::new(store.clone());
        let s1 = complete(&store, 1, 1000, &[("A", Some(true), Some(0.9))]);
        engine.process(s1).unwrap();
        engine.process(s1).unwrap();
        assert_eq!(store.changes_for_snapshot(s1).unwrap().len(), 1);
    }
}

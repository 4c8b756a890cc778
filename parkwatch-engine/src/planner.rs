//! Expands a per-day capture plan into discrete window tasks.
//!
//! Planning is idempotent: the window set for a given `(day, base,
//! channel, interval)` is fully determined, and persistence goes
//! through insert-or-ignore against the storage-level unique keys, so
//! concurrent planners converge on the same rows.

use chrono::{DateTime, Utc};
use tracing::debug;

use parkwatch_store::{NewTask, NewTaskConfig, PlanStats, Store};
use parkwatch_types::{parse_day, day_bounds, ChannelCode, ReplayUrl, RtspBase};

use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct PlanRequest {
    /// Wall date `YYYY-MM-DD`.
    pub day: String,
    pub base_rtsp: String,
    pub channel: ChannelCode,
    pub interval_minutes: u32,
}

/// Materialize the task rows for one day plan.
pub fn plan(
    store: &Store,
    zone: chrono_tz::Tz,
    req: &PlanRequest,
    now: DateTime<Utc>,
) -> Result<PlanStats> {
    if !(1..=1440).contains(&req.interval_minutes) {
        return Err(Error::InvalidInput(format!(
            "interval_minutes {} out of range 1..=1440",
            req.interval_minutes
        )));
    }
    let base = RtspBase::parse(&req.base_rtsp)
        .map_err(|e| Error::InvalidInput(e.to_string()))?;
    let day = parse_day(&req.day).map_err(|e| Error::InvalidInput(e.to_string()))?;
    let (day_start, day_end) = day_bounds(day, zone)?;

    let step = req.interval_minutes as i64 * 60;
    let mut tasks = Vec::new();
    let mut index = 0u32;
    loop {
        let start = day_start + index as i64 * step;
        if start >= day_end {
            break;
        }
        let end = (start + step - 1).min(day_end);
        let rtsp_url = ReplayUrl::build(&req.base_rtsp, &req.channel, start, end)?;
        tasks.push(NewTask {
            date: req.day.clone(),
            index,
            start_ts: start,
            end_ts: end,
            rtsp_url,
            ip: base.host.clone(),
            channel: req.channel.clone(),
        });
        index += 1;
    }

    let cfg = NewTaskConfig {
        date: req.day.clone(),
        rtsp_base: req.base_rtsp.clone(),
        channel: req.channel.clone(),
        interval_minutes: req.interval_minutes,
        day_start_ts: day_start,
        day_end_ts: day_end,
    };
    let stats = store.insert_plan(&cfg, &tasks, now)?;
    debug!(
        day = %req.day,
        base = %base.redacted(),
        channel = %req.channel,
        created = stats.created,
        existing = stats.existing,
        "planned day"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parkwatch_store::TaskFilter;

    fn request() -> PlanRequest {
        PlanRequest {
            day: "2025-12-19".into(),
            base_rtsp: "rtsp://u:p@10.0.0.1:554".into(),
            channel: ChannelCode::parse("c1").unwrap(),
            interval_minutes: 10,
        }
    }

    #[test]
    fn full_day_at_ten_minutes_is_144_windows() {
        let store = Store::open_in_memory().unwrap();
        let zone = chrono_tz::Asia::Shanghai;
        let stats = plan(&store, zone, &request(), Utc::now()).unwrap();
        assert_eq!(stats.created, 144);
        assert_eq!(stats.existing, 0);
        assert_eq!(stats.total, 144);

        let page = store
            .list_tasks(&TaskFilter {
                page_size: 200,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.total, 144);

        let first = &page.items[0];
        // 2025-12-19 00:00 Asia/Shanghai.
        assert_eq!(first.index, 0);
        assert_eq!(first.start_ts, 1766073600);
        assert_eq!(first.end_ts, 1766073600 + 599);
        assert_eq!(
            first.rtsp_url,
            format!(
                "rtsp://u:p@10.0.0.1:554/c1/b{}/e{}/replay/s1",
                first.start_ts, first.end_ts
            )
        );
        assert_eq!(first.ip, "10.0.0.1");

        let last = &page.items[143];
        assert_eq!(last.end_ts, 1766073600 + 86399);
    }

    #[test]
    fn coverage_has_no_gaps_or_overlaps() {
        let store = Store::open_in_memory().unwrap();
        let zone = chrono_tz::Asia::Shanghai;
        let req = PlanRequest {
            interval_minutes: 420, // does not divide the day evenly
            ..request()
        };
        plan(&store, zone, &req, Utc::now()).unwrap();

        let page = store
            .list_tasks(&TaskFilter {
                page_size: 500,
                ..Default::default()
            })
            .unwrap();
        let mut expected_start = 1766073600i64;
        for t in &page.items {
            assert_eq!(t.start_ts, expected_start);
            assert!(t.end_ts - t.start_ts <= 420 * 60);
            expected_start = t.end_ts + 1;
        }
        // The final window is clipped to the day end.
        assert_eq!(expected_start, 1766073600 + 86400);
    }

    #[test]
    fn replanning_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let zone = chrono_tz::Asia::Shanghai;
        plan(&store, zone, &request(), Utc::now()).unwrap();
        let again = plan(&store, zone, &request(), Utc::now()).unwrap();
        assert_eq!(again.created, 0);
        assert_eq!(again.existing, 144);
    }

    #[test]
    fn rejects_bad_input_without_writes() {
        let store = Store::open_in_memory().unwrap();
        let zone = chrono_tz::Asia::Shanghai;

        let bad_interval = PlanRequest {
            interval_minutes: 0,
            ..request()
        };
        assert!(matches!(
            plan(&store, zone, &bad_interval, Utc::now()),
            Err(Error::InvalidInput(_))
        ));

        let bad_base = PlanRequest {
            base_rtsp: "http://10.0.0.1:80".into(),
            ..request()
        };
        assert!(matches!(
            plan(&store, zone, &bad_base, Utc::now()),
            Err(Error::InvalidInput(_))
        ));

        let page = store.list_tasks(&TaskFilter::default()).unwrap();
        assert_eq!(page.total, 0);
    }
}

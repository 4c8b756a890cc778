//! Work discovery: auto-rule firing, explicit run-now, and reruns.
//!
//! Auto rules are polled on a fixed tick. Firing is deduplicated per
//! `(rule, wall minute)` through a conditional update on the rule row,
//! so two scheduler instances sharing a store fire a rule at most once
//! per minute.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use parkwatch_store::{PlanStats, Store};
use parkwatch_types::{AutoRule, ChannelCode, ExecutionStatus, RtspBase, TaskStatus, DAY_FORMAT};

use crate::planner::{plan, PlanRequest};
use crate::{EngineConfig, Error, ExecutionEngine, Result};

#[derive(Debug, Clone)]
pub enum RerunTarget {
    Task(i64),
    Matching {
        date: String,
        ip: Option<String>,
        channel: Option<ChannelCode>,
    },
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct RunNowOutcome {
    pub plan: PlanStats,
    pub submitted: usize,
}

#[derive(Clone)]
pub struct Scheduler {
    store: Arc<Store>,
    engine: ExecutionEngine,
    cfg: EngineConfig,
}

impl Scheduler {
    pub fn new(store: Arc<Store>, engine: ExecutionEngine, cfg: EngineConfig) -> Self {
        Scheduler { store, engine, cfg }
    }

    /// Explicit run-now: materialize the plan, then submit every task
    /// matching the predicate that is not currently running.
    pub async fn run_now(&self, req: &PlanRequest) -> Result<RunNowOutcome> {
        let stats = self.plan_blocking(req.clone()).await?;
        let ip = RtspBase::parse(&req.base_rtsp)
            .map_err(|e| Error::InvalidInput(e.to_string()))?
            .host;
        let ids = {
            let day = req.day.clone();
            let channel = req.channel.clone();
            self.store
                .clone()
                .run(move |s| {
                    s.task_ids_by(
                        &day,
                        Some(&ip),
                        Some(&channel),
                        &[
                            TaskStatus::Pending,
                            TaskStatus::Failed,
                            TaskStatus::ScreenshotTaken,
                        ],
                    )
                })
                .await?
        };
        let submitted = self.engine.submit_all(&ids).await?;
        Ok(RunNowOutcome {
            plan: stats,
            submitted,
        })
    }

    /// [planner::plan] on the blocking pool; the expansion writes one
    /// transaction of up to 1440 rows.
    async fn plan_blocking(&self, req: PlanRequest) -> Result<PlanStats> {
        let store = self.store.clone();
        let zone = self.cfg.wall_timezone;
        tokio::task::spawn_blocking(move || plan(&store, zone, &req, Utc::now())).await?
    }

    /// Reset matching tasks to `pending` (skipping any that are
    /// `playing`) and submit them. Returns the re-armed ids.
    pub async fn rerun(&self, target: &RerunTarget) -> Result<Vec<i64>> {
        let ids = match target {
            RerunTarget::Task(id) => {
                let id = *id;
                let rearmed = self
                    .store
                    .clone()
                    .run(move |s| s.rearm_task(id, Utc::now()))
                    .await?;
                if rearmed {
                    vec![id]
                } else {
                    Vec::new()
                }
            }
            RerunTarget::Matching { date, ip, channel } => {
                let date = date.clone();
                let ip = ip.clone();
                let channel = channel.clone();
                self.store
                    .clone()
                    .run(move |s| {
                        s.rearm_matching(&date, ip.as_deref(), channel.as_ref(), Utc::now())
                    })
                    .await?
            }
        };
        self.engine.submit_all(&ids).await?;
        Ok(ids)
    }

    /// One auto-rule pass for the given instant. Public so the tick
    /// loop and tests share the same path.
    pub async fn fire_due_rules(&self, now: DateTime<Utc>) -> Result<()> {
        let wall = now.with_timezone(&self.cfg.wall_timezone);
        let hhmm = wall.format("%H:%M").to_string();
        let minute_start = now - chrono::Duration::milliseconds(now.timestamp_millis().rem_euclid(60_000));

        let rules = self.store.clone().run(|s| s.enabled_rules()).await?;
        for rule in rules {
            if rule.trigger_time != hhmm {
                continue;
            }
            let rule_id = rule.id;
            let fired = self
                .store
                .clone()
                .run(move |s| s.rule_begin_firing(rule_id, now, minute_start))
                .await?;
            if !fired {
                debug!(rule_id, "rule already fired this minute");
                continue;
            }
            info!(rule_id, trigger = %hhmm, "auto rule firing");
            match self.fire_rule(&rule, &wall).await {
                Ok(submitted) => {
                    debug!(rule_id, submitted, "auto rule done");
                    self.store
                        .clone()
                        .run(move |s| {
                            s.rule_finish_firing(rule_id, ExecutionStatus::Success, None)
                        })
                        .await?;
                }
                Err(e) => {
                    warn!(rule_id, "auto rule failed: {e}");
                    let message = e.to_string();
                    self.store
                        .clone()
                        .run(move |s| {
                            s.rule_finish_firing(
                                rule_id,
                                ExecutionStatus::Failed,
                                Some(&message),
                            )
                        })
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn fire_rule(
        &self,
        rule: &AutoRule,
        wall: &DateTime<chrono_tz::Tz>,
    ) -> Result<usize> {
        let day = if rule.use_today {
            wall.format(DAY_FORMAT).to_string()
        } else {
            rule.custom_date
                .clone()
                .ok_or_else(|| Error::InvalidInput("rule has neither use_today nor custom_date".into()))?
        };
        let req = PlanRequest {
            day,
            base_rtsp: rule.base_rtsp.clone(),
            channel: rule.channel.clone(),
            interval_minutes: rule.interval_minutes,
        };
        self.plan_blocking(req.clone()).await?;
        let ip = RtspBase::parse(&rule.base_rtsp)
            .map_err(|e| Error::InvalidInput(e.to_string()))?
            .host;
        let ids = {
            let channel = rule.channel.clone();
            self.store
                .clone()
                .run(move |s| {
                    s.task_ids_by(&req.day, Some(&ip), Some(&channel), &[TaskStatus::Pending])
                })
                .await?
        };
        self.engine.submit_all(&ids).await
    }

    /// Background loops: the 30 s auto-rule tick and the
    /// stuck-`playing` reaper. Both exit when `shutdown` flips.
    pub fn spawn_loops(
        &self,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let rule_loop = {
            let scheduler = self.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(scheduler.cfg.rule_tick);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = tick.tick() => {
                            if let Err(e) = scheduler.fire_due_rules(Utc::now()).await {
                                error!("auto rule tick failed: {e}");
                            }
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            })
        };

        let reaper_loop = {
            let scheduler = self.clone();
            let mut shutdown = shutdown;
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(scheduler.cfg.reaper_tick);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = tick.tick() => {
                            let sweep = scheduler
                                .store
                                .clone()
                                .run(|s| s.sweep_stuck_playing(Utc::now()))
                                .await;
                            match sweep {
                                Ok(ids) if !ids.is_empty() => {
                                    warn!(?ids, "swept stuck playing tasks to failed");
                                }
                                Ok(_) => {}
                                Err(e) => error!("stuck-playing sweep failed: {e}"),
                            }
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            })
        };

        vec![rule_loop, reaper_loop]
    }
}

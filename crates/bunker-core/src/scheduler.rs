//! Periodic trigger for backup runs.
//!
//! The backup core itself is imperative (`BackupService::run`); this module
//! is the injected scheduling collaborator that drives it on the configured
//! cron cadence. Overlap protection lives in `BackupService`, not here.

use std::{collections::BTreeSet, sync::Arc};

use chrono::{DateTime, Datelike, Local, Timelike};
use tokio::{task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{archive::BackupService, config::Config, errors::Error, Result};

pub struct BackupScheduler {
    service: Arc<BackupService>,
    entries: Vec<(String, CronExpr)>,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl BackupScheduler {
    /// Validate every configured schedule up front; a typo in one cron
    /// expression is a config error, not a silently dead job.
    pub fn new(cfg: &Config, service: Arc<BackupService>) -> Result<Self> {
        let mut entries = Vec::new();
        for schedule in &cfg.schedules {
            let expr = CronExpr::parse(&schedule.cron).map_err(|e| {
                Error::Config(format!("schedule for {}: {e}", schedule.strategy))
            })?;
            entries.push((schedule.strategy.clone(), expr));
        }
        Ok(Self {
            service,
            entries,
            cancel: CancellationToken::new(),
            handles: Vec::new(),
        })
    }

    /// Spawn one timer task per schedule entry. Returns the job count.
    pub fn start(&mut self) -> usize {
        for (strategy, expr) in self.entries.clone() {
            let service = self.service.clone();
            let cancel = self.cancel.clone();
            self.handles.push(tokio::spawn(async move {
                job_loop(service, strategy, expr, cancel).await;
            }));
        }
        info!(jobs = self.handles.len(), "backup scheduler started");
        self.handles.len()
    }

    pub fn stop(&mut self) {
        self.cancel.cancel();
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

async fn job_loop(
    service: Arc<BackupService>,
    strategy: String,
    expr: CronExpr,
    cancel: CancellationToken,
) {
    loop {
        let Some(next) = expr.next_after(Local::now()) else {
            warn!(strategy = %strategy, "schedule has no next run, stopping job");
            return;
        };
        let wait = (next - Local::now()).to_std().unwrap_or_default();

        tokio::select! {
          _ = cancel.cancelled() => return,
          _ = sleep(wait) => {
            if let Err(e) = service.run(&strategy).await {
              error!(strategy = %strategy, error = %e, "scheduled backup cycle failed");
            }
          }
        }
    }
}

// === Cron expressions (5-field: min hour dom mon dow) ===

#[derive(Clone, Debug)]
struct CronField {
    /// True when the field covers its whole domain (needed for the standard
    /// dom/dow either-matches rule).
    any: bool,
    allowed: BTreeSet<u32>,
}

impl CronField {
    fn parse(raw: &str, min: u32, max: u32) -> Result<Self> {
        let mut allowed = BTreeSet::new();

        for part in raw.trim().split(',') {
            let part = part.trim();
            if part.is_empty() {
                return Err(Error::Config(format!("empty cron field part in {raw:?}")));
            }

            let (range, step) = match part.split_once('/') {
                Some((r, s)) => {
                    let step = s
                        .trim()
                        .parse::<u32>()
                        .map_err(|_| Error::Config(format!("invalid cron step: {s}")))?;
                    if step == 0 {
                        return Err(Error::Config("cron step must be > 0".to_string()));
                    }
                    (r.trim(), step)
                }
                None => (part, 1),
            };

            let (start, end) = if range == "*" {
                (min, max)
            } else if let Some((a, b)) = range.split_once('-') {
                (parse_num(a)?, parse_num(b)?)
            } else {
                let v = parse_num(range)?;
                // "5/2" means "every 2 starting at 5".
                if part.contains('/') {
                    (v, max)
                } else {
                    (v, v)
                }
            };

            if start < min || end > max || start > end {
                return Err(Error::Config(format!(
                    "cron value out of range {min}-{max}: {part}"
                )));
            }

            let mut v = start;
            while v <= end {
                allowed.insert(v);
                v += step;
            }
        }

        let any = (min..=max).all(|v| allowed.contains(&v));
        Ok(Self { any, allowed })
    }

    fn contains(&self, v: u32) -> bool {
        self.allowed.contains(&v)
    }
}

fn parse_num(s: &str) -> Result<u32> {
    s.trim()
        .parse::<u32>()
        .map_err(|_| Error::Config(format!("invalid cron number: {s}")))
}

#[derive(Clone, Debug)]
pub struct CronExpr {
    minute: CronField,
    hour: CronField,
    dom: CronField,
    month: CronField,
    dow: CronField,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(Error::Config(format!(
                "expected 5 cron fields, got {}",
                parts.len()
            )));
        }

        // Sunday may be written as 0 or 7; fold 7 into 0 after parsing.
        let mut dow = CronField::parse(parts[4], 0, 7)?;
        if dow.allowed.remove(&7) {
            dow.allowed.insert(0);
        }
        dow.any = (0..=6).all(|v| dow.allowed.contains(&v));

        Ok(Self {
            minute: CronField::parse(parts[0], 0, 59)?,
            hour: CronField::parse(parts[1], 0, 23)?,
            dom: CronField::parse(parts[2], 1, 31)?,
            month: CronField::parse(parts[3], 1, 12)?,
            dow,
        })
    }

    fn matches(&self, dt: DateTime<Local>) -> bool {
        if !self.minute.contains(dt.minute())
            || !self.hour.contains(dt.hour())
            || !self.month.contains(dt.month())
        {
            return false;
        }

        // Standard cron rule: when both dom and dow are restricted, either
        // one matching is enough.
        let dom_match = self.dom.contains(dt.day());
        let dow_match = self.dow.contains(dt.weekday().num_days_from_sunday());
        match (self.dom.any, self.dow.any) {
            (true, true) => true,
            (true, false) => dow_match,
            (false, true) => dom_match,
            (false, false) => dom_match || dow_match,
        }
    }

    /// Next matching minute boundary strictly after `now`. Capped at one
    /// year of minutes so an impossible expression terminates.
    pub fn next_after(&self, now: DateTime<Local>) -> Option<DateTime<Local>> {
        let mut t = (now + chrono::Duration::minutes(1))
            .with_second(0)?
            .with_nanosecond(0)?;

        for _ in 0..366 * 24 * 60 {
            if self.matches(t) {
                return Some(t);
            }
            t += chrono::Duration::minutes(1);
        }
        None
    }
}

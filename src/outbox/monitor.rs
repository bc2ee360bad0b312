//! Outbox health monitoring.
//!
//! Aggregates status counts into a 0–100 health score and raises alerts at
//! configurable thresholds. DLQ saturation beyond the alert threshold is the
//! coordinator's cue to shut down.

use std::collections::HashMap;

use anyhow::Result;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::warn;

use crate::outbox::OutboxStatus;
use crate::store::repos::OutboxRepository;

#[derive(Debug, Clone, Serialize)]
pub struct OutboxStats {
    pub status_counts: HashMap<String, u64>,
    pub total_events: u64,
    pub oldest_pending_age_secs: Option<f64>,
    pub health_score: f64,
}

#[derive(Debug, Clone)]
pub struct OutboxAlertConfig {
    /// Alert when the health score drops below this.
    pub min_health_score: f64,
    /// Alert when the DLQ grows past this.
    pub max_dead_letter: u64,
    /// Alert when this many events sit pending.
    pub max_pending: u64,
}

impl Default for OutboxAlertConfig {
    fn default() -> Self {
        Self {
            min_health_score: 50.0,
            max_dead_letter: 10,
            max_pending: 500,
        }
    }
}

#[derive(Clone)]
pub struct OutboxMonitor {
    repo: OutboxRepository,
    alert_config: OutboxAlertConfig,
}

impl OutboxMonitor {
    pub fn new(repo: OutboxRepository, alert_config: OutboxAlertConfig) -> Self {
        Self { repo, alert_config }
    }

    pub async fn stats(&self, now: Decimal) -> Result<OutboxStats> {
        let mut status_counts = HashMap::new();
        for status in OutboxStatus::ALL {
            let count = self.repo.count_by_status(status).await?;
            status_counts.insert(status.as_str().to_string(), count);
        }
        let total_events: u64 = status_counts.values().sum();

        let oldest_pending_age_secs = self
            .repo
            .oldest_pending_created_at()
            .await?
            .map(|created| (now.to_f64().unwrap_or(0.0) - created).max(0.0));

        let health_score = health_score(&status_counts, total_events, oldest_pending_age_secs);

        Ok(OutboxStats {
            status_counts,
            total_events,
            oldest_pending_age_secs,
            health_score,
        })
    }

    /// Evaluate alert conditions; each returned string was also logged.
    pub async fn check_alerts(&self, now: Decimal) -> Result<Vec<String>> {
        let stats = self.stats(now).await?;
        let mut alerts = Vec::new();

        if stats.health_score < self.alert_config.min_health_score {
            alerts.push(format!(
                "outbox health score {:.1} below threshold {:.1}",
                stats.health_score, self.alert_config.min_health_score
            ));
        }

        let dead_letter = stats.status_counts.get("dead_letter").copied().unwrap_or(0);
        if dead_letter > self.alert_config.max_dead_letter {
            alerts.push(format!(
                "dead letter queue has {dead_letter} events (threshold {})",
                self.alert_config.max_dead_letter
            ));
        }

        let pending = stats.status_counts.get("pending").copied().unwrap_or(0);
        if pending > self.alert_config.max_pending {
            alerts.push(format!(
                "{pending} pending outbox events (threshold {})",
                self.alert_config.max_pending
            ));
        }

        for alert in &alerts {
            warn!(alert = %alert, "outbox alert");
        }
        Ok(alerts)
    }

    /// DLQ past its alert threshold; treated as fatal by the coordinator.
    pub async fn dead_letter_saturated(&self) -> Result<bool> {
        let dead_letter = self.repo.count_by_status(OutboxStatus::DeadLetter).await?;
        Ok(dead_letter > self.alert_config.max_dead_letter)
    }
}

/// 0–100. Penalises failure ratio (×30), DLQ ratio (×50), oldest-pending age
/// (1 point per minute, capped at 30) and a pending ratio above 10%.
fn health_score(
    status_counts: &HashMap<String, u64>,
    total: u64,
    oldest_pending_age_secs: Option<f64>,
) -> f64 {
    if total == 0 {
        return 100.0;
    }
    let count = |key: &str| status_counts.get(key).copied().unwrap_or(0) as f64;
    let total = total as f64;

    let mut score = 100.0;
    score -= (count("failed") / total) * 30.0;
    score -= (count("dead_letter") / total) * 50.0;
    score -= oldest_pending_age_secs
        .map(|age| (age / 60.0).min(30.0))
        .unwrap_or(0.0);

    let pending_ratio = count("pending") / total;
    if pending_ratio > 0.1 {
        score -= (pending_ratio - 0.1) * 100.0;
    }

    score.clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(pending: u64, failed: u64, dead: u64, completed: u64) -> (HashMap<String, u64>, u64) {
        let mut map = HashMap::new();
        map.insert("pending".to_string(), pending);
        map.insert("processing".to_string(), 0);
        map.insert("completed".to_string(), completed);
        map.insert("failed".to_string(), failed);
        map.insert("dead_letter".to_string(), dead);
        let total = pending + failed + dead + completed;
        (map, total)
    }

    #[test]
    fn empty_outbox_is_perfectly_healthy() {
        let (map, total) = counts(0, 0, 0, 0);
        assert_eq!(health_score(&map, total, None), 100.0);
    }

    #[test]
    fn failures_and_dead_letters_penalise() {
        let (map, total) = counts(0, 5, 0, 5);
        // failed ratio 0.5 -> -15
        assert_eq!(health_score(&map, total, None), 85.0);

        let (map, total) = counts(0, 0, 5, 5);
        // dead letter ratio 0.5 -> -25
        assert_eq!(health_score(&map, total, None), 75.0);
    }

    #[test]
    fn old_pending_events_penalise_up_to_30() {
        let (map, total) = counts(1, 0, 0, 99);
        let fresh = health_score(&map, total, Some(60.0));
        let stale = health_score(&map, total, Some(7200.0));
        assert!(fresh > stale);
        assert_eq!(stale, 70.0);
    }

    #[test]
    fn pending_backlog_penalises_above_10_percent() {
        let (map, total) = counts(50, 0, 0, 50);
        // pending ratio 0.5 -> -(0.4 * 100) = -40
        assert_eq!(health_score(&map, total, None), 60.0);

        let (map, total) = counts(5, 0, 0, 95);
        // ratio 0.05, under the 10% knee.
        assert_eq!(health_score(&map, total, None), 100.0);
    }

    #[test]
    fn score_clamps_at_zero() {
        let (map, total) = counts(100, 0, 0, 0);
        let score = health_score(&map, total, Some(1e9));
        assert!(score >= 0.0);
    }
}

//! Balance tracking.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::account::{parse_decimal_field, Balance, BalanceUpdateReason};
use crate::clock::Clock;
use crate::events::BalanceEvent;
use crate::store::repos::BalanceRepository;

/// Total changes smaller than this are not worth a log line.
fn change_log_threshold() -> Decimal {
    Decimal::new(1, 3)
}

/// Maintains the in-memory balance map, persists every change, and fans
/// updates out to subscribers. The mutex makes this the only writer.
pub struct BalanceTracker {
    repo: BalanceRepository,
    clock: Arc<dyn Clock>,
    balances: Mutex<HashMap<String, Balance>>,
    balance_tx: broadcast::Sender<BalanceEvent>,
}

impl BalanceTracker {
    pub fn new(
        repo: BalanceRepository,
        clock: Arc<dyn Clock>,
        balance_tx: broadcast::Sender<BalanceEvent>,
    ) -> Self {
        Self {
            repo,
            clock,
            balances: Mutex::new(HashMap::new()),
            balance_tx,
        }
    }

    /// Seed the in-memory map from the store on startup.
    pub async fn load_initial(&self) -> Result<usize> {
        let rows = self.repo.get_all_balances().await?;
        let mut balances = self.balances.lock().await;
        for balance in rows {
            balances.insert(balance.asset.clone(), balance);
        }
        info!(balance_count = balances.len(), "initial balances loaded");
        Ok(balances.len())
    }

    pub async fn update_balance(
        &self,
        asset: &str,
        available: Decimal,
        locked: Decimal,
        reason: BalanceUpdateReason,
    ) {
        let mut balances = self.balances.lock().await;
        let old = balances.get(asset).cloned();

        let balance = Balance {
            asset: asset.to_string(),
            available,
            locked,
            total: available + locked,
            updated_at: self.clock.now(),
        };
        balances.insert(asset.to_string(), balance.clone());

        if let Err(e) = self.repo.update_balance(&balance).await {
            error!(asset, error = %e, "failed to persist balance");
        }

        match old {
            Some(old) => {
                let change = balance.total - old.total;
                if change.abs() > change_log_threshold() {
                    info!(
                        asset,
                        old_total = %old.total,
                        new_total = %balance.total,
                        change = %change,
                        reason = reason.as_str(),
                        "balance updated"
                    );
                }
            }
            None => {
                info!(asset, total = %balance.total, reason = reason.as_str(), "initial balance set");
            }
        }

        drop(balances);
        let _ = self.balance_tx.send(BalanceEvent { balance, reason });
    }

    /// Apply a `{asset: {available, locked}}` map from the account stream
    /// or a REST refresh.
    pub async fn update_from_snapshot(&self, balances: &Value, reason: BalanceUpdateReason) {
        let Some(map) = balances.as_object() else {
            warn!("balance snapshot is not an object, ignoring");
            return;
        };
        for (asset, entry) in map {
            let available = parse_decimal_field(entry, "available").unwrap_or(Decimal::ZERO);
            let locked = parse_decimal_field(entry, "locked").unwrap_or(Decimal::ZERO);
            self.update_balance(asset, available, locked, reason).await;
        }
    }

    pub async fn get_balance(&self, asset: &str) -> Option<Balance> {
        self.balances.lock().await.get(asset).cloned()
    }

    pub async fn get_all_balances(&self) -> HashMap<String, Balance> {
        self.balances.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::repos::Repositories;
    use crate::store::Store;
    use rust_decimal_macros::dec;
    use serde_json::json;

    async fn tracker() -> (tempfile::TempDir, BalanceTracker, broadcast::Receiver<BalanceEvent>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("bal.db")).unwrap();
        let repos = Repositories::new(store);
        let (tx, rx) = broadcast::channel(64);
        let tracker = BalanceTracker::new(
            repos.balances.clone(),
            Arc::new(ManualClock::new(dec!(1000))),
            tx,
        );
        (dir, tracker, rx)
    }

    #[tokio::test]
    async fn update_persists_and_notifies() {
        let (_dir, tracker, mut rx) = tracker().await;

        tracker
            .update_balance("ADA", dec!(900), dec!(100), BalanceUpdateReason::Initial)
            .await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.balance.asset, "ADA");
        assert_eq!(event.balance.total, dec!(1000));
        assert_eq!(event.reason, BalanceUpdateReason::Initial);

        let stored = tracker.get_balance("ADA").await.unwrap();
        assert_eq!(stored.available, dec!(900));
        assert_eq!(stored.locked, dec!(100));
    }

    #[tokio::test]
    async fn snapshot_updates_every_asset() {
        let (_dir, tracker, _rx) = tracker().await;

        tracker
            .update_from_snapshot(
                &json!({
                    "ADA": {"available": "1000", "locked": "50"},
                    "USDM": {"available": 2000.0, "locked": 0},
                }),
                BalanceUpdateReason::Adjustment,
            )
            .await;

        assert_eq!(tracker.get_balance("ADA").await.unwrap().total, dec!(1050));
        assert_eq!(tracker.get_balance("USDM").await.unwrap().total, dec!(2000));
    }

    #[tokio::test]
    async fn load_initial_restores_from_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("bal.db")).unwrap();
        let repos = Repositories::new(store);
        let clock = Arc::new(ManualClock::new(dec!(1000)));

        {
            let (tx, _rx) = broadcast::channel(64);
            let tracker = BalanceTracker::new(repos.balances.clone(), clock.clone(), tx);
            tracker
                .update_balance("ADA", dec!(123), dec!(0), BalanceUpdateReason::Initial)
                .await;
        }

        let (tx, _rx) = broadcast::channel(64);
        let tracker = BalanceTracker::new(repos.balances.clone(), clock, tx);
        assert_eq!(tracker.load_initial().await.unwrap(), 1);
        assert_eq!(tracker.get_balance("ADA").await.unwrap().available, dec!(123));
    }
}

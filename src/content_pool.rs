/// Content Pool Accessor
///
/// Given a user's level, returns the tips that can still be scheduled for
/// them: every active tip at that level minus the tips they have already
/// unlocked.
///
/// Side-effect note: `select_candidates` is a read except for one branch.
/// When fewer than three candidates remain, it resets the user's unlock
/// history for the level pool and returns the full pool, so previously
/// seen tips become eligible again. Repeats are preferred over starving
/// the daily feed; callers and tests must account for this one mutation.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::Result;
use crate::store::{Tip, UnlockStore};

pub struct ContentPool {
    store: Arc<dyn UnlockStore>,
}

impl ContentPool {
    pub fn new(store: Arc<dyn UnlockStore>) -> Self {
        Self { store }
    }

    /// Tips eligible for the user's next schedule
    pub async fn select_candidates(&self, user_id: i64, level: i32) -> Result<Vec<Tip>> {
        let pool = self.store.list_active_tips_for_level(level).await?;
        let unlocked: HashSet<i64> = self
            .store
            .list_unlocked_tip_ids(user_id, level)
            .await?
            .into_iter()
            .collect();

        let remaining: Vec<Tip> = pool
            .iter()
            .filter(|t| !unlocked.contains(&t.id))
            .cloned()
            .collect();

        if remaining.len() >= 3 {
            return Ok(remaining);
        }

        // Pool exhausted: recycle the level pool rather than run dry
        self.reset_unlock_history(user_id, level).await?;
        Ok(pool)
    }

    /// Clear the user's unlock history for one level pool
    pub async fn reset_unlock_history(&self, user_id: i64, level: i32) -> Result<()> {
        let reset = self.store.bulk_reset_interactions(user_id, level).await?;
        if reset > 0 {
            log::info!(
                "Reset unlock history for user {} at level {} ({} tips recycled)",
                user_id,
                level,
                reset
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::{TimeZone, Utc};

    fn pool_with_tips(count: i64) -> (ContentPool, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        for id in 1..=count {
            store.add_tip(Tip {
                id,
                level: 1,
                active: true,
            });
        }
        (ContentPool::new(store.clone()), store)
    }

    #[tokio::test]
    async fn unlocked_tips_are_excluded() {
        let (pool, store) = pool_with_tips(5);
        let stamp = Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap();
        store.upsert_interaction(1, 2, stamp, 1).await.unwrap();

        let candidates = pool.select_candidates(1, 1).await.unwrap();
        let ids: Vec<i64> = candidates.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![1, 3, 4, 5]);
    }

    #[tokio::test]
    async fn inactive_and_other_level_tips_never_appear() {
        let (pool, store) = pool_with_tips(3);
        store.add_tip(Tip { id: 90, level: 2, active: true });
        store.add_tip(Tip { id: 91, level: 1, active: false });

        let candidates = pool.select_candidates(1, 1).await.unwrap();
        let ids: Vec<i64> = candidates.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn exhaustion_resets_and_returns_full_pool() {
        let (pool, store) = pool_with_tips(4);
        let stamp = Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap();
        // Two unlocked leaves only two candidates, under the three needed
        store.upsert_interaction(1, 1, stamp, 1).await.unwrap();
        store.upsert_interaction(1, 2, stamp, 2).await.unwrap();

        let candidates = pool.select_candidates(1, 1).await.unwrap();
        assert_eq!(candidates.len(), 4);

        // The reset is durable: the old unlocks are gone
        let record = store.find_interaction(1, 1).await.unwrap().unwrap();
        assert!(!record.is_unlocked);
        assert_eq!(record.unlock_order, None);
    }

    #[tokio::test]
    async fn tiny_pool_comes_back_whole_after_reset() {
        let (pool, _store) = pool_with_tips(2);
        // Fewer than three tips exist at all; the accessor still answers
        let candidates = pool.select_candidates(1, 1).await.unwrap();
        assert_eq!(candidates.len(), 2);
    }

    #[tokio::test]
    async fn reset_does_not_leak_across_users() {
        let (pool, store) = pool_with_tips(4);
        let stamp = Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap();
        store.upsert_interaction(1, 1, stamp, 1).await.unwrap();
        store.upsert_interaction(1, 2, stamp, 2).await.unwrap();
        store.upsert_interaction(7, 1, stamp, 1).await.unwrap();

        // User 1 triggers the reset branch
        pool.select_candidates(1, 1).await.unwrap();

        // User 7's history is intact
        let other = store.find_interaction(7, 1).await.unwrap().unwrap();
        assert!(other.is_unlocked);
    }
}

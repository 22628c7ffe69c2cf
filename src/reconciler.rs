/// Unlock Reconciler
///
/// The core state machine of the daily feed. Given a user and "now", it
/// loads (or creates) the day's schedule, transitions every due slot from
/// pending to unlocked exactly once, records the matching interaction,
/// and emits the delta to the notification bridge.
///
/// Slot states per day: PENDING (unlocked_at none) -> UNLOCKED
/// (unlocked_at set). UNLOCKED is terminal.
///
/// Two timestamp rules coexist on purpose:
/// - Creation back-unlock stamps a slot with its *scheduled* instant, so
///   a late first open shows an on-time history (see schedule.rs)
/// - Catch-up here stamps a due slot with *now*, the moment the service
///   actually processed it
///
/// Safe under concurrent invocation for the same user: a process-wide
/// per-user lock serializes reconcile passes, and the store's upserts are
/// conflict-safe besides, so overlapping callers agree on one committed
/// unlock per slot and only one of them dispatches its notification.

use chrono::{DateTime, FixedOffset, Utc};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::SlotTime;
use crate::error::{Result, SchedulerError};
use crate::notifier::NotificationBridge;
use crate::schedule::{DailySchedule, ScheduleBuilder, UnlockSlot};
use crate::store::UnlockStore;

// One serialization lock per user, shared by every reconciler in the
// process (cron sweep and HTTP handlers included)
lazy_static! {
    static ref USER_LOCKS: Mutex<HashMap<i64, Arc<Mutex<()>>>> = Mutex::new(HashMap::new());
}

async fn lock_for_user(user_id: i64) -> Arc<Mutex<()>> {
    let mut locks = USER_LOCKS.lock().await;
    locks
        .entry(user_id)
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

/// One slot that unlocked during a reconcile pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnlockedTip {
    pub tip_id: i64,
    pub position: i32,
    pub unlocked_at: DateTime<Utc>,
}

/// What a reconcile pass changed and where the day stands now
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileOutcome {
    /// Slots unlocked by this call, in position order. Empty on a repeat
    /// call at the same instant.
    pub newly_unlocked: Vec<UnlockedTip>,

    /// Unlocked slots for the day after this pass
    pub total_unlocked: usize,

    /// Instant of the next pending slot, or tomorrow's first slot once
    /// today is done
    pub next_unlock_at: DateTime<Utc>,

    /// True only for the call that unlocked the final slot of the day
    pub completed: bool,

    /// The day's schedule after this pass, for read models
    pub schedule: DailySchedule,
}

pub struct Reconciler {
    store: Arc<dyn UnlockStore>,
    builder: ScheduleBuilder,
    notifier: Arc<dyn NotificationBridge>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn UnlockStore>,
        notifier: Arc<dyn NotificationBridge>,
        unlock_times: [SlotTime; 3],
        day_offset: FixedOffset,
    ) -> Self {
        Self {
            builder: ScheduleBuilder::new(store.clone(), unlock_times, day_offset),
            store,
            notifier,
        }
    }

    /// Bring one user's day up to date with `now`
    ///
    /// # Errors
    /// `UnknownUser`, `UserInactive` and `QuizNotCompleted` mean the user
    /// is not eligible for the feed; callers skip rather than retry.
    pub async fn reconcile(&self, user_id: i64, now: DateTime<Utc>) -> Result<ReconcileOutcome> {
        let lock = lock_for_user(user_id).await;
        let _guard = lock.lock().await;

        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or(SchedulerError::UnknownUser(user_id))?;
        if !user.active {
            return Err(SchedulerError::UserInactive(user_id));
        }
        if !user.quiz_completed {
            return Err(SchedulerError::QuizNotCompleted(user_id));
        }

        let built = self.builder.build_or_get(&user, now).await?;
        let mut schedule = built.schedule;

        // Creation-time back-unlocks are part of this call's delta
        let mut newly_unlocked: Vec<UnlockedTip> = built
            .backfilled
            .iter()
            .map(slot_to_unlocked)
            .collect();

        // Catch-up: transition every due pending slot, stamped with `now`
        let unlock_times = schedule.unlock_times;
        let mut dirty = false;
        for slot in schedule.slots.iter_mut() {
            let due = unlock_times[(slot.position - 1) as usize];
            if slot.unlocked_at.is_none() && now >= due {
                slot.unlocked_at = Some(now);
                newly_unlocked.push(slot_to_unlocked(slot));
                dirty = true;
            }
        }

        // Interactions first, then one schedule write covering the pass.
        // Both are idempotent, so a crash between them is healed by the
        // next reconcile.
        for unlocked in &newly_unlocked {
            self.store
                .upsert_interaction(user_id, unlocked.tip_id, unlocked.unlocked_at, unlocked.position)
                .await?;
        }
        if dirty {
            self.store.upsert_schedule(&schedule).await?;
        }

        // Notifications only after the unlock state committed; failures
        // are logged and swallowed
        for unlocked in &newly_unlocked {
            if let Err(e) = self
                .notifier
                .notify_tip_unlocked(user_id, unlocked.tip_id, unlocked.position)
                .await
            {
                log::warn!(
                    "Tip unlock notification failed (user {}, tip {}): {:#}",
                    user_id,
                    unlocked.tip_id,
                    e
                );
            }
        }

        // Daily completion fires only from the call that unlocked the
        // final slot; later reconciles of a finished day stay silent
        let completed = schedule.is_fully_unlocked()
            && schedule
                .final_position()
                .map(|last| newly_unlocked.iter().any(|u| u.position == last))
                .unwrap_or(false);
        if completed {
            log::info!("User {} completed their daily tips", user_id);
            if let Err(e) = self.notifier.notify_daily_completion(user_id, user.level).await {
                log::warn!("Daily completion notification failed (user {}): {:#}", user_id, e);
            }
        }

        let next_unlock_at = schedule
            .next_unlock_after(now)
            .unwrap_or_else(|| self.builder.next_day_first_unlock(schedule.day_start));

        Ok(ReconcileOutcome {
            total_unlocked: schedule.unlocked_count(),
            newly_unlocked,
            next_unlock_at,
            completed,
            schedule,
        })
    }
}

fn slot_to_unlocked(slot: &UnlockSlot) -> UnlockedTip {
    UnlockedTip {
        tip_id: slot.tip_id,
        position: slot.position,
        // Slots reaching this point are always unlocked
        unlocked_at: slot.unlocked_at.unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Tip, UserProfile};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};

    struct RecordingNotifier {
        tips: std::sync::Mutex<Vec<(i64, i64, i32)>>,
        completions: std::sync::Mutex<Vec<i64>>,
        fail: bool,
    }

    impl RecordingNotifier {
        fn new() -> Self {
            Self {
                tips: std::sync::Mutex::new(Vec::new()),
                completions: std::sync::Mutex::new(Vec::new()),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self { fail: true, ..Self::new() }
        }

        fn tip_count(&self) -> usize {
            self.tips.lock().unwrap().len()
        }

        fn completion_count(&self) -> usize {
            self.completions.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl NotificationBridge for RecordingNotifier {
        async fn notify_tip_unlocked(&self, user_id: i64, tip_id: i64, position: i32) -> anyhow::Result<()> {
            if self.fail {
                return Err(anyhow!("delivery service down"));
            }
            self.tips.lock().unwrap().push((user_id, tip_id, position));
            Ok(())
        }

        async fn notify_daily_completion(&self, user_id: i64, _level: i32) -> anyhow::Result<()> {
            if self.fail {
                return Err(anyhow!("delivery service down"));
            }
            self.completions.lock().unwrap().push(user_id);
            Ok(())
        }
    }

    fn slot_times() -> [SlotTime; 3] {
        [
            SlotTime { hour: 9, minute: 0 },
            SlotTime { hour: 14, minute: 0 },
            SlotTime { hour: 18, minute: 45 },
        ]
    }

    fn utc(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, h, m, 0).unwrap()
    }

    fn setup(user_id: i64, tip_count: i64) -> (Arc<Reconciler>, Arc<MemoryStore>, Arc<RecordingNotifier>) {
        setup_with(user_id, tip_count, Arc::new(RecordingNotifier::new()))
    }

    fn setup_with(
        user_id: i64,
        tip_count: i64,
        notifier: Arc<RecordingNotifier>,
    ) -> (Arc<Reconciler>, Arc<MemoryStore>, Arc<RecordingNotifier>) {
        let store = Arc::new(MemoryStore::new());
        store.add_user(UserProfile {
            user_id,
            level: 1,
            quiz_completed: true,
            active: true,
        });
        for id in 1..=tip_count {
            store.add_tip(Tip { id, level: 1, active: true });
        }
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            notifier.clone(),
            slot_times(),
            FixedOffset::east_opt(0).unwrap(),
        ));
        (reconciler, store, notifier)
    }

    #[tokio::test]
    async fn nothing_unlocks_before_the_first_slot() {
        let (r, _, notifier) = setup(101, 5);

        let outcome = r.reconcile(101, utc(3, 0)).await.unwrap();

        assert!(outcome.newly_unlocked.is_empty());
        assert_eq!(outcome.total_unlocked, 0);
        assert_eq!(outcome.next_unlock_at, utc(9, 0));
        assert!(!outcome.completed);
        assert_eq!(notifier.tip_count(), 0);
    }

    #[tokio::test]
    async fn first_slot_unlocks_at_now_after_its_instant() {
        let (r, store, notifier) = setup(102, 5);
        r.reconcile(102, utc(3, 0)).await.unwrap();

        let outcome = r.reconcile(102, utc(9, 1)).await.unwrap();

        assert_eq!(outcome.newly_unlocked.len(), 1);
        let first = &outcome.newly_unlocked[0];
        assert_eq!(first.position, 1);
        // Catch-up stamps with now, not the 09:00 schedule
        assert_eq!(first.unlocked_at, utc(9, 1));
        assert_eq!(outcome.total_unlocked, 1);
        assert_eq!(outcome.next_unlock_at, utc(14, 0));
        assert_eq!(notifier.tip_count(), 1);

        let record = store.find_interaction(102, first.tip_id).await.unwrap().unwrap();
        assert!(record.is_unlocked);
        assert_eq!(record.unlocked_at, Some(utc(9, 1)));
        assert_eq!(record.unlock_order, Some(1));
    }

    #[tokio::test]
    async fn repeat_reconcile_at_same_instant_is_a_no_op() {
        let (r, _, notifier) = setup(103, 5);
        r.reconcile(103, utc(3, 0)).await.unwrap();

        let first = r.reconcile(103, utc(9, 1)).await.unwrap();
        let second = r.reconcile(103, utc(9, 1)).await.unwrap();

        assert_eq!(first.newly_unlocked.len(), 1);
        assert!(second.newly_unlocked.is_empty());
        assert_eq!(second.total_unlocked, 1);
        assert_eq!(notifier.tip_count(), 1);
    }

    #[tokio::test]
    async fn unlock_stamps_never_move_on_later_reconciles() {
        let (r, _, _) = setup(104, 5);
        r.reconcile(104, utc(3, 0)).await.unwrap();
        r.reconcile(104, utc(9, 1)).await.unwrap();

        let later = r.reconcile(104, utc(12, 0)).await.unwrap();

        let slot1 = later.schedule.slots.iter().find(|s| s.position == 1).unwrap();
        assert_eq!(slot1.unlocked_at, Some(utc(9, 1)));
    }

    #[tokio::test]
    async fn downtime_catchup_unlocks_everything_in_one_pass() {
        let (r, _, notifier) = setup(105, 5);
        r.reconcile(105, utc(3, 0)).await.unwrap();

        // Server was down from before 09:00 until 19:00
        let outcome = r.reconcile(105, utc(19, 0)).await.unwrap();

        assert_eq!(outcome.newly_unlocked.len(), 3);
        // Catch-up path: all three stamped with the processing instant
        assert!(outcome.newly_unlocked.iter().all(|u| u.unlocked_at == utc(19, 0)));
        assert!(outcome.completed);
        assert_eq!(notifier.tip_count(), 3);
        assert_eq!(notifier.completion_count(), 1);
        // Day finished, next unlock is tomorrow morning
        assert_eq!(outcome.next_unlock_at, utc(9, 0) + Duration::days(1));
    }

    #[tokio::test]
    async fn late_first_open_backfills_at_scheduled_instants() {
        let (r, store, notifier) = setup(106, 5);

        // No schedule existed yet; user first opens the app at 20:00
        let outcome = r.reconcile(106, utc(20, 0)).await.unwrap();

        assert_eq!(outcome.newly_unlocked.len(), 3);
        let stamps: Vec<_> = outcome.newly_unlocked.iter().map(|u| u.unlocked_at).collect();
        // Back-unlock preserves the on-time illusion
        assert_eq!(stamps, vec![utc(9, 0), utc(14, 0), utc(18, 45)]);
        assert!(outcome.completed);
        assert_eq!(notifier.completion_count(), 1);

        // Interactions carry the scheduled stamps as well
        let first = &outcome.newly_unlocked[0];
        let record = store.find_interaction(106, first.tip_id).await.unwrap().unwrap();
        assert_eq!(record.unlocked_at, Some(utc(9, 0)));
    }

    #[tokio::test]
    async fn completion_fires_at_most_once_per_day() {
        let (r, _, notifier) = setup(107, 5);
        r.reconcile(107, utc(20, 0)).await.unwrap();
        assert_eq!(notifier.completion_count(), 1);

        let again = r.reconcile(107, utc(21, 0)).await.unwrap();
        let evening = r.reconcile(107, utc(23, 30)).await.unwrap();

        assert!(!again.completed);
        assert!(!evening.completed);
        assert_eq!(notifier.completion_count(), 1);
    }

    #[tokio::test]
    async fn notification_failure_never_blocks_the_unlock() {
        let notifier = Arc::new(RecordingNotifier::failing());
        let (r, store, _) = setup_with(108, 5, notifier);

        let outcome = r.reconcile(108, utc(9, 1)).await.unwrap();

        assert_eq!(outcome.newly_unlocked.len(), 1);
        assert_eq!(outcome.total_unlocked, 1);
        let tip_id = outcome.newly_unlocked[0].tip_id;
        let record = store.find_interaction(108, tip_id).await.unwrap().unwrap();
        assert!(record.is_unlocked);
    }

    #[tokio::test]
    async fn concurrent_reconciles_unlock_each_slot_once() {
        let (r, _, notifier) = setup(109, 5);
        r.reconcile(109, utc(3, 0)).await.unwrap();
        r.reconcile(109, utc(9, 1)).await.unwrap();
        assert_eq!(notifier.tip_count(), 1);

        // Cron tick and app-open race at 14:05 with slot 2 pending
        let (a, b) = tokio::join!(r.reconcile(109, utc(14, 5)), r.reconcile(109, utc(14, 5)));
        let a = a.unwrap();
        let b = b.unwrap();

        // Exactly one caller won the slot-2 transition
        assert_eq!(a.newly_unlocked.len() + b.newly_unlocked.len(), 1);
        assert_eq!(a.total_unlocked, 2);
        assert_eq!(b.total_unlocked, 2);
        assert_eq!(notifier.tip_count(), 2);
    }

    #[tokio::test]
    async fn ineligible_users_are_rejected_not_scheduled() {
        let (r, store, _) = setup(110, 5);
        store.add_user(UserProfile {
            user_id: 111,
            level: 1,
            quiz_completed: false,
            active: true,
        });
        store.add_user(UserProfile {
            user_id: 112,
            level: 1,
            quiz_completed: true,
            active: false,
        });

        assert!(matches!(
            r.reconcile(999, utc(9, 1)).await,
            Err(SchedulerError::UnknownUser(999))
        ));
        assert!(matches!(
            r.reconcile(111, utc(9, 1)).await,
            Err(SchedulerError::QuizNotCompleted(111))
        ));
        assert!(matches!(
            r.reconcile(112, utc(9, 1)).await,
            Err(SchedulerError::UserInactive(112))
        ));
    }

    #[tokio::test]
    async fn short_pool_day_completes_on_its_last_slot() {
        let (r, _, notifier) = setup(113, 2);

        let outcome = r.reconcile(113, utc(15, 0)).await.unwrap();

        // Two slots existed, both due by 15:00; that completes the short day
        assert_eq!(outcome.newly_unlocked.len(), 2);
        assert!(outcome.completed);
        assert_eq!(notifier.completion_count(), 1);
        assert_eq!(outcome.next_unlock_at, utc(9, 0) + Duration::days(1));
    }
}

/// Daily Schedule Builder
///
/// This module owns the daily schedule model and the logic that creates
/// one schedule per user per calendar day:
/// - Day boundaries are midnight in the configured service offset
/// - Three unlock instants are derived from configured times of day
/// - A fresh schedule draws up to three tips from the content pool and
///   fixes them to positions 1..3 in shuffle order
/// - Slots whose instant already passed at creation are back-unlocked at
///   their scheduled instant, so a late first open still shows an
///   on-time history
/// - If an operator changes the configured unlock times, existing
///   schedules get their instants migrated without touching unlock state

use chrono::{DateTime, Duration, FixedOffset, NaiveTime, TimeZone, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::SlotTime;
use crate::content_pool::ContentPool;
use crate::error::Result;
use crate::store::{UnlockStore, UserProfile};

/// One of the three daily unlock positions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockSlot {
    pub tip_id: i64,

    /// 1, 2 or 3; fixed at creation, never reassigned
    pub position: i32,

    /// None until the slot is unlocked; once set it never changes
    pub unlocked_at: Option<DateTime<Utc>>,
}

/// One schedule per (user, calendar day)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailySchedule {
    pub user_id: i64,

    /// Midnight of the schedule's day in the service offset, as a UTC instant
    pub day_start: DateTime<Utc>,

    /// Absolute instants at which positions 1..3 become due, strictly ascending
    pub unlock_times: [DateTime<Utc>; 3],

    /// At most three slots in position order. Fewer than three only when
    /// the content pool could not supply three tips even after a reset.
    pub slots: Vec<UnlockSlot>,
}

impl DailySchedule {
    pub fn unlocked_count(&self) -> usize {
        self.slots.iter().filter(|s| s.unlocked_at.is_some()).count()
    }

    /// True once every populated slot has unlocked (empty schedules never complete)
    pub fn is_fully_unlocked(&self) -> bool {
        !self.slots.is_empty() && self.slots.iter().all(|s| s.unlocked_at.is_some())
    }

    /// Highest populated position, i.e. the slot whose unlock completes the day
    pub fn final_position(&self) -> Option<i32> {
        self.slots.iter().map(|s| s.position).max()
    }

    /// Instant of the next still-pending slot strictly after `now`
    pub fn next_unlock_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.slots
            .iter()
            .filter(|s| s.unlocked_at.is_none())
            .map(|s| self.unlock_times[(s.position - 1) as usize])
            .filter(|t| *t > now)
            .min()
    }
}

/// Result of a build-or-get pass
#[derive(Debug, Clone)]
pub struct BuiltSchedule {
    pub schedule: DailySchedule,

    /// Slots unlocked during creation because their instant had already
    /// passed. These carry the scheduled instant, not the creation time,
    /// and still need interactions and notifications downstream.
    pub backfilled: Vec<UnlockSlot>,

    /// True when the schedule was created by this call
    pub created: bool,
}

/// Midnight of `now`'s calendar day in `day_offset`, as a UTC instant
pub fn day_start_for(now: DateTime<Utc>, day_offset: FixedOffset) -> DateTime<Utc> {
    let local_midnight = now
        .with_timezone(&day_offset)
        .date_naive()
        .and_time(NaiveTime::MIN);

    // Express the local midnight back as a UTC instant
    Utc.from_utc_datetime(&(local_midnight - Duration::seconds(day_offset.local_minus_utc() as i64)))
}

/// Absolute unlock instants for a day, from the configured times of day
pub fn unlock_instants(day_start: DateTime<Utc>, times: &[SlotTime; 3]) -> [DateTime<Utc>; 3] {
    [
        day_start + Duration::minutes(times[0].minutes_from_midnight()),
        day_start + Duration::minutes(times[1].minutes_from_midnight()),
        day_start + Duration::minutes(times[2].minutes_from_midnight()),
    ]
}

/// Builds (or fetches) the schedule for a (user, day) pair
pub struct ScheduleBuilder {
    store: Arc<dyn UnlockStore>,
    pool: ContentPool,
    unlock_times: [SlotTime; 3],
    day_offset: FixedOffset,
}

impl ScheduleBuilder {
    pub fn new(
        store: Arc<dyn UnlockStore>,
        unlock_times: [SlotTime; 3],
        day_offset: FixedOffset,
    ) -> Self {
        Self {
            pool: ContentPool::new(store.clone()),
            store,
            unlock_times,
            day_offset,
        }
    }

    pub fn day_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        day_start_for(now, self.day_offset)
    }

    /// First-slot instant of the day after `day_start`; the fallback
    /// "next unlock" once all of today's slots have passed
    pub fn next_day_first_unlock(&self, day_start: DateTime<Utc>) -> DateTime<Utc> {
        day_start + Duration::days(1) + Duration::minutes(self.unlock_times[0].minutes_from_midnight())
    }

    /// Fetch the user's schedule for the day containing `now`, creating
    /// it if absent. Creation applies the back-unlock rule; fetching an
    /// existing schedule applies the unlock-time migration check.
    pub async fn build_or_get(&self, user: &UserProfile, now: DateTime<Utc>) -> Result<BuiltSchedule> {
        let day_start = self.day_start(now);
        let instants = unlock_instants(day_start, &self.unlock_times);

        if let Some(mut existing) = self.store.find_schedule(user.user_id, day_start).await? {
            // Unlock-time migration: a changed configuration rewrites the
            // schedule triple, never the per-slot unlock state
            if existing.unlock_times[2] != instants[2] {
                log::info!(
                    "Migrating unlock times for user {} day {}: {:?} -> {:?}",
                    user.user_id,
                    day_start,
                    existing.unlock_times,
                    instants
                );
                existing.unlock_times = instants;
                self.store.upsert_schedule(&existing).await?;
            }

            return Ok(BuiltSchedule {
                schedule: existing,
                backfilled: Vec::new(),
                created: false,
            });
        }

        // Fresh day: draw candidates and fix them to positions in shuffle order
        let mut candidates = self.pool.select_candidates(user.user_id, user.level).await?;
        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(3);

        if candidates.len() < 3 {
            // Pool shortfall: proceed with however many tips exist; the
            // missing positions simply never unlock
            log::warn!(
                "Only {} candidate tips for user {} at level {}, scheduling a short day",
                candidates.len(),
                user.user_id,
                user.level
            );
        }

        let mut slots: Vec<UnlockSlot> = candidates
            .iter()
            .enumerate()
            .map(|(i, tip)| UnlockSlot {
                tip_id: tip.id,
                position: (i + 1) as i32,
                unlocked_at: None,
            })
            .collect();

        // Back-unlock: a slot whose instant already passed is unlocked at
        // its scheduled instant, not at `now`
        let mut backfilled = Vec::new();
        for slot in slots.iter_mut() {
            let scheduled = instants[(slot.position - 1) as usize];
            if scheduled <= now {
                slot.unlocked_at = Some(scheduled);
                backfilled.push(slot.clone());
            }
        }

        let schedule = DailySchedule {
            user_id: user.user_id,
            day_start,
            unlock_times: instants,
            slots,
        };

        self.store.upsert_schedule(&schedule).await?;

        log::info!(
            "Created schedule for user {} on {} ({} slots, {} back-unlocked)",
            user.user_id,
            day_start,
            schedule.slots.len(),
            backfilled.len()
        );

        Ok(BuiltSchedule {
            schedule,
            backfilled,
            created: true,
        })
    }
}

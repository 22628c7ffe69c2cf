/// LinguaTip Backend Library
///
/// Core of the LinguaTip daily feed: per user and per calendar day, three
/// tips unlock at configured times. This library owns the schedule
/// building, unlock reconciliation with catch-up semantics, the unlock
/// record store and the outbound notification boundary, plus the HTTP
/// surface and background sweep that host it.

pub mod config;
pub mod content_pool;
pub mod error;
pub mod http_server;
pub mod notifier;
pub mod reconciler;
pub mod schedule;
pub mod store;
pub mod sweep;

//! ladderbot: cross-venue market-making bot.
//!
//! Consumes top-of-book quotes from a reference spot venue and continuously
//! posts a layered ladder of limit orders on a destination venue, replacing
//! the ladder whenever the reference moves or quotes go stale. Fills feed a
//! position/balance state that shapes spreads and sizes so inventory tracks
//! a target value ratio between the quote and base assets.

pub mod account;
pub mod api;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod events;
pub mod feed;
pub mod oms;
pub mod outbox;
pub mod pipeline;
pub mod quote;
pub mod rate_limiter;
pub mod ratio;
pub mod reaper;
pub mod store;
pub mod venue;

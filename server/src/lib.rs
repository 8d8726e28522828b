//! # Game Coordinator Server
//!
//! This library implements the authoritative coordinator for a competitive
//! shooter: it authenticates players on top of platform tickets, serves
//! their social state (ranks, wins, commendations, reports, cooldowns),
//! runs skill-based matchmaking, reserves dedicated game servers for the
//! matches it forms, and fans moderator notifications out to a webhook.
//!
//! ## Module Organization
//!
//! - `transport` — the datagram (client) and length-prefixed TCP (game
//!   server) wire variants behind one send contract, feeding a shared
//!   event queue
//! - `session` — peer→session tracking, activity, chunk reassembly, idle
//!   reaping, item-scan cursors
//! - `dispatch` — the message-type→handler table and the pre-auth gate
//! - `repository` — the persistence contract; MySQL and in-memory
//!   implementations
//! - `social` — hello/profile payloads and the commend/report token rules
//! - `matchmaking` — bracketed queues, sliding-window selection, the
//!   ready-up state machine and match lifecycle
//! - `gameserver` — dedicated-server registry and reservations
//! - `moderation` — batched report notifications to the webhook
//! - `gc` — the dependency graph built at startup and the long-lived
//!   workers
//!
//! Tests stand up the same graph with the in-memory repository and a
//! recording transport; nothing in here reaches for global state.

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gameserver;
pub mod gc;
pub mod matchmaking;
pub mod moderation;
pub mod repository;
pub mod session;
pub mod social;
pub mod transport;

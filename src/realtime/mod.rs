//! Real-time collaboration core.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐ WebSocket ┌─────────────────────────────────────────────┐
//! │  Client  │ ────────> │  session.rs  (auth gate, socket loop)       │
//! └──────────┘ <──────── │        │ publish(room, event)               │
//!                        │        v                                    │
//!                        │  bus.rs      (EventBus, per-room relays)    │
//!                        │     │    │                                  │
//!                        │     │    └──> broker.rs (RoomBroker trait,  │
//!                        │     │         in-process loopback impl)     │
//!                        │     │         relay.rs  (TcpBroker + relay  │
//!                        │     │         daemon for multi-process)     │
//!                        │     v                                       │
//!                        │  registry.rs (RoomRegistry, bounded per-    │
//!                        │               connection outbound queues)   │
//!                        └─────────────────────────────────────────────┘
//! ```
//!
//! `events.rs` defines the closed event union shared by all of the above;
//! its serde representation is the wire format.
//!
//! Delivery contract: best-effort, at-most-once per connection per publish.
//! A connection whose outbound queue is full or closed is pruned during
//! fan-out (self-healing membership); publishers are never blocked on a slow
//! consumer. Events published by one process instance reach local members in
//! publish order; cross-process frames are forwarded through the broker and
//! de-duplicated by origin.

pub mod broker;
pub mod bus;
pub mod events;
pub mod registry;
pub mod relay;
pub mod session;

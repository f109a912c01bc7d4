//! Fan-out engine: recipient computation and per-participant outbound queues
//!
//! Every outbound control record is encoded once and the same `Bytes` buffer
//! is enqueued to each recipient's [`queues::Mailbox`], so an N-way fan-out
//! reference-counts one allocation. Each mailbox has three lanes with
//! channel-specific overflow policy:
//!
//! | lane    | policy                                          |
//! |---------|--------------------------------------------------|
//! | control | never dropped; hard bound breach = evict peer    |
//! | screen  | single latest-wins slot                          |
//! | chat    | drop-oldest past 256 items / 8 MiB aggregate     |
//!
//! A/V datagrams never touch a mailbox: [`engine`] sends them straight out
//! of the shared UDP socket and drops them when the socket would block.

pub mod engine;
pub mod queues;

pub use engine::FanOut;
pub use queues::{Mailbox, MailboxOverflow};

#![warn(missing_docs)]
#![warn(clippy::missing_safety_doc)]
#![warn(clippy::missing_panics_doc)]

//! Asynchronous in-process message channels backed by a deadlock-free worker pool
//!
//! A [Channel](channel::Channel) is an independent bounded message queue with
//! exactly one active consumer slot: producers [offer](channel::Channel::offer)
//! payloads, an [OverflowPolicy](channel::OverflowPolicy) decides what happens
//! when the queue is full, and a shared [Executor](executor::Executor) drains
//! the queue through the channel's handler — on at most one thread at a time,
//! without dedicating a thread to any channel. Channels opened under a key are
//! addressed together through the
//! [ChannelRegistry](channel::ChannelRegistry)'s broadcast.
//!
//! The executor tolerates recursive submissions deeper than its thread count:
//! joining a handle whose task has not started runs the task on the joining
//! thread when the pool looks saturated, so nested submit-and-join chains
//! cannot starve the pool into deadlock. Timed joins are bounded by a real
//! wakeup scheduled through the [interrupt] service.

mod common;

pub mod channel;
pub mod executor;
pub mod interrupt;

pub use channel::{Channel, ChannelOptions, ChannelRegistry, Offer, OverflowPolicy};
pub use executor::Executor;
pub use interrupt::InterruptService;

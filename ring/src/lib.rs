// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Fixed-capacity ring queues for cross-thread packet and command handoff.
//!
//! A [`Queue`] is an array of tagged slots indexed by two free-running
//! cursors, one per side.  A slot is occupied exactly when it lies between
//! the consumer cursor and the producer cursor (modulo capacity), and the
//! per-slot tag is the only synchronization on the
//! single-producer/single-consumer data path: no lock is ever taken there.
//!
//! Every operation comes in four flavors: blocking or non-blocking, and
//! single or multi producer/consumer.  The multi variants serialize on a
//! per-half lock; the single variants assume the caller is the sole producer
//! (or consumer) of that half.  Violating the single-side contract cannot
//! corrupt memory -- slot claims are atomic -- but can stall or misorder the
//! queue, so use the `_mp`/`_mc` variants whenever a half is shared.
//!
//! *Exchange* queues are pre-filled with placeholder values: an exchange put
//! hands back the displaced placeholder and an exchange get installs a
//! replacement, so a long-lived queue can run on a fixed set of preallocated
//! values without ever touching an allocator.
//!
//! Sleeping is explicit.  Each half owns a [`Waiter`]; a producer that finds
//! the queue full wakes the consumer side (and vice versa for an empty
//! queue), but a successful push never wakes anyone by itself -- the caller
//! decides when to [`Waiter::kick`] the other side.

mod queue;
mod waiter;

pub use queue::Queue;
pub use waiter::Waiter;

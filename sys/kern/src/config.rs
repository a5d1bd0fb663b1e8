// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Compile-time sizing of kernel tables.
//!
//! The kernel allocates nothing at runtime; every table below is a fixed
//! array sized here. Running out of any of them is reported to the caller as
//! an error rather than being treated as fatal.

/// Number of mailboxes in the kernel's mailbox table.
pub const MAILBOXES: usize = 4;

/// Capacity of the pending-request arena. This bounds the number of
/// unmatched rendezvous halves (queued senders and receivers plus senders
/// awaiting a deferred data fetch) that can exist at once.
pub const PENDING_REQUESTS: usize = 16;

/// Capacity of the data-mover arena. This bounds the number of deferred
/// transfers outstanding at once; movers for immediate transfers never
/// occupy a slot.
pub const DATA_MOVERS: usize = 8;

/// Number of counting completion signals available to asynchronous senders.
pub const SIGNALS: usize = 8;

/// Number of payload block pools.
pub const BLOCK_POOLS: usize = 2;

/// Blocks per pool.
pub const BLOCKS_PER_POOL: usize = 4;

/// Payload capacity of a single pool block, in bytes.
pub const BLOCK_SIZE: usize = 64;

/// Entries in the mailbox subsystem's trace ring.
pub const TRACE_DEPTH: usize = 32;

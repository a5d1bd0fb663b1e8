// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mailbox rendezvous kernel.
//!
//! This is the application-independent portion of the operating system: a
//! task table, validated access to task memory, and the mailbox subsystem
//! that provides the system's inter-task messaging primitive.
//!
//! # Design principles
//!
//! While this isn't a *deeply* principled kernel, there are some basic ideas
//! that appear consistently.
//!
//! 1. Static configuration. As much as possible, the system should take a
//!    single shape specified at compile time; every table in here has a
//!    compile-time bound and exhaustion is a reportable condition, not a
//!    panic.
//! 2. A strong preference for safe code where reasonable. The `unsafe` in
//!    this kernel is concentrated in `umem`, behind access validation.
//! 3. A preference for simple and clear algorithms over fast and clever
//!    algorithms.
//!
//! # Execution model
//!
//! Everything in this crate runs inside a cooperative, single-threaded
//! command processor: at most one kernel operation executes at a time, and
//! each runs to completion before the next begins. That invariant is
//! expressed in the types -- every entry point takes the task table and the
//! mailbox state by `&mut` -- and it is a hard precondition of the design.
//! There are no locks in here, and there must be no concurrent mutators.
//! Interrupt-context code must hand work off to the processor (for example,
//! the timer interrupt arranges for [`mbox::tick`] to run) rather than
//! touching these structures directly.

#![cfg_attr(not(test), no_std)]

pub mod arena;
pub mod config;
pub mod descs;
pub mod err;
pub mod mbox;
pub mod pool;
pub mod task;
pub mod time;
pub mod umem;
pub mod xfer;

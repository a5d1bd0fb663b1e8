// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ring buffer for instrumenting the kernel and services.
//!
//! This contains an implementation of a fixed-size ring buffer designed to
//! record small `Copy` events from arbitrary contexts. While there is nothing
//! to prevent these ring buffers from being left in production code, the
//! design center is primarily around debugging in development: a ring buffer
//! is a plain struct with public fields, so it can be read out with a
//! debugger without any cooperation from the running system.
//!
//! A ring buffer can be owned by the data structure it instruments:
//!
//! ```ignore
//! struct Widget {
//!     trace: Ringbuf<Event, 16>,
//! }
//! ```
//!
//! ...with entries recorded by handing in the event and the source line, which
//! disambiguates call sites that record the same payload:
//!
//! ```ignore
//! self.trace.entry(line!() as u16, Event::Reset);
//! ```
//!
//! For contexts where no owner is available, the [`ringbuf!`] macro declares a
//! `static` ring buffer, and [`ringbuf_entry!`] records into it.
//!
//! Consecutive identical entries from the same line are coalesced by
//! incrementing a count rather than consuming a new slot, which keeps tight
//! retry loops from flooding the buffer.

#![cfg_attr(not(test), no_std)]

/// The structure of a single [`Ringbuf`] entry, carrying a payload of
/// arbitrary type. When a ring buffer entry is generated with an identical
/// payload to the most recent entry (in terms of both `line` and `payload`),
/// `count` will be incremented rather than generating a new entry.
#[derive(Debug, Copy, Clone)]
pub struct RingbufEntry<T: Copy + PartialEq> {
    pub line: u16,
    pub generation: u16,
    pub count: u32,
    pub payload: T,
}

/// A ring buffer of parametrized type and size.
///
/// All fields are public so the buffer stays legible to debuggers; code should
/// treat them as read-only and go through [`Ringbuf::entry`].
#[derive(Debug)]
pub struct Ringbuf<T: Copy + PartialEq, const N: usize> {
    pub last: Option<usize>,
    pub buffer: [RingbufEntry<T>; N],
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, { N }> {
    /// Creates an empty ring buffer. Because entries are stored by value, a
    /// `fill` payload is required to initialize the unused slots.
    pub const fn new(fill: T) -> Self {
        Self {
            last: None,
            buffer: [RingbufEntry {
                line: 0,
                generation: 0,
                count: 0,
                payload: fill,
            }; N],
        }
    }

    /// Records `payload` from source line `line`, coalescing with the previous
    /// entry when both match.
    pub fn entry(&mut self, line: u16, payload: T) {
        if cfg!(feature = "disabled") {
            return;
        }

        let ndx = match self.last {
            None => 0,
            Some(last) => {
                let ent = &mut self.buffer[last];

                if ent.line == line && ent.payload == payload {
                    ent.count += 1;
                    return;
                }

                if last + 1 >= self.buffer.len() {
                    0
                } else {
                    last + 1
                }
            }
        };

        let ent = &mut self.buffer[ndx];
        ent.line = line;
        ent.payload = payload;
        ent.count = 1;
        ent.generation += 1;

        self.last = Some(ndx);
    }

    /// Returns the most recently recorded entry, if anything has been
    /// recorded since construction.
    pub fn last_entry(&self) -> Option<&RingbufEntry<T>> {
        self.last.map(|i| &self.buffer[i])
    }
}

/// Defines a static ring buffer with a payload type of `$ptype` and `$size`
/// entries, statically initialized with the payload `$pinit`. An entry is
/// recorded in the ring buffer with a call to [`ringbuf_entry!`].
#[macro_export]
macro_rules! ringbuf {
    ($ptype:ty, $size:expr, $pinit:expr) => {
        #[no_mangle]
        static mut RINGBUF: $crate::Ringbuf<$ptype, $size> =
            $crate::Ringbuf::new($pinit);
    };
}

/// Adds an entry to a ring buffer that has been declared with [`ringbuf!`].
/// The line number of the call will be recorded, along with the payload.
///
/// The underlying static is accessed without synchronization, so this is only
/// appropriate in single-threaded contexts; prefer an owned [`Ringbuf`] where
/// a natural owner exists.
#[macro_export]
macro_rules! ringbuf_entry {
    ($payload:expr) => {{
        let ringbuf = unsafe { &mut *core::ptr::addr_of_mut!(RINGBUF) };
        ringbuf.entry(line!() as u16, $payload);
    }};
}

// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! poll/select over descriptor capability objects
//!
//! A call either completes within the current slice or parks the guest
//! thread and returns [`Progress::Retry`]; the scheduler re-invokes the
//! identical call later. Which of the two applies is decided by the wait
//! state carried on [`GuestThread`].

use std::collections::HashMap;
use std::sync::Arc;

use tracing::trace;

use crate::error::{Errno, FsResult, Progress};
use crate::memory::GuestMemory;
use crate::wait::{Clock, GuestThread, TimerQueue, WaitPhase};
use crate::ThreadId;

pub const POLLIN: u16 = 0x0001;
pub const POLLPRI: u16 = 0x0002;
pub const POLLOUT: u16 = 0x0004;
pub const POLLERR: u16 = 0x0008;
pub const POLLHUP: u16 = 0x0010;
pub const POLLNVAL: u16 = 0x0020;

/// Timeouts at or above this value never expire
pub const INFINITE_TIMEOUT: u32 = 0xF000_0000;

/// Timeout select uses when the caller passes no timeval
pub const SELECT_NO_TIMEOUT: u32 = 0x7FFF_FFFF;

/// Size of one guest `struct pollfd`
const POLLFD_SIZE: u32 = 8;

/// Readiness interface of an open descriptor
#[cfg_attr(test, mockall::automock)]
pub trait Pollable: Send + Sync {
    fn is_open(&self) -> bool;
    fn is_read_ready(&self) -> bool;
    fn is_write_ready(&self) -> bool;
    /// Register `thread` to be woken when any of `events` becomes ready
    fn wait_for_events(&self, thread: ThreadId, events: u16);
}

/// Descriptor lookup for the calling process
pub trait DescriptorTable {
    fn get(&self, fd: i32) -> Option<Arc<dyn Pollable>>;
}

impl DescriptorTable for HashMap<i32, Arc<dyn Pollable>> {
    fn get(&self, fd: i32) -> Option<Arc<dyn Pollable>> {
        HashMap::get(self, &fd).cloned()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PollRequest {
    pub fd: i32,
    pub events: u16,
    pub revents: u16,
}

impl PollRequest {
    pub fn new(fd: i32, events: u16) -> Self {
        Self {
            fd,
            events,
            revents: 0,
        }
    }
}

pub struct Multiplexer<'a> {
    fds: &'a dyn DescriptorTable,
    timers: &'a mut TimerQueue,
    clock: &'a dyn Clock,
}

impl<'a> Multiplexer<'a> {
    pub fn new(fds: &'a dyn DescriptorTable, timers: &'a mut TimerQueue, clock: &'a dyn Clock) -> Self {
        Self { fds, timers, clock }
    }

    /// Evaluate readiness for `requests`, filling in `revents`.
    ///
    /// Per descriptor only one of read or write readiness is tested: write is
    /// consulted only when read was not requested or is not ready.
    pub fn poll_requests(
        &mut self,
        thread: &mut GuestThread,
        requests: &mut [PollRequest],
        timeout: u32,
    ) -> FsResult<Progress<u32>> {
        let interrupted = thread.take_interrupt();

        let mut ready = 0;
        for request in requests.iter_mut() {
            request.revents = 0;
            let Some(object) = self.fds.get(request.fd) else {
                continue;
            };
            if !object.is_open() {
                request.revents = POLLHUP;
            } else if request.events & POLLIN != 0 && object.is_read_ready() {
                request.revents |= POLLIN;
            } else if request.events & POLLOUT != 0 && object.is_write_ready() {
                request.revents |= POLLOUT;
            }
            if request.revents != 0 {
                ready += 1;
            }
        }

        if ready > 0 || timeout == 0 {
            self.finish_wait(thread);
            return Ok(Progress::Complete(ready));
        }

        let now = self.clock.millis_since_start();
        let start_ms = match thread.wait.phase() {
            WaitPhase::Waiting { start_ms } => {
                if now.saturating_sub(start_ms) > u64::from(timeout) {
                    trace!(thread = thread.id, "wait timed out");
                    self.finish_wait(thread);
                    return Ok(Progress::Complete(0));
                }
                if interrupted {
                    return Err(Errno::Interrupted);
                }
                start_ms
            }
            WaitPhase::Fresh => {
                if interrupted {
                    return Err(Errno::Interrupted);
                }
                thread.wait.begin(now)
            }
        };

        for request in requests.iter() {
            if let Some(object) = self.fds.get(request.fd) {
                object.wait_for_events(thread.id, request.events);
            }
        }
        if timeout < INFINITE_TIMEOUT && !self.timers.is_armed(thread.id) {
            self.timers.arm(thread.id, start_ms + u64::from(timeout));
        }
        trace!(thread = thread.id, start_ms, timeout, "parking thread");
        Ok(Progress::Retry)
    }

    fn finish_wait(&mut self, thread: &mut GuestThread) {
        thread.wait.clear();
        self.timers.cancel(thread.id);
    }

    /// poll(2): `nfds` packed `{ fd: u32, events: u16, revents: u16 }` records at `pfds`
    pub fn poll(
        &mut self,
        thread: &mut GuestThread,
        mem: &mut dyn GuestMemory,
        pfds: u32,
        nfds: u32,
        timeout: u32,
    ) -> FsResult<Progress<u32>> {
        // The whole array must fit in the 32-bit guest address space
        u64::from(nfds)
            .checked_mul(u64::from(POLLFD_SIZE))
            .and_then(|len| len.checked_add(u64::from(pfds)))
            .filter(|end| *end <= 1 << 32)
            .ok_or(Errno::Fault)?;
        let mut requests = Vec::new();
        for i in 0..nfds {
            let address = pfds.wrapping_add(i.wrapping_mul(POLLFD_SIZE));
            requests.push(PollRequest {
                fd: mem.read_u32(address)? as i32,
                events: mem.read_u16(address.wrapping_add(4))?,
                revents: mem.read_u16(address.wrapping_add(6))?,
            });
        }

        let result = self.poll_requests(thread, &mut requests, timeout)?;
        if let Progress::Complete(_) = result {
            for (i, request) in requests.iter().enumerate() {
                let address = pfds.wrapping_add(6).wrapping_add(i as u32 * POLLFD_SIZE);
                mem.write_u16(address, request.revents)?;
            }
        }
        Ok(result)
    }

    /// select(2): three optional descriptor bitmaps plus an optional
    /// `{ seconds, microseconds }` timeout. A zero address means "absent".
    #[allow(clippy::too_many_arguments)]
    pub fn select(
        &mut self,
        thread: &mut GuestThread,
        mem: &mut dyn GuestMemory,
        nfds: u32,
        readfds: u32,
        writefds: u32,
        errorfds: u32,
        timeout_addr: u32,
    ) -> FsResult<Progress<u32>> {
        let set_len = nfds.div_ceil(8);
        let mut requests = Vec::new();
        for byte in 0..set_len {
            let read_bits = read_set_byte(mem, readfds, byte)?;
            let write_bits = read_set_byte(mem, writefds, byte)?;
            let error_bits = read_set_byte(mem, errorfds, byte)?;
            for bit in 0..8 {
                let fd = byte * 8 + bit;
                if fd >= nfds {
                    break;
                }
                let mask = 1u8 << bit;
                let mut events = 0;
                if read_bits & mask != 0 {
                    events |= POLLIN;
                }
                if write_bits & mask != 0 {
                    events |= POLLHUP | POLLOUT;
                }
                if error_bits & mask != 0 {
                    events |= POLLERR;
                }
                if events != 0 {
                    requests.push(PollRequest::new(fd as i32, events));
                }
            }
        }

        let timeout = if timeout_addr == 0 {
            SELECT_NO_TIMEOUT
        } else {
            let seconds = mem.read_u32(timeout_addr)?;
            let micros = mem.read_u32(timeout_addr.wrapping_add(4))?;
            seconds.wrapping_mul(1000).wrapping_add(micros / 1000)
        };

        let result = self.poll_requests(thread, &mut requests, timeout);
        if let Ok(Progress::Retry) = result {
            return Ok(Progress::Retry);
        }

        for set in [readfds, writefds, errorfds] {
            if set != 0 {
                mem.zero(set, set_len)?;
            }
        }
        match result? {
            Progress::Complete(0) | Progress::Retry => return Ok(Progress::Complete(0)),
            Progress::Complete(_) => {}
        }

        let mut found = 0;
        for request in &requests {
            let fd = request.fd as u32;
            let mut hit = false;
            if readfds != 0 && request.revents & (POLLIN | POLLHUP) != 0 {
                set_bit(mem, readfds, fd)?;
                hit = true;
            }
            if writefds != 0 && request.revents & POLLOUT != 0 {
                set_bit(mem, writefds, fd)?;
                hit = true;
            }
            if errorfds != 0 && request.revents & POLLERR != 0 {
                set_bit(mem, errorfds, fd)?;
                hit = true;
            }
            if hit {
                found += 1;
            }
        }
        Ok(Progress::Complete(found))
    }
}

fn read_set_byte(mem: &dyn GuestMemory, set: u32, byte: u32) -> FsResult<u8> {
    if set == 0 {
        return Ok(0);
    }
    mem.read_u8(set.wrapping_add(byte))
}

fn set_bit(mem: &mut dyn GuestMemory, set: u32, fd: u32) -> FsResult<()> {
    let address = set.wrapping_add(fd / 8);
    let value = mem.read_u8(address)?;
    mem.write_u8(address, value | (1 << (fd % 8)))
}

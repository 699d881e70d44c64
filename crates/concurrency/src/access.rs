//! Per-value lock state machine.
//!
//! One [`Access`] guards one value of a namespace. It supports two modes:
//!
//! - **Parallel** (shared): any number of holders, compatible with other
//!   parallel holders, incompatible with an exclusive holder.
//! - **Exclusive**: single holder, incompatible with everything else,
//!   re-entrant by holder thread.
//!
//! Acquisition accepts `blocking` and an optional timeout; failures are the
//! non-fatal [`Error::NonBlocking`] / [`Error::Timeout`].

use parking_lot::{Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use stowage_core::{Error, Result};

#[derive(Debug, Default)]
struct AccessState {
    readers: usize,
    writer: Option<ThreadId>,
    writer_depth: usize,
}

#[derive(Debug, Default)]
pub(crate) struct Access {
    state: Mutex<AccessState>,
    cond: Condvar,
}

impl Access {
    pub(crate) fn acquire_parallel(
        &self,
        blocking: bool,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let me = thread::current().id();
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            let blocked = matches!(state.writer, Some(w) if w != me);
            if !blocked {
                break;
            }
            if !blocking {
                return Err(Error::NonBlocking);
            }
            match deadline {
                None => self.cond.wait(&mut state),
                Some(d) => {
                    if self.cond.wait_until(&mut state, d).timed_out()
                        && matches!(state.writer, Some(w) if w != me)
                    {
                        return Err(Error::Timeout);
                    }
                }
            }
        }
        state.readers += 1;
        Ok(())
    }

    pub(crate) fn acquire_exclusive(
        &self,
        blocking: bool,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let me = thread::current().id();
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        if state.writer == Some(me) {
            state.writer_depth += 1;
            return Ok(());
        }
        loop {
            let blocked = state.readers > 0 || state.writer.is_some();
            if !blocked {
                break;
            }
            if !blocking {
                return Err(Error::NonBlocking);
            }
            match deadline {
                None => self.cond.wait(&mut state),
                Some(d) => {
                    if self.cond.wait_until(&mut state, d).timed_out()
                        && (state.readers > 0 || state.writer.is_some())
                    {
                        return Err(Error::Timeout);
                    }
                }
            }
        }
        state.writer = Some(me);
        state.writer_depth = 1;
        Ok(())
    }

    pub(crate) fn release_parallel(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.readers > 0, "parallel release without holder");
        state.readers = state.readers.saturating_sub(1);
        drop(state);
        self.cond.notify_all();
    }

    pub(crate) fn release_exclusive(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.writer_depth > 0, "exclusive release without holder");
        if state.writer_depth > 0 {
            state.writer_depth -= 1;
            if state.writer_depth == 0 {
                state.writer = None;
                drop(state);
                self.cond.notify_all();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn in_use(&self) -> bool {
        let state = self.state.lock();
        state.readers > 0 || state.writer.is_some()
    }
}

//! BW requests to the DP-IN adapter
//!
//! A request is a write of granularity units to DP_REQUEST_BW. The adapter
//! answers asynchronously through DP_TUNNELING_STATUS; the requester polls
//! that register and sleeps on [`BwRequestQueue`] between polls so an IRQ
//! reporting the result cuts the wait short.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

use dplink_raw::dpcd::tunnel::{addr, TunnelingStatus, MAX_REQUEST_BW};

use dplink_raw::register::Register;

use super::manager::{tunnel_mut, tunnel_ref, DpTunnel, TunnelManager};
use crate::common::aux::{read_layout, write_layout, DpAux};
use crate::error::{DplinkError, Result};

/// Wait queue shared by all BW requesters of a manager
pub(crate) struct BwRequestQueue {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl BwRequestQueue {
    pub(crate) fn new() -> Self {
        Self {
            generation: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    pub(crate) fn wake_all(&self) {
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Sleep until woken after `seen` or `timeout` passes
    pub(crate) fn wait(&self, seen: u64, timeout: Duration) {
        let mut generation = self.generation.lock();
        if *generation != seen {
            return;
        }
        let _ = self.cond.wait_for(&mut generation, timeout);
    }
}

/// Request result, `None` while the adapter is still working on it
fn bw_req_complete(aux: &dyn DpAux) -> Result<Option<bool>> {
    let status: Register<TunnelingStatus> = read_layout(aux, addr::DP_TUNNELING_STATUS)?;
    let result = status.layout.request_result();
    if !result.has_request_result() {
        return Ok(None);
    }
    write_layout(aux, &Register::new(status.address, result))?;

    Ok(Some(result.bw_request_succeeded && !result.bw_request_failed))
}

enum RequestOutcome {
    Granted,
    Rejected,
    TimedOut,
}

impl TunnelManager {
    /// Set the tunnel's allocation to `bw` Mb/s, rounded up to the granularity
    ///
    /// Blocks until the adapter answers or the request timeout expires. A
    /// timeout, or a rejected request to shrink the allocation, leaves the
    /// tunnel with a sticky BW allocation error.
    pub fn allocate_bw(&self, handle: &DpTunnel, bw: u32) -> Result<()> {
        let (aux, enabled, granularity, allocated) = self.with_tunnel(handle, |g, i| {
            let t = tunnel_ref(g, i);
            (t.aux.clone(), t.bw_alloc_enabled, t.bw_granularity, t.allocated_bw)
        })?;

        if !enabled {
            return Err(DplinkError::BwAllocDisabled {
                tunnel: handle.id(),
            });
        }

        let units = bw.div_ceil(granularity.max(1));
        if units > MAX_REQUEST_BW {
            return Err(DplinkError::BwRequestTooLarge {
                tunnel: handle.id(),
                units,
            });
        }
        let bw = units * granularity;

        aux.write_byte(addr::DP_REQUEST_BW, units as u8)?;

        let outcome = self.wait_bw_request(aux.as_ref())?;

        let granted = matches!(outcome, RequestOutcome::Granted);
        let sticky = match outcome {
            RequestOutcome::Granted => false,
            RequestOutcome::Rejected => bw < allocated,
            RequestOutcome::TimedOut => true,
        };
        self.with_tunnel(handle, |g, i| {
            let t = tunnel_mut(g, i);
            if granted {
                t.allocated_bw = bw;
            }
            if sticky {
                t.bw_alloc_has_errors = true;
            }
        })?;

        tracing::debug!(
            "{} Allocating {}/{} Mb/s: {}",
            handle,
            bw,
            allocated,
            match outcome {
                RequestOutcome::Granted => "ok",
                RequestOutcome::Rejected => "rejected",
                RequestOutcome::TimedOut => "timed out",
            }
        );

        match outcome {
            RequestOutcome::Granted => Ok(()),
            RequestOutcome::Rejected => Err(DplinkError::BwRequestRejected {
                tunnel: handle.id(),
                bw,
            }),
            RequestOutcome::TimedOut => Err(DplinkError::BwRequestTimeout {
                tunnel: handle.id(),
                bw,
            }),
        }
    }

    fn wait_bw_request(&self, aux: &dyn DpAux) -> Result<RequestOutcome> {
        let deadline = Instant::now() + self.config.bw_request_timeout();
        let poll = self.config.bw_request_poll();

        loop {
            // Sample before polling so a wakeup in between is not lost
            let seen = self.bw_req_queue.generation();
            match bw_req_complete(aux)? {
                Some(true) => return Ok(RequestOutcome::Granted),
                Some(false) => return Ok(RequestOutcome::Rejected),
                None => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(RequestOutcome::TimedOut);
            }
            self.bw_req_queue.wait(seen, poll.min(deadline - now));
        }
    }
}

//! The delayed-callback contract the server requires from its host
//! environment. The host schedules one-shot (or recurring) callbacks and, on
//! expiry, hands the token back through [`Server::timed_out`].
//!
//! [`Server::timed_out`]: crate::server::Server::timed_out

use core::net::Ipv4Addr;

use embassy_time::Duration;

use crate::Mac;

/// Names the entity a timer was armed for.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Token {
    /// Lease expiry for the client with this hardware address.
    Lease(Mac),
    /// Cooldown of an address withheld after a DECLINE.
    Quarantine(Ipv4Addr),
}

/// The identifier under which the host tracks a scheduled timer.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct TimerHandle(pub i64);

pub trait TimerService {
    /// Schedules a callback after `delay`, recurring if `periodic`. Returns
    /// `None` when the host cannot take another timer; the caller degrades
    /// by leaving the entity untimed.
    fn start(&mut self, delay: Duration, token: Token, periodic: bool) -> Option<TimerHandle>;

    /// Cancels a timer; after this returns, its token will not be delivered.
    fn stop(&mut self, handle: TimerHandle);

    /// Reschedules a pending timer without changing its token.
    fn reset(&mut self, handle: TimerHandle, delay: Duration);
}

impl<T> TimerService for &mut T
where
    T: TimerService,
{
    fn start(&mut self, delay: Duration, token: Token, periodic: bool) -> Option<TimerHandle> {
        (**self).start(delay, token, periodic)
    }

    fn stop(&mut self, handle: TimerHandle) {
        (**self).stop(handle)
    }

    fn reset(&mut self, handle: TimerHandle, delay: Duration) {
        (**self).reset(handle, delay)
    }
}

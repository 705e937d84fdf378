//! The reactor half of the server: one loop multiplexing the socket against
//! the earliest lease deadline. Timer callbacks are delivered strictly
//! between datagrams, so they never preempt an `rx` in progress.

use core::net::{SocketAddr, SocketAddrV4};

use embassy_futures::select::{select, Either};
use embassy_time::{Duration, Instant, Timer};

use edge_nal::{UdpReceive, UdpSend};

use heapless::Vec;

use log::{info, warn};

use crate::server::{Server, ServerOptions};
use crate::timer::{TimerHandle, TimerService, Token};
use crate::CLIENT_PORT;

use super::Error;

#[derive(Copy, Clone, Debug)]
struct Slot {
    handle: TimerHandle,
    token: Token,
    deadline: Instant,
    period: Option<Duration>,
}

/// A fixed-capacity timer wheel polled by the reactor loop between
/// datagrams; the [`TimerService`] the server core is driven with.
pub struct TimerQueue<const N: usize = 64> {
    slots: Vec<Slot, N>,
    next_handle: i64,
}

impl<const N: usize> TimerQueue<N> {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            next_handle: 0,
        }
    }

    /// The earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots.iter().map(|slot| slot.deadline).min()
    }

    /// Takes one elapsed timer; recurring timers are rewound in place.
    pub fn poll(&mut self, now: Instant) -> Option<Token> {
        let index = self.slots.iter().position(|slot| slot.deadline <= now)?;
        let slot = self.slots[index];

        match slot.period {
            Some(period) => self.slots[index].deadline = now + period,
            None => {
                self.slots.swap_remove(index);
            }
        }

        Some(slot.token)
    }
}

impl<const N: usize> Default for TimerQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> TimerService for TimerQueue<N> {
    fn start(&mut self, delay: Duration, token: Token, periodic: bool) -> Option<TimerHandle> {
        let handle = TimerHandle(self.next_handle);

        let slot = Slot {
            handle,
            token,
            deadline: Instant::now() + delay,
            period: periodic.then_some(delay),
        };

        match self.slots.push(slot) {
            Ok(()) => {
                self.next_handle += 1;

                Some(handle)
            }
            Err(_) => {
                warn!("Timer queue full");

                None
            }
        }
    }

    fn stop(&mut self, handle: TimerHandle) {
        if let Some(index) = self.slots.iter().position(|slot| slot.handle == handle) {
            self.slots.swap_remove(index);
        }
    }

    fn reset(&mut self, handle: TimerHandle, delay: Duration) {
        for slot in self.slots.iter_mut() {
            if slot.handle == handle {
                slot.deadline = Instant::now() + delay;
                slot.period = slot.period.map(|_| delay);
            }
        }
    }
}

/// Runs the server over the supplied socket, which should be bound to the
/// server port on the served interface and able to send broadcasts.
///
/// Note that dropping this future is safe in that it won't remove the lease
/// registry, so users are free to drop it in case they would like to take a
/// snapshot of the bindings or inspect them otherwise.
pub async fn run<S, const N: usize, const T: usize>(
    server: &mut Server<N>,
    options: &ServerOptions<'_>,
    timers: &mut TimerQueue<T>,
    socket: &mut S,
    buf: &mut [u8],
) -> Result<(), Error<S::Error>>
where
    S: UdpReceive + UdpSend,
{
    info!(
        "Serving {}..={} as {}",
        server.range_start, server.range_end, options.ip
    );

    loop {
        let incoming = match timers.next_deadline() {
            Some(deadline) => match select(socket.receive(buf), Timer::at(deadline)).await {
                Either::First(result) => Some(result.map_err(Error::Io)?),
                Either::Second(()) => None,
            },
            None => Some(socket.receive(buf).await.map_err(Error::Io)?),
        };

        match incoming {
            Some((len, remote)) => {
                let remote_port = match remote {
                    SocketAddr::V4(remote) => remote.port(),
                    _ => CLIENT_PORT,
                };

                if let Some(reply) = server.rx(options, timers, buf, len) {
                    let to = SocketAddr::V4(SocketAddrV4::new(reply.dst, remote_port));

                    // A failed write leaves the lease state untouched; the
                    // client retries
                    if let Err(err) = socket.send(to, reply.data).await {
                        warn!("Reply to {to} failed: {err:?}");
                    }
                }
            }
            None => {
                let now = Instant::now();

                while let Some(token) = timers.poll(now) {
                    server.timed_out(timers, token);
                }
            }
        }
    }
}

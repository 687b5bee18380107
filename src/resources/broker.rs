//! Bookkeeping for scarce local resources: GPU ids, server slots and ports.
//!
//! All state lives behind one mutex which is never held across an `.await`.
//! Waiters park on a [`Notify`] and also poll periodically, so a missed wakeup
//! only costs one poll interval.

use std::{
    collections::BTreeSet,
    net::TcpListener,
    sync::Mutex,
    time::Duration,
};

use tokio::sync::Notify;

use crate::{async_utils::cancel::CancelSignal, prelude::*};

/// How often blocked acquirers re-check for free resources.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Resources held by one local server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reservation {
    pub gpu_ids: Vec<usize>,
    pub port: u16,
}

#[derive(Debug)]
struct BrokerState {
    allocated: BTreeSet<usize>,
    active_servers: usize,
    base_port: u16,
    next_port: u16,
}

/// Hands out GPU ids, server slots and ports.
#[derive(Debug)]
pub struct ResourceBroker {
    total_gpus: usize,
    max_servers: usize,
    poll_interval: Duration,
    state: Mutex<BrokerState>,
    released: Notify,
}

impl ResourceBroker {
    /// Create a broker for `total_gpus` GPUs, at most `max_servers` concurrent
    /// servers, handing out ports starting at `base_port`.
    pub fn new(total_gpus: usize, max_servers: usize, base_port: u16) -> Self {
        Self {
            total_gpus,
            max_servers: max_servers.max(1),
            poll_interval: DEFAULT_POLL_INTERVAL,
            state: Mutex::new(BrokerState {
                allocated: BTreeSet::new(),
                active_servers: 0,
                base_port,
                next_port: base_port,
            }),
            released: Notify::new(),
        }
    }

    /// Override how often waiters poll.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn total_gpus(&self) -> usize {
        self.total_gpus
    }

    /// GPU ids currently handed out, in ascending order.
    pub fn allocated_gpus(&self) -> Vec<usize> {
        let state = self.state.lock().expect("lock poisoned");
        state.allocated.iter().copied().collect()
    }

    /// Number of server slots currently in use.
    pub fn active_servers(&self) -> usize {
        self.state.lock().expect("lock poisoned").active_servers
    }

    /// Fail if `count` GPUs could never be satisfied.
    pub fn check_ceiling(&self, count: usize) -> Result<()> {
        if count > self.total_gpus {
            bail!(
                "Requested {} GPUs, but only {} GPUs are available",
                count,
                self.total_gpus
            );
        }
        Ok(())
    }

    /// Take `count` free GPU ids (lowest first), or `None` if not enough are
    /// free right now.
    pub fn allocate(&self, count: usize) -> Option<Vec<usize>> {
        let mut state = self.state.lock().expect("lock poisoned");
        allocate_locked(&mut state, self.total_gpus, count)
    }

    /// Return GPU ids and wake any waiters.
    pub fn release_gpus(&self, ids: &[usize]) {
        {
            let mut state = self.state.lock().expect("lock poisoned");
            for id in ids {
                state.allocated.remove(id);
            }
        }
        self.released.notify_waiters();
    }

    /// Find a port we can bind on localhost, starting from our cursor. The
    /// cursor wraps back to the base port after 65535.
    pub fn reserve_port(&self) -> Result<u16> {
        let mut state = self.state.lock().expect("lock poisoned");
        reserve_port_locked(&mut state)
    }

    /// Take a server slot, `count` GPUs and a port, all at once, or `None` if
    /// any of them is unavailable right now.
    pub fn try_acquire(&self, count: usize) -> Result<Option<Reservation>> {
        self.check_ceiling(count)?;
        let mut state = self.state.lock().expect("lock poisoned");
        if state.active_servers >= self.max_servers {
            return Ok(None);
        }
        let Some(gpu_ids) = allocate_locked(&mut state, self.total_gpus, count) else {
            return Ok(None);
        };
        let port = match reserve_port_locked(&mut state) {
            Ok(port) => port,
            Err(err) => {
                for id in &gpu_ids {
                    state.allocated.remove(id);
                }
                return Err(err);
            }
        };
        state.active_servers += 1;
        debug!(?gpu_ids, port, "Reserved local server resources");
        Ok(Some(Reservation { gpu_ids, port }))
    }

    /// Wait until [`Self::try_acquire`] succeeds, or `cancel` fires.
    pub async fn acquire(&self, count: usize, cancel: &CancelSignal) -> Result<Reservation> {
        let mut logged = false;
        loop {
            if cancel.is_canceled() {
                bail!("Canceled while waiting for GPUs");
            }

            // Register for wakeups before checking, so a release between the
            // check and the wait isn't lost.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(reservation) = self.try_acquire(count)? {
                return Ok(reservation);
            }
            if !logged {
                info!(count, "Waiting for GPUs to become available");
                logged = true;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.canceled() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Give back everything in `reservation` and wake any waiters.
    pub fn release(&self, reservation: &Reservation) {
        {
            let mut state = self.state.lock().expect("lock poisoned");
            for id in &reservation.gpu_ids {
                state.allocated.remove(id);
            }
            state.active_servers = state.active_servers.saturating_sub(1);
        }
        debug!(gpu_ids = ?reservation.gpu_ids, port = reservation.port, "Released local server resources");
        self.released.notify_waiters();
    }
}

fn allocate_locked(state: &mut BrokerState, total: usize, count: usize) -> Option<Vec<usize>> {
    let free = (0..total)
        .filter(|id| !state.allocated.contains(id))
        .take(count)
        .collect::<Vec<_>>();
    if free.len() < count {
        return None;
    }
    state.allocated.extend(free.iter().copied());
    Some(free)
}

fn reserve_port_locked(state: &mut BrokerState) -> Result<u16> {
    let start = state.next_port;
    let mut port = start;
    loop {
        let next = next_port_after(state, port);
        if TcpListener::bind(("127.0.0.1", port)).is_ok() {
            state.next_port = next;
            return Ok(port);
        }
        if next == start {
            bail!("No free local ports at or above {}", state.base_port);
        }
        port = next;
    }
}

fn next_port_after(state: &BrokerState, port: u16) -> u16 {
    match port.checked_add(1) {
        Some(next) => next,
        None => state.base_port,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn allocates_lowest_free_ids() {
        let broker = ResourceBroker::new(4, 8, 0);
        assert_eq!(broker.allocate(2), Some(vec![0, 1]));
        assert_eq!(broker.allocate(1), Some(vec![2]));
        assert_eq!(broker.allocate(2), None);
        broker.release_gpus(&[0]);
        assert_eq!(broker.allocate(2), Some(vec![0, 3]));
        assert_eq!(broker.allocated_gpus(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn ceiling_is_checked_before_waiting() {
        let broker = ResourceBroker::new(2, 8, 0);
        let err = broker.try_acquire(3).expect_err("over the ceiling");
        assert!(err.to_string().contains("only 2 GPUs"), "{err}");
    }

    #[test]
    fn reserve_port_skips_bound_ports() -> Result<()> {
        let busy = TcpListener::bind(("127.0.0.1", 0))?;
        let busy_port = busy.local_addr()?.port();
        let broker = ResourceBroker::new(0, 8, busy_port);
        let first = broker.reserve_port()?;
        assert!(first > busy_port);
        let second = broker.reserve_port()?;
        assert!(second > first);
        Ok(())
    }

    #[test]
    fn port_cursor_wraps_to_base_port() -> Result<()> {
        let base = u16::MAX - 1;
        let broker = ResourceBroker::new(0, 8, base);
        assert_eq!(broker.reserve_port()?, base);
        assert_eq!(broker.reserve_port()?, u16::MAX);
        assert_eq!(broker.reserve_port()?, base);
        Ok(())
    }

    #[test]
    fn exhausted_port_range_is_an_error() -> Result<()> {
        let busy = TcpListener::bind(("127.0.0.1", u16::MAX))?;
        let broker = ResourceBroker::new(0, 8, busy.local_addr()?.port());
        let err = broker.reserve_port().expect_err("only port is taken");
        assert_eq!(err.to_string(), "No free local ports at or above 65535");
        Ok(())
    }

    #[test]
    fn server_slots_are_limited() -> Result<()> {
        let broker = ResourceBroker::new(4, 1, 0);
        let first = broker.try_acquire(1)?.expect("first slot");
        assert!(broker.try_acquire(1)?.is_none());
        broker.release(&first);
        assert!(broker.try_acquire(1)?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn waiter_wakes_on_release() -> Result<()> {
        let broker = Arc::new(
            ResourceBroker::new(1, 8, 0).with_poll_interval(Duration::from_secs(60)),
        );
        let held = broker.try_acquire(1)?.expect("free GPU");

        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.acquire(1, &CancelSignal::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        broker.release(&held);
        let reservation = tokio::time::timeout(Duration::from_secs(5), waiter).await???;
        assert_eq!(reservation.gpu_ids, vec![0]);
        Ok(())
    }

    #[tokio::test]
    async fn cancel_aborts_wait() -> Result<()> {
        let broker = Arc::new(
            ResourceBroker::new(1, 8, 0).with_poll_interval(Duration::from_secs(60)),
        );
        let _held = broker.try_acquire(1)?.expect("free GPU");
        let cancel = CancelSignal::new();

        let waiter = {
            let broker = broker.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { broker.acquire(1, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), waiter).await??;
        let err = result.expect_err("wait should be canceled");
        assert_eq!(err.to_string(), "Canceled while waiting for GPUs");
        Ok(())
    }
}

/*!
    mutual exclusion for the half-duplex bus, keyed by message identity.

    The rs485 child bus has no collision arbitration, so the host must never
    have two expect-a-reply exchanges in flight at once, across all modules
    sharing the link. Callers acquire around their whole send-and-wait
    sequence; re-acquiring with the *same* key is a cheap recursion, acquiring
    with a different key queues.

    The lock is fair: acquirers pass one by one through a fifo entry gate, so
    a caller hammering the bus cannot starve an emergency shutdown path.

    A staleness bound (default 500ms) guards against a key that is never
    released because of a logic error somewhere above: a waiter that has seen
    the same owner for longer than the bound forcibly takes the lock over and
    the event is logged loudly. That is a safety valve, nothing should ever
    rely on it.
*/

use std::{
    fmt::Debug,
    sync::Arc,
    sync::Mutex,
    time::Duration,
    };
use tokio::{
    sync::Mutex as FairMutex,
    sync::Notify,
    sync::OwnedMutexGuard,
    time::Instant,
    };
use log::{error, trace, warn};


pub const DEFAULT_STALENESS: Duration = Duration::from_millis(500);

pub struct MessageKeyedLock<K> {
    /// fifo entry gate, only one acquirer at a time waits on the state below
    gate: Arc<FairMutex<()>>,
    state: Mutex<State<K>>,
    released: Notify,
    staleness: Duration,
}

struct State<K> {
    owner: Option<K>,
    count: u32,
    acquired: Instant,
}

impl<K: Copy + PartialEq + Debug> MessageKeyedLock<K> {
    pub fn new(staleness: Duration) -> Self {
        Self {
            gate: Arc::new(FairMutex::new(())),
            state: Mutex::new(State {
                owner: None,
                count: 0,
                acquired: Instant::now(),
                }),
            released: Notify::new(),
            staleness,
        }
    }

    /// take the lock for `key`, or bump its recursion count if `key` already holds it
    pub async fn acquire(&self, key: K) {
        let _entry = self.gate.clone().lock_owned().await;
        self.acquire_past_gate(key).await;
    }

    /// the wait on the keyed state itself, once through (or around) the gate
    async fn acquire_past_gate(&self, key: K) {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                match state.owner {
                    Some(owner) if owner == key => {
                        state.count += 1;
                        trace!("bus lock recursively acquired by {:?}", key);
                        return;
                    }
                    None => {
                        state.owner = Some(key);
                        state.count = 1;
                        state.acquired = Instant::now();
                        return;
                    }
                    Some(owner) => {
                        if state.acquired.elapsed() > self.staleness {
                            // way too long: reset and move on rather than hanging forever
                            error!("abandoning stale bus lock: old={:?} new={:?}", owner, key);
                            state.owner = Some(key);
                            state.count = 1;
                            state.acquired = Instant::now();
                            return;
                        }
                    }
                }
            }
            let _ = tokio::time::timeout(self.staleness / 4, self.released.notified()).await;
        }
    }

    /// undo one acquisition by `key`; the lock frees once every acquisition is released
    pub fn release(&self, key: K) {
        let mut state = self.state.lock().unwrap();
        match state.owner {
            Some(owner) if owner == key => {
                state.count -= 1;
                if state.count == 0 {
                    state.owner = None;
                    self.released.notify_waiters();
                }
                else {
                    trace!("bus lock recursively released by {:?}", key);
                }
            }
            Some(owner) => warn!("ignored bus lock release by non-owner: held={:?} releasing={:?}", owner, key),
            None => warn!("ignored release of unheld bus lock by {:?}", key),
        }
    }

    /// forget any owner, for re-arming after the bus was torn down
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.owner = None;
        state.count = 0;
        self.released.notify_waiters();
    }

    /**
        permanently hang every future [acquire](Self::acquire) caller.

        This closes the entry gate and never reopens it: as long as the
        returned hold is kept alive, nobody queues through anymore. The one
        path holding it can still reach the bus with
        [acquire_bypassing](Self::acquire_bypassing), which is how a final
        fail-safe gets pushed ahead of any queued traffic during an
        unrecoverable shutdown.
    */
    pub async fn lock_acquisitions(&self) -> AcquisitionsHold {
        warn!("bus lock entry gate closing, all future acquirers will hang");
        AcquisitionsHold {
            _gate: self.gate.clone().lock_owned().await,
        }
    }

    /// acquire without queueing through the entry gate. Reserved for the
    /// holder of an [AcquisitionsHold], anything else defeats the fairness
    pub async fn acquire_bypassing(&self, key: K) {
        self.acquire_past_gate(key).await;
    }
}

/// keeps the entry gate of a [MessageKeyedLock] closed for as long as it lives
pub struct AcquisitionsHold {
    _gate: OwnedMutexGuard<()>,
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn recursion_counts() {
        let lock = MessageKeyedLock::new(DEFAULT_STALENESS);
        lock.acquire(1u32).await;
        lock.acquire(1u32).await;
        // one release is not enough to free it
        lock.release(1);
        let other = tokio::time::timeout(Duration::from_millis(50), lock.acquire(2u32)).await;
        assert!(other.is_err());
        lock.release(1);
        tokio::time::timeout(Duration::from_millis(50), lock.acquire(2u32)).await
            .expect("lock should be free after the second release");
    }

    #[tokio::test]
    async fn different_key_blocks_until_release() {
        let lock = Arc::new(MessageKeyedLock::new(DEFAULT_STALENESS));
        lock.acquire(1u32).await;
        let contender = tokio::spawn({
            let lock = lock.clone();
            async move {
                lock.acquire(2u32).await;
                lock.release(2);
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(! contender.is_finished());
        lock.release(1);
        tokio::time::timeout(Duration::from_millis(200), contender).await
            .expect("contender should finish once the lock is released")
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn grants_are_first_come_first_served() {
        let lock = Arc::new(MessageKeyedLock::new(Duration::from_secs(2)));
        let order = Arc::new(Mutex::new(Vec::new()));
        lock.acquire(0u32).await;

        let mut tasks = Vec::new();
        for key in 1u32 ..= 3 {
            let lock = lock.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                lock.acquire(key).await;
                order.lock().unwrap().push(key);
                lock.release(key);
            }));
            // let each contender queue at the gate before the next submits
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        lock.release(0);
        for task in tasks { task.await.unwrap(); }
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn stale_owner_is_abandoned() {
        let lock = MessageKeyedLock::new(Duration::from_millis(100));
        lock.acquire(1u32).await;
        // owner 1 never releases; the waiter must take over after the bound
        tokio::time::timeout(Duration::from_millis(500), lock.acquire(2u32)).await
            .expect("waiter should steal a stale lock");
        lock.release(2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn locked_acquisitions_hang_everyone_else() {
        let lock = Arc::new(MessageKeyedLock::<u32>::new(DEFAULT_STALENESS));
        let attempts = Arc::new(AtomicUsize::new(0));
        let _hold = lock.lock_acquisitions().await;

        let blocked = tokio::spawn({
            let (lock, attempts) = (lock.clone(), attempts.clone());
            async move {
                lock.acquire(7).await;
                attempts.fetch_add(1, Ordering::SeqCst);
            }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
        assert!(! blocked.is_finished());

        // the holder itself still gets through
        tokio::time::timeout(Duration::from_millis(100), lock.acquire_bypassing(9)).await
            .expect("hold owner must bypass the gate");
        lock.release(9);
        blocked.abort();
    }
}

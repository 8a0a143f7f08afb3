//! Ticket store and authorization.
//!
//! Tickets are process local and never persisted; a daemon restart forgets
//! them all. The table is guarded by a single mutex with short critical
//! sections and no lock is ever held across I/O. Each data-plane request
//! takes a [`Lease`] that pins the ticket, counts as a connection, and
//! registers an operation record carrying the cancellation signal.
//!
//! Cancellation states per ticket: active → canceling → removed. While
//! canceling, new authorizations fail and existing leases keep running with
//! their cancel signal raised; the ticket is removed when the last lease is
//! released, or at the cancel deadline when one was given.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use imageio_proto::measure::{Range, RangeList};
use imageio_proto::{Error, ImageResult, TicketSpec, Verb};

use crate::backend::Backend;

/// Cancellation signal shared between a ticket and its operations.
///
/// Handlers poll [`CancelSignal::is_set`] between chunks; long waits can
/// `select!` on [`CancelSignal::cancelled`].
#[derive(Clone, Default)]
pub struct CancelSignal(Arc<CancelInner>);

#[derive(Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.flag.store(true, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.0.flag.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        while !self.is_set() {
            self.0.notify.notified().await;
        }
    }
}

/// One in-flight operation consuming a ticket.
pub struct OpRecord {
    pub verb: Verb,
    pub offset: u64,
    pub length: u64,
    pub done: AtomicU64,
    pub started: Instant,
    cancel: CancelSignal,
}

impl OpRecord {
    fn new(verb: Verb, offset: u64, length: u64) -> Self {
        OpRecord {
            verb,
            offset,
            length,
            done: AtomicU64::new(0),
            started: Instant::now(),
            cancel: CancelSignal::new(),
        }
    }

    pub fn done(&self) -> u64 {
        self.done.load(Ordering::Relaxed)
    }
}

struct TicketState {
    expires: Instant,
    access_time: Instant,
    connections: u64,
    next_op: u64,
    ongoing: HashMap<u64, Arc<OpRecord>>,
    completed: RangeList,
    canceled: bool,
}

/// A ticket installed by the control plane, plus its runtime state.
pub struct Ticket {
    spec: TicketSpec,
    inactivity_timeout: Duration,
    state: Mutex<TicketState>,
    conn_tx: watch::Sender<u64>,
    backend: tokio::sync::Mutex<Option<Arc<dyn Backend>>>,
}

impl Ticket {
    fn new(spec: TicketSpec, default_inactivity: Duration) -> Self {
        let now = Instant::now();
        let inactivity_timeout = spec
            .inactivity_timeout
            .map(Duration::from_secs)
            .unwrap_or(default_inactivity);
        let (conn_tx, _) = watch::channel(0);
        Ticket {
            inactivity_timeout,
            state: Mutex::new(TicketState {
                expires: now + Duration::from_secs(spec.timeout),
                access_time: now,
                connections: 0,
                next_op: 0,
                ongoing: HashMap::new(),
                completed: RangeList::new(),
                canceled: false,
            }),
            conn_tx,
            backend: tokio::sync::Mutex::new(None),
            spec,
        }
    }

    pub fn spec(&self) -> &TicketSpec {
        &self.spec
    }

    pub fn uuid(&self) -> &str {
        &self.spec.uuid
    }

    pub fn size(&self) -> u64 {
        self.spec.size
    }

    pub fn transfer_label(&self) -> String {
        self.spec.transfer_label()
    }

    pub fn canceled(&self) -> bool {
        self.state.lock().unwrap().canceled
    }

    /// Update the last-activity timestamp without running an operation.
    pub fn touch(&self) {
        self.state.lock().unwrap().access_time = Instant::now();
    }

    /// Register an operation, checking every authorization condition under
    /// one lock acquisition.
    fn start_op(self: &Arc<Self>, verb: Verb, offset: u64, length: u64) -> ImageResult<Lease> {
        let record = {
            let mut state = self.state.lock().unwrap();
            if state.canceled {
                return Err(Error::Forbidden(format!(
                    "ticket {} was canceled",
                    self.spec.uuid
                )));
            }
            // An expired ticket with live connections keeps authorizing so
            // an in-progress transfer is not cut mid-flight; the ticket
            // dies when the last connection goes away.
            if Instant::now() >= state.expires && state.connections == 0 {
                return Err(Error::Forbidden(format!(
                    "ticket {} expired",
                    self.spec.uuid
                )));
            }
            if !self.spec.may(verb) {
                return Err(Error::Forbidden(format!(
                    "ticket {} forbids {}",
                    self.spec.uuid, verb
                )));
            }
            if offset
                .checked_add(length)
                .map_or(true, |end| end > self.spec.size)
            {
                return Err(Error::RangeNotSatisfiable {
                    size: self.spec.size,
                });
            }

            let record = Arc::new(OpRecord::new(verb, offset, length));
            let op_id = state.next_op;
            state.next_op += 1;
            state.ongoing.insert(op_id, Arc::clone(&record));
            state.connections += 1;
            let connections = state.connections;
            drop(state);
            self.conn_tx.send_replace(connections);
            (op_id, record)
        };

        Ok(Lease {
            ticket: Arc::clone(self),
            op_id: record.0,
            record: record.1,
        })
    }

    fn finish_op(&self, op_id: u64) {
        let connections = {
            let mut state = self.state.lock().unwrap();
            if let Some(record) = state.ongoing.remove(&op_id) {
                let done = record.done();
                state
                    .completed
                    .add(Range::new(record.offset, record.offset + done));
            }
            state.connections = state.connections.saturating_sub(1);
            state.access_time = Instant::now();
            state.connections
        };
        self.conn_tx.send_replace(connections);
    }

    /// Enter the canceling state and signal every ongoing operation.
    fn start_cancel(&self) {
        let signals: Vec<CancelSignal> = {
            let mut state = self.state.lock().unwrap();
            state.canceled = true;
            state.ongoing.values().map(|op| op.cancel.clone()).collect()
        };
        for signal in signals {
            signal.set();
        }
    }

    /// Wait until no connection holds this ticket.
    async fn wait_quiesce(&self) {
        let mut rx = self.conn_tx.subscribe();
        while *rx.borrow_and_update() != 0 {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Extend or expire. `timeout == 0` expires immediately; otherwise the
    /// deadline never moves backwards.
    fn extend(&self, timeout: u64) -> ImageResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.canceled {
            return Err(Error::Forbidden(format!(
                "ticket {} was canceled",
                self.spec.uuid
            )));
        }
        let now = Instant::now();
        state.expires = if timeout == 0 {
            now
        } else {
            state.expires.max(now + Duration::from_secs(timeout))
        };
        state.access_time = now;
        Ok(())
    }

    /// Expire the ticket when it sat idle past its inactivity timeout.
    fn expire_if_inactive(&self, now: Instant) {
        let mut state = self.state.lock().unwrap();
        if state.connections > 0 || state.canceled || now >= state.expires {
            return;
        }
        if now.duration_since(state.access_time) >= self.inactivity_timeout {
            info!(
                "ticket {} inactive for {:?}, expiring",
                self.spec.uuid, self.inactivity_timeout
            );
            state.expires = now;
        }
    }

    /// Bytes transferred so far. Meaningful only for tickets flowing in a
    /// single direction; overlapping read/write intervals cannot be summed.
    pub fn transferred(&self) -> Option<u64> {
        if self.spec.ops.len() > 1 {
            return None;
        }
        let state = self.state.lock().unwrap();
        let mut ranges = state.completed.clone();
        ranges.update(state.ongoing.values().map(|op| {
            let done = op.done();
            Range::new(op.offset, op.offset + done)
        }));
        Some(ranges.sum())
    }

    /// Status snapshot for the control plane.
    pub fn info(&self) -> TicketInfo {
        let transferred = self.transferred();
        let state = self.state.lock().unwrap();
        let now = Instant::now();
        let active = !state.ongoing.is_empty();
        TicketInfo {
            uuid: self.spec.uuid.clone(),
            size: self.spec.size,
            url: self.spec.url.clone(),
            ops: self.spec.ops.clone(),
            timeout: self.spec.timeout,
            sparse: self.spec.sparse,
            dirty: self.spec.dirty,
            transfer_id: self.spec.transfer_label(),
            filename: self.spec.filename.clone(),
            expires: state.expires.saturating_duration_since(now).as_secs(),
            idle_time: if active {
                0
            } else {
                now.saturating_duration_since(state.access_time).as_secs()
            },
            connections: state.connections,
            active,
            canceled: state.canceled,
            transferred,
        }
    }

    /// The cached backend for this ticket, if one was opened.
    pub async fn cached_backend(&self) -> Option<Arc<dyn Backend>> {
        self.backend.lock().await.clone()
    }

    pub async fn set_backend(&self, backend: Arc<dyn Backend>) {
        *self.backend.lock().await = Some(backend);
    }

    /// Lock the backend cache for get-or-open without double opening.
    pub async fn backend_slot(
        &self,
    ) -> tokio::sync::MutexGuard<'_, Option<Arc<dyn Backend>>> {
        self.backend.lock().await
    }

    async fn close_backend(&self) {
        if let Some(backend) = self.backend.lock().await.take() {
            if let Err(e) = backend.close().await {
                warn!("error closing backend of ticket {}: {}", self.spec.uuid, e);
            }
        }
    }
}

/// Data-plane grant: pins the ticket, counts as a connection, carries the
/// operation record. Releasing (or dropping) the lease merges the bytes
/// done into the ticket's completed ranges.
pub struct Lease {
    ticket: Arc<Ticket>,
    op_id: u64,
    record: Arc<OpRecord>,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").field("op_id", &self.op_id).finish()
    }
}

impl Lease {
    pub fn ticket(&self) -> &Arc<Ticket> {
        &self.ticket
    }

    pub fn cancel_signal(&self) -> CancelSignal {
        self.record.cancel.clone()
    }

    /// Account `n` more bytes moved by this operation.
    pub fn add_done(&self, n: u64) {
        self.record.done.fetch_add(n, Ordering::Relaxed);
    }

    pub fn done(&self) -> u64 {
        self.record.done()
    }

    pub fn release(self) {
        // Bookkeeping happens in Drop so early returns and panics release
        // the lease the same way.
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.ticket.finish_op(self.op_id);
    }
}

/// Ticket status snapshot returned by `GET /tickets/{id}`.
#[derive(Debug, Clone, Serialize)]
pub struct TicketInfo {
    pub uuid: String,
    pub size: u64,
    pub url: String,
    pub ops: Vec<Verb>,
    pub timeout: u64,
    pub sparse: bool,
    pub dirty: bool,
    pub transfer_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// Seconds until expiration, 0 when already expired.
    pub expires: u64,
    /// Seconds since the last activity, 0 while operations are running.
    pub idle_time: u64,
    pub connections: u64,
    pub active: bool,
    pub canceled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transferred: Option<u64>,
}

/// The process-wide ticket table.
pub struct Authorizer {
    default_inactivity: Duration,
    tickets: Mutex<HashMap<String, Arc<Ticket>>>,
}

impl Authorizer {
    pub fn new(default_inactivity: Duration) -> Arc<Self> {
        Arc::new(Authorizer {
            default_inactivity,
            tickets: Mutex::new(HashMap::new()),
        })
    }

    /// Install a ticket, replacing any existing ticket with the same id.
    /// Replacing lets the orchestrator retry an install after a network
    /// failure without a delete round trip.
    pub fn add(&self, spec: TicketSpec) -> ImageResult<()> {
        spec.validate()?;
        let uuid = spec.uuid.clone();
        let ticket = Arc::new(Ticket::new(spec, self.default_inactivity));
        let old = self.tickets.lock().unwrap().insert(uuid.clone(), ticket);
        if old.is_some() {
            debug!("replaced ticket {}", uuid);
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> ImageResult<Arc<Ticket>> {
        self.tickets
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no such ticket {id:?}")))
    }

    pub fn ids(&self) -> Vec<String> {
        self.tickets.lock().unwrap().keys().cloned().collect()
    }

    /// Atomic check-and-register: returns a lease on success.
    pub fn authorize(
        &self,
        id: &str,
        verb: Verb,
        offset: u64,
        length: u64,
    ) -> ImageResult<Lease> {
        let ticket = self
            .tickets
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::Forbidden(format!("no such ticket {id:?}")))?;
        ticket.start_op(verb, offset, length)
    }

    pub fn extend(&self, id: &str, timeout: u64) -> ImageResult<()> {
        self.get(id)?.extend(timeout)
    }

    /// Cancel a ticket and remove it once quiescent.
    ///
    /// With a zero timeout this waits until every connection released the
    /// ticket. With a positive timeout the ticket is force-removed at the
    /// deadline and live requests are disconnected by their raised cancel
    /// signals. Canceling a missing ticket is a no-op, DELETE is
    /// idempotent.
    pub async fn cancel(&self, id: &str, timeout: Duration) -> ImageResult<()> {
        let ticket = match self.tickets.lock().unwrap().get(id).cloned() {
            Some(ticket) => ticket,
            None => return Ok(()),
        };

        ticket.start_cancel();

        if timeout.is_zero() {
            ticket.wait_quiesce().await;
        } else if tokio::time::timeout(timeout, ticket.wait_quiesce())
            .await
            .is_err()
        {
            warn!(
                "ticket {} still active after {:?}, disconnecting users",
                id, timeout
            );
            ticket.start_cancel();
        }

        // Remove only the ticket we canceled; the id may have been reused
        // by a new install while we waited.
        {
            let mut tickets = self.tickets.lock().unwrap();
            if let Some(current) = tickets.get(id) {
                if Arc::ptr_eq(current, &ticket) {
                    tickets.remove(id);
                }
            }
        }
        ticket.close_backend().await;
        info!("removed ticket {}", id);
        Ok(())
    }

    /// Synchronous alias for `cancel(id, 0)`.
    pub async fn remove(&self, id: &str) -> ImageResult<()> {
        self.cancel(id, Duration::ZERO).await
    }

    /// Cancel all tickets, bounded by `timeout` each. Used by DELETE of the
    /// whole collection and by server shutdown.
    pub async fn clear(&self, timeout: Duration) {
        for id in self.ids() {
            let _ = self.cancel(&id, timeout).await;
        }
    }

    /// Expire tickets idle past their inactivity timeout. Driven by a
    /// periodic task in the daemon.
    pub fn expire_inactive(&self) {
        let now = Instant::now();
        let tickets: Vec<Arc<Ticket>> =
            self.tickets.lock().unwrap().values().cloned().collect();
        for ticket in tickets {
            ticket.expire_if_inactive(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(ops: &[Verb]) -> TicketSpec {
        TicketSpec {
            uuid: uuid::Uuid::new_v4().to_string(),
            size: 1024 * 1024,
            url: "file:///no/such/image".into(),
            timeout: 300,
            ops: ops.to_vec(),
            sparse: false,
            dirty: false,
            inactivity_timeout: None,
            transfer_id: None,
            filename: None,
        }
    }

    fn authorizer() -> Arc<Authorizer> {
        Authorizer::new(Duration::from_secs(60))
    }

    #[test]
    fn test_add_and_get() {
        let auth = authorizer();
        let spec = spec(&[Verb::Read]);
        auth.add(spec.clone()).unwrap();
        let ticket = auth.get(&spec.uuid).unwrap();
        assert_eq!(ticket.uuid(), spec.uuid);
        assert!(auth.get("missing").is_err());
    }

    #[test]
    fn test_add_replaces() {
        let auth = authorizer();
        let mut spec = spec(&[Verb::Read]);
        auth.add(spec.clone()).unwrap();
        spec.size = 2048;
        auth.add(spec.clone()).unwrap();
        assert_eq!(auth.get(&spec.uuid).unwrap().size(), 2048);
    }

    #[test]
    fn test_authorize_read_only() {
        let auth = authorizer();
        let spec = spec(&[Verb::Read]);
        auth.add(spec.clone()).unwrap();

        let lease = auth.authorize(&spec.uuid, Verb::Read, 0, 100).unwrap();
        lease.release();

        let err = auth.authorize(&spec.uuid, Verb::Write, 0, 100).unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[test]
    fn test_write_implies_read() {
        let auth = authorizer();
        let spec = spec(&[Verb::Write]);
        auth.add(spec.clone()).unwrap();

        auth.authorize(&spec.uuid, Verb::Write, 0, 100).unwrap();
        auth.authorize(&spec.uuid, Verb::Read, 0, 100).unwrap();
    }

    #[test]
    fn test_authorize_range() {
        let auth = authorizer();
        let spec = spec(&[Verb::Read]);
        auth.add(spec.clone()).unwrap();
        let size = spec.size;

        auth.authorize(&spec.uuid, Verb::Read, 0, size).unwrap();
        auth.authorize(&spec.uuid, Verb::Read, size - 1, 1).unwrap();

        let err = auth
            .authorize(&spec.uuid, Verb::Read, 0, size + 1)
            .unwrap_err();
        assert!(matches!(err, Error::RangeNotSatisfiable { .. }));

        let err = auth
            .authorize(&spec.uuid, Verb::Read, size, 1)
            .unwrap_err();
        assert!(matches!(err, Error::RangeNotSatisfiable { .. }));
    }

    #[test]
    fn test_authorize_unknown_ticket() {
        let auth = authorizer();
        let err = auth.authorize("missing", Verb::Read, 0, 1).unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[test]
    fn test_extend_zero_expires() {
        let auth = authorizer();
        let spec = spec(&[Verb::Read]);
        auth.add(spec.clone()).unwrap();

        auth.extend(&spec.uuid, 0).unwrap();
        let err = auth.authorize(&spec.uuid, Verb::Read, 0, 1).unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[test]
    fn test_extend_revives_expired() {
        let auth = authorizer();
        let spec = spec(&[Verb::Read]);
        auth.add(spec.clone()).unwrap();

        auth.extend(&spec.uuid, 0).unwrap();
        auth.extend(&spec.uuid, 300).unwrap();
        auth.authorize(&spec.uuid, Verb::Read, 0, 1).unwrap();
    }

    #[test]
    fn test_extend_never_shortens() {
        let auth = authorizer();
        let spec = spec(&[Verb::Read]);
        auth.add(spec.clone()).unwrap();

        // Shorter timeout does not move the deadline backwards.
        auth.extend(&spec.uuid, 1).unwrap();
        let info = auth.get(&spec.uuid).unwrap().info();
        assert!(info.expires >= 299, "expires = {}", info.expires);
    }

    #[test]
    fn test_expired_with_connections_still_authorizes() {
        let auth = authorizer();
        let spec = spec(&[Verb::Read]);
        auth.add(spec.clone()).unwrap();

        let lease = auth.authorize(&spec.uuid, Verb::Read, 0, 100).unwrap();
        auth.extend(&spec.uuid, 0).unwrap();

        // A live connection keeps the expired ticket usable.
        let second = auth.authorize(&spec.uuid, Verb::Read, 100, 100).unwrap();
        second.release();
        lease.release();

        // Once idle, the expired ticket refuses.
        let err = auth.authorize(&spec.uuid, Verb::Read, 0, 1).unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[test]
    fn test_transferred_nothing() {
        let auth = authorizer();
        let spec = spec(&[Verb::Read]);
        auth.add(spec.clone()).unwrap();
        assert_eq!(auth.get(&spec.uuid).unwrap().transferred(), Some(0));
    }

    #[test]
    fn test_transferred_ordered_ops() {
        let auth = authorizer();
        let spec = spec(&[Verb::Read]);
        auth.add(spec.clone()).unwrap();
        let ticket = auth.get(&spec.uuid).unwrap();

        for (offset, length) in [(0, 100), (100, 100), (200, 100)] {
            let lease = auth.authorize(&spec.uuid, Verb::Read, offset, length).unwrap();
            lease.add_done(length);
            lease.release();
        }
        assert_eq!(ticket.transferred(), Some(300));
    }

    #[test]
    fn test_transferred_unordered_and_overlapping() {
        let auth = authorizer();
        let spec = spec(&[Verb::Read]);
        auth.add(spec.clone()).unwrap();
        let ticket = auth.get(&spec.uuid).unwrap();

        for (offset, length) in [(100, 100), (0, 120), (180, 120)] {
            let lease = auth.authorize(&spec.uuid, Verb::Read, offset, length).unwrap();
            lease.add_done(length);
            lease.release();
        }
        assert_eq!(ticket.transferred(), Some(300));
    }

    #[test]
    fn test_transferred_includes_ongoing() {
        let auth = authorizer();
        let spec = spec(&[Verb::Read]);
        auth.add(spec.clone()).unwrap();
        let ticket = auth.get(&spec.uuid).unwrap();

        let lease = auth.authorize(&spec.uuid, Verb::Read, 0, 200).unwrap();
        assert_eq!(ticket.transferred(), Some(0));

        lease.add_done(100);
        assert_eq!(ticket.transferred(), Some(100));
        assert!(ticket.info().active);

        lease.add_done(100);
        lease.release();
        assert_eq!(ticket.transferred(), Some(200));
        assert!(!ticket.info().active);
    }

    #[test]
    fn test_transferred_not_reported_for_read_write() {
        let auth = authorizer();
        let spec = spec(&[Verb::Read, Verb::Write]);
        auth.add(spec.clone()).unwrap();
        assert_eq!(auth.get(&spec.uuid).unwrap().transferred(), None);
    }

    #[test]
    fn test_partial_op_counts_done_bytes_only() {
        let auth = authorizer();
        let spec = spec(&[Verb::Read]);
        auth.add(spec.clone()).unwrap();
        let ticket = auth.get(&spec.uuid).unwrap();

        let lease = auth.authorize(&spec.uuid, Verb::Read, 0, 1000).unwrap();
        lease.add_done(300);
        lease.release();
        assert_eq!(ticket.transferred(), Some(300));
    }

    #[tokio::test]
    async fn test_cancel_idle_ticket() {
        let auth = authorizer();
        let spec = spec(&[Verb::Read]);
        auth.add(spec.clone()).unwrap();

        auth.cancel(&spec.uuid, Duration::ZERO).await.unwrap();
        assert!(auth.get(&spec.uuid).is_err());
    }

    #[tokio::test]
    async fn test_cancel_missing_is_idempotent() {
        let auth = authorizer();
        auth.cancel("missing", Duration::ZERO).await.unwrap();
    }

    #[tokio::test]
    async fn test_canceled_blocks_authorize() {
        let auth = authorizer();
        let spec = spec(&[Verb::Write]);
        auth.add(spec.clone()).unwrap();

        // Hold a lease so cancel does not remove the ticket under us.
        let lease = auth.authorize(&spec.uuid, Verb::Write, 0, 100).unwrap();
        let auth2 = Arc::clone(&auth);
        let uuid = spec.uuid.clone();
        let canceler = tokio::spawn(async move { auth2.cancel(&uuid, Duration::ZERO).await });

        // Wait for the cancel signal to reach our operation.
        lease.cancel_signal().cancelled().await;

        for verb in [Verb::Read, Verb::Write] {
            let err = auth.authorize(&spec.uuid, verb, 0, 1).unwrap_err();
            assert!(matches!(err, Error::Forbidden(_)));
        }

        lease.release();
        canceler.await.unwrap().unwrap();
        assert!(auth.get(&spec.uuid).is_err());
    }

    #[tokio::test]
    async fn test_cancel_waits_for_quiescence() {
        let auth = authorizer();
        let spec = spec(&[Verb::Read]);
        auth.add(spec.clone()).unwrap();

        let lease = auth.authorize(&spec.uuid, Verb::Read, 0, 100).unwrap();
        let signal = lease.cancel_signal();

        // Release the lease shortly after cancellation is signaled.
        tokio::spawn(async move {
            signal.cancelled().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
            lease.release();
        });

        auth.cancel(&spec.uuid, Duration::ZERO).await.unwrap();
        assert!(auth.get(&spec.uuid).is_err());
    }

    #[tokio::test]
    async fn test_cancel_timeout_forces_removal() {
        let auth = authorizer();
        let spec = spec(&[Verb::Read]);
        auth.add(spec.clone()).unwrap();

        // A stuck operation that never releases in time.
        let lease = auth.authorize(&spec.uuid, Verb::Read, 0, 100).unwrap();

        auth.cancel(&spec.uuid, Duration::from_millis(20))
            .await
            .unwrap();

        // Ticket is gone even though the lease is still alive, and the
        // operation was told to abort.
        assert!(auth.get(&spec.uuid).is_err());
        assert!(lease.cancel_signal().is_set());
        lease.release();
    }

    #[tokio::test]
    async fn test_cancel_does_not_remove_replacement() {
        let auth = authorizer();
        let spec1 = spec(&[Verb::Read]);
        auth.add(spec1.clone()).unwrap();
        let lease = auth.authorize(&spec1.uuid, Verb::Read, 0, 100).unwrap();

        let auth2 = Arc::clone(&auth);
        let uuid = spec1.uuid.clone();
        let canceler = tokio::spawn(async move { auth2.cancel(&uuid, Duration::ZERO).await });
        lease.cancel_signal().cancelled().await;

        // Reinstall the same id while the cancel is waiting.
        let mut spec2 = spec1.clone();
        spec2.size = 4096;
        auth.add(spec2.clone()).unwrap();

        lease.release();
        canceler.await.unwrap().unwrap();

        // The replacement survived the old ticket's removal.
        assert_eq!(auth.get(&spec1.uuid).unwrap().size(), 4096);
    }

    #[test]
    fn test_inactivity_expiration() {
        let auth = Authorizer::new(Duration::ZERO);
        let mut s = spec(&[Verb::Read]);
        s.inactivity_timeout = Some(0);
        auth.add(s.clone()).unwrap();

        // Idle with a zero inactivity timeout expires on the next sweep.
        auth.expire_inactive();
        let err = auth.authorize(&s.uuid, Verb::Read, 0, 1).unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[test]
    fn test_inactivity_skips_connected_tickets() {
        let auth = Authorizer::new(Duration::ZERO);
        let mut s = spec(&[Verb::Read]);
        s.inactivity_timeout = Some(0);
        auth.add(s.clone()).unwrap();

        let lease = auth.authorize(&s.uuid, Verb::Read, 0, 100).unwrap();
        auth.expire_inactive();

        // Connections inhibit inactivity expiration.
        auth.authorize(&s.uuid, Verb::Read, 100, 100).unwrap();
        lease.release();
    }

    #[test]
    fn test_info_snapshot() {
        let auth = authorizer();
        let mut s = spec(&[Verb::Read]);
        s.transfer_id = Some("xfer-1".into());
        s.filename = Some("disk.raw".into());
        auth.add(s.clone()).unwrap();
        let ticket = auth.get(&s.uuid).unwrap();

        let info = ticket.info();
        assert_eq!(info.uuid, s.uuid);
        assert_eq!(info.size, s.size);
        assert_eq!(info.transfer_id, "xfer-1");
        assert_eq!(info.filename.as_deref(), Some("disk.raw"));
        assert_eq!(info.connections, 0);
        assert!(!info.active);
        assert!(!info.canceled);
        assert_eq!(info.transferred, Some(0));
        assert!(info.expires > 0);

        let lease = auth.authorize(&s.uuid, Verb::Read, 0, 100).unwrap();
        let info = ticket.info();
        assert_eq!(info.connections, 1);
        assert!(info.active);
        assert_eq!(info.idle_time, 0);
        lease.release();
    }

    #[tokio::test]
    async fn test_clear() {
        let auth = authorizer();
        let a = spec(&[Verb::Read]);
        let b = spec(&[Verb::Write]);
        auth.add(a.clone()).unwrap();
        auth.add(b.clone()).unwrap();
        assert_eq!(auth.ids().len(), 2);

        auth.clear(Duration::from_millis(10)).await;
        assert!(auth.ids().is_empty());
    }
}

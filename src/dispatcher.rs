//! The single-threaded event loop.
//!
//! Maintains a descriptor list ordered [crate interrupt endpoints]
//! [listener][clients], blocks once per iteration in [`signals::ppoll`],
//! then services whatever became ready. Hardware events are swept in
//! descending IRQ priority; client messages are decoded and dispatched by
//! tag.

use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::codec::{self, Frame, RecvOutcome};
use crate::error::Error;
use crate::hardware::{CrateAdapter, CrateHandle};
use crate::selector::Selector;
use crate::signals::{self, Caught};
use crate::status::ServerStatus;
use crate::table::SubscriptionTable;

struct AttachedCrate {
    crate_num: u8,
    handle: Box<dyn CrateHandle>,
}

/// Owns every piece of dispatcher state: attached crates, the listening
/// socket, connected clients, and the subscription table.
pub struct Dispatcher {
    crates: Vec<AttachedCrate>,
    listener: crate::socket::Listener,
    clients: Vec<UnixStream>,
    table: SubscriptionTable,
    fake_ok: bool,
    delivery_timeout: Duration,
}

impl Dispatcher {
    /// Enumerate crates 0..15 through `adapter` (skipped entirely when
    /// `adapter` is the simulated backend), bind the listener, and return a
    /// ready-to-run dispatcher.
    pub fn new(
        mut adapter: Box<dyn CrateAdapter>,
        socket_name: &str,
        fake_ok: bool,
        delivery_timeout: Duration,
    ) -> Result<Self, Error> {
        let mut crates = Vec::new();
        for crate_num in 0..16u8 {
            if let Some(handle) = adapter.open(crate_num)? {
                crates.push(AttachedCrate { crate_num, handle });
            }
        }
        let listener = crate::socket::Listener::bind(socket_name)?;
        Ok(Self {
            crates,
            listener,
            clients: Vec::new(),
            table: SubscriptionTable::new(),
            fake_ok,
            delivery_timeout,
        })
    }

    fn attached_crate_mask(&self) -> u32 {
        self.crates
            .iter()
            .fold(0u32, |mask, c| mask | (1u32 << c.crate_num))
    }

    fn build_status(&self) -> ServerStatus {
        ServerStatus {
            pid: std::process::id() as i32,
            crates: self.attached_crate_mask(),
            clients: self.clients.len() as u32,
            irq_requests: self.table.count() as u32,
        }
    }

    /// Run until a `SIGTERM` is received, then return.
    pub fn run(&mut self) -> Result<(), Error> {
        loop {
            let mut fds: Vec<libc::pollfd> = Vec::with_capacity(self.crates.len() + 1 + self.clients.len());
            for c in &self.crates {
                fds.push(libc::pollfd {
                    fd: c.handle.interrupt_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                });
            }
            fds.push(libc::pollfd {
                fd: self.listener.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            });
            for client in &self.clients {
                fds.push(libc::pollfd {
                    fd: client.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                });
            }

            match signals::ppoll(&mut fds)? {
                None => match signals::take_caught() {
                    Caught::Term => {
                        info!("received SIGTERM, shutting down");
                        return Ok(());
                    }
                    Caught::Usr1 => {
                        let status = self.build_status();
                        info!("status: {status}");
                    }
                    Caught::Other(sig) => {
                        error!("unexpected signal {sig}");
                    }
                },
                Some(_) => self.service_ready(&fds)?,
            }
        }
    }

    fn service_ready(&mut self, fds: &[libc::pollfd]) -> Result<(), Error> {
        let ncrates = self.crates.len();
        let listener_idx = ncrates;

        for i in 0..ncrates {
            if fds[i].revents != 0 {
                if let Err(e) = self.process_crate(i) {
                    error!("error processing crate {}: {e}", self.crates[i].crate_num);
                }
            }
        }

        if fds[listener_idx].revents != 0 {
            self.accept_new_client();
        }

        // Walk client indices high to low: removals shift only the tail of
        // the vector, which has already been serviced by this point.
        for i in (0..self.clients.len()).rev() {
            let poll_idx = listener_idx + 1 + i;
            if poll_idx < fds.len() && fds[poll_idx].revents != 0 {
                self.process_client(i)?;
            }
        }
        Ok(())
    }

    fn accept_new_client(&mut self) {
        match self.listener.accept() {
            Ok(stream) => {
                self.clients.push(stream);
                info!("accepted client connection ({} total)", self.clients.len());
            }
            Err(e) => error!("accept() failed: {e}"),
        }
    }

    /// Full recompute: each crate's enable register becomes the union of
    /// IRQ masks across every subscription that names it. The only path
    /// allowed to *shrink* a crate's enable register, since it's the only
    /// one that can tell a line has no more subscribers at all.
    fn recompute_enables(&mut self) -> Result<(), Error> {
        let masks = self.table.enumerate_enable_masks();
        for c in &mut self.crates {
            let mask = masks[c.crate_num as usize];
            c.handle.enable_set(mask)?;
        }
        Ok(())
    }

    /// Widen the affected crates' live enable registers by OR-ing in
    /// `selector`'s IRQ bits. Used on a successful REQUEST: unlike
    /// [`Self::recompute_enables`], this never clears a bit, so it can't
    /// undo a line [`Self::process_crate`] disabled for being unclearable.
    fn widen_enables_for(&mut self, selector: &Selector) -> Result<(), Error> {
        for c in &mut self.crates {
            if selector.crate_mask & (1u16 << c.crate_num) == 0 {
                continue;
            }
            let current = c.handle.enable_get()?;
            c.handle.enable_set(current | selector.irq_mask)?;
        }
        Ok(())
    }

    /// Drain every pending interrupt on the crate at poll-index `idx`,
    /// highest-priority line first. A line that was acknowledged starts a
    /// fresh priority sweep immediately; only a line that failed delivery
    /// (no subscriber, NAK, or a transport error) and is still asserted
    /// gets disabled to prevent it from starving lower-priority lines.
    fn process_crate(&mut self, idx: usize) -> Result<(), Error> {
        self.crates[idx].handle.consume_notification()?;
        let crate_num = self.crates[idx].crate_num;
        let mut enable_mask = self.crates[idx].handle.enable_get()?;

        loop {
            let pending = self.crates[idx].handle.pending()? & enable_mask;
            if pending == 0 {
                return Ok(());
            }
            let irq = Selector::highest_bit(pending as u32) as u8;

            let vector = self.crates[idx].handle.fetch_vector(irq)?;
            let concrete = Selector::concrete(crate_num, irq, vector, 0);
            let acked = self.deliver(&concrete)?;
            if acked {
                continue;
            }

            let still_pending = self.crates[idx].handle.pending()? & (1u8 << irq) != 0;
            if !still_pending {
                continue;
            }

            warn!("disabling unclearable interrupt: crate {crate_num} irq {irq}");
            enable_mask &= !(1u8 << irq);
            self.crates[idx].handle.enable_set(enable_mask)?;
        }
    }

    /// Look up the subscriber for `concrete` and attempt delivery, logging
    /// the outcome. Returns `Ok(true)` only when the client ACK'd; a NAK,
    /// no matching subscription, a disconnected owner, or a transport
    /// failure all report `Ok(false)` rather than propagating an error, so
    /// the hardware sweep always continues.
    fn deliver(&mut self, concrete: &Selector) -> Result<bool, Error> {
        let found = self.table.match_concrete(concrete);
        let Some(m) = found else {
            warn!(
                "no target for {:04X}:{:02X}:{:08X}",
                concrete.crate_mask, concrete.irq_mask, concrete.vector
            );
            return Ok(false);
        };

        let Some(client) = self
            .clients
            .iter_mut()
            .find(|c| c.as_raw_fd() as u64 == m.token)
        else {
            warn!("subscription owner {} is no longer connected", m.token);
            return Ok(false);
        };

        debug!(
            "sending IRQ {:04X}:{:02X}:{:08X}",
            concrete.crate_mask, concrete.irq_mask, concrete.vector
        );
        let frame = Frame::Signal(Selector::new(
            concrete.crate_mask,
            concrete.irq_mask,
            concrete.vector,
            m.payload,
        ));
        match codec::send_and_expect_ack_timeout(
            client,
            &frame,
            m.token,
            self.delivery_timeout.as_millis() as u64,
        ) {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("delivery to token {} failed: {e}", m.token);
                Ok(false)
            }
        }
    }

    fn process_client(&mut self, client_idx: usize) -> Result<(), Error> {
        let token = self.clients[client_idx].as_raw_fd() as u64;

        let outcome = codec::recv(&mut self.clients[client_idx], token);
        let frame = match outcome {
            Ok(RecvOutcome::Frame(f)) => f,
            Ok(RecvOutcome::PeerClosed) => {
                self.clients.remove(client_idx);
                self.table.release_all(token);
                self.recompute_enables()?;
                info!("disconnected client ({} left)", self.clients.len());
                return Ok(());
            }
            Err(e) => {
                error!("failed to get message from token {token}: {e}");
                return Ok(());
            }
        };

        match frame {
            Frame::Request(sel) => {
                let result = self.table.insert(sel, token);
                let reply = if result.is_ok() { Frame::Ack } else { Frame::Nak };
                if let Err(e) = &result {
                    error!("failed to register interrupt: {e}");
                }
                if let Err(e) = codec::send(&mut self.clients[client_idx], &reply, token) {
                    error!("error replying to REQUEST: {e}");
                }
                if result.is_ok() {
                    self.widen_enables_for(&sel)?;
                }
            }
            Frame::Release(sel) => {
                let result = self.table.release(&sel, token);
                let reply = if result.is_ok() { Frame::Ack } else { Frame::Nak };
                if let Err(e) = result {
                    error!("failed to release interrupt: {e}");
                }
                if let Err(e) = codec::send(&mut self.clients[client_idx], &reply, token) {
                    error!("error replying to RELEASE: {e}");
                }
                self.recompute_enables()?;
            }
            Frame::Signal(sel) => {
                if self.fake_ok {
                    if let Err(e) = codec::send(&mut self.clients[client_idx], &Frame::Ack, token) {
                        error!("error ACKing fake interrupt: {e}");
                    }
                    self.deliver(&sel)?;
                } else if let Err(e) = codec::send(&mut self.clients[client_idx], &Frame::Nak, token) {
                    error!("error NAKing fake interrupt: {e}");
                }
            }
            Frame::Status(_) => {
                let status = self.build_status();
                if let Err(e) = codec::send(
                    &mut self.clients[client_idx],
                    &Frame::Status(status),
                    token,
                ) {
                    error!("error replying to STATUS: {e}");
                }
            }
            Frame::Ack | Frame::Nak => {
                warn!("unsolicited {} from token {token}, dropping", frame.tag().name());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::ANYVECTOR;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::rc::Rc;
    use std::sync::atomic::{AtomicU32, Ordering};

    static TEST_SOCKET_COUNTER: AtomicU32 = AtomicU32::new(0);

    fn unique_test_socket() -> String {
        let n = TEST_SOCKET_COUNTER.fetch_add(1, Ordering::SeqCst);
        format!("@vmeirqd-dispatcher-test-{}-{n}", std::process::id())
    }

    fn test_dispatcher(crates: Vec<AttachedCrate>) -> Dispatcher {
        Dispatcher {
            crates,
            listener: crate::socket::Listener::bind(&unique_test_socket()).unwrap(),
            clients: Vec::new(),
            table: SubscriptionTable::new(),
            fake_ok: false,
            delivery_timeout: Duration::from_millis(200),
        }
    }

    /// Shared state behind a [`FakeCrateHandle`], kept by an `Rc` the test
    /// holds on to after the handle itself is boxed into a crate slot, so
    /// assertions can inspect what happened during the run.
    #[derive(Default)]
    struct FakeCrateState {
        pending_sequence: RefCell<VecDeque<u8>>,
        enable: Cell<u8>,
        enable_log: RefCell<Vec<u8>>,
        fetch_log: RefCell<Vec<u8>>,
    }

    /// A crate whose `pending()` reads step through a fixed sequence (one
    /// value per call, the last value repeating once exhausted).
    struct FakeCrateHandle(Rc<FakeCrateState>);

    fn fake_crate(pending_sequence: Vec<u8>, enable: u8) -> (AttachedCrate, Rc<FakeCrateState>) {
        let state = Rc::new(FakeCrateState {
            pending_sequence: RefCell::new(pending_sequence.into()),
            enable: Cell::new(enable),
            ..Default::default()
        });
        let attached = AttachedCrate {
            crate_num: 0,
            handle: Box::new(FakeCrateHandle(state.clone())),
        };
        (attached, state)
    }

    impl CrateHandle for FakeCrateHandle {
        fn interrupt_fd(&self) -> std::os::fd::RawFd {
            0
        }

        fn consume_notification(&mut self) -> Result<(), Error> {
            Ok(())
        }

        fn pending(&self) -> Result<u8, Error> {
            let mut seq = self.0.pending_sequence.borrow_mut();
            if seq.len() > 1 {
                return Ok(seq.pop_front().unwrap());
            }
            Ok(seq.front().copied().unwrap_or(0))
        }

        fn enable_get(&self) -> Result<u8, Error> {
            Ok(self.0.enable.get())
        }

        fn enable_set(&mut self, mask: u8) -> Result<(), Error> {
            self.0.enable.set(mask);
            self.0.enable_log.borrow_mut().push(mask);
            Ok(())
        }

        fn fetch_vector(&mut self, irq: u8) -> Result<u32, Error> {
            self.0.fetch_log.borrow_mut().push(irq);
            Ok(0x1000 + irq as u32)
        }
    }

    #[test]
    fn acked_delivery_restarts_the_sweep_without_disabling_anything() {
        // Highest-priority line (irq2, bit 0b100) first, then irq1
        // (0b010), then empty. Both deliveries are ACK'd by the
        // preloaded client reply, so the still-pending/disable check
        // must never run and the enable register must never be touched.
        let (attached, state) = fake_crate(vec![0b110, 0b010, 0b000], 0b110);
        let mut dispatcher = test_dispatcher(vec![attached]);

        let (server_end, mut client_end) = UnixStream::pair().unwrap();
        let token = server_end.as_raw_fd() as u64;
        dispatcher
            .table
            .insert(Selector::new(0x0001, 0b010, ANYVECTOR, 11), token)
            .unwrap();
        dispatcher
            .table
            .insert(Selector::new(0x0001, 0b100, ANYVECTOR, 22), token)
            .unwrap();
        dispatcher.clients.push(server_end);

        // Preload both ACK replies; order doesn't matter relative to the
        // SIGNAL frames written in the other direction of the pair.
        codec::send(&mut client_end, &Frame::Ack, 0).unwrap();
        codec::send(&mut client_end, &Frame::Ack, 0).unwrap();

        dispatcher.process_crate(0).unwrap();

        assert_eq!(*state.fetch_log.borrow(), vec![2, 1]);
        assert!(state.enable_log.borrow().is_empty());
    }

    #[test]
    fn unacked_and_still_asserted_line_gets_disabled() {
        // irq1 (0b010) pending, nothing subscribed so delivery can't
        // succeed; it's still asserted afterwards, so it must be masked
        // out of the live enable register.
        let (attached, state) = fake_crate(vec![0b010, 0b010, 0b010], 0b010);
        let mut dispatcher = test_dispatcher(vec![attached]);

        dispatcher.process_crate(0).unwrap();

        assert_eq!(*state.fetch_log.borrow(), vec![1]);
        assert_eq!(*state.enable_log.borrow(), vec![0b000]);
    }

    #[test]
    fn request_widens_without_restoring_a_disabled_line_release_recomputes_fully() {
        // crate 0 irq2 (0b100) is already registered but the hardware line
        // has been disabled out-of-band (e.g. by process_crate's
        // unclearable-line path); the table still lists it.
        let (attached, state) = fake_crate(vec![0b000], 0b000);
        let mut dispatcher = test_dispatcher(vec![attached]);
        dispatcher
            .table
            .insert(Selector::new(0x0001, 0b100, ANYVECTOR, 5), 999)
            .unwrap();

        let (server_end, mut client_end) = UnixStream::pair().unwrap();
        let token = server_end.as_raw_fd() as u64;
        dispatcher.clients.push(server_end);

        // REQUEST crate 0 irq1 (0b010): widening must OR 0b010 onto the
        // live register (0b000 -> 0b010) without restoring irq2.
        let request = Selector::new(0x0001, 0b010, ANYVECTOR, 7);
        codec::send(&mut client_end, &Frame::Request(request), 0).unwrap();
        dispatcher.process_client(0).unwrap();
        match codec::recv(&mut client_end, 0).unwrap() {
            RecvOutcome::Frame(Frame::Ack) => {}
            other => panic!("expected ACK, got {other:?}"),
        }
        assert_eq!(state.enable.get(), 0b010);

        // RELEASE that same subscription: the full recompute now derives
        // the register from what's left in the table, which still
        // includes the irq2 entry, so it comes back.
        codec::send(&mut client_end, &Frame::Release(request), token).unwrap();
        dispatcher.process_client(0).unwrap();
        match codec::recv(&mut client_end, 0).unwrap() {
            RecvOutcome::Frame(Frame::Ack) => {}
            other => panic!("expected ACK, got {other:?}"),
        }
        assert_eq!(state.enable.get(), 0b100);
    }
}

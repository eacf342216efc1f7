/*!
    one addressable peer on the bus.

    A [Module] is a lightweight handle over the shared device: it owns the
    per-peer bookkeeping (message numbers, the unfinished-command table, the
    negotiated command registry, the keep-alive timer) while every byte still
    moves through the device's single transmit path and reception loop.
*/

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
    sync::atomic::{AtomicBool, AtomicU8, Ordering},
    time::Duration,
    };
use packbytes::{ByteArray, FromBytes, ToBytes};
use tokio::{
    sync::oneshot,
    task::JoinHandle,
    time::Instant,
    };
use log::{debug, error, warn};

use crate::{
    commands::*,
    datagram::{Datagram, HOST_ADDRESS, PacketId},
    };
use super::{
    Error,
    device::DeviceShared,
    message::{Completion, CommandNumber, Outgoing, Pending, decode_payload},
    registry::{CommandRegistry, InterfaceStatus},
    };


/// capability hooks a device-specific controller composes over a module
///
/// Controllers cache output state for their own purposes; the engine calls
/// [forget_cached_state](Controller::forget_cached_state) whenever the peer
/// may have lost its volatile state, so those caches never go stale.
pub trait Controller: Send + Sync {
    /// the module reset or reconnected, drop any cached values
    fn forget_cached_state(&self);
    /// user engagement resumed
    fn on_engage(&self) {}
    /// user engagement suspended, outputs are floating
    fn on_disengage(&self) {}
}


pub struct Module {
    shared: Weak<DeviceShared>,
    /// handle on our own allocation, for the tasks the module spawns
    weak_self: Weak<Module>,
    address: AtomicU8,
    identity: String,
    is_parent: bool,
    /// made up by the host (discovery sender), not a real peer
    is_system_synthetic: bool,
    engaged: AtomicBool,
    open: AtomicBool,
    next_message_number: AtomicU8,
    state: Mutex<ModuleState>,
    /// serializes interface negotiation, which spans several awaits
    negotiation: tokio::sync::Mutex<()>,
    /// serializes multi-command exchanges whose replies must not interleave
    exclusive: tokio::sync::Mutex<()>,
    controllers: Mutex<Vec<Arc<dyn Controller>>>,
    last_transmit: Mutex<Instant>,
    tasks: Mutex<Tasks>,
}

struct ModuleState {
    /// message number to the command sent under it, the heart of correlation
    unfinished: HashMap<u8, Pending>,
    registry: CommandRegistry,
    /// interfaces to (re)negotiate whenever the module is initialized
    declared: Vec<&'static Interface>,
    /// last commanded indicator pattern, re-pushed after a peer reset
    last_pattern: Option<Vec<PatternStep>>,
}

#[derive(Default)]
struct Tasks {
    ping: Option<JoinHandle<()>>,
    attention: Option<JoinHandle<()>>,
}

impl Module {
    pub(crate) fn new(shared: &Arc<DeviceShared>, address: u8, is_parent: bool, is_system_synthetic: bool) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            shared: Arc::downgrade(shared),
            weak_self: weak_self.clone(),
            address: AtomicU8::new(address),
            identity: format!("{}:{}", shared.identity(), address),
            is_parent,
            is_system_synthetic,
            engaged: AtomicBool::new(true),
            open: AtomicBool::new(true),
            // a random starting point makes collisions with stale replies
            // from a previous session unlikely
            next_message_number: AtomicU8::new(rand::random()),
            state: Mutex::new(ModuleState {
                unfinished: HashMap::new(),
                registry: CommandRegistry::new(),
                declared: Vec::new(),
                last_pattern: None,
                }),
            negotiation: tokio::sync::Mutex::new(()),
            exclusive: tokio::sync::Mutex::new(()),
            controllers: Mutex::new(Vec::new()),
            last_transmit: Mutex::new(Instant::now()),
            tasks: Mutex::new(Tasks::default()),
        })
    }

    fn shared(&self) -> Result<Arc<DeviceShared>, Error> {
        self.shared.upgrade().ok_or(Error::Closed)
    }

    //  accessors

    pub fn address(&self) -> u8 {
        self.address.load(Ordering::SeqCst)
    }
    pub(crate) fn set_address(&self, address: u8) {
        self.address.store(address, Ordering::SeqCst);
    }
    /// stable identity string: the device identity plus the module address
    pub fn identity(&self) -> &str {
        &self.identity
    }
    /// whether this module is the directly usb-attached one
    pub fn is_parent(&self) -> bool {
        self.is_parent
    }
    pub fn is_system_synthetic(&self) -> bool {
        self.is_system_synthetic
    }
    /// entries currently in the unfinished-command table
    pub fn unfinished_commands(&self) -> usize {
        self.state.lock().unwrap().unfinished.len()
    }

    pub fn add_controller(&self, controller: Arc<dyn Controller>) {
        self.controllers.lock().unwrap().push(controller);
    }

    pub(crate) fn forget_cached_state(&self) {
        for controller in self.controllers.lock().unwrap().iter() {
            controller.forget_cached_state();
        }
    }

    //  engagement

    pub fn is_engaged(&self) -> bool {
        self.engaged.load(Ordering::SeqCst)
    }

    pub fn engage(&self) {
        if !self.engaged.swap(true, Ordering::SeqCst) {
            debug!("engaging mod={}", self.address());
            for controller in self.controllers.lock().unwrap().iter() {
                controller.on_engage();
            }
        }
    }

    /// stop live communication without tearing the channel down: everything
    /// in flight is nacked as abandoned and outputs are left to float
    pub fn disengage(&self) {
        if self.engaged.swap(false, Ordering::SeqCst) {
            debug!("disengaging mod={}", self.address());
            self.nack_unfinished();
            for controller in self.controllers.lock().unwrap().iter() {
                controller.on_disengage();
            }
            // a send racing the flag may have slipped an entry in meanwhile
            self.nack_unfinished();
        }
    }

    //  interface negotiation

    /**
        negotiate where (and whether) the module implements a named interface.

        Idempotent: querying again, eg. after a reconnect, first invalidates
        whatever was previously negotiated. Returns whether the interface is
        supported at all; a module reporting fewer commands than the table
        knows is simply an older firmware and still supported.
    */
    pub async fn query_interface(&self, interface: &'static Interface) -> Result<bool, Error> {
        let _negotiating = self.negotiation.lock().await;
        {
            let mut state = self.state.lock().unwrap();
            state.registry.invalidate(interface);
            if !state.declared.iter().any(|declared| std::ptr::eq(*declared, interface)) {
                state.declared.push(interface);
            }
        }
        let outgoing = Outgoing::command(
            "QueryInterface",
            CommandNumber::Standard(COMMAND_QUERY_INTERFACE),
            interface_name_payload(interface.name),
            ).with_response();
        match self.send_message(outgoing).await? {
            Completion::Response { payload, .. } => {
                let reply: QueryInterfaceReply = decode_payload(&payload);
                debug!("mod={} interface {}: {} commands starting at 0x{:04x}",
                    self.address(), interface.name, reply.number_of_commands, reply.command_number_first);
                self.state.lock().unwrap().registry
                    .register(interface, reply.command_number_first, reply.number_of_commands);
                Ok(true)
            }
            Completion::Nacked(reason) => {
                debug!("mod={} interface {} is not supported ({:?})", self.address(), interface.name, reason);
                self.state.lock().unwrap().registry.mark_nacked(interface);
                Ok(false)
            }
            Completion::Acked { .. } => {
                error!("mod={} interface query acked without a response", self.address());
                Err(Error::Nack(NackReason::AbandonedWaitingForResponse))
            }
            Completion::Pretended => Ok(true),
        }
    }

    /// whether this module implements the command, per its own negotiated
    /// table rather than any global default
    pub fn is_command_supported(&self, command: &'static InterfaceCommand) -> bool {
        // fake modules talk discovery and nothing else
        if self.is_system_synthetic {
            return false;
        }
        self.state.lock().unwrap().registry.is_supported(command)
    }

    /// first command number negotiated for the interface
    pub fn interface_base_command_number(&self, interface: &'static Interface) -> Result<u16, Error> {
        match self.state.lock().unwrap().registry.interface_status(interface.name) {
            Some(InterfaceStatus::Supported { base, .. }) => Ok(base),
            Some(InterfaceStatus::Nacked) => Err(Error::Unsupported(interface.name)),
            None => Err(Error::Usage("interface was never queried")),
        }
    }

    //  sending

    /// send an interface command and wait for it to finish
    pub async fn send(&self, command: &'static InterfaceCommand, payload: Vec<u8>) -> Result<(), Error> {
        let mut outgoing = Outgoing::command(command.name, CommandNumber::Interface(command), payload);
        if command.expects_response {
            outgoing = outgoing.with_response();
        }
        match self.send_message(outgoing).await? {
            Completion::Nacked(reason) => Err(Error::Nack(reason)),
            _ => Ok(()),
        }
    }

    /// send an interface command and wait for its response payload
    pub async fn send_receive(&self, command: &'static InterfaceCommand, payload: Vec<u8>) -> Result<Vec<u8>, Error> {
        if !command.expects_response {
            return Err(Error::Usage("command has no response to receive"));
        }
        let outgoing = Outgoing::command(command.name, CommandNumber::Interface(command), payload).with_response();
        match self.send_message(outgoing).await? {
            Completion::Response { payload, .. } => Ok(payload),
            Completion::Nacked(reason) => Err(Error::Nack(reason)),
            Completion::Acked { .. } => Err(Error::Nack(NackReason::AbandonedWaitingForResponse)),
            Completion::Pretended => Ok(Vec::new()),
        }
    }

    /**
        like [send](Self::send), but loop while the module answers with a
        transient busy reason, sleeping shortly between attempts.

        The loop is bounded by the device's busy-retry window; on expiry the
        last busy nack surfaces as the error.
    */
    pub async fn send_retrying(&self, command: &'static InterfaceCommand, payload: Vec<u8>) -> Result<(), Error> {
        let (window, pause) = {
            let shared = self.shared()?;
            (shared.options.busy_retry_window, shared.options.busy_retry_pause)
        };
        let deadline = Instant::now() + window;
        loop {
            match self.send(command, payload.clone()).await {
                Err(error) if error.is_transient() && Instant::now() < deadline => {
                    tokio::time::sleep(pause).await;
                }
                other => return other,
            }
        }
    }

    /// send under a caller-held bus lock key: the exchange recurses on the
    /// lock instead of queueing, so several commands can share one critical
    /// section taken with [Device::acquire_bus_lock](super::Device::acquire_bus_lock)
    pub async fn send_with_key(&self, key: super::MessageKey, command: &'static InterfaceCommand, payload: Vec<u8>) -> Result<Completion, Error> {
        let mut outgoing = Outgoing::command(command.name, CommandNumber::Interface(command), payload).keyed(key);
        if command.expects_response {
            outgoing = outgoing.with_response();
        }
        self.send_message(outgoing).await
    }

    /// serialize a sequence of commands whose replies must not interleave
    /// with other exchanges on this module
    pub async fn exclusive(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.exclusive.lock().await
    }

    //  standard commands

    /// keep-alive; mostly sent by the ping timer during idle periods, since
    /// any other traffic resets the peer's timeout just as well
    pub async fn ping(&self) -> Result<(), Error> {
        self.standard_send("KeepAlive", COMMAND_KEEP_ALIVE, Vec::new()).await
    }

    /// command the module into its safe output state
    pub async fn fail_safe(&self) -> Result<(), Error> {
        let result = self.standard_send("FailSafe", COMMAND_FAIL_SAFE, Vec::new()).await;
        self.forget_cached_state();
        result
    }

    /// fail-safe without queueing through the bus lock entry gate, for the
    /// unrecoverable-shutdown path that already holds the gate closed
    pub(crate) async fn fail_safe_bypassing(&self) -> Result<(), Error> {
        let outgoing = Outgoing::command("FailSafe", CommandNumber::Standard(COMMAND_FAIL_SAFE), Vec::new())
            .bypassing();
        let result = match self.send_message(outgoing).await? {
            Completion::Nacked(reason) => Err(Error::Nack(reason)),
            _ => Ok(()),
        };
        self.forget_cached_state();
        result
    }

    pub async fn get_module_status(&self, clear_status: bool) -> Result<ModuleStatusReply, Error> {
        self.standard_send_receive(
            "GetModuleStatus", COMMAND_GET_MODULE_STATUS,
            GetModuleStatus { clear_status: clear_status as u8 }.to_le_bytes().to_vec(),
            ).await
    }

    pub async fn set_module_led_color(&self, color: LedColor) -> Result<(), Error> {
        self.standard_send("SetModuleLedColor", COMMAND_SET_MODULE_LED_COLOR, color.to_le_bytes().to_vec()).await
    }

    pub async fn get_module_led_color(&self) -> Result<LedColor, Error> {
        self.standard_send_receive("GetModuleLedColor", COMMAND_GET_MODULE_LED_COLOR, Vec::new()).await
    }

    /// command the indicator pattern; the module caches it so it can be
    /// pushed again after the peer loses its volatile state
    pub async fn set_module_led_pattern(&self, steps: &[PatternStep]) -> Result<(), Error> {
        self.state.lock().unwrap().last_pattern = Some(steps.to_vec());
        self.send_pattern(steps).await
    }

    async fn send_pattern(&self, steps: &[PatternStep]) -> Result<(), Error> {
        // a pattern arriving as the very first message after a keep-alive
        // timeout gets overwritten by the firmware; ping first
        let _ = self.ping().await;
        self.standard_send("SetModuleLedPattern", COMMAND_SET_MODULE_LED_PATTERN, pattern_payload(steps)).await
    }

    /// read back the indicator pattern the module is currently running
    pub async fn get_module_led_pattern(&self) -> Result<Vec<PatternStep>, Error> {
        let outgoing = Outgoing::command(
            "GetModuleLedPattern", CommandNumber::Standard(COMMAND_GET_MODULE_LED_PATTERN), Vec::new(),
            ).with_response();
        match self.send_message(outgoing).await? {
            Completion::Response { payload, .. } => {
                Ok(payload.chunks_exact(4)
                    .map(|chunk| PatternStep { duration: chunk[0], red: chunk[1], green: chunk[2], blue: chunk[3] })
                    .collect())
            }
            Completion::Nacked(reason) => Err(Error::Nack(reason)),
            Completion::Acked { .. } => Err(Error::Nack(NackReason::AbandonedWaitingForResponse)),
            Completion::Pretended => Ok(Vec::new()),
        }
    }

    async fn resend_pattern(&self) {
        let steps = self.state.lock().unwrap().last_pattern.clone();
        if let Some(steps) = steps {
            debug!("mod={}: pushing indicator pattern again", self.address());
            if let Err(error) = self.send_pattern(&steps).await {
                warn!("mod={}: pattern push failed: {}", self.address(), error);
            }
        }
    }

    pub async fn set_debug_log_level(&self, group: DebugGroup, verbosity: DebugVerbosity) -> Result<(), Error> {
        self.standard_send(
            "SetDebugLogLevel", COMMAND_SET_DEBUG_LOG_LEVEL,
            SetDebugLogLevel { group: group as u8, verbosity: verbosity as u8 }.to_le_bytes().to_vec(),
            ).await
    }

    async fn standard_send(&self, name: &'static str, number: u16, payload: Vec<u8>) -> Result<(), Error> {
        match self.send_message(Outgoing::command(name, CommandNumber::Standard(number), payload)).await? {
            Completion::Nacked(reason) => Err(Error::Nack(reason)),
            _ => Ok(()),
        }
    }

    async fn standard_send_receive<R: FromBytes>(&self, name: &'static str, number: u16, payload: Vec<u8>) -> Result<R, Error> {
        let outgoing = Outgoing::command(name, CommandNumber::Standard(number), payload).with_response();
        match self.send_message(outgoing).await? {
            Completion::Response { payload, .. } => Ok(decode_payload(&payload)),
            Completion::Nacked(reason) => Err(Error::Nack(reason)),
            Completion::Acked { .. } => Err(Error::Nack(NackReason::AbandonedWaitingForResponse)),
            Completion::Pretended => Ok(R::from_le_bytes(R::Bytes::zeroed())),
        }
    }

    //  the exchange core

    /**
        run one command through its whole life: resolve the wire number,
        take the bus for the exchange, assign a message number, transmit,
        then wait for the ack, nack or response, retransmitting on the way.

        When the device is not live (not armed, shut down, disengaged, or
        pretending on purpose), the command completes immediately as
        [Completion::Pretended] so callers never special-case absent hardware.
    */
    pub(crate) async fn send_message(&self, outgoing: Outgoing) -> Result<Completion, Error> {
        let shared = self.shared()?;
        let live = shared.live() && self.is_engaged() && self.open.load(Ordering::SeqCst);
        let number = match outgoing.command {
            CommandNumber::Standard(number) => number,
            CommandNumber::Interface(command) => {
                if !live {
                    0
                }
                else {
                    // fail fast, before any bytes, when negotiation never
                    // granted this command a number
                    match self.state.lock().unwrap().registry.command_number(command) {
                        Some(number) => number,
                        None => return Err(Error::Unsupported(command.name)),
                    }
                }
            }
        };
        if !live {
            return Ok(Completion::Pretended);
        }

        let key = outgoing.key;
        let locked = outgoing.ackable || outgoing.expects_response;
        if locked {
            if outgoing.bypass_gate {
                shared.bus_lock.acquire_bypassing(key).await;
            }
            else {
                shared.bus_lock.acquire(key).await;
            }
        }
        let result = self.exchange(&shared, outgoing, number).await;
        if locked {
            shared.bus_lock.release(key);
        }
        result
    }

    async fn exchange(&self, shared: &Arc<DeviceShared>, outgoing: Outgoing, number: u16) -> Result<Completion, Error> {
        let message_number = self.new_message_number().await;
        let datagram = Datagram::new(
            outgoing.dest.unwrap_or(self.address()),
            HOST_ADDRESS,
            message_number,
            0,
            PacketId::command_id(number),
            outgoing.payload,
            );
        let bytes = datagram.to_bytes();

        let waits = outgoing.ackable || outgoing.expects_response;
        let receiver = if waits {
            let (complete, receiver) = oneshot::channel();
            self.state.lock().unwrap().unfinished.insert(message_number, Pending {
                name: outgoing.name,
                expects_response: outgoing.expects_response,
                serialized: bytes.clone(),
                retransmissions_remaining: if outgoing.retransmittable { shared.options.max_retransmissions } else { 0 },
                complete,
                });
            Some(receiver)
        }
        else {
            None
        };

        match shared.transmit(self, &bytes).await {
            Ok(true) => {}
            Ok(false) => {
                // lost the race against a disengage or shutdown
                self.state.lock().unwrap().unfinished.remove(&message_number);
                return Ok(Completion::Pretended);
            }
            Err(error) => {
                self.state.lock().unwrap().unfinished.remove(&message_number);
                return Err(error);
            }
        }

        match receiver {
            Some(receiver) => Ok(self.await_completion(shared, message_number, receiver).await),
            // nobody will ever answer, the exchange is over the moment it left
            None => {
                self.state.lock().unwrap().unfinished.remove(&message_number);
                Ok(Completion::Acked { attention_required: false })
            }
        }
    }

    /// wait for the table entry to complete, retransmitting on a fixed
    /// cadence, and synthesize an abandonment nack when the window closes
    async fn await_completion(&self, shared: &Arc<DeviceShared>, message_number: u8, mut receiver: oneshot::Receiver<Completion>) -> Completion {
        let deadline = Instant::now() + shared.options.await_interval;
        loop {
            let now = Instant::now();
            if now >= deadline {
                self.force_abandon(message_number);
                return receiver.await.unwrap_or(Completion::Pretended);
            }
            let slice = (deadline - now).min(shared.options.retransmit_interval);
            match tokio::time::timeout(slice, &mut receiver).await {
                Ok(Ok(completion)) => return completion,
                // the sender half vanished wholesale, the device is going away
                Ok(Err(_)) => return Completion::Pretended,
                Err(_) => self.retransmit(shared, message_number).await,
            }
        }
    }

    async fn retransmit(&self, shared: &Arc<DeviceShared>, message_number: u8) {
        let bytes = {
            let mut state = self.state.lock().unwrap();
            match state.unfinished.get_mut(&message_number) {
                Some(pending) if pending.retransmissions_remaining > 0 => {
                    pending.retransmissions_remaining -= 1;
                    pending.serialized.clone()
                }
                // finished meanwhile, or not retransmittable
                _ => return,
            }
        };
        debug!("retransmitting mod={} msg#={}", self.address(), message_number);
        let _ = shared.transmit(self, &bytes).await;
    }

    fn force_abandon(&self, message_number: u8) {
        let removed = self.state.lock().unwrap().unfinished.remove(&message_number);
        if let Some(pending) = removed {
            let reason = pending.abandonment_reason();
            debug!("timeout: abandoning {} mod={} msg#={} ({:?})",
                pending.name, self.address(), message_number, reason);
            let _ = pending.complete.send(Completion::Nacked(reason));
        }
    }

    /// a fresh message number: never 0, never one still in the unfinished
    /// table. Blocks (asynchronously) while all 255 numbers are in flight
    async fn new_message_number(&self) -> u8 {
        loop {
            let candidate = self.next_message_number.fetch_add(1, Ordering::Relaxed);
            if candidate == 0 {
                continue;
            }
            {
                let state = self.state.lock().unwrap();
                if !state.unfinished.contains_key(&candidate) {
                    return candidate;
                }
                if state.unfinished.len() < usize::from(u8::MAX) {
                    continue;
                }
            }
            tokio::time::sleep(Duration::from_millis(3)).await;
        }
    }

    //  reception

    /// resolve an incoming datagram against the unfinished-command table.
    /// Runs on the device's reception loop
    pub(crate) fn on_incoming(&self, datagram: Datagram) {
        let number = datagram.command_number();
        if !self.state.lock().unwrap().registry.knows_number(number) {
            error!("mod={}: no command known for number 0x{:04x}, datagram dropped", self.address(), number);
            return;
        }
        let reference = datagram.reference_number;
        if number == COMMAND_ACK && !datagram.is_response() {
            let ack: Ack = decode_payload(&datagram.payload);
            let attention = ack.attention_required != 0;
            if attention {
                self.note_attention_required();
            }
            self.complete(reference, Completion::Acked { attention_required: attention });
        }
        else if number == COMMAND_NACK && !datagram.is_response() {
            let nack: Nack = decode_payload(&datagram.payload);
            let reason = NackReason::from_wire(nack.reason);
            match reason {
                // routine flow control, not worth a log line
                NackReason::CommandImplPending
                | NackReason::I2cNoResultsPending
                | NackReason::I2cOperationInProgress => {}
                _ => debug!("nack received mod={} ref#={} reason={:?}", self.address(), reference, reason),
            }
            self.complete(reference, Completion::Nacked(reason));
        }
        else if datagram.is_response() {
            self.complete(reference, Completion::Response {
                command_number: number,
                payload: datagram.payload,
                });
        }
        else {
            warn!("mod={}: unsolicited command 0x{:04x} ignored", self.address(), number);
        }
    }

    fn complete(&self, reference: u8, completion: Completion) {
        let removed = self.state.lock().unwrap().unfinished.remove(&reference);
        match removed {
            Some(pending) => {
                let _ = pending.complete.send(completion);
            }
            None => warn!("mod={}: no unfinished command for ref#={}", self.address(), reference),
        }
    }

    /// the module flagged an ack with attention-required: query its status
    /// off the reception loop and recover whatever the flag implied
    fn note_attention_required(&self) {
        if self.is_system_synthetic || !self.open.load(Ordering::SeqCst) {
            return;
        }
        let Some(module) = self.weak_self.upgrade() else { return };
        let task = tokio::spawn(async move {
            module.poll_status_and_recover().await;
        });
        if let Some(previous) = self.tasks.lock().unwrap().attention.replace(task) {
            previous.abort();
        }
        // whatever needed attention may have invalidated cached values
        self.forget_cached_state();
    }

    async fn poll_status_and_recover(self: Arc<Self>) {
        match self.get_module_status(true).await {
            Ok(reply) => {
                if u8::from(reply.status) != 0 {
                    debug!("mod={} status: {:?}", self.address(), reply.status);
                }
                if reply.status.keep_alive_timeout() {
                    // the peer timed out and forgot its volatile state while
                    // we were away: push back what the user expects
                    self.forget_cached_state();
                    self.resend_pattern().await;
                }
            }
            Err(error) => debug!("mod={} status poll failed: {}", self.address(), error),
        }
    }

    //  keep-alive

    /// traffic timestamp feeding the keep-alive timer
    pub(crate) fn note_transmitted(&self) {
        *self.last_transmit.lock().unwrap() = Instant::now();
    }

    fn last_transmit(&self) -> Instant {
        *self.last_transmit.lock().unwrap()
    }

    /// keep the peer from failing safe during idle periods: ping whenever no
    /// other traffic went out for a whole keep-alive interval
    pub(crate) fn start_ping_timer(&self) {
        let Ok(shared) = self.shared() else { return };
        let interval = shared.options.keep_alive_timeout
            .saturating_sub(shared.options.ping_margin);
        drop(shared);

        let Some(module) = self.weak_self.upgrade() else { return };
        let task = tokio::spawn(async move {
            loop {
                let deadline = module.last_transmit() + interval;
                if Instant::now() < deadline {
                    tokio::time::sleep_until(deadline).await;
                    continue;
                }
                let _ = module.ping().await;
                if module.last_transmit() + interval <= Instant::now() {
                    // the ping never reached the wire, do not spin
                    tokio::time::sleep(interval).await;
                }
            }
        });
        if let Some(previous) = self.tasks.lock().unwrap().ping.replace(task) {
            previous.abort();
        }
    }

    pub(crate) fn stop_ping_timer(&self) {
        if let Some(task) = self.tasks.lock().unwrap().ping.take() {
            task.abort();
        }
    }

    //  initialization and teardown

    /// first contact after attach or re-arm: ping through the initial junk,
    /// negotiate the declared interfaces, set up diagnostics
    pub(crate) async fn initialize(&self) -> Result<(), Error> {
        debug!("initializing mod={}", self.address());
        self.ping_initial_contact().await?;
        let declared = {
            self.state.lock().unwrap().declared.clone()
        };
        for interface in declared {
            self.query_interface(interface).await?;
        }
        // harmless if the firmware ignores the verbosity
        let _ = self.set_debug_log_level(DebugGroup::ModuleLed, DebugVerbosity::High).await;
        self.forget_cached_state();
        Ok(())
    }

    /// ping until an ack arrives. Initial acks get lost when the framing is
    /// still off, so keep trying, but only for the contact window
    async fn ping_initial_contact(&self) -> Result<(), Error> {
        let deadline = {
            Instant::now() + self.shared()?.options.initial_contact_window
        };
        loop {
            match self.ping().await {
                Ok(()) => return Ok(()),
                // a dead channel will not get better by pinging harder
                Err(Error::Bus(error)) => return Err(Error::Bus(error)),
                Err(_) if Instant::now() < deadline => {
                    debug!("retrying initial ping mod={}", self.address());
                }
                Err(_) => return Err(Error::NoContact),
            }
        }
    }

    /// synthesize an abandonment nack for every unfinished command
    pub(crate) fn nack_unfinished(&self) {
        loop {
            let drained: Vec<(u8, Pending)> = {
                self.state.lock().unwrap().unfinished.drain().collect()
            };
            if drained.is_empty() {
                break;
            }
            for (message_number, pending) in drained {
                let reason = pending.abandonment_reason();
                debug!("force-nacking unfinished {} mod={} msg#={} ({:?})",
                    pending.name, self.address(), message_number, reason);
                let _ = pending.complete.send(Completion::Nacked(reason));
            }
        }
    }

    /// complete everything in flight as a local no-op, for paths where the
    /// hardware is already unreachable and failure would be noise
    pub(crate) fn pretend_finish_all(&self) {
        let drained: Vec<(u8, Pending)> = {
            self.state.lock().unwrap().unfinished.drain().collect()
        };
        for (_, pending) in drained {
            let _ = pending.complete.send(Completion::Pretended);
        }
    }

    pub(crate) fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            debug!("closing mod={}", self.address());
            let mut tasks = self.tasks.lock().unwrap();
            if let Some(task) = tasks.ping.take() {
                task.abort();
            }
            if let Some(task) = tasks.attention.take() {
                task.abort();
            }
        }
    }
}

/*!
    the bus owner: one serial endpoint, every module behind it.

    The device runs exactly one reception loop and exactly one transmit path;
    every module on the chain shares its bus access lock. Arming gates all
    traffic: a device that is closed, pretending, or abnormally shut down
    completes commands locally instead of touching the wire.
*/

use std::{
    collections::HashMap,
    io,
    sync::{Arc, Mutex},
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Duration,
    };
use packbytes::ToBytes;
use tokio::{
    sync::Notify,
    task::JoinHandle,
    };
use log::{debug, error, warn};

use crate::{
    commands::*,
    datagram::{BROADCAST_ADDRESS, Datagram, FIXED_PACKET_LENGTH, FRAME_MARKER, HOST_ADDRESS, MAX_MODULE_ADDRESS, PREFIX_LENGTH},
    lock::{MessageKeyedLock, AcquisitionsHold},
    transport::{Channel, DynChannel, read_exact},
    };
use super::{
    Error,
    message::{CommandNumber, MessageKey, Outgoing, decode_payload},
    module::Module,
    };


/// where a device stands in its life cycle
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ArmingState {
    /// no communication, the resting state
    Closed,
    /// communication is being brought up
    Arming,
    /// live against real hardware
    Armed,
    /// degraded mode with no hardware: every send completes as a local no-op
    Pretending,
    /// communication is being torn down
    Disarming,
}

/// one module found by a discovery broadcast
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredModule {
    pub address: u8,
    /// whether the module is the directly usb-attached one
    pub is_parent: bool,
}

/// handle for unsubscribing an arming-state observer
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ObserverId(u64);


/// every tunable interval of the engine, preloaded with the protocol defaults
#[derive(Clone, Debug)]
pub struct DeviceOptions {
    /// how long a module waits for traffic before failing safe on its own
    pub keep_alive_timeout: Duration,
    /// safety margin subtracted from the timeout to get the ping cadence
    pub ping_margin: Duration,
    /// how long one exchange may wait for its ack or response
    pub await_interval: Duration,
    /// cadence of retransmissions within the await window
    pub retransmit_interval: Duration,
    pub max_retransmissions: u8,
    /// bound after which a stuck bus lock is forcibly abandoned
    pub lock_staleness: Duration,
    /// how long to keep pinging a module that never answered yet
    pub initial_contact_window: Duration,
    /// guaranteed response slot of one module during discovery
    pub discovery_slot: Duration,
    /// slack added on top of all discovery slots
    pub discovery_slack: Duration,
    /// bound of the transient-busy retry loop in [Module::send_retrying](super::Module::send_retrying)
    pub busy_retry_window: Duration,
    /// sleep between attempts of that loop
    pub busy_retry_pause: Duration,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            keep_alive_timeout: Duration::from_millis(2500),
            ping_margin: Duration::from_millis(550),
            await_interval: Duration::from_millis(250),
            retransmit_interval: Duration::from_millis(100),
            max_retransmissions: 5,
            lock_staleness: Duration::from_millis(500),
            initial_contact_window: Duration::from_millis(500),
            discovery_slot: Duration::from_millis(3),
            discovery_slack: Duration::from_millis(250),
            busy_retry_window: Duration::from_secs(1),
            busy_retry_pause: Duration::from_millis(3),
        }
    }
}


/// state shared between the device handle, its modules and its reception loop
pub(crate) struct DeviceShared {
    channel: Box<dyn DynChannel>,
    pub(crate) options: DeviceOptions,
    pub(crate) bus_lock: MessageKeyedLock<MessageKey>,
    arming: Mutex<ArmingState>,
    engaged: AtomicBool,
    shutdown_abnormally: AtomicBool,
    stop: AtomicBool,
    stop_notify: Notify,
    state: Mutex<DeviceState>,
    collecting_discovery: AtomicBool,
    discovered: Mutex<HashMap<u8, DiscoveredModule>>,
    observers: Mutex<Vec<(u64, Arc<dyn Fn(ArmingState) + Send + Sync>)>>,
    next_observer: AtomicU64,
    /// kept alive after an unrecoverable shutdown so the gate stays closed
    acquisitions_hold: Mutex<Option<AcquisitionsHold>>,
}

struct DeviceState {
    /// module address to module, the routing table of the reception loop
    modules: HashMap<u8, Arc<Module>>,
    /// extra routing entries valid only while an address change is in flight
    changing: HashMap<u8, Arc<Module>>,
    /// configured modules that failed initial contact
    missing: HashMap<u8, String>,
    receive_task: Option<JoinHandle<()>>,
}

impl DeviceShared {
    pub(crate) fn identity(&self) -> &str {
        self.channel.identity()
    }

    /// whether traffic is currently allowed to reach the wire
    pub(crate) fn live(&self) -> bool {
        matches!(*self.arming.lock().unwrap(), ArmingState::Armed | ArmingState::Arming)
            && !self.shutdown_abnormally.load(Ordering::SeqCst)
            && self.engaged.load(Ordering::SeqCst)
    }

    /**
        the one transmit path. Returns whether bytes actually went out;
        `false` means the send lost a race against disengagement or shutdown
        and should complete as a pretend.

        Any write failure is fatal for the whole device until it is re-armed.
    */
    pub(crate) async fn transmit(&self, module: &Module, bytes: &[u8]) -> Result<bool, Error> {
        if !self.live() || !module.is_engaged() {
            return Ok(false);
        }
        if let Err(problem) = self.channel.write(bytes).await {
            error!("bus write failed, shutting down abnormally: {}", problem);
            self.note_abnormal_shutdown();
            return Err(Error::Bus(problem));
        }
        // any outgoing traffic doubles as a keep-alive
        module.note_transmitted();
        Ok(true)
    }

    fn note_abnormal_shutdown(&self) {
        if !self.shutdown_abnormally.swap(true, Ordering::SeqCst) {
            warn!("device {} abnormally shut down, re-arm to recover", self.identity());
            for module in self.all_modules() {
                module.pretend_finish_all();
            }
        }
    }

    fn all_modules(&self) -> Vec<Arc<Module>> {
        self.state.lock().unwrap().modules.values().cloned().collect()
    }

    fn find_module(&self, address: u8) -> Option<Arc<Module>> {
        let state = self.state.lock().unwrap();
        state.modules.get(&address)
            .or_else(|| state.changing.get(&address))
            .cloned()
    }

    fn dispatch(&self, datagram: Datagram) {
        if datagram.is_response() && datagram.command_number() == COMMAND_DISCOVERY {
            self.on_discovery_response(datagram);
            return;
        }
        match self.find_module(datagram.source) {
            Some(module) => module.on_incoming(datagram),
            None => debug!("datagram from unknown module {} dropped", datagram.source),
        }
    }

    fn on_discovery_response(&self, datagram: Datagram) {
        if !self.collecting_discovery.load(Ordering::SeqCst) {
            debug!("late discovery response from module {} ignored", datagram.source);
            return;
        }
        let reply: DiscoveryReply = decode_payload(&datagram.payload);
        let mut discovered = self.discovered.lock().unwrap();
        // a noisy bus can duplicate responses, the first per address wins
        discovered.entry(datagram.source).or_insert_with(|| {
            debug!("discovered module {} parent={}", datagram.source, reply.parent != 0);
            DiscoveredModule {
                address: datagram.source,
                is_parent: reply.parent != 0,
                }
        });
    }

    fn set_arming_state(&self, new: ArmingState) {
        *self.arming.lock().unwrap() = new;
        let observers: Vec<_> = self.observers.lock().unwrap().iter()
            .map(|(_, observer)| observer.clone())
            .collect();
        for observer in observers {
            observer(new);
        }
    }
}


/**
    coroutine receiving everything the module chain sends.

    While unsynchronized it hunts for the frame marker byte by byte; once a
    whole prefix lined up it switches to reading prefixes in one go, falling
    back to the hunt whenever a prefix does not start with the marker. Serial
    links lose and duplicate bytes, this self healing is not optional.
*/
async fn receive_loop(shared: Arc<DeviceShared>) {
    debug!("reception loop starting on {}", shared.identity());
    let mut synchronized = false;
    while !shared.stop.load(Ordering::SeqCst) && !shared.shutdown_abnormally.load(Ordering::SeqCst) {
        let received = tokio::select! {
            _ = shared.stop_notify.notified() => break,
            received = poll_datagram(&shared, &mut synchronized) => received,
        };
        match received {
            Ok(Some(datagram)) => shared.dispatch(datagram),
            // dropped: garbage bytes or a failed checksum, just keep reading
            Ok(None) => {}
            Err(problem) => {
                warn!("bus channel failed in reception loop: {}", problem);
                shared.note_abnormal_shutdown();
                break;
            }
        }
    }
    debug!("reception loop over on {}", shared.identity());
}

async fn poll_datagram(shared: &DeviceShared, synchronized: &mut bool) -> io::Result<Option<Datagram>> {
    let channel: &dyn DynChannel = shared.channel.as_ref();
    let mut prefix = [0u8; PREFIX_LENGTH];

    if !*synchronized {
        // hunt for the two marker bytes one at a time
        let mut byte = [0u8; 1];
        read_exact(channel, &mut byte).await?;
        if byte[0] != FRAME_MARKER[0] {
            return Ok(None);
        }
        read_exact(channel, &mut byte).await?;
        if byte[0] != FRAME_MARKER[1] {
            return Ok(None);
        }
        read_exact(channel, &mut prefix[2 ..]).await?;
        prefix[.. 2].copy_from_slice(&FRAME_MARKER);
        debug!("synchronization gained on {}", shared.identity());
        *synchronized = true;
    }
    else {
        // synchronized: grab the whole prefix in one read for speed
        read_exact(channel, &mut prefix).await?;
        if prefix[.. 2] != FRAME_MARKER {
            debug!("synchronization lost on {}", shared.identity());
            *synchronized = false;
            return Ok(None);
        }
    }

    let packet_length = usize::from(u16::from_le_bytes([prefix[2], prefix[3]]));
    if packet_length < FIXED_PACKET_LENGTH {
        // impossible length, this was garbage that looked like a marker
        *synchronized = false;
        return Ok(None);
    }
    let mut packet = vec![0u8; packet_length];
    packet[.. PREFIX_LENGTH].copy_from_slice(&prefix);
    read_exact(channel, &mut packet[PREFIX_LENGTH ..]).await?;

    let datagram = match Datagram::from_bytes(&packet) {
        Ok(datagram) => datagram,
        Err(problem) => {
            debug!("unparseable packet dropped: {}", problem);
            *synchronized = false;
            return Ok(None);
        }
    };
    if !datagram.is_checksum_valid() {
        // the protocol is explicit here: ignore and count on retransmission
        warn!("invalid checksum received, datagram ignored");
        return Ok(None);
    }
    Ok(Some(datagram))
}


/// the usb-serial endpoint and every module reachable through it
pub struct Device {
    shared: Arc<DeviceShared>,
}

impl Device {
    pub fn new(channel: impl Channel, options: DeviceOptions) -> Self {
        let lock_staleness = options.lock_staleness;
        Self {
            shared: Arc::new(DeviceShared {
                channel: Box::new(channel),
                options,
                bus_lock: MessageKeyedLock::new(lock_staleness),
                arming: Mutex::new(ArmingState::Closed),
                engaged: AtomicBool::new(true),
                shutdown_abnormally: AtomicBool::new(false),
                stop: AtomicBool::new(false),
                stop_notify: Notify::new(),
                state: Mutex::new(DeviceState {
                    modules: HashMap::new(),
                    changing: HashMap::new(),
                    missing: HashMap::new(),
                    receive_task: None,
                    }),
                collecting_discovery: AtomicBool::new(false),
                discovered: Mutex::new(HashMap::new()),
                observers: Mutex::new(Vec::new()),
                next_observer: AtomicU64::new(1),
                acquisitions_hold: Mutex::new(None),
                }),
        }
    }

    pub fn identity(&self) -> &str {
        self.shared.identity()
    }

    pub fn arming_state(&self) -> ArmingState {
        *self.shared.arming.lock().unwrap()
    }

    /// whether the device went down because of a channel failure and needs a re-arm
    pub fn has_shutdown_abnormally(&self) -> bool {
        self.shared.shutdown_abnormally.load(Ordering::SeqCst)
    }

    //  arming

    /**
        bring communication up: start the reception loop, make first contact
        with every known module (the parent first, so the children find a
        consistent bus), negotiate their interfaces and start the keep-alive
        timers.

        A parent that stays silent fails the arm; a silent child is recorded
        as missing and skipped.
    */
    pub async fn arm(&self) -> Result<(), Error> {
        {
            let mut arming = self.shared.arming.lock().unwrap();
            if *arming != ArmingState::Closed {
                return Err(Error::Usage("device is already armed or arming"));
            }
            *arming = ArmingState::Arming;
        }
        debug!("arming device {}", self.identity());
        self.shared.set_arming_state(ArmingState::Arming);
        self.shared.shutdown_abnormally.store(false, Ordering::SeqCst);
        self.shared.stop.store(false, Ordering::SeqCst);
        self.shared.bus_lock.reset();
        {
            let mut state = self.shared.state.lock().unwrap();
            state.receive_task = Some(tokio::spawn(receive_loop(self.shared.clone())));
        }

        if let Err(problem) = self.initialize_known_modules().await {
            self.disarm().await;
            return Err(problem);
        }
        for module in self.shared.all_modules() {
            module.start_ping_timer();
        }
        self.shared.set_arming_state(ArmingState::Armed);
        debug!("device {} armed", self.identity());
        Ok(())
    }

    async fn initialize_known_modules(&self) -> Result<(), Error> {
        let mut modules = self.shared.all_modules();
        // the parent must lock onto the bus before any child is spoken to
        modules.sort_by_key(|module| (!module.is_parent(), module.address()));
        for module in modules {
            if let Err(problem) = module.initialize().await {
                if module.is_parent() || matches!(problem, Error::Bus(_)) {
                    error!("module {} unreachable, arming failed: {}", module.address(), problem);
                    return Err(problem);
                }
                warn!("module {} is missing: {}", module.address(), problem);
                let mut state = self.shared.state.lock().unwrap();
                state.modules.remove(&module.address());
                state.missing.insert(module.address(), format!("module #{}", module.address()));
                module.close();
            }
        }
        Ok(())
    }

    /// degraded mode for absent hardware: every send completes as a no-op
    pub fn pretend(&self) {
        {
            let mut arming = self.shared.arming.lock().unwrap();
            if *arming != ArmingState::Closed {
                warn!("pretend() on a device that is not closed, ignored");
                return;
            }
            *arming = ArmingState::Pretending;
        }
        debug!("device {} pretending", self.identity());
        self.shared.set_arming_state(ArmingState::Pretending);
    }

    /// tear communication down, synthesizing abandonment nacks for
    /// everything still in flight
    pub async fn disarm(&self) {
        {
            let mut arming = self.shared.arming.lock().unwrap();
            match *arming {
                ArmingState::Closed | ArmingState::Disarming => return,
                _ => *arming = ArmingState::Disarming,
            }
        }
        debug!("disarming device {}", self.identity());
        self.shared.set_arming_state(ArmingState::Disarming);

        for module in self.shared.all_modules() {
            module.stop_ping_timer();
            module.nack_unfinished();
        }

        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.stop_notify.notify_waiters();
        let task = self.shared.state.lock().unwrap().receive_task.take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        self.shared.bus_lock.reset();
        self.shared.set_arming_state(ArmingState::Closed);
        debug!("device {} disarmed", self.identity());
    }

    /// orderly shutdown: a last fail-safe while the link is still up, then teardown
    pub async fn close(&self) {
        if matches!(self.arming_state(), ArmingState::Armed) && !self.has_shutdown_abnormally() {
            self.fail_safe().await;
        }
        self.disarm().await;
        for module in self.shared.all_modules() {
            module.close();
        }
    }

    //  engagement

    pub fn is_engaged(&self) -> bool {
        self.shared.engaged.load(Ordering::SeqCst)
    }

    pub fn engage(&self) {
        if !self.shared.engaged.swap(true, Ordering::SeqCst) {
            for module in self.shared.all_modules() {
                module.engage();
            }
        }
    }

    pub fn disengage(&self) {
        if self.shared.engaged.swap(false, Ordering::SeqCst) {
            for module in self.shared.all_modules() {
                module.disengage();
            }
        }
    }

    //  modules

    /**
        attach a module expected at `address`. When the device is already
        live the module is contacted and initialized immediately; a module
        that stays silent is recorded as missing and the attach fails.
    */
    pub async fn add_module(&self, address: u8, is_parent: bool) -> Result<Arc<Module>, Error> {
        if address == HOST_ADDRESS || address == BROADCAST_ADDRESS {
            return Err(Error::Usage("module address out of range"));
        }
        let module = Module::new(&self.shared, address, is_parent, false);
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.modules.contains_key(&address) {
                return Err(Error::Usage("module address already in use"));
            }
            state.modules.insert(address, module.clone());
            state.missing.remove(&address);
        }
        if matches!(self.arming_state(), ArmingState::Armed | ArmingState::Arming) {
            if let Err(problem) = module.initialize().await {
                warn!("module {} is missing: {}", address, problem);
                let mut state = self.shared.state.lock().unwrap();
                state.modules.remove(&address);
                state.missing.insert(address, format!("module #{}", address));
                module.close();
                return Err(problem);
            }
            module.start_ping_timer();
        }
        Ok(module)
    }

    pub fn module(&self, address: u8) -> Option<Arc<Module>> {
        self.shared.state.lock().unwrap().modules.get(&address).cloned()
    }

    pub fn modules(&self) -> Vec<Arc<Module>> {
        self.shared.all_modules()
    }

    /// configured modules that never answered, by address
    pub fn missing_modules(&self) -> Vec<(u8, String)> {
        let state = self.shared.state.lock().unwrap();
        let mut missing: Vec<_> = state.missing.iter().map(|(address, name)| (*address, name.clone())).collect();
        missing.sort();
        missing
    }

    //  discovery

    /**
        enumerate every module reachable through this device.

        A discovery broadcast goes to every module at once; each answers in
        its own guaranteed time slot, so waiting for the worst case (every
        possible address plus slack) sees them all. Responses are collected
        by source address, duplicates ignored. Exactly one of them, if any,
        reports itself as the parent.
    */
    pub async fn discover_modules(&self) -> Result<Vec<DiscoveredModule>, Error> {
        debug!("discovery beginning on {}", self.identity());
        self.shared.discovered.lock().unwrap().clear();
        self.shared.collecting_discovery.store(true, Ordering::SeqCst);

        // a synthetic module stands in as the sender; nothing will ever be
        // addressed to it since no real module holds address 0
        let sender = Module::new(&self.shared, HOST_ADDRESS, false, true);
        let outgoing = Outgoing::command("Discovery", CommandNumber::Standard(COMMAND_DISCOVERY), Vec::new())
            .to(BROADCAST_ADDRESS)
            .fire_and_forget();
        let sent = sender.send_message(outgoing).await;
        sender.close();
        sent?;

        let wait = self.shared.options.discovery_slot * u32::from(MAX_MODULE_ADDRESS)
            + self.shared.options.discovery_slack;
        debug!("discovery waiting {:?}", wait);
        tokio::time::sleep(wait).await;

        self.shared.collecting_discovery.store(false, Ordering::SeqCst);
        let mut found: Vec<DiscoveredModule> = self.shared.discovered.lock().unwrap().values().copied().collect();
        found.sort_by_key(|module| module.address);
        debug!("discovery complete on {}: {} modules", self.identity(), found.len());
        Ok(found)
    }

    //  address change

    /**
        renumber the one module on the bus.

        Refused outright when more than one module is known: renumbering with
        siblings attached invites collisions and is a configuration error.
        The bus lock spans the command *and* the routing-table update, so a
        datagram arriving mid-change can never be misrouted.
    */
    pub async fn change_module_address(&self, module: &Arc<Module>, new_address: u8) -> Result<(), Error> {
        let old_address = module.address();
        if new_address == old_address {
            return Ok(());
        }
        if new_address == HOST_ADDRESS || new_address == BROADCAST_ADDRESS {
            return Err(Error::Usage("module address out of range"));
        }
        {
            let state = self.shared.state.lock().unwrap();
            if state.modules.len() != 1 {
                return Err(Error::Usage("address change requires exactly one known module"));
            }
            if !state.modules.contains_key(&old_address) {
                return Err(Error::Usage("module does not belong to this device"));
            }
        }

        let outgoing = Outgoing::command(
            "SetNewModuleAddress", CommandNumber::Standard(COMMAND_SET_NEW_MODULE_ADDRESS),
            SetNewModuleAddress { address: new_address }.to_le_bytes().to_vec(),
            );
        let key = outgoing.key;
        self.shared.bus_lock.acquire(key).await;
        self.shared.state.lock().unwrap().changing.insert(new_address, module.clone());

        // the send re-acquires the same key, which is a cheap recursion
        let result = match module.send_message(outgoing).await {
            Ok(completion) => match completion.nack_reason() {
                Some(reason) => Err(Error::Nack(reason)),
                None => {
                    let mut state = self.shared.state.lock().unwrap();
                    if let Some(module) = state.modules.remove(&old_address) {
                        module.set_address(new_address);
                        state.modules.insert(new_address, module);
                    }
                    Ok(())
                }
            },
            Err(problem) => Err(problem),
        };

        self.shared.state.lock().unwrap().changing.remove(&new_address);
        self.shared.bus_lock.release(key);
        result
    }

    //  safety

    /// command every real module into its safe output state, best effort:
    /// shutting down beats blocking shutdown, so failures are never retried
    pub async fn fail_safe(&self) {
        for module in self.shared.all_modules() {
            if module.is_system_synthetic() {
                continue;
            }
            if let Err(problem) = module.fail_safe().await {
                warn!("fail-safe for module {} failed: {}", module.address(), problem);
            }
        }
    }

    /**
        unrecoverable-shutdown fast path.

        Permanently hangs every future bus lock acquirer, then pushes one
        final fail-safe per module ahead of whatever was queued. After this
        the process is expected to die; the device never recovers.
    */
    pub async fn shutdown_fast(&self) {
        let hold = self.shared.bus_lock.lock_acquisitions().await;
        *self.shared.acquisitions_hold.lock().unwrap() = Some(hold);
        for module in self.shared.all_modules() {
            if module.is_system_synthetic() {
                continue;
            }
            if let Err(problem) = module.fail_safe_bypassing().await {
                warn!("final fail-safe for module {} failed: {}", module.address(), problem);
            }
        }
    }

    //  bus lock surface for the controller layers

    /// take the bus for a critical section spanning more than one send;
    /// sends made with the same key inside the section recurse for free
    pub async fn acquire_bus_lock(&self, key: MessageKey) {
        self.shared.bus_lock.acquire(key).await;
    }

    pub fn release_bus_lock(&self, key: MessageKey) {
        self.shared.bus_lock.release(key);
    }

    //  arming observers

    /// register for arming-state changes; controllers use this to know when
    /// to forget cached state
    pub fn observe_arming(&self, observer: impl Fn(ArmingState) + Send + Sync + 'static) -> ObserverId {
        let id = self.shared.next_observer.fetch_add(1, Ordering::Relaxed);
        self.shared.observers.lock().unwrap().push((id, Arc::new(observer)));
        ObserverId(id)
    }

    pub fn unobserve_arming(&self, id: ObserverId) {
        self.shared.observers.lock().unwrap().retain(|(observer, _)| *observer != id.0);
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.stop_notify.notify_waiters();
        let mut state = self.shared.state.lock().unwrap();
        if let Some(task) = state.receive_task.take() {
            task.abort();
        }
        for module in state.modules.values() {
            module.close();
        }
    }
}

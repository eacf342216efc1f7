//! end-to-end engine tests over an in-memory channel scripted to act like a
//! chain of hub modules

use std::{
    sync::{Arc, Mutex},
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
    };

use hublink::{
    commands::*,
    datagram::{Datagram, HOST_ADDRESS, PacketId},
    host::{ArmingState, Controller, Device, DeviceOptions, Error},
    transport::mock::MockChannel,
    };


fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// timings tightened so a test run stays short; the keep-alive period is
/// huge so no surprise ping interferes unless a test asks for it
fn fast_options() -> DeviceOptions {
    DeviceOptions {
        keep_alive_timeout: Duration::from_secs(1000),
        ping_margin: Duration::from_millis(550),
        initial_contact_window: Duration::from_millis(300),
        discovery_slot: Duration::from_millis(0),
        discovery_slack: Duration::from_millis(100),
        busy_retry_window: Duration::from_millis(500),
        busy_retry_pause: Duration::from_millis(1),
        .. DeviceOptions::default()
    }
}

// the interface the fake modules implement
static WIDGET_ON: InterfaceCommand = InterfaceCommand { name: "WidgetOn", expects_response: false };
static WIDGET_OFF: InterfaceCommand = InterfaceCommand { name: "WidgetOff", expects_response: false };
static WIDGET_READ: InterfaceCommand = InterfaceCommand { name: "WidgetRead", expects_response: true };

static WIDGET: Interface = Interface {
    name: "Widget",
    commands: &[Some(&WIDGET_ON), Some(&WIDGET_OFF), Some(&WIDGET_READ)],
};

const WIDGET_BASE: u16 = 0x1000;


/// one scripted module chain behind the mock channel
struct FakeHub {
    address: u8,
    /// reply message number counter
    msg: u8,
    /// how many commands of [WIDGET] the firmware admits to
    widget_count: u16,
    /// refuse interface queries altogether
    nack_interfaces: bool,
    /// swallow this many incoming datagrams before reacting again
    swallow: usize,
    /// nack this many widget commands with a busy reason first
    busy: usize,
    /// corrupt the next ack on its way out, the checksum will not match
    corrupt_next: bool,
    /// flag the next ack with attention-required
    attention_next: bool,
    /// respond to the next status query with the keep-alive-timeout bit
    timed_out: bool,
    /// module addresses answering a discovery broadcast, parent first
    chain: Vec<u8>,
}

impl FakeHub {
    fn new(address: u8) -> Self {
        Self {
            address,
            msg: 0,
            widget_count: 3,
            nack_interfaces: false,
            swallow: 0,
            busy: 0,
            corrupt_next: false,
            attention_next: false,
            timed_out: false,
            chain: vec![address],
        }
    }

    fn next_msg(&mut self) -> u8 {
        self.msg = self.msg.wrapping_add(1).max(1);
        self.msg
    }

    fn ack(&mut self, incoming: &Datagram) -> Vec<u8> {
        let attention = std::mem::take(&mut self.attention_next);
        let mut bytes = Datagram::new(
            HOST_ADDRESS, self.address, self.next_msg(), incoming.message_number,
            PacketId::command_id(COMMAND_ACK), vec![attention as u8],
            ).to_bytes();
        if std::mem::take(&mut self.corrupt_next) {
            let index = bytes.len() - 2;
            bytes[index] = bytes[index].wrapping_add(1);
        }
        bytes
    }

    fn nack(&mut self, incoming: &Datagram, reason: u8) -> Vec<u8> {
        Datagram::new(
            HOST_ADDRESS, self.address, self.next_msg(), incoming.message_number,
            PacketId::command_id(COMMAND_NACK), vec![reason],
            ).to_bytes()
    }

    fn respond(&mut self, incoming: &Datagram, payload: Vec<u8>) -> Vec<u8> {
        Datagram::new(
            HOST_ADDRESS, self.address, self.next_msg(), incoming.message_number,
            PacketId::response_id(incoming.command_number()), payload,
            ).to_bytes()
    }

    fn reply(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        let incoming = match Datagram::from_bytes(bytes) {
            Ok(incoming) => incoming,
            Err(_) => return Vec::new(),
        };
        if self.swallow > 0 {
            self.swallow -= 1;
            return Vec::new();
        }
        match incoming.command_number() {
            COMMAND_DISCOVERY => {
                let mut replies = Vec::new();
                for (rank, address) in self.chain.clone().into_iter().enumerate() {
                    replies.push(Datagram::new(
                        HOST_ADDRESS, address, self.next_msg(), 0,
                        PacketId::response_id(COMMAND_DISCOVERY), vec![(rank == 0) as u8],
                        ).to_bytes());
                }
                replies
            }
            COMMAND_QUERY_INTERFACE => {
                if self.nack_interfaces {
                    vec![self.nack(&incoming, 255)]
                }
                else {
                    let mut payload = Vec::new();
                    payload.extend_from_slice(&WIDGET_BASE.to_le_bytes());
                    payload.extend_from_slice(&self.widget_count.to_le_bytes());
                    vec![self.respond(&incoming, payload)]
                }
            }
            COMMAND_GET_MODULE_STATUS => {
                let status: u8 = if std::mem::take(&mut self.timed_out) { 0b0000_0001 } else { 0 };
                vec![self.respond(&incoming, vec![status, 0])]
            }
            COMMAND_SET_NEW_MODULE_ADDRESS => {
                let reply = self.ack(&incoming);
                self.address = incoming.payload[0];
                vec![reply]
            }
            number if number == WIDGET_BASE + 2 => {
                // WidgetRead
                vec![self.respond(&incoming, vec![0xab, 0xcd])]
            }
            number if number == WIDGET_BASE || number == WIDGET_BASE + 1 => {
                if self.busy > 0 {
                    self.busy -= 1;
                    vec![self.nack(&incoming, 40)]
                }
                else {
                    vec![self.ack(&incoming)]
                }
            }
            _ => vec![self.ack(&incoming)],
        }
    }
}

fn scripted_device(options: DeviceOptions) -> (Device, Arc<MockChannel>, Arc<Mutex<FakeHub>>) {
    init_logging();
    let hub = Arc::new(Mutex::new(FakeHub::new(1)));
    let channel = Arc::new(MockChannel::new({
        let hub = hub.clone();
        move |bytes| hub.lock().unwrap().reply(bytes)
    }));
    (Device::new(channel.clone(), options), channel, hub)
}

/// datagrams the engine wrote so far that carry the given command number
fn written_commands(channel: &MockChannel, number: u16) -> Vec<Datagram> {
    channel.written().iter()
        .filter_map(|bytes| Datagram::from_bytes(bytes).ok())
        .filter(|datagram| datagram.command_number() == number)
        .collect()
}


#[tokio::test]
async fn arm_ping_and_command() {
    let (device, channel, _) = scripted_device(fast_options());
    let module = device.add_module(1, true).await.unwrap();
    device.arm().await.unwrap();
    assert_eq!(device.arming_state(), ArmingState::Armed);

    module.ping().await.unwrap();
    assert!(module.query_interface(&WIDGET).await.unwrap());
    module.send(&WIDGET_ON, vec![1]).await.unwrap();
    let payload = module.send_receive(&WIDGET_READ, vec![]).await.unwrap();
    assert_eq!(payload, vec![0xab, 0xcd]);

    assert_eq!(module.unfinished_commands(), 0);
    assert!(! written_commands(&channel, COMMAND_KEEP_ALIVE).is_empty());
    device.close().await;
    // the orderly close pushed a fail-safe while the link was still up
    assert_eq!(written_commands(&channel, COMMAND_FAIL_SAFE).len(), 1);
}

#[tokio::test]
async fn recovers_from_garbage_between_frames() {
    let (device, channel, _hub) = scripted_device(fast_options());
    let module = device.add_module(1, true).await.unwrap();
    device.arm().await.unwrap();

    // junk between valid frames, once plain and once starting like a marker
    // with an impossible length; the ack following each must still be found
    channel.inject(vec![0x00, 0x44, 0x17, 0xa5]);
    module.ping().await.unwrap();
    channel.inject(vec![0x44, 0x4b, 0x03, 0x00, 0x99]);
    module.ping().await.unwrap();

    assert_eq!(module.unfinished_commands(), 0);
    device.close().await;
}

#[tokio::test]
async fn corrupted_datagram_is_dropped_silently() {
    let (device, _channel, hub) = scripted_device(fast_options());
    let module = device.add_module(1, true).await.unwrap();
    device.arm().await.unwrap();

    // the first ack arrives with a flipped byte: the engine must drop it
    // without desynchronizing and complete against the retransmission's ack
    hub.lock().unwrap().corrupt_next = true;
    module.ping().await.unwrap();
    assert_eq!(module.unfinished_commands(), 0);
    device.close().await;
}

#[tokio::test]
async fn disarm_abandons_response_expecting_command() {
    let options = DeviceOptions {
        // long enough that only the disarm can finish the exchange
        await_interval: Duration::from_secs(5),
        .. fast_options()
    };
    let (device, _channel, hub) = scripted_device(options);
    let module = device.add_module(1, true).await.unwrap();
    device.arm().await.unwrap();
    assert!(module.query_interface(&WIDGET).await.unwrap());

    // the module goes silent, the read will hang until disarmed
    hub.lock().unwrap().swallow = usize::MAX;
    let pending = tokio::spawn({
        let module = module.clone();
        async move { module.send_receive(&WIDGET_READ, vec![]).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(module.unfinished_commands(), 1);

    device.disarm().await;
    let result = tokio::time::timeout(Duration::from_secs(1), pending).await
        .expect("disarm must finish the exchange").unwrap();
    match result {
        Err(Error::Nack(reason)) => assert_eq!(reason, NackReason::AbandonedWaitingForResponse),
        other => panic!("expected an abandonment nack, got {:?}", other.map(|_| ())),
    }
    assert_eq!(module.unfinished_commands(), 0);
}

#[tokio::test]
async fn older_firmware_truncates_interface() {
    let (device, channel, hub) = scripted_device(fast_options());
    let module = device.add_module(1, true).await.unwrap();
    device.arm().await.unwrap();

    hub.lock().unwrap().widget_count = 2;
    assert!(module.query_interface(&WIDGET).await.unwrap());

    assert!(module.is_command_supported(&WIDGET_ON));
    assert!(module.is_command_supported(&WIDGET_OFF));
    assert!(! module.is_command_supported(&WIDGET_READ));
    assert_eq!(module.interface_base_command_number(&WIDGET).unwrap(), WIDGET_BASE);

    // the third command fails fast, before any bytes reach the wire
    let writes_before = channel.written().len();
    match module.send_receive(&WIDGET_READ, vec![]).await {
        Err(Error::Unsupported(name)) => assert_eq!(name, "WidgetRead"),
        other => panic!("expected unsupported, got {:?}", other),
    }
    assert_eq!(channel.written().len(), writes_before);
    device.close().await;
}

#[tokio::test]
async fn nacked_interface_fails_fast() {
    let (device, channel, hub) = scripted_device(fast_options());
    let module = device.add_module(1, true).await.unwrap();
    device.arm().await.unwrap();

    hub.lock().unwrap().nack_interfaces = true;
    assert!(! module.query_interface(&WIDGET).await.unwrap());
    match module.interface_base_command_number(&WIDGET) {
        Err(Error::Unsupported(name)) => assert_eq!(name, "Widget"),
        other => panic!("expected unsupported, got {:?}", other),
    }

    let writes_before = channel.written().len();
    assert!(matches!(module.send(&WIDGET_ON, vec![]).await, Err(Error::Unsupported(_))));
    assert_eq!(channel.written().len(), writes_before);
    device.close().await;
}

#[tokio::test]
async fn requery_follows_the_firmware() {
    let (device, _channel, hub) = scripted_device(fast_options());
    let module = device.add_module(1, true).await.unwrap();
    device.arm().await.unwrap();

    assert!(module.query_interface(&WIDGET).await.unwrap());
    assert!(module.is_command_supported(&WIDGET_READ));

    // after a reconnect the firmware reports an older interface
    hub.lock().unwrap().widget_count = 1;
    assert!(module.query_interface(&WIDGET).await.unwrap());
    assert!(module.is_command_supported(&WIDGET_ON));
    assert!(! module.is_command_supported(&WIDGET_OFF));
    assert!(! module.is_command_supported(&WIDGET_READ));
    device.close().await;
}

#[tokio::test]
async fn address_change_refused_with_siblings() {
    let (device, channel, _) = scripted_device(fast_options());
    let first = device.add_module(1, true).await.unwrap();
    device.add_module(2, false).await.unwrap();
    device.arm().await.unwrap();

    let writes_before = channel.written().len();
    match device.change_module_address(&first, 5).await {
        Err(Error::Usage(_)) => {}
        other => panic!("expected a refused address change, got {:?}", other),
    }
    // refused before any bytes moved
    assert_eq!(channel.written().len(), writes_before);
    assert_eq!(first.address(), 1);
    device.close().await;
}

#[tokio::test]
async fn address_change_rekeys_routing() {
    let (device, channel, hub) = scripted_device(fast_options());
    let module = device.add_module(1, true).await.unwrap();
    device.arm().await.unwrap();

    device.change_module_address(&module, 7).await.unwrap();
    assert_eq!(module.address(), 7);
    assert_eq!(hub.lock().unwrap().address, 7);
    assert!(device.module(1).is_none());
    assert!(device.module(7).is_some());

    // traffic flows under the new address
    module.ping().await.unwrap();
    let last_ping = written_commands(&channel, COMMAND_KEEP_ALIVE).pop().unwrap();
    assert_eq!(last_ping.dest, 7);
    device.close().await;
}

#[tokio::test]
async fn busy_nacks_are_retried() {
    let (device, channel, hub) = scripted_device(fast_options());
    let module = device.add_module(1, true).await.unwrap();
    device.arm().await.unwrap();
    assert!(module.query_interface(&WIDGET).await.unwrap());

    hub.lock().unwrap().busy = 2;
    module.send_retrying(&WIDGET_ON, vec![]).await.unwrap();
    // two busy nacks then the ack: three copies on the wire
    assert_eq!(written_commands(&channel, WIDGET_BASE).len(), 3);
    device.close().await;
}

#[tokio::test]
async fn busy_retry_is_bounded() {
    let options = DeviceOptions {
        busy_retry_window: Duration::from_millis(150),
        .. fast_options()
    };
    let (device, _channel, hub) = scripted_device(options);
    let module = device.add_module(1, true).await.unwrap();
    device.arm().await.unwrap();
    assert!(module.query_interface(&WIDGET).await.unwrap());

    hub.lock().unwrap().busy = usize::MAX;
    match module.send_retrying(&WIDGET_ON, vec![]).await {
        Err(Error::Nack(NackReason::I2cMasterBusy)) => {}
        other => panic!("expected the last busy nack to surface, got {:?}", other),
    }
    device.close().await;
}

#[tokio::test]
async fn unacknowledged_command_is_retransmitted() {
    let (device, channel, hub) = scripted_device(fast_options());
    let module = device.add_module(1, true).await.unwrap();
    device.arm().await.unwrap();

    // the first copy vanishes on the wire, a retransmission gets through
    hub.lock().unwrap().swallow = 1;
    module.ping().await.unwrap();

    let pings = written_commands(&channel, COMMAND_KEEP_ALIVE);
    let last = pings.last().unwrap();
    let copies = pings.iter().filter(|ping| ping.message_number == last.message_number).count();
    assert!(copies >= 2, "expected at least one retransmission, saw {}", copies);
    device.close().await;
}

#[tokio::test]
async fn silence_becomes_an_abandonment_nack() {
    let (device, _channel, hub) = scripted_device(fast_options());
    let module = device.add_module(1, true).await.unwrap();
    device.arm().await.unwrap();

    hub.lock().unwrap().swallow = usize::MAX;
    match module.ping().await {
        Err(Error::Nack(reason)) => assert_eq!(reason, NackReason::AbandonedWaitingForAck),
        other => panic!("expected an abandonment nack, got {:?}", other),
    }
    assert_eq!(module.unfinished_commands(), 0);
    device.close().await;
}

#[tokio::test]
async fn discovery_collects_each_module_once() {
    let (device, _channel, hub) = scripted_device(fast_options());
    device.arm().await.unwrap();
    // parent plus two children, and a duplicated child response
    hub.lock().unwrap().chain = vec![3, 1, 2, 2];

    let found = device.discover_modules().await.unwrap();
    assert_eq!(found.len(), 3);
    assert_eq!(found[0].address, 1);
    assert!(! found[0].is_parent);
    assert!(found.iter().find(|module| module.address == 3).unwrap().is_parent);
    device.close().await;
}

#[tokio::test]
async fn pretending_completes_commands_locally() {
    let (device, channel, _) = scripted_device(fast_options());
    let module = device.add_module(1, true).await.unwrap();
    device.pretend();
    assert_eq!(device.arming_state(), ArmingState::Pretending);

    module.ping().await.unwrap();
    module.fail_safe().await.unwrap();
    let status = module.get_module_status(true).await.unwrap();
    assert_eq!(u8::from(status.status), 0);
    assert!(channel.written().is_empty());
}

#[tokio::test]
async fn write_failure_shuts_the_device_down() {
    let (device, channel, _) = scripted_device(fast_options());
    let module = device.add_module(1, true).await.unwrap();
    device.arm().await.unwrap();

    channel.fail_writes(true);
    assert!(matches!(module.ping().await, Err(Error::Bus(_))));
    assert!(device.has_shutdown_abnormally());
    // no further traffic is attempted until re-armed
    let writes_before = channel.written().len();
    module.ping().await.unwrap();
    assert_eq!(channel.written().len(), writes_before);
}

#[tokio::test]
async fn unplugged_channel_shuts_the_device_down() {
    let (device, channel, _) = scripted_device(fast_options());
    let module = device.add_module(1, true).await.unwrap();
    device.arm().await.unwrap();

    channel.unplug();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(device.has_shutdown_abnormally());
    module.ping().await.unwrap();  // pretend completion, not an error
}

#[tokio::test]
async fn disengaged_module_pretends_and_reengages() {
    let (device, channel, _) = scripted_device(fast_options());
    let module = device.add_module(1, true).await.unwrap();
    device.arm().await.unwrap();

    module.disengage();
    let writes_before = channel.written().len();
    module.ping().await.unwrap();
    assert_eq!(channel.written().len(), writes_before);

    module.engage();
    module.ping().await.unwrap();
    assert!(channel.written().len() > writes_before);
    device.close().await;
}

#[tokio::test]
async fn idle_module_gets_pinged() {
    let options = DeviceOptions {
        keep_alive_timeout: Duration::from_millis(300),
        ping_margin: Duration::from_millis(220),
        .. fast_options()
    };
    let (device, channel, _) = scripted_device(options);
    device.add_module(1, true).await.unwrap();
    device.arm().await.unwrap();

    let after_arm = written_commands(&channel, COMMAND_KEEP_ALIVE).len();
    tokio::time::sleep(Duration::from_millis(400)).await;
    let after_idle = written_commands(&channel, COMMAND_KEEP_ALIVE).len();
    assert!(after_idle > after_arm, "idle period should have produced keep-alives");
    device.close().await;
}

struct CountingController {
    forgotten: AtomicUsize,
}
impl Controller for CountingController {
    fn forget_cached_state(&self) {
        self.forgotten.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn attention_required_recovers_peer_state() {
    let (device, channel, hub) = scripted_device(fast_options());
    let module = device.add_module(1, true).await.unwrap();
    device.arm().await.unwrap();

    let controller = Arc::new(CountingController { forgotten: AtomicUsize::new(0) });
    module.add_controller(controller.clone());

    let steps = [PatternStep { duration: 5, red: 0, green: 255, blue: 0 }];
    module.set_module_led_pattern(&steps).await.unwrap();
    assert_eq!(written_commands(&channel, COMMAND_SET_MODULE_LED_PATTERN).len(), 1);

    // the peer reset behind our back: it flags attention, reports a
    // keep-alive timeout, and must end up with its pattern restored
    {
        let mut hub = hub.lock().unwrap();
        hub.attention_next = true;
        hub.timed_out = true;
    }
    module.ping().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(written_commands(&channel, COMMAND_GET_MODULE_STATUS).len(), 1);
    assert_eq!(written_commands(&channel, COMMAND_SET_MODULE_LED_PATTERN).len(), 2);
    assert!(controller.forgotten.load(Ordering::SeqCst) >= 1);
    device.close().await;
}

#[tokio::test]
async fn many_sequential_exchanges_never_use_message_number_zero() {
    let (device, channel, _) = scripted_device(fast_options());
    let module = device.add_module(1, true).await.unwrap();
    device.arm().await.unwrap();

    // enough traffic to wrap the 8 bit message number space
    for _ in 0 .. 300 {
        module.ping().await.unwrap();
    }
    let pings = written_commands(&channel, COMMAND_KEEP_ALIVE);
    assert!(pings.len() >= 300);
    assert!(pings.iter().all(|ping| ping.message_number != 0));
    assert_eq!(module.unfinished_commands(), 0);
    device.close().await;
}

#[tokio::test]
async fn rearm_after_abnormal_shutdown() {
    let (device, channel, _) = scripted_device(fast_options());
    let module = device.add_module(1, true).await.unwrap();
    device.arm().await.unwrap();

    channel.fail_writes(true);
    assert!(module.ping().await.is_err());
    assert!(device.has_shutdown_abnormally());

    device.disarm().await;
    assert_eq!(device.arming_state(), ArmingState::Closed);
    channel.fail_writes(false);
    device.arm().await.unwrap();
    assert!(! device.has_shutdown_abnormally());
    module.ping().await.unwrap();
    device.close().await;
}

#[tokio::test]
async fn arming_observers_see_the_transitions() {
    let (device, _channel, _) = scripted_device(fast_options());
    device.add_module(1, true).await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let observer = device.observe_arming({
        let seen = seen.clone();
        move |state| seen.lock().unwrap().push(state)
    });

    device.arm().await.unwrap();
    device.disarm().await;
    assert_eq!(*seen.lock().unwrap(), vec![
        ArmingState::Arming, ArmingState::Armed,
        ArmingState::Disarming, ArmingState::Closed,
        ]);

    device.unobserve_arming(observer);
    device.arm().await.unwrap();
    assert_eq!(seen.lock().unwrap().len(), 4);
    device.close().await;
}

#[tokio::test]
async fn fast_shutdown_pushes_failsafe_ahead_and_hangs_the_rest() {
    let (device, channel, _hub) = scripted_device(fast_options());
    let module = device.add_module(1, true).await.unwrap();
    device.arm().await.unwrap();

    device.shutdown_fast().await;
    assert_eq!(written_commands(&channel, COMMAND_FAIL_SAFE).len(), 1);

    // every later bus acquirer hangs at the gate for good
    let late = tokio::spawn({
        let module = module.clone();
        async move { module.ping().await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(! late.is_finished());
    late.abort();
}

#[tokio::test]
async fn critical_section_spans_multiple_sends() {
    use hublink::host::{Completion, MessageKey};
    let (device, _channel, _hub) = scripted_device(fast_options());
    let module = device.add_module(1, true).await.unwrap();
    device.arm().await.unwrap();
    assert!(module.query_interface(&WIDGET).await.unwrap());

    // both sends recurse on the section's key instead of queueing behind it
    let key = MessageKey::new();
    device.acquire_bus_lock(key).await;
    let on = module.send_with_key(key, &WIDGET_ON, vec![]).await.unwrap();
    let off = module.send_with_key(key, &WIDGET_OFF, vec![]).await.unwrap();
    device.release_bus_lock(key);

    assert!(matches!(on, Completion::Acked { .. }));
    assert!(matches!(off, Completion::Acked { .. }));
    assert_eq!(module.unfinished_commands(), 0);
    device.close().await;
}

#[tokio::test]
async fn missing_child_is_skipped_missing_parent_fails() {
    // a chain where nothing ever answers
    init_logging();
    let silent = Arc::new(MockChannel::silent());
    let device = Device::new(silent.clone(), fast_options());
    device.add_module(1, true).await.unwrap();
    match device.arm().await {
        Err(Error::NoContact) => {}
        other => panic!("expected the arm to fail on the silent parent, got {:?}", other),
    }
    assert_eq!(device.arming_state(), ArmingState::Closed);

    // a chain whose parent answers but whose child does not: the fake hub
    // always replies from its own address, so module 9 never hears back
    let (device, _channel, _hub) = scripted_device(fast_options());
    device.add_module(1, true).await.unwrap();
    device.add_module(9, false).await.unwrap();
    device.arm().await.unwrap();
    assert!(device.module(1).is_some());
    assert!(device.module(9).is_none());
    assert_eq!(device.missing_modules(), vec![(9, "module #9".into())]);
    device.close().await;
}

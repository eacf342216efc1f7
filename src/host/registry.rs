/*!
    per-module command numbering.

    Different modules, and different firmware versions of the same module,
    place the same named interface at different command numbers and may
    implement fewer of its trailing commands. Each module therefore carries
    its own registry, seeded with the fixed standard band and extended by
    interface negotiation. Nothing here is global mutable state.
*/

use std::collections::HashMap;
use log::{debug, warn};

use crate::commands::{Interface, InterfaceCommand, is_standard_command};


/// how negotiation concluded for one named interface
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum InterfaceStatus {
    /// the module reported where the interface lives and how much of it it has
    Supported { base: u16, count: u16 },
    /// the module nacked the query, the whole interface is unavailable
    Nacked,
}

/// identity key of a static command descriptor
fn key(command: &'static InterfaceCommand) -> usize {
    command as *const InterfaceCommand as usize
}


/// maps wire command numbers to the commands one module actually implements
pub(crate) struct CommandRegistry {
    /// negotiated number to descriptor, for incoming validation
    numbers: HashMap<u16, &'static InterfaceCommand>,
    /// descriptor identity to negotiated number, for outgoing resolution
    supported: HashMap<usize, u16>,
    /// negotiation outcome per interface name
    interfaces: HashMap<&'static str, InterfaceStatus>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self {
            numbers: HashMap::new(),
            supported: HashMap::new(),
            interfaces: HashMap::new(),
        }
    }

    /// wire number for a negotiated command, `None` when its interface is
    /// unsupported, truncated away, or was never queried
    pub fn command_number(&self, command: &'static InterfaceCommand) -> Option<u16> {
        self.supported.get(&key(command)).copied()
    }

    pub fn is_supported(&self, command: &'static InterfaceCommand) -> bool {
        self.supported.contains_key(&key(command))
    }

    /// whether an incoming command number means anything on this module
    pub fn knows_number(&self, number: u16) -> bool {
        is_standard_command(number) || self.numbers.contains_key(&number)
    }

    pub fn lookup(&self, number: u16) -> Option<&'static InterfaceCommand> {
        self.numbers.get(&number).copied()
    }

    pub fn interface_status(&self, name: &str) -> Option<InterfaceStatus> {
        self.interfaces.get(name).copied()
    }

    /// drop every number previously negotiated for this interface, so a
    /// re-query never leaves stale entries behind
    pub fn invalidate(&mut self, interface: &'static Interface) {
        for slot in interface.commands {
            if let Some(command) = *slot {
                if let Some(number) = self.supported.remove(&key(command)) {
                    self.numbers.remove(&number);
                }
            }
        }
        self.interfaces.remove(interface.name);
    }

    /**
        record a successful negotiation.

        A module reporting fewer commands than we know simply runs an older
        version of the interface: the trailing commands stay unregistered and
        report unsupported, which is not an error.
    */
    pub fn register(&mut self, interface: &'static Interface, base: u16, count: u16) {
        if count < interface.command_count() {
            debug!("interface {}: expected {} commands, module has {}",
                interface.name, interface.command_count(), count);
        }
        for (index, slot) in interface.commands.iter().enumerate() {
            if index >= usize::from(count) {
                break;
            }
            let Some(number) = base.checked_add(index as u16) else {
                warn!("interface {}: command numbering overflows at slot {}", interface.name, index);
                break;
            };
            if is_standard_command(number) || number >= 1 << 15 {
                // the reserved band and the response bit are off limits, a
                // module reporting numbers there is broken
                warn!("interface {}: ignoring reserved command number 0x{:04x}",
                    interface.name, number);
                continue;
            }
            if let Some(command) = *slot {
                self.numbers.insert(number, command);
                self.supported.insert(key(command), number);
            }
        }
        self.interfaces.insert(interface.name, InterfaceStatus::Supported { base, count });
    }

    /// record a refused negotiation: every command of the interface must now
    /// fail fast before any bytes reach the wire
    pub fn mark_nacked(&mut self, interface: &'static Interface) {
        self.interfaces.insert(interface.name, InterfaceStatus::Nacked);
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::Interface;

    static FIRST: InterfaceCommand = InterfaceCommand { name: "First", expects_response: false };
    static SECOND: InterfaceCommand = InterfaceCommand { name: "Second", expects_response: true };
    static THIRD: InterfaceCommand = InterfaceCommand { name: "Third", expects_response: false };

    static IFACE: Interface = Interface {
        name: "Test",
        commands: &[Some(&FIRST), Some(&SECOND), Some(&THIRD)],
    };

    #[test]
    fn truncated_interface_registers_prefix_only() {
        let mut registry = CommandRegistry::new();
        registry.register(&IFACE, 0x1000, 2);

        assert_eq!(registry.command_number(&FIRST), Some(0x1000));
        assert_eq!(registry.command_number(&SECOND), Some(0x1001));
        assert!(registry.is_supported(&SECOND));
        assert!(! registry.is_supported(&THIRD));
        assert_eq!(registry.command_number(&THIRD), None);
    }

    #[test]
    fn requery_invalidates_before_repopulating() {
        let mut registry = CommandRegistry::new();
        registry.register(&IFACE, 0x1000, 3);
        assert_eq!(registry.command_number(&THIRD), Some(0x1002));

        // the module came back with a different base and an older version
        registry.invalidate(&IFACE);
        assert!(! registry.is_supported(&FIRST));
        registry.register(&IFACE, 0x2000, 2);

        assert_eq!(registry.command_number(&FIRST), Some(0x2000));
        assert_eq!(registry.command_number(&THIRD), None);
        assert!(! registry.knows_number(0x1000));
        assert!(registry.knows_number(0x2001));
    }

    #[test]
    fn nacked_interface_supports_nothing() {
        let mut registry = CommandRegistry::new();
        registry.mark_nacked(&IFACE);
        assert_eq!(registry.interface_status("Test"), Some(InterfaceStatus::Nacked));
        assert!(! registry.is_supported(&FIRST));
    }

    #[test]
    fn standard_band_is_always_known() {
        let registry = CommandRegistry::new();
        assert!(registry.knows_number(0x7f01));
        assert!(registry.knows_number(0x7fff));
        assert!(! registry.knows_number(0x1000));
    }

    #[test]
    fn placeholder_slots_keep_numbering() {
        static SPARSE: Interface = Interface {
            name: "Sparse",
            commands: &[Some(&FIRST), None, Some(&THIRD)],
        };
        let mut registry = CommandRegistry::new();
        registry.register(&SPARSE, 0x3000, 3);
        assert_eq!(registry.command_number(&FIRST), Some(0x3000));
        assert_eq!(registry.command_number(&THIRD), Some(0x3002));
        assert!(! registry.knows_number(0x3001));
    }
}

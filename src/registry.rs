//! Per-class-type instance registries and the ownership scans over them.
//!
//! Instance counts are small and fixed, so every lookup is a linear walk in
//! dispatch precedence order; no derived tables are kept.

use crate::class::{ClassInstanceId, ClassType, ControlData, DeviceClass, RequestStatus};
use crate::config::{limits, InstanceConfig};
use crate::control::{Recipient, SetupPacket};
use crate::driver::EndpointEvent;
use crate::endpoint::{EndpointAddress, EndpointSet};
use crate::{Result, UsbError};
use heapless::Vec;

/// One registered class instance: its static binding, its handler and the
/// core-maintained runtime flags.
pub(crate) struct ClassInstance<'a> {
    pub(crate) config: &'a InstanceConfig<'a>,
    pub(crate) handler: &'a mut dyn DeviceClass,
    owned: EndpointSet,
    started: EndpointSet,
    active: bool,
}

impl ClassInstance<'_> {
    pub(crate) fn owner_device(&self) -> u8 {
        self.config.device
    }

    pub(crate) fn owns_endpoint(&self, addr: EndpointAddress) -> bool {
        self.owned.contains(addr)
    }

    pub(crate) fn owns_interface(&self, number: u8) -> bool {
        self.config.owns_interface(number)
    }

    /// Whether a SETUP packet's recipient addresses this instance.
    /// Device- and Other-recipient requests are offered to every instance
    /// on the device, in precedence order.
    fn matches_recipient(&self, setup: &SetupPacket) -> bool {
        match setup.recipient {
            Recipient::Device | Recipient::Other => true,
            Recipient::Interface => setup.index < 0x100 && self.owns_interface(setup.index as u8),
            Recipient::Endpoint => self.owns_endpoint(EndpointAddress::from(setup.index as u8)),
            Recipient::Reserved => false,
        }
    }
}

/// Walks every instance table in dispatch precedence order, stopping early
/// when the closure produces a value.
macro_rules! walk_instances {
    ($self:ident, $f:ident) => {{
        for (i, inst) in $self.custom_class.iter_mut().enumerate() {
            if let Some(r) = $f(ClassInstanceId::new(ClassType::CustomClass, i as u8), inst) {
                return Some(r);
            }
        }
        for (i, inst) in $self.audio.iter_mut().enumerate() {
            if let Some(r) = $f(ClassInstanceId::new(ClassType::Audio, i as u8), inst) {
                return Some(r);
            }
        }
        for (i, inst) in $self.cdc.iter_mut().enumerate() {
            if let Some(r) = $f(ClassInstanceId::new(ClassType::Cdc, i as u8), inst) {
                return Some(r);
            }
        }
        for (i, inst) in $self.hid.iter_mut().enumerate() {
            if let Some(r) = $f(ClassInstanceId::new(ClassType::Hid, i as u8), inst) {
                return Some(r);
            }
        }
        for (i, inst) in $self.msc.iter_mut().enumerate() {
            if let Some(r) = $f(ClassInstanceId::new(ClassType::Msc, i as u8), inst) {
                return Some(r);
            }
        }
        None
    }};
}

/// The ordered collections of class instances, one per class type.
pub struct ClassRegistry<'a> {
    custom_class: Vec<ClassInstance<'a>, { limits::CUSTOM_CLASS }>,
    audio: Vec<ClassInstance<'a>, { limits::AUDIO }>,
    cdc: Vec<ClassInstance<'a>, { limits::CDC }>,
    hid: Vec<ClassInstance<'a>, { limits::HID }>,
    msc: Vec<ClassInstance<'a>, { limits::MSC }>,
}

impl<'a> ClassRegistry<'a> {
    pub(crate) fn new() -> ClassRegistry<'a> {
        ClassRegistry {
            custom_class: Vec::new(),
            audio: Vec::new(),
            cdc: Vec::new(),
            hid: Vec::new(),
            msc: Vec::new(),
        }
    }

    pub(crate) fn register(
        &mut self,
        class: ClassType,
        config: &'a InstanceConfig<'a>,
        handler: &'a mut dyn DeviceClass,
    ) -> Result<ClassInstanceId> {
        let instance = ClassInstance {
            config,
            handler,
            owned: config.endpoint_set(),
            started: EndpointSet::EMPTY,
            active: false,
        };

        let index = self.instance_count(class);
        let pushed = match class {
            ClassType::CustomClass => self.custom_class.push(instance),
            ClassType::Audio => self.audio.push(instance),
            ClassType::Cdc => self.cdc.push(instance),
            ClassType::Hid => self.hid.push(instance),
            ClassType::Msc => self.msc.push(instance),
        };
        pushed.map_err(|_| UsbError::InstanceLimit)?;

        Ok(ClassInstanceId::new(class, index))
    }

    /// Number of registered instances of one class type.
    pub fn instance_count(&self, class: ClassType) -> u8 {
        let len = match class {
            ClassType::CustomClass => self.custom_class.len(),
            ClassType::Audio => self.audio.len(),
            ClassType::Cdc => self.cdc.len(),
            ClassType::Hid => self.hid.len(),
            ClassType::Msc => self.msc.len(),
        };
        len as u8
    }

    fn instance(&self, id: ClassInstanceId) -> Option<&ClassInstance<'a>> {
        let index = usize::from(id.index);
        match id.class {
            ClassType::CustomClass => self.custom_class.get(index),
            ClassType::Audio => self.audio.get(index),
            ClassType::Cdc => self.cdc.get(index),
            ClassType::Hid => self.hid.get(index),
            ClassType::Msc => self.msc.get(index),
        }
    }

    fn instance_mut(&mut self, id: ClassInstanceId) -> Option<&mut ClassInstance<'a>> {
        let index = usize::from(id.index);
        match id.class {
            ClassType::CustomClass => self.custom_class.get_mut(index),
            ClassType::Audio => self.audio.get_mut(index),
            ClassType::Cdc => self.cdc.get_mut(index),
            ClassType::Hid => self.hid.get_mut(index),
            ClassType::Msc => self.msc.get_mut(index),
        }
    }

    /// Device index an instance is bound to.
    pub fn owner_device(&self, id: ClassInstanceId) -> Result<u8> {
        self.instance(id)
            .map(|inst| inst.owner_device())
            .ok_or(UsbError::OutOfRange)
    }

    /// Whether `addr` is in an instance's configured endpoint set.
    pub fn owns_endpoint(&self, id: ClassInstanceId, addr: EndpointAddress) -> bool {
        self.instance(id)
            .map(|inst| inst.owns_endpoint(addr))
            .unwrap_or(false)
    }

    /// Whether an instance is bound to interface `number`.
    pub fn owns_interface(&self, id: ClassInstanceId, number: u8) -> bool {
        self.instance(id)
            .map(|inst| inst.owns_interface(number))
            .unwrap_or(false)
    }

    fn each_instance_mut<R>(
        &mut self,
        mut f: impl FnMut(ClassInstanceId, &mut ClassInstance<'a>) -> Option<R>,
    ) -> Option<R> {
        walk_instances!(self, f)
    }

    /// Finds the instance owning `addr` on `device`. Ownership is exclusive
    /// by configuration, so the first match is the only match.
    pub(crate) fn find_endpoint_owner(
        &self,
        device: u8,
        addr: EndpointAddress,
    ) -> Option<ClassInstanceId> {
        for class in ClassType::ALL {
            for index in 0..self.instance_count(class) {
                let id = ClassInstanceId::new(class, index);
                let inst = self.instance(id)?;
                if inst.owner_device() == device && inst.owns_endpoint(addr) {
                    return Some(id);
                }
            }
        }
        None
    }

    /// Offers a SETUP packet to every matching instance on `device` in
    /// precedence order. The first instance returning something other than
    /// `NotProcessed` wins and the walk stops.
    pub(crate) fn dispatch_setup(
        &mut self,
        device: u8,
        setup: &SetupPacket,
        data: &mut ControlData<'_>,
    ) -> (RequestStatus, Option<ClassInstanceId>) {
        self.each_instance_mut(|id, inst| {
            if inst.owner_device() != device || !inst.matches_recipient(setup) {
                return None;
            }

            let status = inst.handler.setup_packet_received(setup, data);
            if status == RequestStatus::NotProcessed {
                None
            } else {
                Some((status, Some(id)))
            }
        })
        .unwrap_or((RequestStatus::NotProcessed, None))
    }

    pub(crate) fn setup_processed(&mut self, id: ClassInstanceId, setup: &SetupPacket) {
        if let Some(inst) = self.instance_mut(id) {
            inst.handler.setup_packet_processed(setup);
        }
    }

    pub(crate) fn out_data_received(&mut self, id: ClassInstanceId, data: &[u8]) -> RequestStatus {
        match self.instance_mut(id) {
            Some(inst) => inst.handler.out_data_received(data),
            None => RequestStatus::NotProcessed,
        }
    }

    pub(crate) fn in_data_sent(&mut self, id: ClassInstanceId, len: usize) -> RequestStatus {
        match self.instance_mut(id) {
            Some(inst) => inst.handler.in_data_sent(len),
            None => RequestStatus::NotProcessed,
        }
    }

    /// Routes a non-control endpoint event to the owning instance. Returns
    /// false when no instance owns the address (possible only during a
    /// teardown race); the caller drops the event.
    pub(crate) fn dispatch_endpoint_event(
        &mut self,
        device: u8,
        addr: EndpointAddress,
        event: EndpointEvent,
    ) -> bool {
        match self.find_endpoint_owner(device, addr) {
            Some(id) => {
                if let Some(inst) = self.instance_mut(id) {
                    inst.handler.endpoint_event(addr, event);
                }
                true
            }
            None => false,
        }
    }

    /// Calls `initialize` on every instance owned by `device`. Initialization
    /// continues past failures so one broken class function does not prevent
    /// the others from starting; the last non-OK status is returned.
    pub(crate) fn initialize_device(&mut self, device: u8) -> Result<()> {
        let mut status = Ok(());
        let _ = self.each_instance_mut(|_, inst| -> Option<()> {
            if inst.owner_device() == device {
                match inst.handler.initialize() {
                    Ok(()) => inst.active = true,
                    Err(e) => status = Err(e),
                }
            }
            None
        });
        status
    }

    /// Calls `uninitialize` on every active instance owned by `device`,
    /// with the same attempt-all-report-last policy as initialization.
    pub(crate) fn uninitialize_device(&mut self, device: u8) -> Result<()> {
        let mut status = Ok(());
        let _ = self.each_instance_mut(|_, inst| -> Option<()> {
            if inst.owner_device() == device && inst.active {
                inst.active = false;
                inst.started.clear();
                if let Err(e) = inst.handler.uninitialize() {
                    status = Err(e);
                }
            }
            None
        });
        status
    }

    /// Bus reset fan-out: endpoints are implicitly stopped by the reset, so
    /// the started masks are cleared before the handlers run.
    pub(crate) fn reset_device(&mut self, device: u8) {
        let _ = self.each_instance_mut(|_, inst| -> Option<()> {
            if inst.owner_device() == device && inst.active {
                inst.started.clear();
                inst.handler.reset();
            }
            None
        });
    }

    /// Fan-out of the configured hook, only for a non-zero configuration
    /// value.
    pub(crate) fn configuration_set(&mut self, device: u8, value: u8) {
        let _ = self.each_instance_mut(|_, inst| -> Option<()> {
            if inst.owner_device() == device && inst.active {
                inst.handler.configuration_set(value);
            }
            None
        });
    }

    /// Starts an owned endpoint. A second start of an already started
    /// address is a no-op, so worker threads are not duplicated. Returns
    /// false when nothing on `device` owns `addr`.
    pub(crate) fn endpoint_start(&mut self, device: u8, addr: EndpointAddress) -> bool {
        match self.find_endpoint_owner(device, addr) {
            Some(id) => {
                if let Some(inst) = self.instance_mut(id) {
                    if !inst.started.contains(addr) {
                        inst.started.insert(addr);
                        inst.handler.endpoint_start(addr);
                    }
                }
                true
            }
            None => false,
        }
    }

    /// Stops an owned endpoint; only started addresses reach the handler.
    pub(crate) fn endpoint_stop(&mut self, device: u8, addr: EndpointAddress) -> bool {
        match self.find_endpoint_owner(device, addr) {
            Some(id) => {
                if let Some(inst) = self.instance_mut(id) {
                    if inst.started.contains(addr) {
                        inst.started.remove(addr);
                        inst.handler.endpoint_stop(addr);
                    }
                }
                true
            }
            None => false,
        }
    }

    pub(crate) fn feature_stall_cleared(&mut self, device: u8, addr: EndpointAddress) {
        if let Some(id) = self.find_endpoint_owner(device, addr) {
            if let Some(inst) = self.instance_mut(id) {
                inst.handler.feature_stall_cleared(addr);
            }
        }
    }

    /// The endpoint table of the instance owning `interface` on `device`,
    /// for alternate-setting endpoint restarts.
    pub(crate) fn interface_endpoints(
        &self,
        device: u8,
        interface: u8,
    ) -> Option<&'a [crate::endpoint::EndpointConfig]> {
        for class in ClassType::ALL {
            for index in 0..self.instance_count(class) {
                let inst = self.instance(ClassInstanceId::new(class, index))?;
                if inst.owner_device() == device && inst.owns_interface(interface) {
                    return Some(inst.config.endpoints);
                }
            }
        }
        None
    }

    /// Iterates the endpoint tables of every instance owned by `device`.
    pub(crate) fn each_device_endpoint(
        &self,
        device: u8,
        mut f: impl FnMut(&crate::endpoint::EndpointConfig),
    ) {
        for class in ClassType::ALL {
            for index in 0..self.instance_count(class) {
                if let Some(inst) = self.instance(ClassInstanceId::new(class, index)) {
                    if inst.owner_device() == device {
                        for ep in inst.config.endpoints {
                            f(ep);
                        }
                    }
                }
            }
        }
    }
}

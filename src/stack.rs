//! The stack core: lifecycle orchestration, event pump and SETUP dispatch.

use crate::class::{ClassInstanceId, ClassType, ControlData, DeviceClass, RequestStatus};
use crate::config::StackConfig;
use crate::control::{descriptor_type, RequestType, Recipient, SetupPacket, OS_STRING_INDEX};
use crate::control_pipe::{InComplete, OutComplete};
use crate::device::{ClaimedRequest, Device, DeviceState, DispatchTarget};
use crate::driver::{DeviceEvent, EndpointEvent, UsbdDriver};
use crate::endpoint::EndpointAddress;
use crate::kernel::{ThreadTask, UsbKernel, FLAG_DEVICE_EVENT, FLAG_ENDPOINT_EVENT};
use crate::registry::ClassRegistry;
use crate::{Result, UsbDirection, UsbError};
use core::cmp::min;
use heapless::Vec;

use crate::config::MAX_DEVICES;

/// The composite device stack: up to [`MAX_DEVICES`] device ports, the
/// class-instance registries shared by all of them, and the RTOS boundary.
///
/// Interrupt glue calls the `signal_*` methods; each device's core thread
/// runs [`device_task`](UsbStack::device_task). On a bare-metal target both
/// roles can be played by a single loop calling
/// [`process_events`](UsbStack::process_events).
pub struct UsbStack<'a, D: UsbdDriver, K: UsbKernel> {
    kernel: &'a K,
    config: StackConfig<'a>,
    devices: Vec<Device<'a, D, K>, MAX_DEVICES>,
    classes: ClassRegistry<'a>,
    hooks: [Option<&'a mut dyn DeviceClass>; MAX_DEVICES],
}

impl<'a, D: UsbdDriver, K: UsbKernel> UsbStack<'a, D, K> {
    /// Creates the stack from a validated configuration and one driver per
    /// configured device port, in device-index order.
    pub fn new(
        config: StackConfig<'a>,
        kernel: &'a K,
        drivers: impl IntoIterator<Item = D>,
    ) -> Result<UsbStack<'a, D, K>> {
        config.validate()?;

        let mut devices = Vec::new();
        for (index, driver) in drivers.into_iter().enumerate() {
            let dev_config = config.devices.get(index).ok_or(UsbError::OutOfRange)?;
            devices
                .push(Device::new(index as u8, driver, dev_config))
                .map_err(|_| UsbError::OutOfRange)?;
        }
        if devices.len() != config.devices.len() {
            return Err(UsbError::OutOfRange);
        }

        Ok(UsbStack {
            kernel,
            config,
            devices,
            classes: ClassRegistry::new(),
            hooks: Default::default(),
        })
    }

    /// Registers the next class instance of `class`, binding `handler` to
    /// the next unclaimed row of that class's configuration table.
    pub fn register(
        &mut self,
        class: ClassType,
        handler: &'a mut dyn DeviceClass,
    ) -> Result<ClassInstanceId> {
        let table = self.config.class_tables()[class as usize];
        let index = usize::from(self.classes.instance_count(class));
        let instance_config = table.get(index).ok_or(UsbError::OutOfRange)?;

        self.classes.register(class, instance_config, handler)
    }

    /// Installs the application hook for one device port. The hook is
    /// consulted before any class instance for non-standard requests on
    /// that port, so an application can override or extend class behavior.
    pub fn set_device_hook(&mut self, dev: u8, hook: &'a mut dyn DeviceClass) -> Result<()> {
        if usize::from(dev) >= self.devices.len() {
            return Err(UsbError::OutOfRange);
        }
        self.hooks[usize::from(dev)] = Some(hook);
        Ok(())
    }

    /// Number of configured device ports.
    pub fn device_count(&self) -> u8 {
        self.devices.len() as u8
    }

    pub fn device(&self, dev: u8) -> Result<&Device<'a, D, K>> {
        self.devices.get(usize::from(dev)).ok_or(UsbError::OutOfRange)
    }

    pub fn device_mut(&mut self, dev: u8) -> Result<&mut Device<'a, D, K>> {
        self.devices
            .get_mut(usize::from(dev))
            .ok_or(UsbError::OutOfRange)
    }

    /// Shared access to the class registries.
    pub fn classes(&self) -> &ClassRegistry<'a> {
        &self.classes
    }

    /// Brings one device port up: driver, power, core thread, then every
    /// class instance bound to the port.
    ///
    /// Instance initialization continues past a failing instance; the last
    /// failure is returned after all instances have been attempted.
    pub fn initialize(&mut self, dev: u8) -> Result<()> {
        let device = self.device_mut(dev)?;
        device.driver.initialize()?;
        if let Err(e) = device.driver.power_control(true) {
            let _ = device.driver.uninitialize();
            return Err(e);
        }

        let thread = match self.kernel.spawn(ThreadTask::DeviceCore(dev)) {
            Ok(thread) => thread,
            Err(e) => {
                let device = &mut self.devices[usize::from(dev)];
                let _ = device.driver.power_control(false);
                let _ = device.driver.uninitialize();
                return Err(e);
            }
        };
        self.devices[usize::from(dev)].thread = Some(thread);

        self.classes.initialize_device(dev)
    }

    /// Tears one device port down, the reverse of
    /// [`initialize`](UsbStack::initialize).
    pub fn uninitialize(&mut self, dev: u8) -> Result<()> {
        let status = self.classes.uninitialize_device(dev);

        let thread = self.device_mut(dev)?.thread.take();
        if let Some(thread) = thread {
            self.kernel.terminate(thread)?;
        }

        let device = self.device_mut(dev)?;
        device.reset_state();
        device.driver.power_control(false)?;
        device.driver.uninitialize()?;

        status
    }

    /// Makes the port visible to the host by activating the pull-up.
    pub fn connect(&mut self, dev: u8) -> Result<()> {
        self.device_mut(dev)?.driver.connect()
    }

    /// Detaches the port from the host.
    pub fn disconnect(&mut self, dev: u8) -> Result<()> {
        self.device_mut(dev)?.driver.disconnect()
    }

    /// Signals resume to the host. Fails with
    /// [`InvalidState`](UsbError::InvalidState) unless the host has enabled
    /// the remote wakeup feature.
    pub fn remote_wakeup(&mut self, dev: u8) -> Result<()> {
        let device = self.device_mut(dev)?;
        if !device.driver.capabilities().remote_wakeup {
            return Err(UsbError::Unsupported);
        }
        if !device.remote_wakeup_enabled {
            return Err(UsbError::InvalidState);
        }
        device.driver.remote_wakeup()
    }

    /// Starts an endpoint's class-level activity outside the normal
    /// SET_CONFIGURATION flow. Starting an already started endpoint is a
    /// no-op.
    pub fn endpoint_start(&mut self, dev: u8, addr: EndpointAddress) -> Result<()> {
        if usize::from(dev) >= self.devices.len() {
            return Err(UsbError::OutOfRange);
        }
        if self.classes.endpoint_start(dev, addr) {
            Ok(())
        } else {
            Err(UsbError::OutOfRange)
        }
    }

    /// Stops an endpoint's class-level activity.
    pub fn endpoint_stop(&mut self, dev: u8, addr: EndpointAddress) -> Result<()> {
        if usize::from(dev) >= self.devices.len() {
            return Err(UsbError::OutOfRange);
        }
        if self.classes.endpoint_stop(dev, addr) {
            Ok(())
        } else {
            Err(UsbError::OutOfRange)
        }
    }

    /// Records a device-level event and wakes the port's core thread.
    /// Callable from interrupt context.
    pub fn signal_device_event(&self, dev: u8, event: DeviceEvent) {
        if let Some(device) = self.devices.get(usize::from(dev)) {
            device.pending.signal_device(event);
            if let Some(thread) = device.thread {
                self.kernel.signal(thread, FLAG_DEVICE_EVENT);
            }
        } else {
            usb_debug!("usbd{}: device event for unknown port dropped", dev);
        }
    }

    /// Records an endpoint event and wakes the port's core thread.
    /// Callable from interrupt context.
    pub fn signal_endpoint_event(&self, dev: u8, addr: EndpointAddress, event: EndpointEvent) {
        if let Some(device) = self.devices.get(usize::from(dev)) {
            device.pending.signal_endpoint(addr, event);
            if let Some(thread) = device.thread {
                self.kernel.signal(thread, FLAG_ENDPOINT_EVENT);
            }
        } else {
            usb_debug!("usbd{}: endpoint event for unknown port dropped", dev);
        }
    }

    /// The body of one device core thread: blocks on the kernel for event
    /// signals and processes whatever has accumulated. Returns only on a
    /// driver fault.
    pub fn device_task(&mut self, dev: u8) -> Result<()> {
        loop {
            let _ = self
                .kernel
                .wait_flags(FLAG_DEVICE_EVENT | FLAG_ENDPOINT_EVENT, None);
            self.process_events(dev)?;
        }
    }

    /// Drains and processes every pending event for one device port.
    /// Device-level events run first, then endpoint 0, then the other
    /// endpoints.
    pub fn process_events(&mut self, dev: u8) -> Result<()> {
        let taken = self.device(dev)?.pending.take();
        if taken.is_empty() {
            return Ok(());
        }

        use crate::device::PendingEvents as P;

        if taken.device & P::device_event_bit(DeviceEvent::Reset) != 0 {
            self.handle_reset(dev)?;
        }
        if taken.device & P::device_event_bit(DeviceEvent::HighSpeed) != 0 {
            self.device_mut(dev)?.high_speed = true;
        }
        if taken.device & P::device_event_bit(DeviceEvent::Connect) != 0 {
            usb_trace!("usbd{}: connected", dev);
        }
        if taken.device
            & (P::device_event_bit(DeviceEvent::Disconnect)
                | P::device_event_bit(DeviceEvent::VbusOff))
            != 0
        {
            self.handle_detach(dev)?;
        }
        if taken.device & P::device_event_bit(DeviceEvent::VbusOn) != 0 {
            usb_trace!("usbd{}: vbus on", dev);
        }
        if taken.device & P::device_event_bit(DeviceEvent::Suspend) != 0 {
            let device = self.device_mut(dev)?;
            if device.state != DeviceState::Suspend {
                device.resume_state = device.state;
                device.state = DeviceState::Suspend;
            }
        }
        if taken.device & P::device_event_bit(DeviceEvent::Resume) != 0 {
            let device = self.device_mut(dev)?;
            if device.state == DeviceState::Suspend {
                device.state = device.resume_state;
            }
        }

        const EP0_OUT_BIT: u32 = 1 << 0;
        const EP0_IN_BIT: u32 = 1 << 16;

        if taken.ep_setup & EP0_OUT_BIT != 0 {
            self.handle_ep0_setup(dev)?;
        }
        if taken.ep_out & EP0_OUT_BIT != 0 {
            self.handle_ep0_out(dev)?;
        }
        if taken.ep_in & EP0_IN_BIT != 0 {
            self.handle_ep0_in(dev)?;
        }

        for bit in 1..16u8 {
            if taken.ep_out & (1u32 << bit) != 0 {
                self.dispatch_endpoint(dev, EndpointAddress::from(bit), EndpointEvent::OutDataReceived);
            }
        }
        for bit in 17..32u8 {
            if taken.ep_in & (1u32 << bit) != 0 {
                let addr = EndpointAddress::from(0x80 | (bit - 16));
                self.dispatch_endpoint(dev, addr, EndpointEvent::InDataSent);
            }
        }

        Ok(())
    }

    fn dispatch_endpoint(&mut self, dev: u8, addr: EndpointAddress, event: EndpointEvent) {
        if !self.classes.dispatch_endpoint_event(dev, addr, event) {
            usb_debug!("usbd{}: dropping event for unowned endpoint {}", dev, u8::from(addr));
        }
    }

    /// Bus reset: protocol state back to defaults on the port and a reset
    /// notification to the hook and every owned instance.
    fn handle_reset(&mut self, dev: u8) -> Result<()> {
        usb_trace!("usbd{}: bus reset", dev);
        self.device_mut(dev)?.reset_state();
        if let Some(hook) = self.hooks[usize::from(dev)].as_mut() {
            hook.reset();
        }
        self.classes.reset_device(dev);
        Ok(())
    }

    /// Detach or VBUS loss: same protocol teardown as a reset, without the
    /// driver having been through reset signalling.
    fn handle_detach(&mut self, dev: u8) -> Result<()> {
        usb_trace!("usbd{}: detached", dev);
        self.device_mut(dev)?.reset_state();
        self.classes.reset_device(dev);
        Ok(())
    }

    fn handle_ep0_setup(&mut self, dev: u8) -> Result<()> {
        let Self {
            devices,
            classes,
            hooks,
            ..
        } = self;
        let device = devices.get_mut(usize::from(dev)).ok_or(UsbError::OutOfRange)?;
        let hook = &mut hooks[usize::from(dev)];

        let setup = match device.control.handle_setup(&mut device.driver)? {
            Some(setup) => setup,
            None => return Ok(()),
        };

        usb_trace!(
            "usbd{}: setup req {} value {} index {} len {}",
            dev,
            setup.request,
            setup.value,
            setup.index,
            setup.length
        );

        dispatch_setup(device, classes, hook, setup)
    }

    fn handle_ep0_out(&mut self, dev: u8) -> Result<()> {
        let Self {
            devices,
            classes,
            hooks,
            ..
        } = self;
        let device = devices.get_mut(usize::from(dev)).ok_or(UsbError::OutOfRange)?;
        let hook = &mut hooks[usize::from(dev)];

        match device.control.handle_out(&mut device.driver)? {
            OutComplete::None => Ok(()),
            OutComplete::DataReady(_setup) => {
                let status = match device.claimed {
                    Some(claimed) => match claimed.target {
                        DispatchTarget::Core => RequestStatus::Ok,
                        DispatchTarget::Hook => match hook.as_mut() {
                            Some(h) => h.out_data_received(device.control.data()),
                            None => RequestStatus::NotProcessed,
                        },
                        DispatchTarget::Instance(id) => {
                            classes.out_data_received(id, device.control.data())
                        }
                    },
                    None => RequestStatus::NotProcessed,
                };

                match status {
                    RequestStatus::Ok => device.control.accept_status(&mut device.driver),
                    RequestStatus::Nak => Ok(()),
                    _ => device.control.reject(&mut device.driver),
                }
            }
            OutComplete::StatusComplete => finish_transfer(device, classes, hook),
        }
    }

    fn handle_ep0_in(&mut self, dev: u8) -> Result<()> {
        let Self {
            devices,
            classes,
            hooks,
            ..
        } = self;
        let device = devices.get_mut(usize::from(dev)).ok_or(UsbError::OutOfRange)?;
        let hook = &mut hooks[usize::from(dev)];

        match device.control.handle_in_complete(&mut device.driver)? {
            InComplete::None => Ok(()),
            InComplete::DataSent(len) => {
                let status = match device.claimed {
                    Some(claimed) => match claimed.target {
                        DispatchTarget::Core => RequestStatus::Ok,
                        DispatchTarget::Hook => match hook.as_mut() {
                            Some(h) => h.in_data_sent(len),
                            None => RequestStatus::NotProcessed,
                        },
                        DispatchTarget::Instance(id) => classes.in_data_sent(id, len),
                    },
                    None => RequestStatus::Ok,
                };

                match status {
                    RequestStatus::Stall => device.control.reject(&mut device.driver),
                    _ => Ok(()),
                }
            }
            InComplete::StatusComplete => finish_transfer(device, classes, hook),
        }
    }
}

/// Applies end-of-transfer effects once the status stage completes: a
/// deferred SET_ADDRESS takes effect, and the winning handler gets its
/// `setup_packet_processed` notification.
fn finish_transfer<'a, D: UsbdDriver, K: UsbKernel>(
    device: &mut Device<'a, D, K>,
    classes: &mut ClassRegistry<'a>,
    hook: &mut Option<&'a mut dyn DeviceClass>,
) -> Result<()> {
    if let Some(addr) = device.pending_address.take() {
        if !D::QUIRK_SET_ADDRESS_BEFORE_STATUS {
            device.driver.set_address(addr)?;
        }
        device.state = if addr == 0 {
            DeviceState::Default
        } else {
            DeviceState::Addressed
        };
        usb_debug!("usbd{}: address set to {}", device.index, addr);
    }

    if let Some(claimed) = device.claimed.take() {
        match claimed.target {
            DispatchTarget::Core => {}
            DispatchTarget::Hook => {
                if let Some(h) = hook.as_mut() {
                    h.setup_packet_processed(&claimed.setup);
                }
            }
            DispatchTarget::Instance(id) => classes.setup_processed(id, &claimed.setup),
        }
    }

    Ok(())
}

/// What the core decided to do with a standard request.
enum StandardAction {
    /// Serve `len` bytes already placed in the control buffer.
    SendData(usize),
    /// The request took effect; acknowledge with the status stage.
    Status,
    Stall,
    /// Not a request the core serves; offer it to the dispatch chain.
    Unhandled,
}

/// Runs the full SETUP dispatch: standard requests in the core first, then
/// the vendor OS-descriptor request, then the device hook, then the class
/// instances in precedence order. An unclaimed request stalls endpoint 0.
fn dispatch_setup<'a, D: UsbdDriver, K: UsbKernel>(
    device: &mut Device<'a, D, K>,
    classes: &mut ClassRegistry<'a>,
    hook: &mut Option<&'a mut dyn DeviceClass>,
    setup: SetupPacket,
) -> Result<()> {
    device.claimed = None;

    if setup.request_type == RequestType::Standard {
        match handle_standard(device, classes, &setup)? {
            StandardAction::SendData(len) => {
                device.claimed = Some(ClaimedRequest {
                    target: DispatchTarget::Core,
                    setup,
                });
                return device.control.accept_in(&mut device.driver, &setup, len);
            }
            StandardAction::Status => {
                device.claimed = Some(ClaimedRequest {
                    target: DispatchTarget::Core,
                    setup,
                });
                return device.control.accept_status(&mut device.driver);
            }
            StandardAction::Stall => return device.control.reject(&mut device.driver),
            StandardAction::Unhandled => {}
        }
    }

    if let Some(len) = serve_os_descriptor(device, &setup)? {
        device.claimed = Some(ClaimedRequest {
            target: DispatchTarget::Core,
            setup,
        });
        return device.control.accept_in(&mut device.driver, &setup, len);
    }

    let (status, target, len) = {
        let mut data = ControlData::new(device.control.buf());

        let mut outcome = (RequestStatus::NotProcessed, DispatchTarget::Core);
        if let Some(h) = hook.as_mut() {
            let status = h.setup_packet_received(&setup, &mut data);
            if status != RequestStatus::NotProcessed {
                outcome = (status, DispatchTarget::Hook);
            }
        }
        if outcome.0 == RequestStatus::NotProcessed {
            let (status, id) = classes.dispatch_setup(device.index, &setup, &mut data);
            if let Some(id) = id {
                outcome = (status, DispatchTarget::Instance(id));
            }
        }

        (outcome.0, outcome.1, data.len())
    };

    match status {
        RequestStatus::Ok => {
            device.claimed = Some(ClaimedRequest { target, setup });

            if setup.length == 0 {
                device.control.accept_status(&mut device.driver)
            } else if setup.direction == UsbDirection::In {
                device.control.accept_in(&mut device.driver, &setup, len)
            } else {
                // OUT data stage already armed; the completion callback
                // runs when the data arrives.
                Ok(())
            }
        }
        RequestStatus::Nak => {
            device.claimed = Some(ClaimedRequest { target, setup });
            Ok(())
        }
        RequestStatus::Stall | RequestStatus::NotProcessed => {
            usb_debug!(
                "usbd{}: unhandled request {} stalled",
                device.index,
                setup.request
            );
            device.control.reject(&mut device.driver)
        }
    }
}

/// Serves the Microsoft extended compat ID OS descriptor when the request
/// matches the configured vendor code.
fn serve_os_descriptor<'a, D: UsbdDriver, K: UsbKernel>(
    device: &mut Device<'a, D, K>,
    setup: &SetupPacket,
) -> Result<Option<usize>> {
    const COMPAT_ID_INDEX: u16 = 0x0004;

    if setup.request_type != RequestType::Vendor
        || setup.direction != UsbDirection::In
        || setup.index != COMPAT_ID_INDEX
    {
        return Ok(None);
    }

    match device.config.os_descriptor_vendor_code {
        Some(code) if code == setup.request => {}
        _ => return Ok(None),
    }

    match device.config.descriptors.os_compat_id {
        Some(blob) => Ok(Some(load_response(device, blob))),
        None => Ok(None),
    }
}

/// Copies a response blob into the control buffer, truncating to the buffer
/// size, and returns the loaded length.
fn load_response<'a, D: UsbdDriver, K: UsbKernel>(
    device: &mut Device<'a, D, K>,
    response: &[u8],
) -> usize {
    let buf = device.control.buf();
    let len = min(response.len(), buf.len());
    buf[..len].copy_from_slice(&response[..len]);
    len
}

fn handle_standard<'a, D: UsbdDriver, K: UsbKernel>(
    device: &mut Device<'a, D, K>,
    classes: &mut ClassRegistry<'a>,
    setup: &SetupPacket,
) -> Result<StandardAction> {
    match (setup.recipient, setup.request) {
        (_, SetupPacket::GET_STATUS) => get_status(device, classes, setup),
        (_, SetupPacket::CLEAR_FEATURE) => clear_feature(device, classes, setup),
        (_, SetupPacket::SET_FEATURE) => set_feature(device, setup),
        (Recipient::Device, SetupPacket::SET_ADDRESS) => set_address(device, setup),
        (Recipient::Device, SetupPacket::GET_DESCRIPTOR) => get_descriptor(device, setup),
        (Recipient::Device, SetupPacket::GET_CONFIGURATION) => {
            let configuration = device.configuration;
            device.control.buf()[0] = configuration;
            Ok(StandardAction::SendData(1))
        }
        (Recipient::Device, SetupPacket::SET_CONFIGURATION) => {
            set_configuration(device, classes, setup)
        }
        (Recipient::Interface, SetupPacket::GET_INTERFACE) => get_interface(device, setup),
        (Recipient::Interface, SetupPacket::SET_INTERFACE) => set_interface(device, classes, setup),
        (Recipient::Endpoint, SetupPacket::SYNCH_FRAME) => {
            // Frame numbers are not tracked; report frame zero.
            let buf = device.control.buf();
            buf[0] = 0;
            buf[1] = 0;
            Ok(StandardAction::SendData(2))
        }
        // GET_DESCRIPTOR with an interface recipient is served by class
        // handlers (HID report descriptors and similar).
        _ => Ok(StandardAction::Unhandled),
    }
}

fn get_status<'a, D: UsbdDriver, K: UsbKernel>(
    device: &mut Device<'a, D, K>,
    classes: &ClassRegistry<'a>,
    setup: &SetupPacket,
) -> Result<StandardAction> {
    let status: u16 = match setup.recipient {
        Recipient::Device => {
            let mut bits = 0;
            if device.config.self_powered() {
                bits |= 0x0001;
            }
            if device.remote_wakeup_enabled {
                bits |= 0x0002;
            }
            bits
        }
        Recipient::Interface => {
            if setup.index >= u16::from(device.config.interface_count) {
                return Ok(StandardAction::Stall);
            }
            0x0000
        }
        Recipient::Endpoint => {
            let addr = EndpointAddress::from(setup.index as u8);
            // Only endpoint 0 is addressable before the device is
            // configured; endpoints no instance owns get a request error.
            if !addr.is_control()
                && (device.state != DeviceState::Configured
                    || classes.find_endpoint_owner(device.index, addr).is_none())
            {
                return Ok(StandardAction::Stall);
            }
            if device.stalled.contains(addr) {
                0x0001
            } else {
                0x0000
            }
        }
        _ => return Ok(StandardAction::Unhandled),
    };

    device.control.buf()[..2].copy_from_slice(&status.to_le_bytes());
    Ok(StandardAction::SendData(2))
}

fn clear_feature<'a, D: UsbdDriver, K: UsbKernel>(
    device: &mut Device<'a, D, K>,
    classes: &mut ClassRegistry<'a>,
    setup: &SetupPacket,
) -> Result<StandardAction> {
    match (setup.recipient, setup.value) {
        (Recipient::Device, SetupPacket::FEATURE_DEVICE_REMOTE_WAKEUP) => {
            if !device.config.supports_remote_wakeup() {
                return Ok(StandardAction::Stall);
            }
            device.remote_wakeup_enabled = false;
            Ok(StandardAction::Status)
        }
        (Recipient::Endpoint, SetupPacket::FEATURE_ENDPOINT_HALT) => {
            let addr = EndpointAddress::from(setup.index as u8);
            if addr.is_control() {
                return Ok(StandardAction::Status);
            }
            if device.state != DeviceState::Configured {
                return Ok(StandardAction::Stall);
            }

            device.driver.endpoint_stall(addr, false)?;
            device.stalled.remove(addr);
            classes.feature_stall_cleared(device.index, addr);
            Ok(StandardAction::Status)
        }
        _ => Ok(StandardAction::Unhandled),
    }
}

fn set_feature<'a, D: UsbdDriver, K: UsbKernel>(
    device: &mut Device<'a, D, K>,
    setup: &SetupPacket,
) -> Result<StandardAction> {
    match (setup.recipient, setup.value) {
        (Recipient::Device, SetupPacket::FEATURE_DEVICE_REMOTE_WAKEUP) => {
            if !device.config.supports_remote_wakeup() {
                return Ok(StandardAction::Stall);
            }
            device.remote_wakeup_enabled = true;
            Ok(StandardAction::Status)
        }
        (Recipient::Endpoint, SetupPacket::FEATURE_ENDPOINT_HALT) => {
            let addr = EndpointAddress::from(setup.index as u8);
            if addr.is_control() || device.state != DeviceState::Configured {
                return Ok(StandardAction::Stall);
            }

            device.driver.endpoint_stall(addr, true)?;
            device.stalled.insert(addr);
            Ok(StandardAction::Status)
        }
        _ => Ok(StandardAction::Unhandled),
    }
}

fn set_address<'a, D: UsbdDriver, K: UsbKernel>(
    device: &mut Device<'a, D, K>,
    setup: &SetupPacket,
) -> Result<StandardAction> {
    if setup.value > 127 || device.state == DeviceState::Configured {
        return Ok(StandardAction::Stall);
    }

    let addr = setup.value as u8;
    device.pending_address = Some(addr);
    if D::QUIRK_SET_ADDRESS_BEFORE_STATUS {
        device.driver.set_address(addr)?;
    }

    Ok(StandardAction::Status)
}

/// String descriptor index conventionally used for the serial number.
const SERIAL_STRING_INDEX: u8 = 3;

fn get_descriptor<'a, D: UsbdDriver, K: UsbKernel>(
    device: &mut Device<'a, D, K>,
    setup: &SetupPacket,
) -> Result<StandardAction> {
    let (dtype, dindex) = setup.descriptor_type_index();
    let config = device.config;
    let descriptors = &config.descriptors;

    let descriptor: &'a [u8] = match dtype {
        descriptor_type::DEVICE => descriptors.device,
        descriptor_type::CONFIGURATION => {
            if device.high_speed {
                descriptors.configuration_hs.unwrap_or(descriptors.configuration)
            } else {
                descriptors.configuration
            }
        }
        descriptor_type::DEVICE_QUALIFIER => match descriptors.device_qualifier {
            Some(d) if config.high_speed_capable => d,
            _ => return Ok(StandardAction::Stall),
        },
        descriptor_type::OTHER_SPEED_CONFIGURATION => {
            match descriptors.other_speed_configuration {
                Some(d) => d,
                None => return Ok(StandardAction::Stall),
            }
        }
        descriptor_type::STRING => {
            if dindex == SERIAL_STRING_INDEX {
                if let Some(len) = device.serial_response() {
                    return Ok(StandardAction::SendData(len));
                }
            }

            let string = if dindex == OS_STRING_INDEX {
                descriptors.os_string
            } else {
                descriptors.strings.get(usize::from(dindex)).copied()
            };
            match string {
                Some(d) => d,
                None => return Ok(StandardAction::Stall),
            }
        }
        _ => return Ok(StandardAction::Unhandled),
    };

    if descriptor.len() > crate::control_pipe::CONTROL_BUF_LEN {
        usb_debug!(
            "usbd{}: descriptor {} too long for the control buffer",
            device.index,
            dtype
        );
        return Ok(StandardAction::Stall);
    }

    Ok(StandardAction::SendData(load_response(device, descriptor)))
}

fn set_configuration<'a, D: UsbdDriver, K: UsbKernel>(
    device: &mut Device<'a, D, K>,
    classes: &mut ClassRegistry<'a>,
    setup: &SetupPacket,
) -> Result<StandardAction> {
    if device.state == DeviceState::Default {
        return Ok(StandardAction::Stall);
    }

    let value = setup.value as u8;

    if value == 0 {
        deconfigure(device, classes)?;
        return Ok(StandardAction::Status);
    }

    if value != device.config.configuration_value {
        return Ok(StandardAction::Stall);
    }
    if device.state == DeviceState::Configured {
        // Re-selecting the active configuration restarts it.
        deconfigure(device, classes)?;
    }

    let dev = device.index;
    let driver = &mut device.driver;
    let mut driver_status = Ok(());
    classes.each_device_endpoint(dev, |ep| {
        if let Err(e) = driver.endpoint_configure(ep) {
            driver_status = Err(e);
        }
    });
    driver_status?;

    classes.configuration_set(dev, value);

    let mut addrs = crate::endpoint::EndpointSet::EMPTY;
    classes.each_device_endpoint(dev, |ep| addrs.insert(ep.address));
    for bit in 0..32u8 {
        if bit == 0 || bit == 16 {
            continue;
        }
        let addr = mask_bit_address(bit);
        if addrs.contains(addr) {
            classes.endpoint_start(dev, addr);
        }
    }

    device.configuration = value;
    device.alt_settings = [0; crate::config::MAX_INTERFACES];
    device.state = DeviceState::Configured;
    usb_debug!("usbd{}: configured (configuration {})", dev, value);

    Ok(StandardAction::Status)
}

fn deconfigure<'a, D: UsbdDriver, K: UsbKernel>(
    device: &mut Device<'a, D, K>,
    classes: &mut ClassRegistry<'a>,
) -> Result<()> {
    let dev = device.index;

    let mut addrs = crate::endpoint::EndpointSet::EMPTY;
    classes.each_device_endpoint(dev, |ep| addrs.insert(ep.address));
    for bit in 0..32u8 {
        if bit == 0 || bit == 16 {
            continue;
        }
        let addr = mask_bit_address(bit);
        if addrs.contains(addr) {
            classes.endpoint_stop(dev, addr);
            device.driver.endpoint_unconfigure(addr)?;
        }
    }

    device.configuration = 0;
    device.stalled.clear();
    if device.state == DeviceState::Configured {
        device.state = DeviceState::Addressed;
    }

    Ok(())
}

fn get_interface<'a, D: UsbdDriver, K: UsbKernel>(
    device: &mut Device<'a, D, K>,
    setup: &SetupPacket,
) -> Result<StandardAction> {
    if device.state != DeviceState::Configured
        || setup.index >= u16::from(device.config.interface_count)
    {
        return Ok(StandardAction::Stall);
    }

    let alt = device.alt_settings[usize::from(setup.index)];
    device.control.buf()[0] = alt;
    Ok(StandardAction::SendData(1))
}

fn set_interface<'a, D: UsbdDriver, K: UsbKernel>(
    device: &mut Device<'a, D, K>,
    classes: &mut ClassRegistry<'a>,
    setup: &SetupPacket,
) -> Result<StandardAction> {
    if device.state != DeviceState::Configured
        || setup.index >= u16::from(device.config.interface_count)
    {
        return Ok(StandardAction::Stall);
    }

    let interface = setup.index as u8;
    device.alt_settings[usize::from(interface)] = setup.value as u8;

    // Restart the owning instance's endpoints so data toggles reset, as
    // the host expects after an interface change.
    if let Some(endpoints) = classes.interface_endpoints(device.index, interface) {
        for ep in endpoints {
            classes.endpoint_stop(device.index, ep.address);
            device.driver.endpoint_configure(ep)?;
            classes.endpoint_start(device.index, ep.address);
        }
    }

    Ok(StandardAction::Status)
}

/// The endpoint address for a mask bit, the inverse of
/// [`EndpointAddress::mask_bit`].
fn mask_bit_address(bit: u8) -> EndpointAddress {
    if bit < 16 {
        EndpointAddress::from(bit)
    } else {
        EndpointAddress::from(0x80 | (bit - 16))
    }
}

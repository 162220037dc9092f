//! Shared scaffolding for the integration tests: a scripted controller
//! driver, a single-threaded kernel and a recording class handler.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use usbd_composite::class::{ControlData, DeviceClass, RequestStatus};
use usbd_composite::control::SetupPacket;
use usbd_composite::driver::{DriverCapabilities, EndpointEvent, UsbdDriver};
use usbd_composite::endpoint::{EndpointAddress, EndpointConfig};
use usbd_composite::kernel::{EventFlags, ThreadTask, UsbKernel};
use usbd_composite::{Result, UsbError};

/// Everything the mock controller remembers, shared between the driver
/// handed to the stack and the test body.
#[derive(Default)]
pub struct DriverState {
    pub initialized: bool,
    pub powered: bool,
    pub connected: bool,
    pub address: u8,
    pub address_history: Vec<u8>,
    /// SETUP packets waiting for `read_setup`.
    pub setup_queue: VecDeque<[u8; 8]>,
    /// Received packets waiting for `endpoint_read`, per endpoint address.
    pub out_queues: Vec<(u8, VecDeque<Vec<u8>>)>,
    /// Packets the stack wrote, per endpoint address, in order.
    pub written: Vec<(u8, Vec<Vec<u8>>)>,
    /// Currently configured non-control endpoint addresses.
    pub configured: Vec<u8>,
    /// Currently stalled endpoint addresses.
    pub stalled: Vec<u8>,
    pub aborted: Vec<u8>,
}

impl DriverState {
    pub fn queue_out(&mut self, addr: u8, packet: Vec<u8>) {
        for (a, q) in self.out_queues.iter_mut() {
            if *a == addr {
                q.push_back(packet);
                return;
            }
        }
        let mut q = VecDeque::new();
        q.push_back(packet);
        self.out_queues.push((addr, q));
    }

    fn pop_out(&mut self, addr: u8) -> Option<Vec<u8>> {
        self.out_queues
            .iter_mut()
            .find(|(a, _)| *a == addr)
            .and_then(|(_, q)| q.pop_front())
    }

    fn record_write(&mut self, addr: u8, packet: Vec<u8>) {
        for (a, packets) in self.written.iter_mut() {
            if *a == addr {
                packets.push(packet);
                return;
            }
        }
        self.written.push((addr, vec![packet]));
    }

    pub fn written_to(&self, addr: u8) -> Vec<Vec<u8>> {
        self.written
            .iter()
            .find(|(a, _)| *a == addr)
            .map(|(_, packets)| packets.clone())
            .unwrap_or_default()
    }

    /// All data packets written to EP0 IN, concatenated.
    pub fn ep0_in_data(&self) -> Vec<u8> {
        self.written_to(0x80).concat()
    }
}

/// A controller driver scripted through shared [`DriverState`].
pub struct MockDriver(pub Rc<RefCell<DriverState>>);

impl MockDriver {
    pub fn new() -> (MockDriver, Rc<RefCell<DriverState>>) {
        let state = Rc::new(RefCell::new(DriverState::default()));
        (MockDriver(state.clone()), state)
    }
}

impl UsbdDriver for MockDriver {
    fn initialize(&mut self) -> Result<()> {
        self.0.borrow_mut().initialized = true;
        Ok(())
    }

    fn uninitialize(&mut self) -> Result<()> {
        self.0.borrow_mut().initialized = false;
        Ok(())
    }

    fn power_control(&mut self, on: bool) -> Result<()> {
        self.0.borrow_mut().powered = on;
        Ok(())
    }

    fn connect(&mut self) -> Result<()> {
        self.0.borrow_mut().connected = true;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        self.0.borrow_mut().connected = false;
        Ok(())
    }

    fn set_address(&mut self, addr: u8) -> Result<()> {
        let mut state = self.0.borrow_mut();
        state.address = addr;
        state.address_history.push(addr);
        Ok(())
    }

    fn read_setup(&mut self, buf: &mut [u8; 8]) -> Result<()> {
        match self.0.borrow_mut().setup_queue.pop_front() {
            Some(raw) => {
                *buf = raw;
                Ok(())
            }
            None => Err(UsbError::WouldBlock),
        }
    }

    fn endpoint_configure(&mut self, config: &EndpointConfig) -> Result<()> {
        let mut state = self.0.borrow_mut();
        let addr = u8::from(config.address);
        if !state.configured.contains(&addr) {
            state.configured.push(addr);
        }
        Ok(())
    }

    fn endpoint_unconfigure(&mut self, addr: EndpointAddress) -> Result<()> {
        let addr = u8::from(addr);
        self.0.borrow_mut().configured.retain(|a| *a != addr);
        Ok(())
    }

    fn endpoint_read(&mut self, addr: EndpointAddress, buf: &mut [u8]) -> Result<usize> {
        let packet = self
            .0
            .borrow_mut()
            .pop_out(u8::from(addr))
            .ok_or(UsbError::WouldBlock)?;
        if packet.len() > buf.len() {
            return Err(UsbError::BufferOverflow);
        }
        buf[..packet.len()].copy_from_slice(&packet);
        Ok(packet.len())
    }

    fn endpoint_write(&mut self, addr: EndpointAddress, buf: &[u8]) -> Result<usize> {
        self.0.borrow_mut().record_write(u8::from(addr), buf.to_vec());
        Ok(buf.len())
    }

    fn endpoint_stall(&mut self, addr: EndpointAddress, stalled: bool) -> Result<()> {
        let addr = u8::from(addr);
        let mut state = self.0.borrow_mut();
        if stalled {
            if !state.stalled.contains(&addr) {
                state.stalled.push(addr);
            }
        } else {
            state.stalled.retain(|a| *a != addr);
        }
        Ok(())
    }

    fn endpoint_abort(&mut self, addr: EndpointAddress) -> Result<()> {
        self.0.borrow_mut().aborted.push(u8::from(addr));
        Ok(())
    }

    fn endpoint_transfer_count(&self, _addr: EndpointAddress) -> usize {
        0
    }

    fn remote_wakeup(&mut self) -> Result<()> {
        Ok(())
    }

    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities {
            vbus_detection: true,
            remote_wakeup: true,
        }
    }
}

/// A kernel that records spawns and signals and never blocks.
#[derive(Default)]
pub struct SimKernel {
    pub spawned: RefCell<Vec<ThreadTask>>,
    pub terminated: RefCell<Vec<u8>>,
    pub signals: RefCell<Vec<(u8, EventFlags)>>,
    /// Makes every `spawn` fail, for bring-up unwind tests.
    pub fail_spawn: bool,
}

impl UsbKernel for SimKernel {
    type ThreadId = u8;
    type SemaphoreId = u8;
    type TimerId = u8;

    fn spawn(&self, task: ThreadTask) -> Result<u8> {
        if self.fail_spawn {
            return Err(UsbError::Kernel);
        }
        let mut spawned = self.spawned.borrow_mut();
        spawned.push(task);
        Ok((spawned.len() - 1) as u8)
    }

    fn terminate(&self, thread: u8) -> Result<()> {
        self.terminated.borrow_mut().push(thread);
        Ok(())
    }

    fn signal(&self, thread: u8, flags: EventFlags) {
        self.signals.borrow_mut().push((thread, flags));
    }

    fn wait_flags(&self, flags: EventFlags, _timeout_ms: Option<u32>) -> EventFlags {
        flags
    }

    fn semaphore_create(&self, _initial: u32) -> Result<u8> {
        Ok(0)
    }

    fn semaphore_acquire(&self, _sem: u8, _timeout_ms: Option<u32>) -> Result<()> {
        Ok(())
    }

    fn semaphore_release(&self, _sem: u8) {}

    fn timer_start(&self, _task: ThreadTask, _period_ms: u32) -> Result<u8> {
        Ok(0)
    }

    fn timer_stop(&self, _timer: u8) -> Result<()> {
        Ok(())
    }
}

/// Everything a [`TestClass`] handler observed.
#[derive(Default)]
pub struct ClassLog {
    pub initialized: u32,
    pub uninitialized: u32,
    pub resets: u32,
    pub configurations: Vec<u8>,
    pub started: Vec<u8>,
    pub stopped: Vec<u8>,
    pub setups: Vec<SetupPacket>,
    pub processed: Vec<SetupPacket>,
    pub out_payloads: Vec<Vec<u8>>,
    pub in_sent: Vec<usize>,
    pub events: Vec<(u8, EndpointEvent)>,
    pub stall_cleared: Vec<u8>,
}

/// A class handler that records every callback and claims requests matching
/// a scripted predicate.
pub struct TestClass {
    pub log: Rc<RefCell<ClassLog>>,
    /// Decides whether (and how) to claim an offered SETUP packet.
    pub claim: Box<dyn Fn(&SetupPacket) -> RequestStatus>,
    /// Response served for claimed IN requests.
    pub response: Vec<u8>,
    /// Makes `initialize` fail, for fan-out aggregation tests.
    pub fail_init: bool,
}

impl TestClass {
    /// A handler that never claims anything.
    pub fn passive() -> (TestClass, Rc<RefCell<ClassLog>>) {
        TestClass::claiming(|_| RequestStatus::NotProcessed)
    }

    /// A handler claiming whatever `claim` accepts.
    pub fn claiming(
        claim: impl Fn(&SetupPacket) -> RequestStatus + 'static,
    ) -> (TestClass, Rc<RefCell<ClassLog>>) {
        let log = Rc::new(RefCell::new(ClassLog::default()));
        let class = TestClass {
            log: log.clone(),
            claim: Box::new(claim),
            response: Vec::new(),
            fail_init: false,
        };
        (class, log)
    }
}

impl DeviceClass for TestClass {
    fn initialize(&mut self) -> Result<()> {
        self.log.borrow_mut().initialized += 1;
        if self.fail_init {
            Err(UsbError::Kernel)
        } else {
            Ok(())
        }
    }

    fn uninitialize(&mut self) -> Result<()> {
        self.log.borrow_mut().uninitialized += 1;
        Ok(())
    }

    fn reset(&mut self) {
        self.log.borrow_mut().resets += 1;
    }

    fn configuration_set(&mut self, value: u8) {
        self.log.borrow_mut().configurations.push(value);
    }

    fn endpoint_start(&mut self, addr: EndpointAddress) {
        self.log.borrow_mut().started.push(u8::from(addr));
    }

    fn endpoint_stop(&mut self, addr: EndpointAddress) {
        self.log.borrow_mut().stopped.push(u8::from(addr));
    }

    fn setup_packet_received(
        &mut self,
        setup: &SetupPacket,
        data: &mut ControlData<'_>,
    ) -> RequestStatus {
        self.log.borrow_mut().setups.push(*setup);

        let status = (self.claim)(setup);
        if status == RequestStatus::Ok && !self.response.is_empty() {
            data.write(&self.response).unwrap();
        }
        status
    }

    fn setup_packet_processed(&mut self, setup: &SetupPacket) {
        self.log.borrow_mut().processed.push(*setup);
    }

    fn out_data_received(&mut self, data: &[u8]) -> RequestStatus {
        self.log.borrow_mut().out_payloads.push(data.to_vec());
        RequestStatus::Ok
    }

    fn in_data_sent(&mut self, len: usize) -> RequestStatus {
        self.log.borrow_mut().in_sent.push(len);
        RequestStatus::Ok
    }

    fn endpoint_event(&mut self, addr: EndpointAddress, event: EndpointEvent) {
        self.log.borrow_mut().events.push((u8::from(addr), event));
    }

    fn feature_stall_cleared(&mut self, addr: EndpointAddress) {
        self.log.borrow_mut().stall_cleared.push(u8::from(addr));
    }
}

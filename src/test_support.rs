//! Shared fixtures for the unit tests.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use std::collections::HashMap;
use std::sync::{Condvar, Mutex};

use crate::bus::{DriverObject, PdoId, UsbBus, UsbDeviceDesc};
use crate::cmdq::completion::{PostProcessList, XferCmd, XferTransport, process_completion};
use crate::platform::{Event, EventHandle, PlatformOps, WaitEvent};
use crate::status::{Error, Result, XferError};

#[ctor::ctor]
fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A notification event that counts how many times it was signaled.
#[derive(Default)]
pub(crate) struct TestEvent {
    signals: AtomicU32,
}

impl TestEvent {
    pub(crate) fn signal_count(&self) -> u32 {
        self.signals.load(Ordering::SeqCst)
    }
}

impl Event for TestEvent {
    fn signal(&self) {
        let _ = self.signals.fetch_add(1, Ordering::SeqCst);
    }
}

struct TestWaitEvent {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl WaitEvent for TestWaitEvent {
    fn signal(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        *signaled = true;
        self.cond.notify_all();
    }

    fn wait(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        while !*signaled {
            signaled = self.cond.wait(signaled).unwrap();
        }
    }

    fn wait_timeout(&self, ms: u32) -> bool {
        let deadline = std::time::Duration::from_millis(u64::from(ms));
        let signaled = self.signaled.lock().unwrap();
        let (signaled, _) = self
            .cond
            .wait_timeout_while(signaled, deadline, |s| !*s)
            .unwrap();
        *signaled
    }
}

/// Platform with a registry of referenceable events. `reference_event`
/// returns clones of the registered `Arc`, so event identity behaves like
/// the kernel object manager's.
pub(crate) struct TestPlatform {
    events: Mutex<HashMap<u64, Arc<TestEvent>>>,
}

impl TestPlatform {
    pub(crate) fn new() -> Self {
        Self {
            events: Mutex::new(HashMap::new()),
        }
    }

    /// Registers an event under `handle` and returns it for inspection.
    pub(crate) fn register_event(&self, handle: EventHandle) -> Arc<TestEvent> {
        let event = Arc::new(TestEvent::default());
        let _ = self
            .events
            .lock()
            .unwrap()
            .insert(handle.0, Arc::clone(&event));
        event
    }
}

impl PlatformOps for TestPlatform {
    fn reference_event(&self, handle: EventHandle) -> Result<Arc<dyn Event>> {
        self.events
            .lock()
            .unwrap()
            .get(&handle.0)
            .map(|e| Arc::clone(e) as Arc<dyn Event>)
            .ok_or(Error::InvalidParameter)
    }

    fn create_wait_event(&self) -> Arc<dyn WaitEvent> {
        Arc::new(TestWaitEvent {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        })
    }

    fn sleep_ms(&self, ms: u32) {
        // keep the bounded poll loops fast under test
        std::thread::sleep(std::time::Duration::from_millis(u64::from(ms.min(1))));
    }
}

struct TestBusInner {
    hubs: Vec<Arc<DriverObject>>,
    devices: HashMap<u64, UsbDeviceDesc>,
    cycled: Vec<PdoId>,
}

/// A bus with pluggable hubs and devices, recording port cycles.
pub(crate) struct TestBus {
    inner: Mutex<TestBusInner>,
}

impl TestBus {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(TestBusInner {
                hubs: Vec::new(),
                devices: HashMap::new(),
                cycled: Vec::new(),
            }),
        }
    }

    pub(crate) fn add_hub(&self, hub: Arc<DriverObject>) {
        self.inner.lock().unwrap().hubs.push(hub);
    }

    pub(crate) fn add_device(&self, pdo: PdoId, desc: UsbDeviceDesc) {
        let _ = self.inner.lock().unwrap().devices.insert(pdo.0, desc);
    }

    pub(crate) fn remove_device(&self, pdo: PdoId) {
        let _ = self.inner.lock().unwrap().devices.remove(&pdo.0);
    }

    pub(crate) fn cycled(&self) -> Vec<PdoId> {
        self.inner.lock().unwrap().cycled.clone()
    }
}

impl UsbBus for TestBus {
    fn hub_drivers(&self) -> Vec<Arc<DriverObject>> {
        self.inner.lock().unwrap().hubs.clone()
    }

    fn enumerate_hub_children(&self) -> Vec<PdoId> {
        let mut children: Vec<PdoId> = self
            .inner
            .lock()
            .unwrap()
            .devices
            .keys()
            .map(|k| PdoId(*k))
            .collect();
        children.sort_by_key(|p| p.0);
        children
    }

    fn device_desc(&self, pdo: PdoId) -> Option<UsbDeviceDesc> {
        self.inner.lock().unwrap().devices.get(&pdo.0).copied()
    }

    fn cycle_port(&self, pdo: PdoId) {
        self.inner.lock().unwrap().cycled.push(pdo);
    }
}

pub(crate) enum XferBehavior {
    /// Complete every submission inline with the given device result.
    Complete(XferError),
    /// Keep submissions pending until cancelled.
    Hold,
}

/// A submission channel completing commands per a configured behavior.
pub(crate) struct TestTransport {
    behavior: Mutex<XferBehavior>,
    held: Mutex<Vec<Arc<XferCmd>>>,
    submitted: AtomicU32,
}

impl TestTransport {
    pub(crate) fn completing() -> Self {
        Self::with_behavior(XferBehavior::Complete(XferError::Ok))
    }

    pub(crate) fn with_behavior(behavior: XferBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            held: Mutex::new(Vec::new()),
            submitted: AtomicU32::new(0),
        }
    }

    pub(crate) fn submissions(&self) -> u32 {
        self.submitted.load(Ordering::SeqCst)
    }
}

impl XferTransport for TestTransport {
    fn submit(&self, cmd: Arc<XferCmd>) -> Result<()> {
        let _ = self.submitted.fetch_add(1, Ordering::SeqCst);
        match &*self.behavior.lock().unwrap() {
            XferBehavior::Complete(result) => {
                cmd.set_result(*result);
                let mut post = PostProcessList::new();
                process_completion(&cmd, false, &mut post);
                assert!(post.is_empty());
            }
            XferBehavior::Hold => self.held.lock().unwrap().push(cmd),
        }
        Ok(())
    }

    fn cancel(&self, cmd: &Arc<XferCmd>) {
        let mut held = self.held.lock().unwrap();
        if let Some(pos) = held.iter().position(|c| Arc::ptr_eq(c, cmd)) {
            let cmd = held.remove(pos);
            drop(held);
            cmd.set_result(XferError::Cancelled);
            let mut post = PostProcessList::new();
            process_completion(&cmd, false, &mut post);
        }
    }
}

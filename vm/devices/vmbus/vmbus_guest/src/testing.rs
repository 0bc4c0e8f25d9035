// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! In-process host and hypervisor fakes for the crate's tests.

use crate::BusError;
use crate::hypercall::HypercallInterface;
use crate::pal::NodeAttributes;
use crate::pal::NodeHandle;
use crate::pal::Platform;
use crate::pal::RawAlloc;
use hvdef::HvStatus;
use hvdef::PostMessageInput;
use hvdef::SynicMessageType;
use parking_lot::Mutex;
use std::alloc::Layout;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::mpsc;

const FAKE_VECTOR: u8 = 0x5e;

#[derive(Default)]
struct NodeState {
    next: NodeHandle,
    published: BTreeMap<NodeHandle, NodeAttributes>,
}

/// A fake host OS: page-aligned heap allocations with identity
/// virtual-to-physical mapping, an MSR store, and a node registry.
pub struct FakePlatform {
    cpus: u32,
    msrs: Mutex<HashMap<(u32, u32), u64>>,
    eom_writes: Mutex<HashMap<u32, u32>>,
    outstanding: AtomicUsize,
    nodes: Mutex<NodeState>,
}

impl FakePlatform {
    pub fn new(cpus: u32) -> Arc<Self> {
        Arc::new(Self {
            cpus,
            msrs: Mutex::new(HashMap::new()),
            eom_writes: Mutex::new(HashMap::new()),
            outstanding: AtomicUsize::new(0),
            nodes: Mutex::new(NodeState::default()),
        })
    }

    pub fn eom_writes(&self, cpu: u32) -> u32 {
        self.eom_writes.lock().get(&cpu).copied().unwrap_or(0)
    }

    pub fn outstanding_allocs(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub fn published_nodes(&self) -> Vec<NodeAttributes> {
        self.nodes.lock().published.values().cloned().collect()
    }

    fn alloc(&self, len: usize) -> Result<RawAlloc, BusError> {
        let layout = Layout::from_size_align(len.max(1), hvdef::HV_PAGE_SIZE_USIZE).unwrap();
        // SAFETY: the layout has nonzero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(BusError::NoMemory)?;
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        Ok(RawAlloc {
            gpa: ptr.as_ptr() as u64,
            ptr,
        })
    }
}

impl Platform for FakePlatform {
    fn alloc_contiguous(&self, len: usize) -> Result<RawAlloc, BusError> {
        self.alloc(len)
    }

    fn alloc_executable_page(&self) -> Result<RawAlloc, BusError> {
        self.alloc(hvdef::HV_PAGE_SIZE_USIZE)
    }

    fn free_contiguous(&self, ptr: NonNull<u8>, len: usize) {
        let layout = Layout::from_size_align(len.max(1), hvdef::HV_PAGE_SIZE_USIZE).unwrap();
        // SAFETY: the pointer came from alloc() with the same layout.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }

    fn cpu_count(&self) -> u32 {
        self.cpus
    }

    fn current_cpu(&self) -> u32 {
        0
    }

    fn read_msr(&self, cpu: u32, msr: u32) -> u64 {
        self.msrs.lock().get(&(cpu, msr)).copied().unwrap_or(0)
    }

    fn write_msr(&self, cpu: u32, msr: u32, value: u64) {
        if msr == hvdef::HV_X64_MSR_EOM {
            *self.eom_writes.lock().entry(cpu).or_default() += 1;
        } else {
            self.msrs.lock().insert((cpu, msr), value);
        }
    }

    fn interrupt_vector(&self) -> u8 {
        FAKE_VECTOR
    }

    fn publish_node(&self, attributes: NodeAttributes) -> Result<NodeHandle, BusError> {
        let mut nodes = self.nodes.lock();
        nodes.next += 1;
        let handle = nodes.next;
        nodes.published.insert(handle, attributes);
        Ok(handle)
    }

    fn withdraw_node(&self, node: NodeHandle) {
        self.nodes.lock().published.remove(&node);
    }
}

/// A fake hypervisor gateway: validates post-message envelopes, captures
/// the vmbus payloads for a test host to consume, and records signalled
/// connection ids. Failures can be injected to exercise the retry path.
pub struct FakeHypervisor {
    sender: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    fail: Mutex<(HvStatus, u32)>,
    attempts: AtomicU32,
    signals: Mutex<Vec<u32>>,
}

impl FakeHypervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sender: Mutex::new(None),
            fail: Mutex::new((HvStatus::SUCCESS, 0)),
            attempts: AtomicU32::new(0),
            signals: Mutex::new(Vec::new()),
        })
    }

    /// Creates a fake whose received messages are forwarded to a channel.
    pub fn with_channel() -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        let (send, recv) = mpsc::channel();
        let hv = Self::new();
        *hv.sender.lock() = Some(send);
        (hv, recv)
    }

    /// Makes the next `count` post-message calls fail with `status`.
    pub fn fail_posts(&self, status: HvStatus, count: u32) {
        *self.fail.lock() = (status, count);
    }

    pub fn post_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn signals(&self) -> Vec<u32> {
        self.signals.lock().clone()
    }
}

impl HypercallInterface for FakeHypervisor {
    fn post_message(&self, _input_gpa: u64, input: &PostMessageInput) -> HvStatus {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        {
            let mut fail = self.fail.lock();
            if fail.1 > 0 {
                fail.1 -= 1;
                return fail.0;
            }
        }

        assert_eq!(input.connection_id, vmbus_core::protocol::MESSAGE_CONNECTION_ID);
        assert_eq!(input.message_type, SynicMessageType::CHANNEL.0);
        let payload = &input.payload[..input.payload_size as usize];
        if let Some(sender) = &*self.sender.lock() {
            sender.send(payload.to_vec()).ok();
        }
        HvStatus::SUCCESS
    }

    fn signal_event(&self, connection_id: u32) -> HvStatus {
        self.signals.lock().push(connection_id);
        HvStatus::SUCCESS
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The hypercall gateway: one executable page registered with the
//! hypervisor, exposing the two calls the bus needs.

use crate::BusError;
use crate::pal::DmaBuffer;
use crate::pal::Platform;
use hvdef::HV_GUEST_OS_ID_OPEN_SOURCE;
use hvdef::HV_X64_MSR_GUEST_OS_ID;
use hvdef::HV_X64_MSR_HYPERCALL;
use hvdef::HvStatus;
use hvdef::HypercallCode;
use hvdef::HypercallControl;
use hvdef::MsrHypercallContents;
use hvdef::PostMessageInput;
use hvdef::SignalEventInput;
use std::sync::Arc;

/// The two hypercalls issued by the bus.
///
/// The real implementation is [`HypercallPage`]; tests substitute an
/// in-process hypervisor.
pub trait HypercallInterface: Send + Sync {
    /// Issues HvCallPostMessage. `input_gpa` is the guest physical address
    /// of `input`, which the caller keeps pinned for the duration of the
    /// call.
    fn post_message(&self, input_gpa: u64, input: &PostMessageInput) -> HvStatus;

    /// Issues the HvCallSignalEvent fast hypercall.
    fn signal_event(&self, connection_id: u32) -> HvStatus;
}

/// The executable hypercall page. The hypervisor writes a call thunk into
/// the page when its frame is stored in the hypercall MSR.
pub struct HypercallPage {
    page: DmaBuffer,
    platform: Arc<dyn Platform>,
}

impl HypercallPage {
    /// Reports the guest OS identity and registers a freshly allocated
    /// executable page with the hypervisor.
    pub fn new(platform: &Arc<dyn Platform>) -> Result<Self, BusError> {
        let page = DmaBuffer::alloc_executable(platform)?;
        let cpu = platform.current_cpu();

        // The hypervisor ignores the hypercall MSR until a guest OS id is
        // reported.
        platform.write_msr(cpu, HV_X64_MSR_GUEST_OS_ID, HV_GUEST_OS_ID_OPEN_SOURCE);

        let msr = MsrHypercallContents::from(platform.read_msr(cpu, HV_X64_MSR_HYPERCALL))
            .with_gpn(page.base_pfn())
            .with_enable(true);
        platform.write_msr(cpu, HV_X64_MSR_HYPERCALL, msr.into());

        let msr = MsrHypercallContents::from(platform.read_msr(cpu, HV_X64_MSR_HYPERCALL));
        if !msr.enable() {
            tracing::error!("hypervisor rejected the hypercall page");
            return Err(BusError::Io);
        }

        tracing::debug!(gpa = page.gpa(), "hypercalls enabled");
        Ok(Self {
            page,
            platform: platform.clone(),
        })
    }

    #[cfg(target_arch = "x86_64")]
    fn invoke(&self, control: u64, input: u64) -> HvStatus {
        let output: u64;
        // SAFETY: the page was installed through the hypercall MSR, so it
        // contains the hypervisor's thunk. The thunk follows the standard
        // calling convention: control in rcx, input in rdx, result in rax.
        unsafe {
            core::arch::asm!(
                "call {page}",
                page = in(reg) self.page.as_ptr(),
                inout("rcx") control => _,
                inout("rdx") input => _,
                inout("r8") 0u64 => _,
                out("rax") output,
                clobber_abi("C"),
            );
        }
        HvStatus(output as u16)
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn invoke(&self, _control: u64, _input: u64) -> HvStatus {
        unimplemented!("hypercalls are only implemented for x86_64")
    }
}

impl HypercallInterface for HypercallPage {
    fn post_message(&self, input_gpa: u64, _input: &PostMessageInput) -> HvStatus {
        let control = HypercallControl::new().with_code(HypercallCode::HV_CALL_POST_MESSAGE.0);
        self.invoke(control.into(), input_gpa)
    }

    fn signal_event(&self, connection_id: u32) -> HvStatus {
        let control = HypercallControl::new()
            .with_code(HypercallCode::HV_CALL_SIGNAL_EVENT.0)
            .with_fast(true);
        let input = SignalEventInput {
            connection_id,
            flag_number: 0,
            rsvd: 0,
        };
        self.invoke(control.into(), input.into_register())
    }
}

impl Drop for HypercallPage {
    fn drop(&mut self) {
        let cpu = self.platform.current_cpu();
        let msr = MsrHypercallContents::from(self.platform.read_msr(cpu, HV_X64_MSR_HYPERCALL))
            .with_enable(false);
        self.platform.write_msr(cpu, HV_X64_MSR_HYPERCALL, msr.into());
    }
}

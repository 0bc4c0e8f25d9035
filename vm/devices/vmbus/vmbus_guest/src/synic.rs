// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-processor synthetic interrupt controller state.
//!
//! Each CPU owns a pinned message page and event-flags page, programmed
//! into the SIMP and SIEFP MSRs during initialisation. The pages must not
//! move for the lifetime of the bus.

use crate::BusError;
use crate::pal::DmaBuffer;
use crate::pal::Platform;
use hvdef::HV_X64_MSR_EOM;
use hvdef::HV_X64_MSR_SCONTROL;
use hvdef::HV_X64_MSR_SIEFP;
use hvdef::HV_X64_MSR_SIMP;
use hvdef::HV_X64_MSR_SINT0;
use hvdef::MsrScontrolContents;
use hvdef::MsrSimpSiefpContents;
use hvdef::MsrSintContents;
use hvdef::SYNIC_EVENT_FLAG_WORDS;
use hvdef::SYNIC_MESSAGE_SIZE;
use hvdef::SynicMessage;
use hvdef::SynicMessageHeader;
use hvdef::SynicMessageType;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::sync::atomic::fence;
use vmbus_core::protocol::SINT_MESSAGE;
use vmbus_core::protocol::SINT_TIMER;

pub(crate) struct SynicCpu {
    pub message_page: DmaBuffer,
    pub event_flags_page: DmaBuffer,
}

impl SynicCpu {
    /// Index of the first event-flag word for `sint` within the page.
    pub fn event_flag_word_base(sint: u8) -> usize {
        sint as usize * SYNIC_EVENT_FLAG_WORDS
    }
}

pub(crate) struct SynicState {
    platform: Arc<dyn Platform>,
    cpus: Vec<SynicCpu>,
}

const MESSAGE_SLOT_OFFSET: usize = SINT_MESSAGE as usize * SYNIC_MESSAGE_SIZE;

impl SynicState {
    pub fn new(platform: Arc<dyn Platform>) -> Result<Self, BusError> {
        let mut cpus = Vec::new();
        for _ in 0..platform.cpu_count() {
            cpus.push(SynicCpu {
                message_page: DmaBuffer::alloc(&platform, hvdef::HV_PAGE_SIZE_USIZE)?,
                event_flags_page: DmaBuffer::alloc(&platform, hvdef::HV_PAGE_SIZE_USIZE)?,
            });
        }
        Ok(Self { platform, cpus })
    }

    pub fn cpu(&self, cpu: u32) -> &SynicCpu {
        &self.cpus[cpu as usize]
    }

    /// Programs the message page, event-flags page, and the bus SINTs on
    /// every processor, then enables the SynIC.
    pub fn enable(&self) {
        let vector = self.platform.interrupt_vector();
        for (cpu, state) in self.cpus.iter().enumerate() {
            let cpu = cpu as u32;

            let simp = MsrSimpSiefpContents::from(self.platform.read_msr(cpu, HV_X64_MSR_SIMP))
                .with_base_gpn(state.message_page.base_pfn())
                .with_enable(true);
            self.platform.write_msr(cpu, HV_X64_MSR_SIMP, simp.into());

            let siefp = MsrSimpSiefpContents::from(self.platform.read_msr(cpu, HV_X64_MSR_SIEFP))
                .with_base_gpn(state.event_flags_page.base_pfn())
                .with_enable(true);
            self.platform.write_msr(cpu, HV_X64_MSR_SIEFP, siefp.into());

            // Point both bus interrupt sources at the host vector,
            // preserving the reserved bits.
            for sint in [SINT_MESSAGE, SINT_TIMER] {
                let msr = HV_X64_MSR_SINT0 + sint as u32;
                let value = MsrSintContents::from(self.platform.read_msr(cpu, msr))
                    .with_vector(vector)
                    .with_masked(false);
                self.platform.write_msr(cpu, msr, value.into());
            }

            let scontrol =
                MsrScontrolContents::from(self.platform.read_msr(cpu, HV_X64_MSR_SCONTROL))
                    .with_enable(true);
            self.platform.write_msr(cpu, HV_X64_MSR_SCONTROL, scontrol.into());

            tracing::debug!(
                cpu,
                simp = state.message_page.gpa(),
                siefp = state.event_flags_page.gpa(),
                vector,
                "synic enabled"
            );
        }
    }

    /// Disables the SynIC and unregisters the pages on every processor.
    pub fn disable(&self) {
        for cpu in 0..self.cpus.len() as u32 {
            let scontrol =
                MsrScontrolContents::from(self.platform.read_msr(cpu, HV_X64_MSR_SCONTROL))
                    .with_enable(false);
            self.platform.write_msr(cpu, HV_X64_MSR_SCONTROL, scontrol.into());

            for sint in [SINT_MESSAGE, SINT_TIMER] {
                let msr = HV_X64_MSR_SINT0 + sint as u32;
                let value = MsrSintContents::from(self.platform.read_msr(cpu, msr))
                    .with_vector(0)
                    .with_masked(true);
                self.platform.write_msr(cpu, msr, value.into());
            }

            self.platform.write_msr(cpu, HV_X64_MSR_SIMP, 0);
            self.platform.write_msr(cpu, HV_X64_MSR_SIEFP, 0);
        }
    }

    /// The type tag currently in the message slot for the bus SINT.
    pub fn message_slot_type(&self, cpu: u32) -> SynicMessageType {
        let header: SynicMessageHeader = self.cpu(cpu).message_page.read_obj(MESSAGE_SLOT_OFFSET);
        header.typ
    }

    /// Copies the current message out of the slot for the bus SINT.
    pub fn read_message_slot(&self, cpu: u32) -> SynicMessage {
        self.cpu(cpu).message_page.read_obj(MESSAGE_SLOT_OFFSET)
    }

    /// Completes the message in the slot: clears the type tag and, if the
    /// hypervisor queued another message behind it, writes the end-of-message
    /// register on the owning CPU so delivery continues.
    pub fn end_of_message(&self, cpu: u32) {
        let page = &self.cpu(cpu).message_page;
        page.write_obj(MESSAGE_SLOT_OFFSET, &SynicMessageType::NONE);

        // The host must observe the cleared slot before the repost.
        fence(Ordering::SeqCst);

        let header: SynicMessageHeader = page.read_obj(MESSAGE_SLOT_OFFSET);
        if header.flags.message_pending() {
            self.platform.write_msr(cpu, HV_X64_MSR_EOM, 0);
        }
    }
}

#[cfg(test)]
impl SynicState {
    /// Places a message directly in the slot, as the hypervisor would.
    pub fn write_message_slot(&self, cpu: u32, message: &SynicMessage) {
        self.cpu(cpu)
            .message_page
            .write_obj(MESSAGE_SLOT_OFFSET, message);
    }
}

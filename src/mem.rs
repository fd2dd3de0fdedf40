//! Memory and I/O substrate
//!
//! Segmented accesses flow through three layers: segmentation (base add,
//! canonical/limit/wrap checks), paging ([`crate::paging`]), and the host
//! [`Bus`]. The on-chip register windows (the 186 peripheral control
//! block, the V33 internal I/O block, the V25 IRAM overlay and the Cyrix
//! 22h/23h configuration pair) are peeled off between paging and the bus,
//! exactly where the silicon intercepts them.
//!
//! The prefetch queue is filled lazily at the start of each step inside a
//! nested catch: a fault during speculative fill rewinds the queue without
//! delivering an exception.

use crate::bus::{AccessKind, AddressSpace, Bus};
use crate::cpu::Cpu;
use crate::exception::{Exception, Fallible};
use crate::regs::{seg, Cr4, Dr6, Dr7, DR7_LEN0_SHIFT, DR7_RW0_SHIFT, CCR3_MAPEN_MASK, CCR3_MAPEN_SHIFT};
use crate::traits::{CpuFamily, CpuSubtype};
use crate::x87::float80::Float80;

/// 80186 peripheral control block relocation register offset and fields.
pub const PCB_PCR_OFFSET: usize = 0xFE;
pub const PCR_MIO: u16 = 0x1000;
pub const PCR_ADDRESS: u16 = 0x0FFF;

impl Cpu {
    // ========== Canonical and Linear ==========

    /// In 64-bit mode the high linear bits (48 or 57 and up, per VA57)
    /// must all match; SS-relative violations raise #SS, others #GP.
    pub fn check_canonical(
        &self,
        segment: Option<usize>,
        address: u64,
        error_code: u64,
    ) -> Fallible<()> {
        if !self.is_64bit_mode() {
            return Ok(());
        }
        let mask: u64 = if self.cr[4] & Cr4::VA57.bits() == 0 {
            0xFFFF_0000_0000_0000
        } else {
            0xFE00_0000_0000_0000
        };
        if address & mask != 0 && address & mask != mask {
            if segment == Some(seg::SS) {
                Err(Exception::ss_fault(error_code))
            } else {
                Err(Exception::gp(error_code))
            }
        } else {
            Ok(())
        }
    }

    /// Add the segment base. In 64-bit mode only FS/GS carry a base and the
    /// result must be canonical.
    pub fn segmented_to_linear(&self, segment: usize, offset: u64) -> Fallible<u64> {
        if self.is_64bit_mode() {
            let address = if segment < seg::FS || segment >= seg::USER_COUNT {
                offset
            } else {
                self.sr[segment].base.wrapping_add(offset)
            };
            self.check_canonical(Some(segment), address, 0)?;
            Ok(address)
        } else {
            Ok(self.sr[segment].base.wrapping_add(offset))
        }
    }

    // ========== External (Physical) Access ==========

    fn memory_space(&self) -> AddressSpace {
        if self.parser.user_mode {
            AddressSpace::User
        } else {
            self.cpu_level
        }
    }

    /// 186 peripheral control block window location, when memory-mapped.
    fn pcb_memory_window(&self) -> Option<u64> {
        if self.traits.family != CpuFamily::I186 {
            return None;
        }
        let pcr = u16::from_le_bytes([self.pcb[PCB_PCR_OFFSET], self.pcb[PCB_PCR_OFFSET + 1]]);
        if pcr & PCR_MIO != 0 {
            Some(u64::from(pcr & PCR_ADDRESS) << 8)
        } else {
            None
        }
    }

    /// Physical read straight to the host, with only the 186 PCB window in
    /// between. Instruction fetch uses this path (the V25 fetches around
    /// its internal RAM).
    pub fn memory_read_external(&mut self, bus: &mut dyn Bus, address: u64, buffer: &mut [u8]) {
        let space = self.memory_space();
        if let Some(pcb_base) = self.pcb_memory_window() {
            if address < pcb_base + 0x100 && address + buffer.len() as u64 > pcb_base {
                self.split_over_window(bus, address, pcb_base, buffer.len(), |cpu, bus, addr, range| {
                    if addr >= pcb_base && addr < pcb_base + 0x100 {
                        let start = (addr - pcb_base) as usize;
                        range.copy_from_slice(&cpu.pcb[start..start + range.len()]);
                    } else {
                        bus.memory_read(space, addr, range);
                    }
                }, buffer);
                return;
            }
        }
        bus.memory_read(space, address, buffer);
    }

    pub fn memory_write_external(&mut self, bus: &mut dyn Bus, address: u64, buffer: &[u8]) {
        let space = self.memory_space();
        if let Some(pcb_base) = self.pcb_memory_window() {
            if address < pcb_base + 0x100 && address + buffer.len() as u64 > pcb_base {
                let mut scratch = buffer.to_vec();
                self.split_over_window(bus, address, pcb_base, buffer.len(), |cpu, bus, addr, range| {
                    if addr >= pcb_base && addr < pcb_base + 0x100 {
                        let start = (addr - pcb_base) as usize;
                        cpu.pcb[start..start + range.len()].copy_from_slice(range);
                    } else {
                        bus.memory_write(space, addr, range);
                    }
                }, &mut scratch);
                return;
            }
        }
        bus.memory_write(space, address, buffer);
    }

    /// Run `op` over the sub-ranges of an access that straddles an on-chip
    /// window boundary.
    fn split_over_window(
        &mut self,
        bus: &mut dyn Bus,
        address: u64,
        window: u64,
        len: usize,
        mut op: impl FnMut(&mut Cpu, &mut dyn Bus, u64, &mut [u8]),
        buffer: &mut [u8],
    ) {
        let mut addr = address;
        let mut done = 0usize;
        while done < len {
            let boundary = if addr < window {
                window
            } else if addr < window + 0x100 {
                window + 0x100
            } else {
                u64::MAX
            };
            let chunk = ((boundary - addr) as usize).min(len - done);
            let (_, rest) = buffer.split_at_mut(done);
            let (range, _) = rest.split_at_mut(chunk);
            op(self, bus, addr, range);
            addr += chunk as u64;
            done += chunk;
        }
    }

    /// Physical access below paging: identical to the external path except
    /// on the V25, whose internal data area overlays the top of the first
    /// megabyte when PRC.RAMEN is set.
    pub fn memory_read_no_paging(&mut self, bus: &mut dyn Bus, address: u64, buffer: &mut [u8]) {
        if self.traits.family == CpuFamily::V25 {
            self.v25_overlay_read(bus, address, buffer);
        } else {
            self.memory_read_external(bus, address, buffer);
        }
    }

    pub fn memory_write_no_paging(&mut self, bus: &mut dyn Bus, address: u64, buffer: &[u8]) {
        if self.traits.family == CpuFamily::V25 {
            self.v25_overlay_write(bus, address, buffer);
        } else {
            self.memory_write_external(bus, address, buffer);
        }
    }

    fn v25_iram_window(&self) -> (u64, u64) {
        let idb = u64::from(self.iram[crate::regs::sfr::IDB]) << 12;
        let ramen = self.iram[crate::regs::sfr::PRC] & crate::regs::sfr::PRC_RAMEN != 0;
        // With RAMEN the overlay covers IDB+E00..IDB+FFF; without, only the
        // SFR block at IDB+F00 remains internal.
        if ramen {
            (idb + 0xE00, idb + 0x1000)
        } else {
            (idb + 0xF00, idb + 0x1000)
        }
    }

    fn v25_overlay_read(&mut self, bus: &mut dyn Bus, address: u64, buffer: &mut [u8]) {
        let (lo, hi) = self.v25_iram_window();
        let mask = self.traits.memory_mask();
        let mut addr = address & mask;
        self.store_register_bank();
        let mut done = 0usize;
        while done < buffer.len() {
            let boundary = if addr < lo {
                lo
            } else if addr < hi {
                hi
            } else {
                mask + 1
            };
            let chunk = ((boundary - addr) as usize).min(buffer.len() - done);
            let range = &mut buffer[done..done + chunk];
            if addr >= lo && addr < hi {
                let base = (addr - (hi - 0x200)) as usize;
                range.copy_from_slice(&self.iram[base..base + chunk]);
            } else {
                self.memory_read_external(bus, addr, range);
            }
            addr = (addr + chunk as u64) & mask;
            done += chunk;
        }
    }

    fn v25_overlay_write(&mut self, bus: &mut dyn Bus, address: u64, buffer: &[u8]) {
        let (lo, hi) = self.v25_iram_window();
        let mask = self.traits.memory_mask();
        let mut addr = address & mask;
        self.store_register_bank();
        let mut done = 0usize;
        let mut touched_iram = false;
        while done < buffer.len() {
            let boundary = if addr < lo {
                lo
            } else if addr < hi {
                hi
            } else {
                mask + 1
            };
            let chunk = ((boundary - addr) as usize).min(buffer.len() - done);
            let range = &buffer[done..done + chunk];
            if addr >= lo && addr < hi {
                let base = (addr - (hi - 0x200)) as usize;
                self.iram[base..base + chunk].copy_from_slice(range);
                touched_iram = true;
            } else {
                self.memory_write_external(bus, addr, range);
            }
            addr = (addr + chunk as u64) & mask;
            done += chunk;
        }
        if touched_iram {
            // A write through the window may have landed in the live bank
            self.load_register_bank();
        }
    }

    /// Raw physical table-entry reads for the page walker (no breakpoints,
    /// no paging recursion).
    pub fn physical_read32(&mut self, bus: &mut dyn Bus, address: u64) -> u32 {
        let mut bytes = [0u8; 4];
        self.memory_read_external(bus, address, &mut bytes);
        u32::from_le_bytes(bytes)
    }

    pub fn physical_write32(&mut self, bus: &mut dyn Bus, address: u64, value: u32) {
        self.memory_write_external(bus, address, &value.to_le_bytes());
    }

    pub fn physical_read64(&mut self, bus: &mut dyn Bus, address: u64) -> u64 {
        let mut bytes = [0u8; 8];
        self.memory_read_external(bus, address, &mut bytes);
        u64::from_le_bytes(bytes)
    }

    pub fn physical_write64(&mut self, bus: &mut dyn Bus, address: u64, value: u64) {
        self.memory_write_external(bus, address, &value.to_le_bytes());
    }

    // ========== Debug Register Breakpoints ==========

    /// Compare an access range against each armed DR0..DR3 slot; a match
    /// sets the DR6 status bit and raises #DB: a fault for execution,
    /// as a trap otherwise.
    pub fn check_breakpoints(
        &mut self,
        kind: AccessKind,
        address: u64,
        count: u64,
    ) -> Fallible<()> {
        if kind == AccessKind::Io && self.cr[4] & Cr4::DE.bits() == 0 {
            return Ok(());
        }
        if self.traits.family < CpuFamily::I386 {
            return Ok(());
        }

        for slot in 0..4 {
            if self.dr[7] & ((Dr7::L0.bits() | Dr7::G0.bits()) << (2 * slot)) == 0 {
                continue;
            }
            let rw = (self.dr[7] >> (DR7_RW0_SHIFT + 2 * slot as u32)) & 3;
            if rw != kind.dr7_rw() {
                continue;
            }
            const SIZES: [u64; 4] = [1, 2, 8, 4];
            let size = SIZES[((self.dr[7] >> (DR7_LEN0_SHIFT + 2 * slot as u32)) & 3) as usize];
            let bp = self.dr[slot];
            let end = address.saturating_add(count);
            if address < bp + size && end > bp {
                self.dr[6] |= Dr6::B0.bits() << slot;
                return Err(if kind == AccessKind::Execute {
                    Exception::db_fault()
                } else {
                    Exception::db_trap()
                });
            }
        }
        Ok(())
    }

    // ========== Linear Access (post-segmentation) ==========

    /// Ordinary data read at the current privilege.
    pub fn memory_read(&mut self, bus: &mut dyn Bus, address: u64, buffer: &mut [u8]) -> Fallible<()> {
        self.check_breakpoints(AccessKind::Read, address, buffer.len() as u64)?;
        self.paged_access(bus, address, buffer.len(), false, false, self.cpl == 3, |cpu, bus, phys, range| {
            cpu.memory_read_no_paging(bus, phys, range);
        }, buffer)
    }

    /// System-structure read: ignores the current privilege for the U/S
    /// paging check (descriptor tables, TSS).
    pub fn memory_read_system(&mut self, bus: &mut dyn Bus, address: u64, buffer: &mut [u8]) -> Fallible<()> {
        self.check_breakpoints(AccessKind::Read, address, buffer.len() as u64)?;
        self.paged_access(bus, address, buffer.len(), false, false, false, |cpu, bus, phys, range| {
            cpu.memory_read_no_paging(bus, phys, range);
        }, buffer)
    }

    /// Speculative code read for the prefetch queue: execute intent, no
    /// breakpoint checks, bypasses the V25 internal RAM.
    pub fn memory_read_prefetch(&mut self, bus: &mut dyn Bus, address: u64, buffer: &mut [u8]) -> Fallible<()> {
        self.paged_access(bus, address, buffer.len(), false, true, self.cpl == 3, |cpu, bus, phys, range| {
            cpu.memory_read_external(bus, phys, range);
        }, buffer)
    }

    pub fn memory_write(&mut self, bus: &mut dyn Bus, address: u64, buffer: &[u8]) -> Fallible<()> {
        self.check_breakpoints(AccessKind::Write, address, buffer.len() as u64)?;
        let mut scratch = buffer.to_vec();
        self.paged_access(bus, address, buffer.len(), true, false, self.cpl == 3, |cpu, bus, phys, range| {
            cpu.memory_write_no_paging(bus, phys, range);
        }, &mut scratch)
    }

    pub fn memory_write_system(&mut self, bus: &mut dyn Bus, address: u64, buffer: &[u8]) -> Fallible<()> {
        self.check_breakpoints(AccessKind::Write, address, buffer.len() as u64)?;
        let mut scratch = buffer.to_vec();
        self.paged_access(bus, address, buffer.len(), true, false, false, |cpu, bus, phys, range| {
            cpu.memory_write_no_paging(bus, phys, range);
        }, &mut scratch)
    }

    /// Translate-and-split loop shared by all the linear access paths; each
    /// page run is handed to `op` with its physical address.
    fn paged_access(
        &mut self,
        bus: &mut dyn Bus,
        mut address: u64,
        len: usize,
        write: bool,
        exec: bool,
        user: bool,
        mut op: impl FnMut(&mut Cpu, &mut dyn Bus, u64, &mut [u8]),
        buffer: &mut [u8],
    ) -> Fallible<()> {
        let mut done = 0usize;
        while done < len {
            let (physical, run) = self.page_translate(bus, address, write, exec, user)?;
            let chunk = if run == 0 { len - done } else { (run as usize).min(len - done) };
            let (_, rest) = buffer.split_at_mut(done);
            let (range, _) = rest.split_at_mut(chunk);
            op(self, bus, physical, range);
            address += chunk as u64;
            done += chunk;
        }
        Ok(())
    }

    // Fixed-width linear helpers (IVT, TSS fields, SMM images).

    pub fn memory_read8(&mut self, bus: &mut dyn Bus, address: u64) -> Fallible<u8> {
        let mut b = [0u8; 1];
        self.memory_read_system(bus, address, &mut b)?;
        Ok(b[0])
    }

    pub fn memory_read16(&mut self, bus: &mut dyn Bus, address: u64) -> Fallible<u16> {
        let mut b = [0u8; 2];
        self.memory_read_system(bus, address, &mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    pub fn memory_read32(&mut self, bus: &mut dyn Bus, address: u64) -> Fallible<u32> {
        let mut b = [0u8; 4];
        self.memory_read_system(bus, address, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    pub fn memory_read64(&mut self, bus: &mut dyn Bus, address: u64) -> Fallible<u64> {
        let mut b = [0u8; 8];
        self.memory_read_system(bus, address, &mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    pub fn memory_write8(&mut self, bus: &mut dyn Bus, address: u64, value: u8) -> Fallible<()> {
        self.memory_write_system(bus, address, &[value])
    }

    pub fn memory_write16(&mut self, bus: &mut dyn Bus, address: u64, value: u16) -> Fallible<()> {
        self.memory_write_system(bus, address, &value.to_le_bytes())
    }

    pub fn memory_write32(&mut self, bus: &mut dyn Bus, address: u64, value: u32) -> Fallible<()> {
        self.memory_write_system(bus, address, &value.to_le_bytes())
    }

    pub fn memory_write64(&mut self, bus: &mut dyn Bus, address: u64, value: u64) -> Fallible<()> {
        self.memory_write_system(bus, address, &value.to_le_bytes())
    }

    // ========== Prefetch Queue ==========

    /// Undo speculative consumption without refetching.
    pub fn prefetch_queue_rewind(&mut self) {
        self.prefetch_len += self.prefetch_offset;
        self.prefetch_offset = 0;
    }

    /// Note: xIP must be rewritten alongside, otherwise the queue invariant
    /// breaks and the next fill starts from scratch anyway.
    pub fn prefetch_queue_flush(&mut self) {
        self.prefetch_len = 0;
        self.prefetch_offset = 0;
        self.prefetch_pointer = self.xip;
    }

    /// Lazily top up the queue. Faults raised while filling are swallowed
    /// here; speculative fetch must not deliver exceptions.
    pub fn prefetch_queue_fill(&mut self, bus: &mut dyn Bus) {
        if self.xip.wrapping_add(self.prefetch_len as u64) != self.prefetch_pointer {
            // stale speculation, start over
            self.prefetch_queue_flush();
        }

        if self.prefetch_offset != 0 && self.prefetch_len != 0 {
            self.prefetch_queue.copy_within(
                self.prefetch_offset..self.prefetch_offset + self.prefetch_len,
                0,
            );
        }
        self.prefetch_offset = 0;

        while self.prefetch_len < self.traits.prefetch_queue_size {
            let pointer = self.prefetch_pointer;
            let filled = (|| -> Fallible<u8> {
                let linear = self.segmented_to_linear(seg::CS, pointer)?;
                let mut byte = [0u8; 1];
                self.memory_read_prefetch(bus, linear, &mut byte)?;
                Ok(byte[0])
            })();
            match filled {
                Ok(byte) => {
                    self.prefetch_queue[self.prefetch_offset + self.prefetch_len] = byte;
                    self.prefetch_len += 1;
                    self.prefetch_pointer = self.prefetch_pointer.wrapping_add(1);
                }
                Err(_) => break,
            }
        }
    }

    /// Code read: consumes queued bytes first, then fetches the remainder.
    pub fn memory_read_exec(&mut self, bus: &mut dyn Bus, mut address: u64, buffer: &mut [u8]) -> Fallible<()> {
        self.check_breakpoints(AccessKind::Execute, address, buffer.len() as u64)?;

        let mut start = 0usize;
        if self.prefetch_len > 0 {
            let take = buffer.len().min(self.prefetch_len);
            buffer[..take]
                .copy_from_slice(&self.prefetch_queue[self.prefetch_offset..self.prefetch_offset + take]);
            self.prefetch_offset += take;
            self.prefetch_len -= take;
            address += take as u64;
            start = take;
        }
        if start < buffer.len() {
            self.memory_read_prefetch(bus, address, &mut buffer[start..])?;
        }
        Ok(())
    }

    // ========== Segmented Access ==========

    /// Segmented code read: applies 16-bit offset masking and the 64 KiB
    /// wrap rule on the pre-286 families, then the limit check.
    pub fn segmented_read_exec(
        &mut self,
        bus: &mut dyn Bus,
        segment: usize,
        mut offset: u64,
        buffer: &mut [u8],
    ) -> Fallible<()> {
        let wraps = self.traits.wraps_segments();
        if wraps {
            offset &= 0xFFFF;
        }
        let count = buffer.len() as u64;
        if wraps && offset + count > 0x10000 {
            let head = (0x10000 - offset) as usize;
            let linear = self.segmented_to_linear(segment, offset)?;
            self.memory_read_exec(bus, linear, &mut buffer[..head])?;
            let linear = self.segmented_to_linear(segment, 0)?;
            return self.memory_read_exec(bus, linear, &mut buffer[head..]);
        }

        if segment < seg::USER_COUNT || segment == seg::FDS {
            self.segment_check_limit(segment, offset, count, 0)?;
        }
        let linear = self.segmented_to_linear(segment, offset)?;
        self.memory_read_exec(bus, linear, buffer)
    }

    pub fn segmented_read8_exec(&mut self, bus: &mut dyn Bus, segment: usize, offset: u64) -> Fallible<u8> {
        let mut b = [0u8; 1];
        self.segmented_read_exec(bus, segment, offset, &mut b)?;
        Ok(b[0])
    }

    pub fn segmented_read16_exec(&mut self, bus: &mut dyn Bus, segment: usize, offset: u64) -> Fallible<u16> {
        let mut b = [0u8; 2];
        self.segmented_read_exec(bus, segment, offset, &mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    pub fn segmented_read32_exec(&mut self, bus: &mut dyn Bus, segment: usize, offset: u64) -> Fallible<u32> {
        let mut b = [0u8; 4];
        self.segmented_read_exec(bus, segment, offset, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    /// Segmented data read with read-permission, wrap and limit checks.
    /// Table registers (GDTR and friends) skip the limit check here; their
    /// limit handling is in the descriptor logic.
    pub fn segmented_read(
        &mut self,
        bus: &mut dyn Bus,
        segment: usize,
        mut offset: u64,
        buffer: &mut [u8],
    ) -> Fallible<()> {
        if self.is_v55_iram(segment) {
            return self.iram_segment_read(offset, buffer);
        }

        let wraps = self.traits.wraps_segments();
        if wraps {
            offset &= 0xFFFF;
        }
        let count = buffer.len() as u64;
        if wraps && offset + count > 0x10000 {
            let mut done = 0usize;
            while done < buffer.len() {
                let chunk = (0x10000 - (offset & 0xFFFF)) as usize;
                let chunk = chunk.min(buffer.len() - done);
                let linear = self.segmented_to_linear(segment, offset)?;
                self.memory_read(bus, linear, &mut buffer[done..done + chunk])?;
                offset = (offset + chunk as u64) & 0xFFFF;
                done += chunk;
            }
            return Ok(());
        }

        if segment < seg::USER_COUNT || segment == seg::FDS {
            self.segment_check_read(segment)?;
            self.segment_check_limit(segment, offset, count, 0)?;
            let linear = self.segmented_to_linear(segment, offset)?;
            self.memory_read(bus, linear, buffer)
        } else {
            let linear = self.segmented_to_linear(segment, offset)?;
            self.memory_read_system(bus, linear, buffer)
        }
    }

    pub fn segmented_write(
        &mut self,
        bus: &mut dyn Bus,
        segment: usize,
        mut offset: u64,
        buffer: &[u8],
    ) -> Fallible<()> {
        if self.is_v55_iram(segment) {
            return self.iram_segment_write(offset, buffer);
        }

        let wraps = self.traits.wraps_segments();
        if wraps {
            offset &= 0xFFFF;
        }
        let count = buffer.len() as u64;
        if wraps && offset + count > 0x10000 {
            let mut done = 0usize;
            while done < buffer.len() {
                let chunk = (0x10000 - (offset & 0xFFFF)) as usize;
                let chunk = chunk.min(buffer.len() - done);
                let linear = self.segmented_to_linear(segment, offset)?;
                self.memory_write(bus, linear, &buffer[done..done + chunk])?;
                offset = (offset + chunk as u64) & 0xFFFF;
                done += chunk;
            }
            return Ok(());
        }

        if segment < seg::USER_COUNT || segment == seg::FDS {
            self.segment_check_write(segment)?;
            self.segment_check_limit(segment, offset, count, 0)?;
            let linear = self.segmented_to_linear(segment, offset)?;
            self.memory_write(bus, linear, buffer)
        } else {
            let linear = self.segmented_to_linear(segment, offset)?;
            self.memory_write_system(bus, linear, buffer)
        }
    }

    fn is_v55_iram(&self, segment: usize) -> bool {
        segment == seg::IRAM
            && matches!(self.traits.family, CpuFamily::V55 | CpuFamily::Extended)
    }

    fn iram_segment_read(&mut self, offset: u64, buffer: &mut [u8]) -> Fallible<()> {
        let mut offset = (offset & 0x1FF) as usize;
        self.store_register_bank();
        for byte in buffer.iter_mut() {
            *byte = self.iram[offset];
            offset = (offset + 1) & 0x1FF;
        }
        Ok(())
    }

    fn iram_segment_write(&mut self, offset: u64, buffer: &[u8]) -> Fallible<()> {
        let mut offset = (offset & 0x1FF) as usize;
        self.store_register_bank();
        for byte in buffer.iter() {
            self.iram[offset] = *byte;
            offset = (offset + 1) & 0x1FF;
        }
        self.load_register_bank();
        Ok(())
    }

    // Fixed-width segmented helpers. The byte and word forms also latch
    // the V25 macro-service operand registers.

    pub fn segmented_read8(&mut self, bus: &mut dyn Bus, segment: usize, offset: u64) -> Fallible<u8> {
        let mut b = [0u8; 1];
        self.segmented_read(bus, segment, offset, &mut b)?;
        Ok(b[0])
    }

    pub fn segmented_read16(&mut self, bus: &mut dyn Bus, segment: usize, offset: u64) -> Fallible<u16> {
        let mut b = [0u8; 2];
        self.segmented_read(bus, segment, offset, &mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    pub fn segmented_read32(&mut self, bus: &mut dyn Bus, segment: usize, offset: u64) -> Fallible<u32> {
        let mut b = [0u8; 4];
        self.segmented_read(bus, segment, offset, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    pub fn segmented_read64(&mut self, bus: &mut dyn Bus, segment: usize, offset: u64) -> Fallible<u64> {
        let mut b = [0u8; 8];
        self.segmented_read(bus, segment, offset, &mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    pub fn segmented_read80fp(&mut self, bus: &mut dyn Bus, segment: usize, offset: u64) -> Fallible<Float80> {
        let fraction = self.segmented_read64(bus, segment, offset)?;
        let exponent = self.segmented_read16(bus, segment, offset + 8)?;
        Ok(Float80::from_parts(fraction, exponent & 0x7FFF, exponent & 0x8000 != 0))
    }

    pub fn segmented_read128(
        &mut self,
        bus: &mut dyn Bus,
        segment: usize,
        offset: u64,
    ) -> Fallible<(u64, u64)> {
        Ok((
            self.segmented_read64(bus, segment, offset)?,
            self.segmented_read64(bus, segment, offset + 8)?,
        ))
    }

    pub fn segmented_write8(&mut self, bus: &mut dyn Bus, segment: usize, offset: u64, value: u8) -> Fallible<()> {
        self.segmented_write(bus, segment, offset, &[value])
    }

    pub fn segmented_write16(&mut self, bus: &mut dyn Bus, segment: usize, offset: u64, value: u16) -> Fallible<()> {
        self.segmented_write(bus, segment, offset, &value.to_le_bytes())
    }

    pub fn segmented_write32(&mut self, bus: &mut dyn Bus, segment: usize, offset: u64, value: u32) -> Fallible<()> {
        self.segmented_write(bus, segment, offset, &value.to_le_bytes())
    }

    pub fn segmented_write64(&mut self, bus: &mut dyn Bus, segment: usize, offset: u64, value: u64) -> Fallible<()> {
        self.segmented_write(bus, segment, offset, &value.to_le_bytes())
    }

    pub fn segmented_write80fp(
        &mut self,
        bus: &mut dyn Bus,
        segment: usize,
        offset: u64,
        value: Float80,
    ) -> Fallible<()> {
        let (fraction, exponent, sign) = value.to_parts();
        self.segmented_write64(bus, segment, offset, fraction)?;
        self.segmented_write16(bus, segment, offset + 8, exponent | if sign { 0x8000 } else { 0 })
    }

    pub fn segmented_write128(
        &mut self,
        bus: &mut dyn Bus,
        segment: usize,
        offset: u64,
        low: u64,
        high: u64,
    ) -> Fallible<()> {
        self.segmented_write64(bus, segment, offset, low)?;
        self.segmented_write64(bus, segment, offset + 8, high)
    }

    // ========== x87 Operand Access ==========
    //
    // External FPUs take over the bus after the CPU read the first two
    // bytes of the operand; running past the segment limit then raises the
    // coprocessor segment overrun (#MP) instead of #GP.

    pub fn x87_segmented_read(
        &mut self,
        bus: &mut dyn Bus,
        segment: usize,
        x86_offset: u64,
        mut offset: u64,
        buffer: &mut [u8],
    ) -> Fallible<()> {
        if self.is_v55_iram(segment) {
            return self.iram_segment_read(offset, buffer);
        }
        let wraps = self.traits.wraps_segments();
        if wraps {
            offset &= 0xFFFF;
        }
        let count = buffer.len() as u64;
        if wraps && offset + count > 0x10000 {
            return self.segmented_read(bus, segment, offset, buffer);
        }
        self.segment_check_read(segment)?;
        self.x87_segment_check_limit(segment, x86_offset, offset, count, 0)?;
        let linear = self.segmented_to_linear(segment, offset)?;
        self.memory_read(bus, linear, buffer)
    }

    pub fn x87_segmented_write(
        &mut self,
        bus: &mut dyn Bus,
        segment: usize,
        x86_offset: u64,
        mut offset: u64,
        buffer: &[u8],
    ) -> Fallible<()> {
        if self.is_v55_iram(segment) {
            return self.iram_segment_write(offset, buffer);
        }
        let wraps = self.traits.wraps_segments();
        if wraps {
            offset &= 0xFFFF;
        }
        let count = buffer.len() as u64;
        if wraps && offset + count > 0x10000 {
            return self.segmented_write(bus, segment, offset, buffer);
        }
        self.segment_check_write(segment)?;
        self.x87_segment_check_limit(segment, x86_offset, offset, count, 0)?;
        let linear = self.segmented_to_linear(segment, offset)?;
        self.memory_write(bus, linear, buffer)
    }

    pub fn x87_read16(&mut self, bus: &mut dyn Bus, segment: usize, x86_offset: u64, offset: u64) -> Fallible<u16> {
        let mut b = [0u8; 2];
        self.x87_segmented_read(bus, segment, x86_offset, offset, &mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    pub fn x87_read32(&mut self, bus: &mut dyn Bus, segment: usize, x86_offset: u64, offset: u64) -> Fallible<u32> {
        let mut b = [0u8; 4];
        self.x87_segmented_read(bus, segment, x86_offset, offset, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    pub fn x87_read64(&mut self, bus: &mut dyn Bus, segment: usize, x86_offset: u64, offset: u64) -> Fallible<u64> {
        let mut b = [0u8; 8];
        self.x87_segmented_read(bus, segment, x86_offset, offset, &mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    pub fn x87_read80fp(&mut self, bus: &mut dyn Bus, segment: usize, x86_offset: u64, offset: u64) -> Fallible<Float80> {
        let fraction = self.x87_read64(bus, segment, x86_offset, offset)?;
        let exponent = self.x87_read16(bus, segment, x86_offset, offset + 8)?;
        Ok(Float80::from_parts(fraction, exponent & 0x7FFF, exponent & 0x8000 != 0))
    }

    pub fn x87_write16(&mut self, bus: &mut dyn Bus, segment: usize, x86_offset: u64, offset: u64, value: u16) -> Fallible<()> {
        self.x87_segmented_write(bus, segment, x86_offset, offset, &value.to_le_bytes())
    }

    pub fn x87_write32(&mut self, bus: &mut dyn Bus, segment: usize, x86_offset: u64, offset: u64, value: u32) -> Fallible<()> {
        self.x87_segmented_write(bus, segment, x86_offset, offset, &value.to_le_bytes())
    }

    pub fn x87_write64(&mut self, bus: &mut dyn Bus, segment: usize, x86_offset: u64, offset: u64, value: u64) -> Fallible<()> {
        self.x87_segmented_write(bus, segment, x86_offset, offset, &value.to_le_bytes())
    }

    pub fn x87_write80fp(&mut self, bus: &mut dyn Bus, segment: usize, x86_offset: u64, offset: u64, value: Float80) -> Fallible<()> {
        let (fraction, exponent, sign) = value.to_parts();
        self.x87_write64(bus, segment, x86_offset, offset, fraction)?;
        self.x87_write16(bus, segment, x86_offset, offset + 8, exponent | if sign { 0x8000 } else { 0 })
    }

    // ========== I/O Ports ==========

    pub fn input(&mut self, bus: &mut dyn Bus, port: u16, buffer: &mut [u8]) -> Fallible<()> {
        self.check_breakpoints(AccessKind::Io, u64::from(port), buffer.len() as u64)?;

        match self.traits.family {
            CpuFamily::I186 => {
                let pcr = u16::from_le_bytes([self.pcb[PCB_PCR_OFFSET], self.pcb[PCB_PCR_OFFSET + 1]]);
                if pcr & PCR_MIO == 0 {
                    let base = (pcr & PCR_ADDRESS) << 8;
                    if port >= base && usize::from(port) + buffer.len() <= usize::from(base) + 0x100 {
                        let start = usize::from(port - base);
                        buffer.copy_from_slice(&self.pcb[start..start + buffer.len()]);
                        return Ok(());
                    }
                }
            }
            CpuFamily::V33 => {
                if (0xFF00..0xFF81).contains(&port) {
                    let start = usize::from(port - 0xFF00);
                    let end = (start + buffer.len()).min(self.v33_io.len());
                    let take = end - start;
                    buffer[..take].copy_from_slice(&self.v33_io[start..end]);
                    if take == buffer.len() {
                        return Ok(());
                    }
                    bus.port_read(0xFF81, &mut buffer[take..]);
                    return Ok(());
                }
            }
            CpuFamily::Cyrix => {
                if port == 0x0023 && self.cyrix.port22_accessed {
                    buffer[0] = self.cyrix_register_get(self.cyrix.port_number);
                    self.cyrix.port22_accessed = false;
                    if buffer.len() > 1 {
                        bus.port_read(0x0024, &mut buffer[1..]);
                    }
                    return Ok(());
                }
                self.cyrix.port22_accessed = false;
            }
            _ => {}
        }

        bus.port_read(port, buffer);
        Ok(())
    }

    pub fn input8(&mut self, bus: &mut dyn Bus, port: u16) -> Fallible<u8> {
        let mut b = [0u8; 1];
        self.input(bus, port, &mut b)?;
        Ok(b[0])
    }

    pub fn input16(&mut self, bus: &mut dyn Bus, port: u16) -> Fallible<u16> {
        let mut b = [0u8; 2];
        self.input(bus, port, &mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    pub fn input32(&mut self, bus: &mut dyn Bus, port: u16) -> Fallible<u32> {
        let mut b = [0u8; 4];
        self.input(bus, port, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    pub fn output(&mut self, bus: &mut dyn Bus, port: u16, buffer: &[u8]) -> Fallible<()> {
        self.check_breakpoints(AccessKind::Io, u64::from(port), buffer.len() as u64)?;

        match self.traits.family {
            CpuFamily::I186 => {
                let pcr = u16::from_le_bytes([self.pcb[PCB_PCR_OFFSET], self.pcb[PCB_PCR_OFFSET + 1]]);
                if pcr & PCR_MIO == 0 {
                    let base = (pcr & PCR_ADDRESS) << 8;
                    if port >= base && usize::from(port) + buffer.len() <= usize::from(base) + 0x100 {
                        let start = usize::from(port - base);
                        self.pcb[start..start + buffer.len()].copy_from_slice(buffer);
                        return Ok(());
                    }
                }
            }
            CpuFamily::V33 => {
                if (0xFF00..0xFF81).contains(&port) {
                    let start = usize::from(port - 0xFF00);
                    let end = (start + buffer.len()).min(self.v33_io.len());
                    let take = end - start;
                    self.v33_io[start..end].copy_from_slice(&buffer[..take]);
                    if take < buffer.len() {
                        bus.port_write(0xFF81, &buffer[take..]);
                    }
                    return Ok(());
                }
            }
            CpuFamily::Cyrix => {
                if port == 0x0022 {
                    self.cyrix.port_number = buffer[0];
                    self.cyrix.port22_accessed = self.cyrix_port22_ungated();
                    if buffer.len() > 1 {
                        bus.port_write(0x0023, &buffer[1..])
                    }
                    return Ok(());
                }
                if port == 0x0023 && self.cyrix.port22_accessed {
                    self.cyrix_register_set(self.cyrix.port_number, buffer[0]);
                    self.cyrix.port22_accessed = false;
                    if buffer.len() > 1 {
                        bus.port_write(0x0024, &buffer[1..]);
                    }
                    return Ok(());
                }
                self.cyrix.port22_accessed = false;
            }
            _ => {}
        }

        bus.port_write(port, buffer);
        Ok(())
    }

    /// Per-subtype allow-list deciding whether the index just written to
    /// port 22h opens the configuration window.
    fn cyrix_port22_ungated(&self) -> bool {
        let n = self.cyrix.port_number;
        let in_ccr_block = (0xC0..=0xCF).contains(&n);
        let mapen = (self.cyrix.ccr[3] & CCR3_MAPEN_MASK) >> CCR3_MAPEN_SHIFT;
        match self.traits.subtype {
            CpuSubtype::Cx486Slc | CpuSubtype::Cx486Slce => in_ccr_block,
            CpuSubtype::Cx5x86 | CpuSubtype::Cx6x86 => in_ccr_block || n >= 0xFE || mapen == 0x01,
            CpuSubtype::MediaGx | CpuSubtype::Gxm | CpuSubtype::Gx1 => {
                in_ccr_block || n >= 0xFE || self.cyrix.ccr[3] & 0x10 != 0
            }
            CpuSubtype::CxM2 | CpuSubtype::CyrixIii => in_ccr_block || n >= 0xFE || mapen != 0,
            // GX2/LX route configuration through MSRs instead
            _ => false,
        }
    }

    pub fn output8(&mut self, bus: &mut dyn Bus, port: u16, value: u8) -> Fallible<()> {
        self.output(bus, port, &[value])
    }

    pub fn output16(&mut self, bus: &mut dyn Bus, port: u16, value: u16) -> Fallible<()> {
        self.output(bus, port, &value.to_le_bytes())
    }

    pub fn output32(&mut self, bus: &mut dyn Bus, port: u16, value: u32) -> Fallible<()> {
        self.output(bus, port, &value.to_le_bytes())
    }
}

//! Linear to physical translation
//!
//! Walk shapes, selected by (family, CR0.PG, CR4.PAE, EFER.LMA, CR4.VA57):
//!
//! ```text
//!            8086    V33     V55     286     386        PAE        x64
//! segment    16:16   16:16   16:16   16:16   16:32      16:32      16:64
//! linear     20      20      24      24      32         32         64
//! pages      -       6+14    -       -       10+10+12   2+9+9+12   9+9+9+9+12
//! physical   20      24      24      24      32         36         64
//! ```
//!
//! Every translation also reports how many bytes remain inside the page
//! (or flat region) so that callers can split accesses that straddle page
//! boundaries.

use crate::bus::Bus;
use crate::cpu::Cpu;
use crate::exception::{pf_error, Exception, Fallible};
use crate::regs::{Cr0, Cr4, Efer};
use crate::traits::CpuFamily;

bitflags::bitflags! {
    /// Page table entry bits common to every format.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageEntry: u64 {
        const P = 1 << 0;
        const WR = 1 << 1;
        const US = 1 << 2;
        const PWT = 1 << 3;
        const PCD = 1 << 4;
        const A = 1 << 5;
        const D = 1 << 6;
        const PS = 1 << 7;
        const G = 1 << 8;
        const XD = 1 << 63;
    }
}

/// V33 expanded-address control bit.
pub const XAM_XA: u8 = 0x01;

impl Cpu {
    /// Fetch one 32-bit table entry, enforce its permission bits, and set
    /// the accessed/dirty bits for a successful visit.
    fn page_fetch32(
        &mut self,
        bus: &mut dyn Bus,
        full_address: u64,
        table: u64,
        index: u64,
        write: bool,
        exec: bool,
        user: bool,
    ) -> Fallible<u32> {
        let slot = table + index * 4;
        let mut entry = self.physical_read32(bus, slot);
        let error_code = (if write { pf_error::WR } else { 0 })
            | (if user { pf_error::US } else { 0 })
            | (if exec { pf_error::ID } else { 0 });

        if u64::from(entry) & PageEntry::P.bits() == 0 {
            self.cr[2] = full_address;
            return Err(Exception::pf(error_code));
        }
        if write
            && u64::from(entry) & PageEntry::WR.bits() == 0
            && (user || self.cr[0] & Cr0::WP.bits() != 0)
        {
            self.cr[2] = full_address;
            return Err(Exception::pf(error_code | pf_error::P));
        }
        if user && u64::from(entry) & PageEntry::US.bits() == 0 {
            self.cr[2] = full_address;
            return Err(Exception::pf(error_code | pf_error::P));
        }

        let mut set = PageEntry::A.bits() as u32;
        if write {
            set |= PageEntry::D.bits() as u32;
        }
        if entry & set != set {
            entry |= set;
            self.physical_write32(bus, slot, entry);
        }
        Ok(entry)
    }

    /// Fetch one 64-bit table entry (PAE and long mode formats), with the
    /// additional NX check.
    fn page_fetch64(
        &mut self,
        bus: &mut dyn Bus,
        full_address: u64,
        table: u64,
        index: u64,
        write: bool,
        exec: bool,
        user: bool,
    ) -> Fallible<u64> {
        let slot = table + index * 8;
        let mut entry = self.physical_read64(bus, slot);
        let error_code = (if write { pf_error::WR } else { 0 })
            | (if user { pf_error::US } else { 0 })
            | (if exec { pf_error::ID } else { 0 });

        if entry & PageEntry::P.bits() == 0 {
            self.cr[2] = full_address;
            return Err(Exception::pf(error_code));
        }
        if write
            && entry & PageEntry::WR.bits() == 0
            && (user || self.cr[0] & Cr0::WP.bits() != 0)
        {
            self.cr[2] = full_address;
            return Err(Exception::pf(error_code | pf_error::P));
        }
        if user && entry & PageEntry::US.bits() == 0 {
            self.cr[2] = full_address;
            return Err(Exception::pf(error_code | pf_error::P));
        }
        if exec && self.efer & Efer::NXE.bits() != 0 && entry & PageEntry::XD.bits() != 0 {
            self.cr[2] = full_address;
            return Err(Exception::pf(error_code | pf_error::P));
        }

        let mut set = PageEntry::A.bits();
        if write {
            set |= PageEntry::D.bits();
        }
        if entry & set != set {
            entry |= set;
            self.physical_write64(bus, slot, entry);
        }
        Ok(entry)
    }

    /// Translate one linear address; returns the physical address and the
    /// number of bytes remaining in its page (or flat region).
    pub fn page_translate(
        &mut self,
        bus: &mut dyn Bus,
        full_address: u64,
        write: bool,
        exec: bool,
        user: bool,
    ) -> Fallible<(u64, u64)> {
        let mut address = full_address;

        if self.traits.family == CpuFamily::V33 {
            return Ok(if self.v33_xam & XAM_XA != 0 {
                // 6-bit page table index, 14-bit offset, 24-bit physical
                let page = u64::from(self.v33_pgr[(address >> 14) as usize & 0x3F] & 0x3FF);
                address &= 0x3FFF;
                ((page << 14) + address, 0x4000 - address)
            } else {
                address &= 0xF_FFFF;
                (address, 0x10_0000 - address)
            });
        }

        if self.cr[0] & Cr0::PG.bits() == 0 {
            let mask = self.traits.memory_mask();
            address &= mask;
            return Ok((address, mask - address + 1));
        }

        if self.efer & Efer::LMA.bits() == 0 {
            if self.cr[4] & Cr4::PAE.bits() != 0 {
                // 3-level, 36-bit physical
                let pml3 = self.page_fetch64(
                    bus,
                    full_address,
                    self.cr[3] & !0xFFF,
                    (address >> 30) & 3,
                    write,
                    exec,
                    user,
                )?;
                let pml2 = self.page_fetch64(
                    bus,
                    full_address,
                    pml3 & 0x000F_FFFF_FFFF_F000,
                    (address >> 21) & 0x1FF,
                    write,
                    exec,
                    user,
                )?;
                if pml2 & PageEntry::PS.bits() != 0 {
                    address &= 0x1F_FFFF;
                    Ok(((pml2 & 0x000F_FFFF_FFE0_0000) + address, 0x20_0000 - address))
                } else {
                    let pml1 = self.page_fetch64(
                        bus,
                        full_address,
                        pml2 & 0x000F_FFFF_FFFF_F000,
                        (address >> 12) & 0x1FF,
                        write,
                        exec,
                        user,
                    )?;
                    address &= 0xFFF;
                    Ok(((pml1 & 0x000F_FFFF_FFFF_F000) + address, 0x1000 - address))
                }
            } else {
                // 2-level, 32-bit
                let pml2 = self.page_fetch32(
                    bus,
                    full_address,
                    self.cr[3] & !0xFFF,
                    (address >> 22) & 0x3FF,
                    write,
                    exec,
                    user,
                )?;
                if self.cr[4] & Cr4::PSE.bits() != 0
                    && u64::from(pml2) & PageEntry::PS.bits() != 0
                {
                    address &= 0x3F_FFFF;
                    // PSE-36: physical bits 32..36 come from entry bits 13..17
                    let base = (u64::from(pml2) & 0xFFC0_0000)
                        | ((u64::from(pml2) & 0x003F_E000) << 19);
                    Ok((base + address, 0x40_0000 - address))
                } else {
                    let pml1 = self.page_fetch32(
                        bus,
                        full_address,
                        u64::from(pml2) & 0xFFFF_F000,
                        (address >> 12) & 0x3FF,
                        write,
                        exec,
                        user,
                    )?;
                    address &= 0xFFF;
                    Ok(((u64::from(pml1) & 0xFFFF_F000) + address, 0x1000 - address))
                }
            }
        } else if self.cr[4] & Cr4::VA57.bits() == 0 {
            // 4-level
            let pml4 = self.page_fetch64(
                bus,
                full_address,
                self.cr[3] & !0xFFF,
                (address >> 39) & 0x1FF,
                write,
                exec,
                user,
            )?;
            if pml4 & PageEntry::PS.bits() != 0 {
                address &= 0x7F_FFFF_FFFF;
                return Ok(((pml4 & 0x000F_FF80_0000_0000) + address, 0x80_0000_0000 - address));
            }
            let pml3 = self.page_fetch64(
                bus,
                full_address,
                pml4 & 0x000F_FFFF_FFFF_F000,
                (address >> 30) & 0x1FF,
                write,
                exec,
                user,
            )?;
            if pml3 & PageEntry::PS.bits() != 0 {
                address &= 0x3FFF_FFFF;
                return Ok(((pml3 & 0x000F_FFFF_C000_0000) + address, 0x4000_0000 - address));
            }
            let pml2 = self.page_fetch64(
                bus,
                full_address,
                pml3 & 0x000F_FFFF_FFFF_F000,
                (address >> 21) & 0x1FF,
                write,
                exec,
                user,
            )?;
            if pml2 & PageEntry::PS.bits() != 0 {
                address &= 0x1F_FFFF;
                return Ok(((pml2 & 0x000F_FFFF_FFE0_0000) + address, 0x20_0000 - address));
            }
            let pml1 = self.page_fetch64(
                bus,
                full_address,
                pml2 & 0x000F_FFFF_FFFF_F000,
                (address >> 12) & 0x1FF,
                write,
                exec,
                user,
            )?;
            address &= 0xFFF;
            Ok(((pml1 & 0x000F_FFFF_FFFF_F000) + address, 0x1000 - address))
        } else {
            // 5-level
            let pml5 = self.page_fetch64(
                bus,
                full_address,
                self.cr[3] & !0xFFF,
                (address >> 48) & 0x1FF,
                write,
                exec,
                user,
            )?;
            if pml5 & PageEntry::PS.bits() != 0 {
                address &= 0xFFFF_FFFF_FFFF;
                return Ok(((pml5 & 0x000F_0000_0000_0000) + address, 0x1_0000_0000_0000 - address));
            }
            let pml4 = self.page_fetch64(
                bus,
                full_address,
                pml5 & 0x000F_FFFF_FFFF_F000,
                (address >> 39) & 0x1FF,
                write,
                exec,
                user,
            )?;
            if pml4 & PageEntry::PS.bits() != 0 {
                address &= 0x7F_FFFF_FFFF;
                return Ok(((pml4 & 0x000F_FF80_0000_0000) + address, 0x80_0000_0000 - address));
            }
            let pml3 = self.page_fetch64(
                bus,
                full_address,
                pml4 & 0x000F_FFFF_FFFF_F000,
                (address >> 30) & 0x1FF,
                write,
                exec,
                user,
            )?;
            if pml3 & PageEntry::PS.bits() != 0 {
                address &= 0x3FFF_FFFF;
                return Ok(((pml3 & 0x000F_FFFF_C000_0000) + address, 0x4000_0000 - address));
            }
            let pml2 = self.page_fetch64(
                bus,
                full_address,
                pml3 & 0x000F_FFFF_FFFF_F000,
                (address >> 21) & 0x1FF,
                write,
                exec,
                user,
            )?;
            if pml2 & PageEntry::PS.bits() != 0 {
                address &= 0x1F_FFFF;
                return Ok(((pml2 & 0x000F_FFFF_FFE0_0000) + address, 0x20_0000 - address));
            }
            let pml1 = self.page_fetch64(
                bus,
                full_address,
                pml2 & 0x000F_FFFF_FFFF_F000,
                (address >> 12) & 0x1FF,
                write,
                exec,
                user,
            )?;
            address &= 0xFFF;
            Ok(((pml1 & 0x000F_FFFF_FFFF_F000) + address, 0x1000 - address))
        }
    }
}

//! Host memory and I/O substrate
//!
//! The core never owns guest memory. Every physical access, after
//! segmentation and paging, is routed through the [`Bus`] trait the host
//! provides. Ports work the same way; the on-chip register windows (186
//! peripheral block, V33 internal I/O, V25 IRAM, Cyrix 22h/23h) are peeled
//! off inside the core before the callback is reached.
//!
//! A V20/µPD9002 configured as a *separate* 8080/Z80 (rather than the
//! emulation mode sharing the x86 registers) talks to its own bus through
//! [`X80Bus`].

/// Which address space a physical access belongs to. The space is derived
/// from the processor state (privilege level, SMM, ICE), never from the
/// guest instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressSpace {
    User,
    #[default]
    Supervisor,
    /// System management mode overlay
    Smm,
    /// In-circuit emulation dump space
    Ice,
}

/// Access category used by the debug-register match logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Execute,
    Write,
    Io,
    Read,
}

impl AccessKind {
    /// DR7 R/W field encoding.
    pub fn dr7_rw(self) -> u64 {
        match self {
            AccessKind::Execute => 0,
            AccessKind::Write => 1,
            AccessKind::Io => 2,
            AccessKind::Read => 3,
        }
    }
}

/// Host-provided physical memory and port callbacks.
///
/// Addresses are physical (post-paging). Accesses never cross a page
/// boundary; the core splits them beforehand. The callbacks must not call
/// back into the core.
pub trait Bus {
    fn memory_read(&mut self, space: AddressSpace, address: u64, buffer: &mut [u8]);
    fn memory_write(&mut self, space: AddressSpace, address: u64, buffer: &[u8]);
    fn port_read(&mut self, port: u16, buffer: &mut [u8]);
    fn port_write(&mut self, port: u16, buffer: &[u8]);

    /// Optional sink for the disassembly/debug text the core produces.
    fn debug_output(&mut self, _text: &str) {}
}

/// Bus for a separate (non-emulated) 8080/Z80 processor.
pub trait X80Bus {
    fn memory_fetch(&mut self, address: u16, buffer: &mut [u8]);
    fn memory_read(&mut self, address: u16, buffer: &mut [u8]);
    fn memory_write(&mut self, address: u16, buffer: &[u8]);
    fn port_read(&mut self, port: u16) -> u8;
    fn port_write(&mut self, port: u16, value: u8);
}

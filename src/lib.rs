//! x86 Family Emulator Core
//!
//! This crate provides a cycle-stepped, behaviourally accurate interpreter
//! for the x86 architecture and its historical relatives, from the 8086
//! and the NEC V-series through the 286/386/486 protected-mode parts up to
//! a 64-bit Intel64-class superset. No OS APIs are used; all memory and
//! port traffic goes through host-provided callbacks.
//!
//! # Architecture
//!
//! The core is organized into modules with narrow interfaces:
//! - `traits`: immutable per-instance CPU model configuration
//! - `bus`: host memory/port callback traits
//! - `regs`: register file, segment cache and flag image forms
//! - `mem`/`paging`: segmentation, paging walks, prefetch queue, ports
//! - `desc`/`protect`: descriptors, gates, task switching, far transfers
//! - `exception`/`interrupt`: classification, escalation, delivery
//! - `smm`: SMM and ICE (LOADALL) state images
//! - `x87`: floating point unit with a soft 80-bit format
//! - `x80`: 8080/8085/Z80 submachine (emulation mode or separate bus)
//! - `x89`: 8089-style two-channel I/O processor
//! - `cpu`: the fetch-decode-execute stepper
//! - `disasm`: pure text disassembly for host debuggers
//!
//! # Stepping Model
//!
//! The host drives one of `step`, `fpu_step`, `iop_step` or `x80_step` per
//! virtual tick. A step runs to completion or unwinds via the exception
//! machinery; hardware interrupt lines are only sampled between steps.
//!
//! A stable C ABI is exported for non-Rust hosts: create an instance with
//! callback function pointers, then drive it with `x86_step`.

pub mod bus;
pub mod cpu;
pub mod desc;
pub mod disasm;
pub mod exception;
pub mod interrupt;
pub mod mem;
pub mod paging;
pub mod protect;
pub mod regs;
pub mod smm;
pub mod traits;
pub mod x80;
pub mod x87;
pub mod x89;

pub use bus::{AddressSpace, Bus, X80Bus};
pub use cpu::{Cpu, OpSize};
pub use exception::{CoreError, Exception, Fallible, StepResult};
pub use interrupt::InterruptLine;
pub use traits::{CpuFamily, CpuSubtype, CpuTraits, FpuType, SmmFormat};

use std::ffi::c_void;
use std::ptr;

/// Host callback table for the C ABI.
#[repr(C)]
pub struct X86Callbacks {
    /// Opaque pointer handed back to every callback.
    pub context: *mut c_void,
    pub memory_read:
        Option<extern "C" fn(*mut c_void, u32, u64, *mut u8, usize)>,
    pub memory_write:
        Option<extern "C" fn(*mut c_void, u32, u64, *const u8, usize)>,
    pub port_read: Option<extern "C" fn(*mut c_void, u16, *mut u8, usize)>,
    pub port_write: Option<extern "C" fn(*mut c_void, u16, *const u8, usize)>,
}

struct CallbackBus {
    callbacks: X86Callbacks,
}

// The C ABI instance is single-threaded by contract.
unsafe impl Send for CallbackBus {}

fn space_code(space: AddressSpace) -> u32 {
    match space {
        AddressSpace::User => 0,
        AddressSpace::Supervisor => 1,
        AddressSpace::Smm => 2,
        AddressSpace::Ice => 3,
    }
}

impl Bus for CallbackBus {
    fn memory_read(&mut self, space: AddressSpace, address: u64, buffer: &mut [u8]) {
        if let Some(read) = self.callbacks.memory_read {
            read(
                self.callbacks.context,
                space_code(space),
                address,
                buffer.as_mut_ptr(),
                buffer.len(),
            );
        } else {
            buffer.fill(0xFF);
        }
    }

    fn memory_write(&mut self, space: AddressSpace, address: u64, buffer: &[u8]) {
        if let Some(write) = self.callbacks.memory_write {
            write(
                self.callbacks.context,
                space_code(space),
                address,
                buffer.as_ptr(),
                buffer.len(),
            );
        }
    }

    fn port_read(&mut self, port: u16, buffer: &mut [u8]) {
        if let Some(read) = self.callbacks.port_read {
            read(self.callbacks.context, port, buffer.as_mut_ptr(), buffer.len());
        } else {
            buffer.fill(0xFF);
        }
    }

    fn port_write(&mut self, port: u16, buffer: &[u8]) {
        if let Some(write) = self.callbacks.port_write {
            write(self.callbacks.context, port, buffer.as_ptr(), buffer.len());
        }
    }
}

/// A C ABI instance: the CPU plus its callback bus.
pub struct Instance {
    cpu: Cpu,
    bus: CallbackBus,
}

fn family_from_code(code: u32) -> Option<CpuFamily> {
    Some(match code {
        0 => CpuFamily::I8086,
        1 => CpuFamily::I186,
        2 => CpuFamily::V20,
        3 => CpuFamily::V33,
        4 => CpuFamily::V60,
        5 => CpuFamily::Upd9002,
        6 => CpuFamily::V25,
        7 => CpuFamily::V55,
        8 => CpuFamily::I286,
        9 => CpuFamily::I386,
        10 => CpuFamily::I486,
        11 => CpuFamily::I586,
        12 => CpuFamily::P6,
        13 => CpuFamily::Cyrix,
        14 => CpuFamily::Amd,
        15 => CpuFamily::Intel64,
        16 => CpuFamily::Extended,
        _ => return None,
    })
}

/// Create an instance for the given family code.
/// Returns null if the family code is unknown.
///
/// # Safety
///
/// `callbacks` must point to a valid callback table; the function pointers
/// inside must stay valid for the lifetime of the instance.
#[no_mangle]
pub unsafe extern "C" fn x86_create(family: u32, callbacks: *const X86Callbacks) -> *mut Instance {
    let Some(family) = family_from_code(family) else {
        return ptr::null_mut();
    };
    if callbacks.is_null() {
        return ptr::null_mut();
    }
    let callbacks = unsafe { ptr::read(callbacks) };
    let instance = Box::new(Instance {
        cpu: Cpu::new(CpuTraits::new(family, CpuSubtype::Classic)),
        bus: CallbackBus { callbacks },
    });
    Box::into_raw(instance)
}

/// Destroy an instance.
/// Safe to call with null.
#[no_mangle]
pub extern "C" fn x86_destroy(instance: *mut Instance) {
    if !instance.is_null() {
        unsafe {
            drop(Box::from_raw(instance));
        }
    }
}

/// Reset the instance. `hard` non-zero also clears the powerup-only state.
#[no_mangle]
pub extern "C" fn x86_reset(instance: *mut Instance, hard: i32) {
    if instance.is_null() {
        return;
    }
    let instance = unsafe { &mut *instance };
    instance.cpu.reset(hard != 0);
}

/// Step result codes for the C ABI: the low byte is the kind, the second
/// byte carries the vector/opcode where one applies.
pub const X86_RESULT_SUCCESS: i32 = 0;
pub const X86_RESULT_HALT: i32 = 1;
pub const X86_RESULT_CPU_INTERRUPT: i32 = 2;
pub const X86_RESULT_IRQ: i32 = 3;
pub const X86_RESULT_UNDEFINED: i32 = 4;
pub const X86_RESULT_TRIPLE_FAULT: i32 = 5;
pub const X86_RESULT_ICE_INTERRUPT: i32 = 6;

fn encode_result(result: StepResult) -> i32 {
    match result {
        StepResult::Success => X86_RESULT_SUCCESS,
        StepResult::Halt => X86_RESULT_HALT,
        StepResult::CpuInterrupt(vector) => X86_RESULT_CPU_INTERRUPT | (i32::from(vector) << 8),
        StepResult::Irq(line) => X86_RESULT_IRQ | (i32::from(line) << 8),
        StepResult::Undefined(opcode) => X86_RESULT_UNDEFINED | (i32::from(opcode) << 8),
        StepResult::TripleFault => X86_RESULT_TRIPLE_FAULT,
        StepResult::IceInterrupt => X86_RESULT_ICE_INTERRUPT,
    }
}

/// Execute one instruction.
#[no_mangle]
pub extern "C" fn x86_step(instance: *mut Instance) -> i32 {
    if instance.is_null() {
        return X86_RESULT_TRIPLE_FAULT;
    }
    let instance = unsafe { &mut *instance };
    encode_result(instance.cpu.step(&mut instance.bus))
}

/// Execute one deferred FPU micro-step (external FPU configurations).
#[no_mangle]
pub extern "C" fn x86_fpu_step(instance: *mut Instance) {
    if instance.is_null() {
        return;
    }
    let instance = unsafe { &mut *instance };
    instance.cpu.fpu_step(&mut instance.bus);
}

/// Execute one I/O processor step per running channel.
#[no_mangle]
pub extern "C" fn x86_iop_step(instance: *mut Instance) {
    if instance.is_null() {
        return;
    }
    let instance = unsafe { &mut *instance };
    instance.cpu.iop_step(&mut instance.bus);
}

/// Raise a channel attention on the I/O processor.
#[no_mangle]
pub extern "C" fn x86_iop_attention(instance: *mut Instance) {
    if instance.is_null() {
        return;
    }
    let instance = unsafe { &mut *instance };
    instance.cpu.x89_channel_attention(&mut instance.bus);
}

/// Interrupt line codes for `x86_hardware_interrupt`.
pub const X86_LINE_INTR: u32 = 0;
pub const X86_LINE_NMI: u32 = 1;
pub const X86_LINE_SMI: u32 = 2;
pub const X86_LINE_ICE: u32 = 3;
pub const X86_LINE_RST55: u32 = 4;
pub const X86_LINE_RST65: u32 = 5;
pub const X86_LINE_RST75: u32 = 6;

/// Assert an interrupt line between steps.
/// Returns non-zero when the line was accepted.
///
/// # Safety
///
/// `data` must point to `data_len` readable bytes (or be null when
/// `data_len` is zero).
#[no_mangle]
pub unsafe extern "C" fn x86_hardware_interrupt(
    instance: *mut Instance,
    line: u32,
    vector: u8,
    data: *const u8,
    data_len: usize,
) -> i32 {
    if instance.is_null() {
        return 0;
    }
    let instance = unsafe { &mut *instance };
    let line = match line {
        X86_LINE_INTR => InterruptLine::Intr(vector),
        X86_LINE_NMI => InterruptLine::Nmi,
        X86_LINE_SMI => InterruptLine::Smi,
        X86_LINE_ICE => InterruptLine::Ice,
        X86_LINE_RST55 => InterruptLine::Rst55,
        X86_LINE_RST65 => InterruptLine::Rst65,
        X86_LINE_RST75 => InterruptLine::Rst75,
        _ => return 0,
    };
    let data = if data.is_null() || data_len == 0 {
        &[][..]
    } else {
        unsafe { std::slice::from_raw_parts(data, data_len) }
    };
    i32::from(instance.cpu.hardware_interrupt(&mut instance.bus, line, data))
}

/// Disassemble the instruction at CS:`offset` into the caller's buffer.
/// Returns the number of bytes written (excluding the terminator), or -1.
///
/// # Safety
///
/// `out` must point to `cap` writable bytes.
#[no_mangle]
pub unsafe extern "C" fn x86_disassemble(
    instance: *mut Instance,
    offset: u64,
    out: *mut u8,
    cap: usize,
) -> i32 {
    if instance.is_null() || out.is_null() || cap == 0 {
        return -1;
    }
    let instance = unsafe { &mut *instance };
    let text = instance.cpu.disassemble(&mut instance.bus, offset);
    let bytes = text.as_bytes();
    let length = bytes.len().min(cap - 1);
    unsafe {
        ptr::copy_nonoverlapping(bytes.as_ptr(), out, length);
        *out.add(length) = 0;
    }
    length as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_destroy() {
        let callbacks = X86Callbacks {
            context: ptr::null_mut(),
            memory_read: None,
            memory_write: None,
            port_read: None,
            port_write: None,
        };
        let instance = unsafe { x86_create(8, &callbacks) };
        assert!(!instance.is_null());
        x86_destroy(instance);
    }

    #[test]
    fn test_create_rejects_unknown_family() {
        let callbacks = X86Callbacks {
            context: ptr::null_mut(),
            memory_read: None,
            memory_write: None,
            port_read: None,
            port_write: None,
        };
        let instance = unsafe { x86_create(99, &callbacks) };
        assert!(instance.is_null());
    }

    #[test]
    fn test_result_encoding() {
        assert_eq!(encode_result(StepResult::Success), X86_RESULT_SUCCESS);
        assert_eq!(
            encode_result(StepResult::CpuInterrupt(0x21)),
            X86_RESULT_CPU_INTERRUPT | (0x21 << 8)
        );
        assert_eq!(encode_result(StepResult::TripleFault), X86_RESULT_TRIPLE_FAULT);
    }
}

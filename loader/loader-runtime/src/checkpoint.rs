//! # Checkpoint and Foreign Entry
//!
//! The checkpoint is a tiny hand-written trampoline:
//!
//! ```text
//! lazy_checkpoint_enter(entry, slot)
//!     save callee-saved registers
//!     *slot = sp                      ← the checkpoint
//!     call entry                      → guest runs
//!     return 0                        ← guest returned on its own
//! lazy_checkpoint_landing:
//!     return 1                        ← resumed by the fault handler
//! ```
//!
//! To resume, the fault handler rewrites the interrupted machine context so
//! that the instruction pointer is `lazy_checkpoint_landing` and the stack
//! pointer is the value stored in `slot`, then returns. The kernel's signal
//! return performs the jump and restores the signal mask, so no `setjmp`
//! state is involved. Only guest frames are discarded; the Rust caller sees
//! an ordinary return from `lazy_checkpoint_enter`.

use crate::fault::PageFaultError;
use core::cell::Cell;
use core::ffi::c_void;
use loader_addresses::VirtualAddress;

#[cfg(target_arch = "x86_64")]
core::arch::global_asm!(
    ".pushsection .text.lazy_checkpoint,\"ax\",@progbits",
    ".globl lazy_checkpoint_enter",
    ".hidden lazy_checkpoint_enter",
    ".type lazy_checkpoint_enter,@function",
    "lazy_checkpoint_enter:",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    // six pushes + return address: re-align to 16 bytes for the call
    "sub rsp, 8",
    "mov [rsi], rsp",
    "call rdi",
    "xor eax, eax",
    "jmp 2f",
    ".globl lazy_checkpoint_landing",
    ".hidden lazy_checkpoint_landing",
    "lazy_checkpoint_landing:",
    "mov eax, 1",
    "2:",
    "add rsp, 8",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
    ".size lazy_checkpoint_enter, . - lazy_checkpoint_enter",
    ".popsection",
);

#[cfg(target_arch = "x86")]
core::arch::global_asm!(
    ".pushsection .text.lazy_checkpoint,\"ax\",@progbits",
    ".globl lazy_checkpoint_enter",
    ".hidden lazy_checkpoint_enter",
    ".type lazy_checkpoint_enter,@function",
    "lazy_checkpoint_enter:",
    "push ebp",
    "push ebx",
    "push esi",
    "push edi",
    "mov eax, [esp + 20]",
    "mov ecx, [esp + 24]",
    "sub esp, 12",
    "mov [ecx], esp",
    "call eax",
    "xor eax, eax",
    "jmp 2f",
    ".globl lazy_checkpoint_landing",
    ".hidden lazy_checkpoint_landing",
    "lazy_checkpoint_landing:",
    "mov eax, 1",
    "2:",
    "add esp, 12",
    "pop edi",
    "pop esi",
    "pop ebx",
    "pop ebp",
    "ret",
    ".size lazy_checkpoint_enter, . - lazy_checkpoint_enter",
    ".popsection",
);

unsafe extern "C" {
    fn lazy_checkpoint_enter(entry: usize, slot: *mut usize) -> usize;
    fn lazy_checkpoint_landing();
}

#[cfg(target_arch = "x86_64")]
mod regs {
    pub const IP: libc::c_int = libc::REG_RIP;
    pub const SP: libc::c_int = libc::REG_RSP;
    pub const ERR: libc::c_int = libc::REG_ERR;
}

#[cfg(target_arch = "x86")]
mod regs {
    pub const IP: libc::c_int = libc::REG_EIP;
    pub const SP: libc::c_int = libc::REG_ESP;
    pub const ERR: libc::c_int = libc::REG_ERR;
}

/// How control came back from a guest call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resumption {
    /// The entry point returned normally.
    Returned,
    /// The fault handler resumed at the checkpoint.
    Resumed,
}

/// The armed checkpoint: the stack pointer recorded by the trampoline, or
/// zero while no guest call is in flight.
#[derive(Debug, Default)]
pub struct Checkpoint {
    stack: Cell<usize>,
}

impl Checkpoint {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            stack: Cell::new(0),
        }
    }

    /// Point the interrupted context at the checkpoint's landing site.
    ///
    /// One-shot: the checkpoint is disarmed by this call. Returns `false` if
    /// it was not armed, leaving the context untouched.
    ///
    /// # Safety
    /// `ucontext` must be the `ucontext_t` passed to an `SA_SIGINFO` handler
    /// for a signal raised on the thread that armed this checkpoint.
    #[allow(clippy::cast_possible_wrap)]
    pub unsafe fn resume(&self, ucontext: *mut c_void) -> bool {
        let sp = self.stack.replace(0);
        if sp == 0 {
            return false;
        }

        // SAFETY: caller guarantees this is the handler's ucontext_t.
        let uc = unsafe { &mut *ucontext.cast::<libc::ucontext_t>() };
        let landing = lazy_checkpoint_landing as *const () as usize;
        uc.uc_mcontext.gregs[regs::IP as usize] = landing as libc::greg_t;
        uc.uc_mcontext.gregs[regs::SP as usize] = sp as libc::greg_t;
        true
    }
}

/// Read the hardware page-fault error code from a signal context.
///
/// # Safety
/// `ucontext` must be the `ucontext_t` passed to an `SA_SIGINFO` handler.
#[must_use]
#[allow(clippy::cast_sign_loss)]
pub unsafe fn fault_cause(ucontext: *const c_void) -> PageFaultError {
    // SAFETY: caller guarantees this is the handler's ucontext_t.
    let uc = unsafe { &*ucontext.cast::<libc::ucontext_t>() };
    PageFaultError::from_bits(uc.uc_mcontext.gregs[regs::ERR as usize] as u64)
}

/// The guest's entry point.
///
/// This is the only place where loaded machine code is called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignEntry(usize);

impl ForeignEntry {
    /// `None` for a null entry or one that does not fit a host pointer.
    #[must_use]
    pub fn new(address: VirtualAddress) -> Option<Self> {
        address.as_usize().filter(|&a| a != 0).map(Self)
    }

    #[must_use]
    pub fn address(self) -> VirtualAddress {
        VirtualAddress::new(self.0 as u64)
    }

    /// Arm `checkpoint` and call the entry point as `extern "C" fn()`.
    ///
    /// # Safety
    /// The entry point must be code that either returns like a C function or
    /// faults into a handler that resumes at `checkpoint`. Whatever it does
    /// to process state before that is on the caller.
    pub unsafe fn call(self, checkpoint: &Checkpoint) -> Resumption {
        // SAFETY: the trampoline saves and restores all callee-saved
        // registers on either path; see the module docs.
        let code = unsafe { lazy_checkpoint_enter(self.0, checkpoint.stack.as_ptr()) };
        checkpoint.stack.set(0);
        if code == 0 {
            Resumption::Returned
        } else {
            Resumption::Resumed
        }
    }
}

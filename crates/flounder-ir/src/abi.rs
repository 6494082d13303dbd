//! x86-64 SysV characteristics used by the translation pipeline.
//!
//! Register roles:
//!
//! |                 | rax rcx rdx rbx rsp rbp rsi rdi r8 r9 r10 r11 r12-r15 |
//! |-----------------|--------------------------------------------------------|
//! | spill loads     | rax rcx rdx                                            |
//! | vreg allocation | rbx rbp rsi rdi r8 r9 r10 r11 r12 r13 r14 r15 (12)     |
//! | stack pointer   | rsp                                                    |
//! | callee-save     | rbx rsp rbp r12 r13 r14 r15                            |

pub const NUM_MREGS: usize = 16;

pub const CALLER_SAVE_MASK: [bool; NUM_MREGS] = [
    true, true, true, false, false, false, true, true, true, true, true, true, false, false,
    false, false,
];

pub const CALLEE_SAVE_MASK: [bool; NUM_MREGS] = [
    false, false, false, true, true, true, false, false, false, false, false, false, true, true,
    true, true,
];

pub const IS_PARAM_REG_CALL: [bool; NUM_MREGS] = [
    true, true, true, false, false, false, true, true, true, true, false, false, false, false,
    false, false,
];

/// Parameter register order for syscalls: rax, rdi, rsi, rdx, r10, r8, r9.
pub const PARAM_ORDER_SYSCALL: [u8; 7] = [0, 7, 6, 2, 10, 8, 9];

/// Parameter register order for calls: rdi, rsi, rdx, rcx, r8, r9.
pub const PARAM_ORDER_CALL: [u8; 7] = [7, 6, 2, 1, 8, 9, 255];

/// Registers available to the vreg allocator.
pub const NUM_ALLOCATION_MREGS: usize = 12;

/// Registers reserved for spill traffic, in order of use within an
/// instruction.
pub const SPILL_LOAD_REGS: [u8; 3] = [0, 1, 2];

pub const ALLOCATION_MREGS: [bool; NUM_MREGS] = [
    false, false, false, true, false, true, true, true, true, true, true, true, true, true, true,
    true,
];

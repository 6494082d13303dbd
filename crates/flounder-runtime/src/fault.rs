use std::fmt;

/// Faults raised inside generated code.
///
/// There is no unwinding path through a JIT frame, so these terminate the
/// process with a non-zero exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeFault {
    DivisionByZero,
    ArithmeticOverflow,
    HashTableFull,
    OutOfMemory,
}

impl fmt::Display for RuntimeFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::DivisionByZero => "division by zero",
            Self::ArithmeticOverflow => "arithmetic overflow",
            Self::HashTableFull => "hash table full",
            Self::OutOfMemory => "out of memory",
        };
        f.write_str(msg)
    }
}

/// Report a fault and terminate.
pub fn runtime_fault(fault: RuntimeFault) -> ! {
    eprintln!("runtime error: {fault}");
    std::process::exit(1);
}

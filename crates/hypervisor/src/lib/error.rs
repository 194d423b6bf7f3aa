// Crate-wide error type
//
// Every fallible operation that crosses a module boundary returns
// Result<_, HvError>. The variants map onto the errno values the GDB stub
// reports back to the debugger.

/// Hypervisor error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HvError {
    /// Malformed argument (misaligned address, zero size, ...)
    InvalidArgument,
    /// The entry already exists (breakpoint at that address, ...)
    AlreadyExists,
    /// No such entry
    NotFound,
    /// A bounded table is full
    ResourceExhausted,
    /// The guest memory access faulted or was cut short
    Fault,
}

impl HvError {
    /// errno-style code used in GDB `E<nn>` replies
    pub fn errno(self) -> u32 {
        match self {
            HvError::InvalidArgument => 22,   // EINVAL
            HvError::AlreadyExists => 17,     // EEXIST
            HvError::NotFound => 2,           // ENOENT
            HvError::ResourceExhausted => 16, // EBUSY
            HvError::Fault => 14,             // EFAULT
        }
    }

}

pub type Result<T> = core::result::Result<T, HvError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_values_match_gdb_replies() {
        assert_eq!(HvError::InvalidArgument.errno(), 22);
        assert_eq!(HvError::NotFound.errno(), 2);
        assert_eq!(HvError::Fault.errno(), 14);
    }
}

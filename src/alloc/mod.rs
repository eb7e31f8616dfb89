pub mod bitvec;
pub mod block;
pub mod chain;
pub mod meta;
pub mod page;
pub mod shared;
pub mod tracing;

use std::fmt;

use crate::os::mem::VmError;

#[non_exhaustive]
#[derive(Debug)]
pub enum Error {
    /// `size` plus the header does not fit in one page. Not retryable.
    Oversize { size: usize, capacity: usize },
    /// No page could be reserved
    Reserve(VmError),
    /// Freed a pointer this allocator never handed out, or already freed
    InvalidFree { address: usize },
    /// The header in front of a live allocation was overwritten
    CorruptHeader {
        address: usize,
        recorded: usize,
        header: usize,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Oversize { size, capacity } => write!(
                f,
                "size {size} is larger than one page (at most {capacity} bytes)"
            ),
            Error::Reserve(e) => write!(f, "could not reserve a page: {e}"),
            Error::InvalidFree { address } => {
                write!(f, "{address:#x} is not a live allocation")
            }
            Error::CorruptHeader {
                address,
                recorded,
                header,
            } => write!(
                f,
                "header of {address:#x} says {header} bytes, but {recorded} were allocated"
            ),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Reserve(e) => Some(e),
            _ => None,
        }
    }
}

impl From<VmError> for Error {
    fn from(e: VmError) -> Self {
        Error::Reserve(e)
    }
}

use thiserror::Error;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! encoding_error {
    ($msg:expr) => {
        crate::Error::Encoding {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Encoding {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// # Error Categories
///
/// ## Caller errors
/// - [`Error::Declaration`] - The member cannot be hooked (malformed signature, abstract target)
/// - [`Error::Structural`] - Builder misuse: wrong arity, wrong width, undefined local
///
/// ## Internal invariant failures
/// - [`Error::AllocationInvariant`] - Two interfering values received overlapping registers
/// - [`Error::Encoding`] - An offset, index or operand did not fit the container format
///
/// ## Input errors
/// - [`Error::Malformed`] - A binary unit failed to decode
/// - [`Error::OutOfBounds`] - A read ran past the end of the input
/// - [`Error::Execution`] - The reference interpreter hit an unexecutable instruction
///
/// ## I/O and synchronization
/// - [`Error::FileError`] - Filesystem I/O errors
/// - [`Error::CacheRejected`] - A cached unit failed validation
/// - [`Error::LockError`] - A synthesis lock was poisoned
///
/// Callback failures raised while a generated trampoline runs are never reported through this
/// type; they are logged and absorbed by the dispatch protocol.
#[derive(Error, Debug)]
pub enum Error {
    /// The member descriptor cannot be turned into a trampoline.
    ///
    /// Raised for malformed signatures and for targets that have no code to redirect, such as
    /// abstract methods or instance methods declared on an interface.
    #[error("Cannot hook {member}: {reason}")]
    Declaration {
        /// Canonical signature (or raw input) of the rejected member
        member: String,
        /// Why the member was rejected
        reason: String,
    },

    /// A method body was built incorrectly.
    ///
    /// Identifies the method and the index of the offending instruction in its builder stream,
    /// so misuse fails fast instead of being truncated or widened silently.
    #[error("{method} @ {index}: {message}")]
    Structural {
        /// Name of the method being built
        method: String,
        /// Index of the offending item in the instruction stream
        index: usize,
        /// Description of the violation
        message: String,
    },

    /// The register allocator produced an invalid mapping.
    ///
    /// This is an internal bug class: two values with a recorded interference edge were given
    /// overlapping register ranges. It is never a user error.
    #[error("Register allocation invariant violated in {method}: {message}")]
    AllocationInvariant {
        /// Name of the method being allocated
        method: String,
        /// Which values collided, and where
        message: String,
    },

    /// The container encoder could not represent an item.
    ///
    /// Raised when an index, offset or branch distance does not fit its encoded field.
    #[error("Encoding failure - {file}:{line}: {message}")]
    Encoding {
        /// The message to be printed for the encoding failure
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// The binary unit is damaged and could not be decoded.
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while decoding.
    #[error("Out of Bound read would have occurred!")]
    OutOfBounds,

    /// The reference interpreter could not execute the code it was given.
    #[error("Execution failed: {0}")]
    Execution(String),

    /// Encapsulates an I/O error from the standard library.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// A cached unit was found but does not match the member it is cached for.
    ///
    /// The entry is discarded and the unit is synthesized again.
    #[error("Cached unit rejected for {member}: {reason}")]
    CacheRejected {
        /// Canonical signature of the member
        member: String,
        /// Why the cached unit was not usable
        reason: String,
    },

    /// Failed to acquire a synthesis lock.
    #[error("Failed to lock target: {0}")]
    LockError(String),
}

//! The bit-flagged completion status every operation reports (§7).
//!
//! The source engine this crate's behavior is modeled on returns a bare
//! `int` of OR-ed flags. We keep the bit-flag semantics — flags legitimately
//! compose, e.g. `CRITICAL_ERROR | WRITE_FAILED` — but expose it as a named
//! [`OpStatus`] rather than a raw integer, the same trade the teacher makes
//! for its own `StoragePermissions` and `TlsFlags` bitflag types.

use bitflags::bitflags;

bitflags! {
    /// Completion status of an engine operation. Flags combine freely; see
    /// the module docs for why this isn't a plain enum.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpStatus: u32 {
        /// The operation completed successfully.
        const OK = 0b0000_0000_0000_0001;
        /// The operation failed.
        const ERROR = 0b0000_0000_0000_0010;
        /// The failure is not retriable at this layer.
        const CRITICAL_ERROR = 0b0000_0000_0000_0100;
        /// The host canceled the operation.
        const CANCELED = 0b0000_0000_0000_1000;
        /// The control connection has been torn down.
        const DISCONNECTED = 0b0000_0000_0001_0000;
        /// A local write (during download) failed.
        const WRITE_FAILED = 0b0000_0000_0010_0000;
        /// The inactivity timeout tripped.
        const TIMEOUT = 0b0000_0000_0100_0000;
        /// The server rejected the supplied credentials.
        const PASSWORD_FAILED = 0b0000_0000_1000_0000;
        /// A `CWD` target was not a directory (link discovery).
        const LINK_NOT_DIR = 0b0000_0001_0000_0000;
        /// A programmer error or invariant violation.
        const INTERNAL = 0b0000_0010_0000_0000;
    }
}

impl OpStatus {
    /// True if [`OpStatus::OK`] is set and no error-class flag accompanies it.
    pub fn is_ok(&self) -> bool {
        self.contains(OpStatus::OK) && !self.intersects(OpStatus::ERROR | OpStatus::CRITICAL_ERROR)
    }

    /// True if any error-class flag is set.
    pub fn is_error(&self) -> bool {
        self.intersects(OpStatus::ERROR | OpStatus::CRITICAL_ERROR)
    }

    /// True if the failure should not be retried by the host without
    /// intervention (certificate rejection, wrong protocol, and similar).
    pub fn is_critical(&self) -> bool {
        self.contains(OpStatus::CRITICAL_ERROR)
    }
}

impl Default for OpStatus {
    fn default() -> Self {
        OpStatus::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_alone_is_ok() {
        assert!(OpStatus::OK.is_ok());
    }

    #[test]
    fn error_flags_compose() {
        let s = OpStatus::ERROR | OpStatus::CRITICAL_ERROR | OpStatus::WRITE_FAILED;
        assert!(s.is_error());
        assert!(s.is_critical());
        assert!(s.contains(OpStatus::WRITE_FAILED));
        assert!(!s.is_ok());
    }

    #[test]
    fn ok_combined_with_error_is_not_ok() {
        // Shouldn't happen in practice, but the flag composition must not
        // lie about it if it ever does.
        let s = OpStatus::OK | OpStatus::ERROR;
        assert!(!s.is_ok());
        assert!(s.is_error());
    }
}

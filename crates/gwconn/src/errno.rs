//! Centralized transient-vs-fatal classification for I/O errors.
//!
//! Every read/write site in [`crate::connection`] funnels its error
//! through [`is_transient`] rather than matching `raw_os_error()` magic
//! numbers inline — `EINTR`/`EAGAIN`/`EWOULDBLOCK` all mean "try again
//! later," nothing else does.

use std::io;

/// True if `err` represents a transient condition the caller should
/// silently retry (`EINTR`, `EAGAIN`, `EWOULDBLOCK`), false if it's a
/// fatal I/O error that should be recorded as such.
pub fn is_transient(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::WouldBlock || err.kind() == io::ErrorKind::Interrupted {
        return true;
    }
    match err.raw_os_error() {
        Some(code) => {
            let errno = nix::errno::Errno::from_raw(code);
            matches!(
                errno,
                nix::errno::Errno::EAGAIN | nix::errno::Errno::EWOULDBLOCK | nix::errno::Errno::EINTR
            )
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn would_block_is_transient() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::WouldBlock)));
    }

    #[test]
    fn interrupted_is_transient() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
    }

    #[test]
    fn raw_eagain_is_transient() {
        let err = io::Error::from_raw_os_error(libc::EAGAIN);
        assert!(is_transient(&err));
    }

    #[test]
    fn connection_reset_is_not_transient() {
        let err = io::Error::from_raw_os_error(libc::ECONNRESET);
        assert!(!is_transient(&err));
    }

    #[test]
    fn plain_other_error_is_not_transient() {
        let err = io::Error::new(io::ErrorKind::Other, "boom");
        assert!(!is_transient(&err));
    }
}

use std::sync::atomic::{AtomicBool, Ordering};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use crate::error::Result;

static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn request_stop(_: nix::libc::c_int) {
    STOP_REQUESTED.store(true, Ordering::SeqCst);
}

/// The flag raised by SIGINT and SIGTERM once [install_handlers] has run
///
/// Pass it to the driver: no new cells are started after it is set, cells already running are left
/// to finish
pub fn stop_flag() -> &'static AtomicBool {
    &STOP_REQUESTED
}

/// Installs SIGINT and SIGTERM handlers which raise [stop_flag] instead of terminating
pub fn install_handlers() -> Result<()> {
    let action = SigAction::new(SigHandler::Handler(request_stop), SaFlags::SA_RESTART, SigSet::empty());
    for signal in [Signal::SIGINT, Signal::SIGTERM] {
        // The handler only stores to an atomic, which is async-signal-safe
        unsafe { sigaction(signal, &action) }?;
    }
    Ok(())
}

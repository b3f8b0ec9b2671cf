//! Noticing Ctrl-C (and `SIGTERM`) without dying, so that we still get a
//! chance to clean up our pod.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use lazy_static::lazy_static;

use crate::prelude::*;

lazy_static! {
    /// Set once we've received an interrupt.
    static ref INTERRUPTED: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
}

/// Install our signal handlers. After this, an interrupt no longer kills
/// this process; it just makes [`interrupted`] return true.
///
/// Child processes are unaffected, because caught signals revert to their
/// default action on `exec`. So Ctrl-C still stops a running `kubectl`.
pub fn install_handlers() -> Result<()> {
    #[cfg(unix)]
    {
        use signal_hook::consts::{SIGINT, SIGTERM};

        for &(signal, name) in &[(SIGINT, "SIGINT"), (SIGTERM, "SIGTERM")] {
            signal_hook::flag::register(signal, Arc::clone(&INTERRUPTED))
                .with_context(|| format!("could not install {} handler", name))?;
            trace!("installed {} handler", name);
        }
    }
    Ok(())
}

/// Have we been interrupted?
pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

#[cfg(unix)]
#[test]
fn sigint_sets_interrupted_flag() {
    install_handlers().unwrap();
    signal_hook::low_level::raise(signal_hook::consts::SIGINT).unwrap();
    // We're still alive, and we noticed.
    assert!(interrupted());
}

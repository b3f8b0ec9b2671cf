//! Error-handling code.

use std::{backtrace::BacktraceStatus, fmt};

use anyhow::Error;

/// Extension methods for showing an error to a human.
pub trait DisplayCausesExt {
    /// Display the error followed by each of its causes. If `backtrace` is
    /// true and a backtrace was captured (see `RUST_BACKTRACE`), it is
    /// printed as well.
    fn display_causes(&self, backtrace: bool) -> DisplayCauses<'_>;
}

impl DisplayCausesExt for Error {
    fn display_causes(&self, backtrace: bool) -> DisplayCauses<'_> {
        DisplayCauses {
            err: self,
            backtrace,
        }
    }
}

/// Helper type returned by [`DisplayCausesExt::display_causes`].
pub struct DisplayCauses<'a> {
    err: &'a Error,
    backtrace: bool,
}

impl fmt::Display for DisplayCauses<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut chain = self.err.chain();
        if let Some(top) = chain.next() {
            writeln!(f, "ERROR: {}", top)?;
        }
        for cause in chain {
            writeln!(f, "  caused by: {}", cause)?;
        }

        let backtrace = self.err.backtrace();
        if self.backtrace && backtrace.status() == BacktraceStatus::Captured {
            write!(f, "{}", backtrace)?;
        }
        Ok(())
    }
}

/// Generate a `main` function which calls the specified function. If the
/// function fails, `main` prints the error with its causes to standard error
/// and exits with status 1.
#[macro_export]
macro_rules! quick_main {
    ($wrapped:ident) => {
        fn main() {
            if let Err(err) = $wrapped() {
                use $crate::errors::DisplayCausesExt;
                eprint!("{}", err.display_causes(true));
                ::std::process::exit(1);
            }
        }
    };
}

#[test]
fn display_causes_lists_every_cause() {
    use anyhow::Context;

    let err = Err::<(), _>(anyhow::format_err!("connection refused"))
        .context("error running kubectl")
        .context("could not look up pod psocks1080")
        .unwrap_err();
    assert_eq!(
        err.display_causes(false).to_string(),
        "ERROR: could not look up pod psocks1080\n  \
         caused by: error running kubectl\n  \
         caused by: connection refused\n",
    );
}

//! Process-wide flags and progress reporting, threaded as a context value.
//!
//! The reference implementation keeps the trailing-0xff kill-switch and the
//! progress callback as static globals. Here they are captured once at
//! session start in `AccessContext` and passed by reference into the access
//! engine instead, per §9's design note: no mutable module state, and
//! nothing mutates the context mid-session.

/// One update of a long-running read/write/verify operation, handed to the
/// caller-supplied progress callback. Takes the place of the reference
/// implementation's global `report_progress` function pointer.
#[derive(Debug, Clone, Copy)]
pub struct ProgressEvent {
    pub completed: i64,
    pub total: i64,
    /// Present only on the first call of a new operation ("Reading",
    /// "Writing", …); `None` on every subsequent call for the same
    /// operation.
    pub header: Option<&'static str>,
}

pub type ProgressFn<'a> = dyn FnMut(ProgressEvent) + 'a;

/// Session-scoped, read-only configuration threaded through every access
/// engine call. Built once per session and never mutated afterward.
pub struct AccessContext<'a> {
    /// When false, `hiaddr` always returns the full memory size instead of
    /// trimming trailing 0xff bytes. Set once when the context is built;
    /// the access engine never flips it back.
    trim_trailing_ff: bool,
    progress: Option<Box<ProgressFn<'a>>>,
}

impl<'a> AccessContext<'a> {
    pub fn new() -> Self {
        AccessContext {
            trim_trailing_ff: true,
            progress: None,
        }
    }

    /// Build a context with the trailing-0xff optimization disabled for the
    /// whole session, as if the user had asked for it at startup.
    pub fn with_trim_disabled() -> Self {
        AccessContext {
            trim_trailing_ff: false,
            progress: None,
        }
    }

    pub fn with_progress(mut self, f: impl FnMut(ProgressEvent) + 'a) -> Self {
        self.progress = Some(Box::new(f));
        self
    }

    pub fn trim_trailing_ff(&self) -> bool {
        self.trim_trailing_ff
    }

    pub fn report(&mut self, completed: i64, total: i64, header: Option<&'static str>) {
        if let Some(f) = self.progress.as_mut() {
            f(ProgressEvent { completed, total, header });
        }
    }
}

impl<'a> Default for AccessContext<'a> {
    fn default() -> Self {
        Self::new()
    }
}

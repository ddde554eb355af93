//! Session notifications and user interaction
//!
//! The flasher reports progress through a [FlasherObserver] and asks
//! questions through a [Prompter]; both are capability objects supplied by
//! the embedding shell. The flasher never blocks on an observer, so
//! implementations must return promptly.

/// Receiver of flashing-session notifications.
pub trait FlasherObserver {
    /// Monotone byte counter, bounded by the session's total.
    fn progress(&mut self, bytes: u32);

    /// A human-readable status line. Persistent messages belong in a log;
    /// transient ones may overwrite each other.
    fn status(&mut self, message: &str, persistent: bool);

    /// The session finished; no further notifications follow.
    fn done(&mut self, message: &str, ok: bool);
}

/// Blocking user prompt: presents `choices` and returns the index of the
/// selected one.
pub trait Prompter {
    fn prompt(&self, message: &str, choices: &[&str]) -> usize;
}

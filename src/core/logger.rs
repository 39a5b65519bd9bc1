//! Diagnostic sink handed to the client and to relay sessions.

use std::fmt;
use std::sync::Arc;

/// A cloneable line-oriented logging callback.
///
/// The client reports lifecycle events (`"Client::send: connecting"`, ...)
/// through it. The default forwards to [`tracing`].
#[derive(Clone)]
pub struct Logf(Arc<dyn Fn(&str) + Send + Sync>);

impl Logf {
    /// Wrap an arbitrary callback.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Forward every line to `tracing` at info level.
    pub fn tracing() -> Self {
        Self::new(|line| tracing::info!(target: "relaytun", "{line}"))
    }

    /// Drop every line.
    pub fn discard() -> Self {
        Self::new(|_| {})
    }

    /// Emit one diagnostic line.
    pub fn log(&self, line: &str) {
        (self.0)(line)
    }
}

impl Default for Logf {
    fn default() -> Self {
        Self::tracing()
    }
}

impl fmt::Debug for Logf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Logf")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_logf_forwards_lines() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        let logf = Logf::new(move |line| sink.lock().unwrap().push(line.to_owned()));

        logf.log("one");
        logf.clone().log("two");

        assert_eq!(*lines.lock().unwrap(), vec!["one", "two"]);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,

    /// Script execution error (the runtime raised while executing the user
    /// script).
    ScriptError = 20,

    /// Invalid CLI/config/options (bad flags, invalid durations, invalid
    /// threshold syntax, unknown source types, etc.).
    InvalidInput = 30,

    /// Internal/runtime error (IO errors, engine failures, panics caught at
    /// top level).
    RuntimeError = 40,

    /// One or more thresholds failed; the run itself completed.
    ThresholdsFailed = 99,

    /// The run was cut short by an interrupt (128 + SIGINT).
    Interrupted = 130,
}

impl ExitCode {
    #[must_use]
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tainted_runs_exit_99() {
        assert_eq!(ExitCode::ThresholdsFailed.as_i32(), 99);
        assert_eq!(ExitCode::Success.as_i32(), 0);
    }
}

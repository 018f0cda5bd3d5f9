/// Dry-run and verbosity switches accepted by every core operation.
///
/// With `test` set an operation performs no writes against either store but still returns
/// the shape a real call would. `verbose` adds per-item log events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Diagnostics {
    pub test: bool,
    pub verbose: bool,
}

impl Diagnostics {
    pub fn dry_run() -> Self {
        Self {
            test: true,
            verbose: false,
        }
    }
}

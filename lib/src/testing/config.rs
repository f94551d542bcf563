/// How much the runner prints beyond per-test outcomes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

/// Runner configuration supplied by the embedding boot environment.
#[derive(Clone, Copy, Debug)]
pub struct TestConfig {
    pub enabled: bool,
    pub verbosity: Verbosity,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            verbosity: Verbosity::Normal,
        }
    }
}

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::Error;
use crate::group::Group;
use crate::options::Options;
use crate::sample::SampleSink;

/// Program-specific factory minting VU instances bound to a compiled script.
///
/// `new_vu` is called from the executor's pool-growth path while other VUs
/// are mid-iteration, so implementations must be thread-safe.
pub trait Runner: Send + Sync {
    /// Mints a fresh VU. The sink is bound for the VU's lifetime; every
    /// sample the VU ever emits goes through it.
    fn new_vu(&self, sink: SampleSink) -> Result<Box<dyn Vu>, Error>;

    /// Options declared inside the script itself.
    fn options(&self) -> Options;

    /// Pushes the effective (merged) options back so script-visible config
    /// stays consistent with what the engine actually runs.
    fn set_options(&self, options: Options);

    /// Root metric scope for the run.
    fn default_group(&self) -> Arc<Group>;
}

impl fmt::Debug for dyn Runner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn Runner")
    }
}

/// One virtual user. Never shared between concurrent iterations; the
/// executor is the only caller and serializes all access.
pub trait Vu: Send {
    /// Binds the VU to a new index and resets script-side per-VU state.
    fn reconfigure(&mut self, id: u64) -> Result<(), Error>;

    /// Runs a single iteration. Cancellable at any await point; the executor
    /// drops the future when the run context is cancelled.
    fn run_once(&mut self) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send + '_>>;
}

// crates/aircast-core/src/lib.rs
//
// Media-library-agnostic plumbing shared by the pipeline stages: buffer
// pools, the bounded drop-newest queue, the cancellation token and the
// encoder pause gate. Nothing in here knows about packets or frames; the
// media crate instantiates these with its own shell types.

pub mod cancel;
pub mod error;
pub mod gate;
pub mod pool;
pub mod queue;

pub use cancel::CancelToken;
pub use error::{PopError, QueueClosed};
pub use gate::PauseGate;
pub use pool::Pool;
pub use queue::BoundedQueue;

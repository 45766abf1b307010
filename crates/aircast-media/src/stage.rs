// crates/aircast-media/src/stage.rs
//
// The one worker loop all codec-driven stages share: pop input from the
// upstream queue, feed it to the codec, drain every available output into
// shells from the own pool and push them downstream, then hand the input
// shell back to the upstream pool. Failure handling is recover-continue; the
// loop only exits on cancellation or upstream close, and closes its own
// output queue on the way out.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::debug;

use aircast_core::{BoundedQueue, CancelToken, PopError};

use crate::error::Result;

pub(crate) enum Drain {
    /// The output shell was filled and must be pushed downstream.
    Produced,
    /// Nothing more for this input (EAGAIN / end of stream).
    Exhausted,
}

pub(crate) trait Step {
    type In: Send + 'static;
    type Out: Send + 'static;

    /// Hand one input to the codec. An error releases the input and moves on.
    fn feed(&mut self, input: &mut Self::In) -> Result<()>;

    /// Ask the codec for the next output into `out`.
    fn drain(&mut self, out: &mut Self::Out) -> Result<Drain>;
}

pub(crate) fn spawn_stage<S>(
    name: &str,
    mut step: S,
    upstream: Arc<BoundedQueue<S::In>>,
    downstream: Arc<BoundedQueue<S::Out>>,
    cancel: CancelToken,
    pop_deadline: Duration,
) -> JoinHandle<()>
where
    S: Step + Send + 'static,
{
    let label = name.to_owned();
    thread::Builder::new()
        .name(label.clone())
        .spawn(move || {
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                let mut input = match upstream.pop(pop_deadline, &cancel) {
                    Ok(shell) => shell,
                    Err(PopError::TimedOut) => continue,
                    Err(PopError::Cancelled) | Err(PopError::Closed) => break,
                };

                if let Err(err) = step.feed(&mut input) {
                    debug!(stage = %label, %err, "input rejected, continuing");
                    upstream.release(input);
                    continue;
                }

                loop {
                    let mut out = downstream.acquire();
                    match step.drain(&mut out) {
                        Ok(Drain::Produced) => {
                            // On a shed or a closed queue the pool already
                            // owns the shell; closed additionally ends the
                            // drain round.
                            if downstream.push(out).is_err() {
                                break;
                            }
                        }
                        Ok(Drain::Exhausted) => {
                            downstream.release(out);
                            break;
                        }
                        Err(err) => {
                            downstream.release(out);
                            debug!(stage = %label, %err, "output drain failed");
                            break;
                        }
                    }
                }

                upstream.release(input);
            }
            downstream.close();
        })
        .expect("spawn stage worker")
}

// crates/aircast-media/src/filter.rs
//
// Filter stage: runs a graph built from a FilterSpec over decoded frames.
// The graph lives behind a mutex shared with the runtime retune path, so
// `send_command` can adjust @id-addressed filters (notch frequencies) while
// the worker keeps pumping frames.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use ffmpeg_the_third as ffmpeg;

use ffmpeg::{filter, Frame};
use parking_lot::Mutex;
use tracing::{debug, warn};

use aircast_core::{BoundedQueue, CancelToken};

use crate::decode::Decoder;
use crate::error::{Error, Result};
use crate::ffi_ext::{self, is_drained};
use crate::filter_spec::FilterSpec;
use crate::info::FrameInfo;
use crate::pools;
use crate::stage::{spawn_stage, Drain, Step};

const DEFAULT_CAPACITY: usize = 256;
const POP_DEADLINE: Duration = Duration::from_millis(50);

// Owned by exactly one worker plus the command path, both behind the same
// mutex; the binding's graph type is !Send only for its owner bookkeeping.
struct SharedGraph(filter::Graph);
unsafe impl Send for SharedGraph {}

struct FilterStep {
    graph: Arc<Mutex<SharedGraph>>,
}

impl Step for FilterStep {
    type In = Frame;
    type Out = Frame;

    fn feed(&mut self, frame: &mut Frame) -> Result<()> {
        let mut graph = self.graph.lock();
        let mut source = graph.0.get("in").ok_or(Error::FilterNotFound("in"))?;
        // The graph takes its own reference on the payload; the input shell
        // goes back to the upstream pool right after.
        source.source().add(frame)?;
        Ok(())
    }

    fn drain(&mut self, frame: &mut Frame) -> Result<Drain> {
        let mut graph = self.graph.lock();
        let mut sink = graph.0.get("out").ok_or(Error::FilterNotFound("out"))?;
        match sink.sink().frame(frame) {
            Ok(()) => Ok(Drain::Produced),
            Err(ref err) if is_drained(err) => Ok(Drain::Exhausted),
            Err(err) => Err(err.into()),
        }
    }
}

pub struct Filter {
    queue: Arc<BoundedQueue<Frame>>,
    upstream: Arc<BoundedQueue<Frame>>,
    graph: Arc<Mutex<SharedGraph>>,
    info: FrameInfo,
    cancel: CancelToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Filter {
    pub fn new(decoder: &Decoder, spec: FilterSpec, cancel: &CancelToken) -> Result<Self> {
        Self::with_capacity(decoder, spec, DEFAULT_CAPACITY, cancel)
    }

    pub fn with_capacity(
        decoder: &Decoder,
        spec: FilterSpec,
        capacity: usize,
        cancel: &CancelToken,
    ) -> Result<Self> {
        let upstream_info = decoder.frame_info();
        if spec.medium() != upstream_info.medium() {
            return Err(Error::MediumMismatch);
        }

        let graph = build_graph(&spec, upstream_info)?;
        let info = spec.output_info(upstream_info);

        Ok(Self {
            queue: BoundedQueue::with_capacity(capacity, pools::frame_pool()),
            upstream: Arc::clone(decoder.frames()),
            graph: Arc::new(Mutex::new(SharedGraph(graph))),
            info,
            cancel: cancel.clone(),
            worker: Mutex::new(None),
        })
    }

    /// Frame description of the filter output (what the encoder sees).
    pub fn frame_info(&self) -> &FrameInfo {
        &self.info
    }

    /// The filtered-frame queue the encoder consumes.
    pub fn frames(&self) -> &Arc<BoundedQueue<Frame>> {
        &self.queue
    }

    /// Send a runtime command to an `@id`-addressed filter instance, e.g.
    /// `send_command("prop0_h1", "frequency", "245.00")`.
    pub fn send_command(&self, target: &str, command: &str, argument: &str) -> Result<()> {
        let mut graph = self.graph.lock();
        ffi_ext::graph_send_command(&mut graph.0, target, command, argument)
    }

    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        *worker = Some(spawn_stage(
            "filter",
            FilterStep {
                graph: Arc::clone(&self.graph),
            },
            Arc::clone(&self.upstream),
            Arc::clone(&self.queue),
            self.cancel.clone(),
            POP_DEADLINE,
        ));
    }

    pub fn stop(&self) {
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                warn!("filter worker panicked");
            }
        }
    }
}

fn build_graph(spec: &FilterSpec, upstream: &FrameInfo) -> Result<filter::Graph> {
    crate::ensure_init();

    let (source_name, sink_name) = spec.endpoints();
    let source =
        filter::find(source_name).ok_or(Error::FilterNotFound("buffer source"))?;
    let sink = filter::find(sink_name).ok_or(Error::FilterNotFound("buffer sink"))?;

    let mut graph = filter::Graph::new();
    graph.add(&source, "in", &spec.source_args(upstream))?;
    graph.add(&sink, "out", "")?;

    let content = spec.content();
    let content = if content.is_empty() {
        warn!("no filter content set, frames pass through unchanged");
        spec.passthrough().to_owned()
    } else {
        content
    };

    graph.output("in", 0)?.input("out", 0)?.parse(&content)?;
    graph.validate()?;
    debug!(graph = %graph.dump(), "filter graph configured");

    Ok(graph)
}

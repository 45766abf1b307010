// crates/aircast-media/src/pools.rs
//
// Pool constructors for the two shell kinds that cross stage boundaries.
// Recycling unrefs the shell's refcounted payload; the allocation itself is
// reused by the next acquire.

use std::sync::Arc;

use ffmpeg_the_third as ffmpeg;

use aircast_core::Pool;

use crate::ffi_ext::{unref_frame, unref_packet};

pub(crate) fn packet_pool() -> Arc<Pool<ffmpeg::Packet>> {
    Pool::new(ffmpeg::Packet::empty, unref_packet)
}

pub(crate) fn frame_pool() -> Arc<Pool<ffmpeg::Frame>> {
    Pool::new(|| unsafe { ffmpeg::Frame::empty() }, unref_frame)
}

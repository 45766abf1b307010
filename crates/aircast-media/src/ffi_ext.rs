// crates/aircast-media/src/ffi_ext.rs
//
// The handful of libav calls the binding has no safe surface for: opening an
// input with a forced device format, owning a codec-parameters copy across
// threads, refcount operations on pooled shells, and filter-graph commands.
// Everything else goes through ffmpeg-the-third's safe API.

use std::ffi::CString;
use std::mem::ManuallyDrop;
use std::ptr::{self, NonNull};

use ffmpeg_the_third as ffmpeg;

use ffmpeg::{codec, ffi, format, Dictionary};

use crate::error::{Error, Result};

fn source_cstring(value: &str) -> Result<CString> {
    CString::new(value).map_err(|_| Error::InvalidSource(value.into()))
}

/// `avformat_open_input` + `avformat_find_stream_info`, with an optional
/// forced input format (`alsa`, `avfoundation`, ...) the safe `input()`
/// helpers cannot express.
pub(crate) fn open_input(
    url: &str,
    forced_format: Option<&str>,
    options: Dictionary,
) -> Result<format::context::Input> {
    let url = source_cstring(url)?;

    let input_format = match forced_format {
        Some(name) => {
            let name_c = source_cstring(name)?;
            let found = unsafe { ffi::av_find_input_format(name_c.as_ptr()) };
            if found.is_null() {
                return Err(Error::InputFormatNotFound("forced input format"));
            }
            found
        }
        None => ptr::null(),
    };

    unsafe {
        let mut ctx: *mut ffi::AVFormatContext = ptr::null_mut();
        let mut opts = options.disown();
        // Cast adapts to the pointer mutability this libav major uses.
        let opened =
            ffi::avformat_open_input(&mut ctx, url.as_ptr(), input_format as _, &mut opts);
        // Re-own whatever the call left in the dictionary so it is freed.
        Dictionary::own(opts);
        if opened < 0 {
            return Err(ffmpeg::Error::from(opened).into());
        }

        match ffi::avformat_find_stream_info(ctx, ptr::null_mut()) {
            n if n >= 0 => Ok(format::context::Input::wrap(ctx)),
            e => {
                ffi::avformat_close_input(&mut ctx);
                Err(ffmpeg::Error::from(e).into())
            }
        }
    }
}

/// Owned copy of a stream's `AVCodecParameters`.
///
/// The binding's `Parameters` borrows the format context, which cannot cross
/// threads; this copy can, and outlives the probing context.
pub(crate) struct OwnedParameters(NonNull<ffi::AVCodecParameters>);

// Immutable after construction and freed exactly once by Drop.
unsafe impl Send for OwnedParameters {}
unsafe impl Sync for OwnedParameters {}

impl OwnedParameters {
    pub(crate) fn copy_of(source: &codec::Parameters) -> Result<Self> {
        unsafe {
            let dst = ffi::avcodec_parameters_alloc();
            let Some(dst) = NonNull::new(dst) else {
                return Err(Error::Alloc("codec parameters"));
            };
            match ffi::avcodec_parameters_copy(dst.as_ptr(), source.as_ptr()) {
                n if n >= 0 => Ok(Self(dst)),
                e => {
                    let mut raw = dst.as_ptr();
                    ffi::avcodec_parameters_free(&mut raw);
                    Err(ffmpeg::Error::from(e).into())
                }
            }
        }
    }

    pub(crate) fn codec_id(&self) -> codec::Id {
        unsafe { codec::Id::from((*self.0.as_ptr()).codec_id) }
    }

    pub(crate) fn medium(&self) -> ffmpeg::media::Type {
        unsafe { ffmpeg::media::Type::from((*self.0.as_ptr()).codec_type) }
    }

    /// Fresh `Parameters` clone for `Context::from_parameters`.
    pub(crate) fn to_parameters(&self) -> codec::Parameters {
        // The wrapped view must not run Drop: it does not own our copy.
        let view = ManuallyDrop::new(unsafe { codec::Parameters::wrap(self.0.as_ptr(), None) });
        codec::Parameters::clone(&view)
    }
}

impl Drop for OwnedParameters {
    fn drop(&mut self) {
        unsafe {
            let mut raw = self.0.as_ptr();
            ffi::avcodec_parameters_free(&mut raw);
        }
    }
}

/// Refcount bump: make `dst` share `src`'s payload without copying pixels.
pub(crate) fn ref_frame(
    dst: &mut ffmpeg::Frame,
    src: &ffmpeg::Frame,
) -> std::result::Result<(), ffmpeg::Error> {
    unsafe {
        match ffi::av_frame_ref(dst.as_mut_ptr(), src.as_ptr()) {
            0 => Ok(()),
            e => Err(ffmpeg::Error::from(e)),
        }
    }
}

pub(crate) fn unref_frame(frame: &mut ffmpeg::Frame) {
    unsafe { ffi::av_frame_unref(frame.as_mut_ptr()) }
}

pub(crate) fn unref_packet(packet: &mut ffmpeg::Packet) {
    unsafe { ffi::av_packet_unref(packet.as_mut_ptr()) }
}

/// `avfilter_graph_send_command` against an `@id`-addressed filter instance.
pub(crate) fn graph_send_command(
    graph: &mut ffmpeg::filter::Graph,
    target: &str,
    command: &str,
    argument: &str,
) -> Result<()> {
    let target = source_cstring(target)?;
    let command = source_cstring(command)?;
    let argument = source_cstring(argument)?;

    unsafe {
        let flags = (ffi::AVFILTER_CMD_FLAG_ONE | ffi::AVFILTER_CMD_FLAG_FAST) as i32;
        match ffi::avfilter_graph_send_command(
            graph.as_mut_ptr(),
            target.as_ptr(),
            command.as_ptr(),
            argument.as_ptr(),
            ptr::null_mut(),
            0,
            flags,
        ) {
            n if n >= 0 => Ok(()),
            e => Err(ffmpeg::Error::from(e).into()),
        }
    }
}

pub(crate) fn is_again(err: &ffmpeg::Error) -> bool {
    matches!(err, ffmpeg::Error::Other { errno } if *errno == ffmpeg::util::error::EAGAIN)
}

pub(crate) fn is_drained(err: &ffmpeg::Error) -> bool {
    is_again(err) || matches!(err, ffmpeg::Error::Eof)
}

//! Hardware decoder discovery.
//!
//! Looks up NVDEC (`*_cuvid`), Quick Sync (`*_qsv`) and V4L2 mem2mem
//! decoders by name; callers fall back to the software decoder when none
//! is compiled into the linked FFmpeg.

use ffmpeg_next::codec::Id;

/// Hardware decoder names worth trying for `codec_id`, most preferred first.
pub fn decoder_candidates(codec_id: Id) -> &'static [&'static str] {
    match codec_id {
        Id::H264 => &["h264_cuvid", "h264_qsv", "h264_v4l2m2m"],
        Id::HEVC => &["hevc_cuvid", "hevc_qsv", "hevc_v4l2m2m"],
        Id::VP8 => &["vp8_cuvid", "vp8_qsv", "vp8_v4l2m2m"],
        Id::VP9 => &["vp9_cuvid", "vp9_qsv", "vp9_v4l2m2m"],
        Id::AV1 => &["av1_cuvid", "av1_qsv"],
        Id::MPEG2VIDEO => &["mpeg2_cuvid", "mpeg2_qsv", "mpeg2_v4l2m2m"],
        Id::MPEG4 => &["mpeg4_cuvid", "mpeg4_v4l2m2m"],
        _ => &[],
    }
}

/// First hardware decoder for `codec_id` available in this FFmpeg build.
pub fn find_hw_decoder(codec_id: Id) -> Option<ffmpeg_next::Codec> {
    decoder_candidates(codec_id).iter().find_map(|name| {
        let codec = ffmpeg_next::decoder::find_by_name(name)?;
        log::info!("found hardware decoder: {}", name);
        Some(codec)
    })
}

/// Largest number of decoded pictures a decoder for `codec_id` keeps
/// referenced at once (its decoded picture buffer).
pub fn decoded_picture_buffer(codec_id: Id) -> usize {
    match codec_id {
        Id::H264 | Id::HEVC => 16,
        Id::VP9 | Id::AV1 => 8,
        Id::VP8 => 4,
        _ => 2,
    }
}

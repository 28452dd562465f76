//! Capability descriptions announced on output channels.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, warn};

use crate::manifest::{LogicalStream, QualityLevel, StreamType};

pub const CONTAINER_MEDIA_TYPE: &str = "video/quicktime";
pub const CONTAINER_VARIANT: &str = "mss-fragmented";

const AUDIO_TAG_AAC: u32 = 255;
const AUDIO_TAG_WMA2: u32 = 0x161;
const AUDIO_TAG_WMA_PRO: u32 = 0x162;

const AAC_SAMPLE_RATES: [u32; 13] = [
    96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025, 8_000, 7_350,
];

/// Elementary stream format carried inside the fragmented container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaCaps {
    H264 {
        width: Option<u32>,
        height: Option<u32>,
        /// `avcC` decoder configuration record.
        codec_data: Option<Bytes>,
    },
    Vc1 {
        width: Option<u32>,
        height: Option<u32>,
        codec_data: Option<Bytes>,
    },
    Aac {
        rate: Option<u32>,
        channels: Option<u32>,
        /// AudioSpecificConfig.
        codec_data: Option<Bytes>,
    },
    Wma {
        version: u8,
        rate: Option<u32>,
        channels: Option<u32>,
        bits_per_sample: Option<u32>,
        block_align: Option<u32>,
        codec_data: Option<Bytes>,
    },
}

impl MediaCaps {
    pub fn media_type(&self) -> &'static str {
        match self {
            MediaCaps::H264 { .. } => "video/x-h264",
            MediaCaps::Vc1 { .. } => "video/x-wmv",
            MediaCaps::Aac { .. } => "audio/mpeg",
            MediaCaps::Wma { .. } => "audio/x-wma",
        }
    }

    pub fn codec_data(&self) -> Option<&Bytes> {
        match self {
            MediaCaps::H264 { codec_data, .. }
            | MediaCaps::Vc1 { codec_data, .. }
            | MediaCaps::Aac { codec_data, .. }
            | MediaCaps::Wma { codec_data, .. } => codec_data.as_ref(),
        }
    }
}

impl fmt::Display for MediaCaps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.media_type())?;
        match self {
            MediaCaps::H264 { width, height, .. } => {
                write!(f, ", stream-format=(string)avc")?;
                write_field(f, "width", width)?;
                write_field(f, "height", height)?;
            }
            MediaCaps::Vc1 { width, height, .. } => {
                write!(f, ", wmvversion=(int)3, format=(string)WVC1")?;
                write_field(f, "width", width)?;
                write_field(f, "height", height)?;
            }
            MediaCaps::Aac { rate, channels, .. } => {
                write!(f, ", mpegversion=(int)4")?;
                write_field(f, "rate", rate)?;
                write_field(f, "channels", channels)?;
            }
            MediaCaps::Wma { version, rate, channels, bits_per_sample, block_align, .. } => {
                write!(f, ", wmaversion=(int){version}")?;
                write_field(f, "rate", rate)?;
                write_field(f, "channels", channels)?;
                write_field(f, "depth", bits_per_sample)?;
                write_field(f, "block_align", block_align)?;
            }
        }
        if let Some(codec_data) = self.codec_data() {
            write!(f, ", codec_data=(buffer){}", hex::encode(codec_data))?;
        }
        Ok(())
    }
}

fn write_field(f: &mut fmt::Formatter<'_>, name: &str, value: &Option<u32>) -> fmt::Result {
    match value {
        Some(value) => write!(f, ", {name}=(int){value}"),
        None => Ok(()),
    }
}

/// Caps of an output channel: the fragmented container wrapping [`MediaCaps`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamCaps {
    pub timescale: u64,
    pub media: MediaCaps,
}

impl StreamCaps {
    pub fn media_type(&self) -> &'static str {
        CONTAINER_MEDIA_TYPE
    }

    pub fn variant(&self) -> &'static str {
        CONTAINER_VARIANT
    }
}

impl fmt::Display for StreamCaps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, variant=(string){}, timescale=(guint64){}, media-caps=(GstCaps)[{}]",
            CONTAINER_MEDIA_TYPE, CONTAINER_VARIANT, self.timescale, self.media
        )
    }
}

/// Caps for the stream's currently selected quality level.
pub fn stream_caps(stream: &LogicalStream) -> Option<StreamCaps> {
    let quality = stream.current_quality()?;
    let media = media_caps(stream.stream_type(), quality)?;
    Some(StreamCaps { timescale: stream.timescale(), media })
}

/// Derives the elementary stream caps of a quality level from its FourCC or AudioTag.
pub fn media_caps(stream_type: StreamType, quality: &QualityLevel) -> Option<MediaCaps> {
    let fourcc = quality.fourcc.as_deref().map(str::to_ascii_uppercase);
    let private_data = quality.codec_private_data.as_deref().and_then(decode_private_data);

    let caps = match stream_type {
        StreamType::Video => match fourcc.as_deref() {
            Some("H264") | Some("AVC1") | Some("DAVC") => {
                let nal_length_size = quality.nal_unit_length_field.unwrap_or(4).clamp(1, 4);
                MediaCaps::H264 {
                    width: quality.max_width,
                    height: quality.max_height,
                    codec_data: private_data.and_then(|data| avc_decoder_configuration(&data, nal_length_size)),
                }
            }
            Some("WVC1") => MediaCaps::Vc1 {
                width: quality.max_width,
                height: quality.max_height,
                codec_data: private_data,
            },
            other => {
                warn!("Unsupported video FourCC {:?}", other);
                return None;
            }
        },
        StreamType::Audio => {
            let tag = match fourcc.as_deref() {
                Some("AACL") | Some("AACH") => AUDIO_TAG_AAC,
                Some("WMAP") => AUDIO_TAG_WMA_PRO,
                _ => quality.audio_tag.unwrap_or_default(),
            };
            match tag {
                AUDIO_TAG_AAC => MediaCaps::Aac {
                    rate: quality.sampling_rate,
                    channels: quality.channels,
                    codec_data: private_data.or_else(|| audio_specific_config(quality.sampling_rate?, quality.channels?)),
                },
                AUDIO_TAG_WMA2 | AUDIO_TAG_WMA_PRO => MediaCaps::Wma {
                    version: if tag == AUDIO_TAG_WMA2 { 2 } else { 3 },
                    rate: quality.sampling_rate,
                    channels: quality.channels,
                    bits_per_sample: quality.bits_per_sample,
                    block_align: quality.packet_size,
                    codec_data: private_data,
                },
                _ => {
                    warn!("Unsupported audio FourCC {:?} / AudioTag {:?}", fourcc, quality.audio_tag);
                    return None;
                }
            }
        }
        StreamType::Unknown => return None,
    };

    debug!("Derived caps {}", caps);
    Some(caps)
}

fn decode_private_data(data: &str) -> Option<Bytes> {
    match hex::decode(data.trim()) {
        Ok(bytes) => Some(Bytes::from(bytes)),
        Err(e) => {
            warn!("Ignoring CodecPrivateData that is not valid hex: {e}");
            None
        }
    }
}

/// Splits an Annex-B byte stream on its start codes.
fn annex_b_units(data: &[u8]) -> Vec<&[u8]> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            starts.push(i + 3);
            i += 3;
        } else {
            i += 1;
        }
    }

    starts
        .iter()
        .enumerate()
        .map(|(n, &start)| {
            let mut end = starts.get(n + 1).map(|next| next - 3).unwrap_or(data.len());
            // zero_byte of a four byte start code
            while end > start && data[end - 1] == 0 {
                end -= 1;
            }
            &data[start..end]
        })
        .filter(|unit| !unit.is_empty())
        .collect()
}

/// Builds an `avcC` record from the SPS and PPS units found in Annex-B private data.
fn avc_decoder_configuration(private_data: &[u8], nal_length_size: u8) -> Option<Bytes> {
    let units = annex_b_units(private_data);
    let sps = units.iter().filter(|unit| unit[0] & 0x1f == 7).collect::<Vec<_>>();
    let pps = units.iter().filter(|unit| unit[0] & 0x1f == 8).collect::<Vec<_>>();

    let first = sps.first()?;
    if first.len() < 4 {
        warn!("SPS too short to build the avcC record");
        return None;
    }

    // the record stores 5 bits of SPS count, 8 bits of PPS count and 16 bit unit lengths
    let sps_count = u8::try_from(sps.len()).ok().filter(|count| *count <= 0x1f);
    let pps_count = u8::try_from(pps.len()).ok();
    let (Some(sps_count), Some(pps_count)) = (sps_count, pps_count) else {
        warn!("Too many parameter sets for the avcC record: {} SPS, {} PPS", sps.len(), pps.len());
        return None;
    };
    if sps.iter().chain(&pps).any(|unit| unit.len() > usize::from(u16::MAX)) {
        warn!("Parameter set too long for the avcC record");
        return None;
    }

    let mut out = BytesMut::new();
    out.put_u8(1);
    out.put_slice(&first[1..4]);
    out.put_u8(0xfc | ((nal_length_size - 1) & 0x03));
    out.put_u8(0xe0 | sps_count);
    for unit in &sps {
        out.put_u16(unit.len() as u16);
        out.put_slice(unit);
    }
    out.put_u8(pps_count);
    for unit in &pps {
        out.put_u16(unit.len() as u16);
        out.put_slice(unit);
    }
    Some(out.freeze())
}

/// Two byte AAC-LC AudioSpecificConfig.
fn audio_specific_config(rate: u32, channels: u32) -> Option<Bytes> {
    let index = AAC_SAMPLE_RATES.iter().position(|known| *known == rate)? as u16;
    let config: u16 = (2 << 11) | (index << 7) | (((channels & 0x0f) as u16) << 3);
    Some(Bytes::copy_from_slice(&config.to_be_bytes()))
}

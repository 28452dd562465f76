use std::str::FromStr;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::{debug, trace};

use crate::error::ManifestError;
use crate::manifest::QualityLevel;

/// Typed view of a manifest document before fragment back-fill.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestDocument {
    pub is_live: bool,
    pub timescale: Option<u64>,
    pub duration: Option<u64>,
    pub streams: Vec<StreamIndexNode>,
}

/// A `StreamIndex` element.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamIndexNode {
    pub stream_type: Option<String>,
    pub name: Option<String>,
    pub url: Option<String>,
    pub timescale: Option<u64>,
    pub fragments: Vec<FragmentNode>,
    /// Quality levels in document order.
    pub qualities: Vec<QualityLevel>,
}

/// A `c` element, attributes exactly as written in the document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FragmentNode {
    pub number: Option<u64>,
    pub time: Option<u64>,
    pub duration: Option<u64>,
    pub repeat: Option<u64>,
}

impl FragmentNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn number(mut self, number: u64) -> Self {
        self.number = Some(number);
        self
    }

    pub fn time(mut self, time: u64) -> Self {
        self.time = Some(time);
        self
    }

    pub fn duration(mut self, duration: u64) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn repeat(mut self, repeat: u64) -> Self {
        self.repeat = Some(repeat);
        self
    }
}

impl ManifestDocument {
    pub fn parse(data: &[u8]) -> Result<Self, ManifestError> {
        let mut reader = Reader::from_reader(data);
        reader.config_mut().trim_text(true);

        let mut parser = DocumentParser::default();
        let mut buf = Vec::new();

        loop {
            match reader.read_event_into(&mut buf)? {
                Event::Start(ref e) => parser.open(e, false)?,
                Event::Empty(ref e) => parser.open(e, true)?,
                Event::End(ref e) => {
                    if e.local_name().as_ref() == b"StreamIndex" {
                        parser.close_stream();
                    }
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        parser.finish()
    }
}

#[derive(Default)]
struct DocumentParser {
    document: ManifestDocument,
    seen_root: bool,
    current_stream: Option<StreamIndexNode>,
}

impl DocumentParser {
    fn open(&mut self, e: &BytesStart, empty: bool) -> Result<(), ManifestError> {
        match e.local_name().as_ref() {
            b"SmoothStreamingMedia" => {
                self.seen_root = true;
                for attr in e.attributes() {
                    let attr = attr?;
                    let value = attr.unescape_value()?;
                    match attr.key.local_name().as_ref() {
                        b"IsLive" => self.document.is_live = value.eq_ignore_ascii_case("true"),
                        b"TimeScale" => self.document.timescale = Some(parse_number("TimeScale", &value)?),
                        b"Duration" => self.document.duration = Some(parse_number("Duration", &value)?),
                        _ => {}
                    }
                }
            }
            b"StreamIndex" if self.seen_root => {
                // an unterminated previous StreamIndex is kept as is
                self.close_stream();

                let mut stream = StreamIndexNode::default();
                for attr in e.attributes() {
                    let attr = attr?;
                    let value = attr.unescape_value()?;
                    match attr.key.local_name().as_ref() {
                        b"Type" => stream.stream_type = Some(value.into_owned()),
                        b"Name" => stream.name = Some(value.into_owned()),
                        b"Url" => stream.url = Some(value.into_owned()),
                        b"TimeScale" => stream.timescale = Some(parse_number("TimeScale", &value)?),
                        _ => {}
                    }
                }
                trace!("StreamIndex {:?} ({:?})", stream.stream_type, stream.name);

                if empty {
                    self.document.streams.push(stream);
                } else {
                    self.current_stream = Some(stream);
                }
            }
            b"c" => {
                if let Some(stream) = self.current_stream.as_mut() {
                    stream.fragments.push(parse_fragment(e)?);
                }
            }
            b"QualityLevel" => {
                if let Some(stream) = self.current_stream.as_mut() {
                    stream.qualities.push(parse_quality_level(e)?);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn close_stream(&mut self) {
        if let Some(stream) = self.current_stream.take() {
            self.document.streams.push(stream);
        }
    }

    fn finish(mut self) -> Result<ManifestDocument, ManifestError> {
        if !self.seen_root {
            return Err(ManifestError::MissingRoot);
        }
        self.close_stream();
        debug!("Parsed manifest document with {} StreamIndex elements", self.document.streams.len());
        Ok(self.document)
    }
}

fn parse_fragment(e: &BytesStart) -> Result<FragmentNode, ManifestError> {
    let mut fragment = FragmentNode::default();
    for attr in e.attributes() {
        let attr = attr?;
        let value = attr.unescape_value()?;
        match attr.key.local_name().as_ref() {
            b"n" => fragment.number = Some(parse_number("n", &value)?),
            b"t" => fragment.time = Some(parse_number("t", &value)?),
            b"d" => fragment.duration = Some(parse_number("d", &value)?),
            b"r" => fragment.repeat = Some(parse_number("r", &value)?),
            _ => {}
        }
    }
    Ok(fragment)
}

fn parse_quality_level(e: &BytesStart) -> Result<QualityLevel, ManifestError> {
    let mut quality = QualityLevel::default();
    for attr in e.attributes() {
        let attr = attr?;
        let value = attr.unescape_value()?;
        match attr.key.local_name().as_ref() {
            b"Bitrate" => quality.bitrate = parse_number("Bitrate", &value)?,
            b"FourCC" => quality.fourcc = Some(value.into_owned()).filter(|fourcc| !fourcc.is_empty()),
            b"CodecPrivateData" => {
                quality.codec_private_data = Some(value.into_owned()).filter(|data| !data.is_empty())
            }
            b"MaxWidth" => quality.max_width = Some(parse_number("MaxWidth", &value)?),
            b"MaxHeight" => quality.max_height = Some(parse_number("MaxHeight", &value)?),
            b"SamplingRate" => quality.sampling_rate = Some(parse_number("SamplingRate", &value)?),
            b"Channels" => quality.channels = Some(parse_number("Channels", &value)?),
            b"BitsPerSample" => quality.bits_per_sample = Some(parse_number("BitsPerSample", &value)?),
            b"PacketSize" => quality.packet_size = Some(parse_number("PacketSize", &value)?),
            b"AudioTag" => quality.audio_tag = Some(parse_number("AudioTag", &value)?),
            b"NALUnitLengthField" => {
                quality.nal_unit_length_field = Some(parse_number("NALUnitLengthField", &value)?)
            }
            _ => {}
        }
    }
    Ok(quality)
}

fn parse_number<T: FromStr>(name: &str, value: &str) -> Result<T, ManifestError> {
    value.trim().parse::<T>().map_err(|_| ManifestError::InvalidAttribute {
        name: name.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_root_and_stream_attributes() {
        let xml = r#"<SmoothStreamingMedia IsLive="TRUE" TimeScale="1000" Duration="0">
  <StreamIndex Type="audio" Name="audio_eng" Url="a/{bitrate}/{start_time}" TimeScale="44100">
    <QualityLevel Bitrate="128000" FourCC="AACL" SamplingRate="44100" Channels="2" CodecPrivateData="1210" />
    <c n="7" t="0" d="88200" r="3" />
  </StreamIndex>
</SmoothStreamingMedia>"#;
        let doc = ManifestDocument::parse(xml.as_bytes()).unwrap();

        assert!(doc.is_live);
        assert_eq!(doc.timescale, Some(1000));
        assert_eq!(doc.duration, Some(0));
        let stream = &doc.streams[0];
        assert_eq!(stream.stream_type.as_deref(), Some("audio"));
        assert_eq!(stream.name.as_deref(), Some("audio_eng"));
        assert_eq!(stream.timescale, Some(44_100));
        assert_eq!(stream.fragments, vec![FragmentNode::new().number(7).time(0).duration(88_200).repeat(3)]);
        let quality = &stream.qualities[0];
        assert_eq!(quality.bitrate, 128_000);
        assert_eq!(quality.channels, Some(2));
        assert_eq!(quality.codec_private_data.as_deref(), Some("1210"));
    }

    #[test]
    fn accepts_empty_stream_index() {
        let xml = r#"<SmoothStreamingMedia><StreamIndex Type="text" /></SmoothStreamingMedia>"#;
        let doc = ManifestDocument::parse(xml.as_bytes()).unwrap();
        assert_eq!(doc.streams.len(), 1);
        assert!(doc.streams[0].fragments.is_empty());
    }

    #[test]
    fn rejects_non_numeric_attributes() {
        let xml = r#"<SmoothStreamingMedia><StreamIndex Type="video"><c t="soon" /></StreamIndex></SmoothStreamingMedia>"#;
        let err = ManifestDocument::parse(xml.as_bytes()).unwrap_err();
        assert!(matches!(err, ManifestError::InvalidAttribute { ref name, .. } if name == "t"));
    }

    #[test]
    fn rejects_documents_without_root() {
        let err = ManifestDocument::parse(b"<MPD></MPD>").unwrap_err();
        assert!(matches!(err, ManifestError::MissingRoot));
    }

    #[test]
    fn rejects_malformed_xml() {
        let xml = r#"<SmoothStreamingMedia><StreamIndex Type="video"></Oops></SmoothStreamingMedia>"#;
        assert!(ManifestDocument::parse(xml.as_bytes()).is_err());
    }
}

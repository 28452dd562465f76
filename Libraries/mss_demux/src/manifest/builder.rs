use std::io::Cursor;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::Writer;

use crate::manifest::parser::{FragmentNode, ManifestDocument, StreamIndexNode};
use crate::manifest::QualityLevel;

/// Writes Smooth Streaming manifests.
#[derive(Debug, Clone, Default)]
pub struct ManifestBuilder {
    document: ManifestDocument,
}

impl ManifestBuilder {
    pub fn vod(duration: u64) -> Self {
        Self {
            document: ManifestDocument {
                duration: Some(duration),
                ..ManifestDocument::default()
            },
        }
    }

    /**
     * Live presentations advertise `IsLive="TRUE"` and no duration; clients
     * reload the document to discover new fragments.
     */
    pub fn live() -> Self {
        Self {
            document: ManifestDocument {
                is_live: true,
                ..ManifestDocument::default()
            },
        }
    }

    pub fn from_document(document: ManifestDocument) -> Self {
        Self { document }
    }

    /**
     * Presentation wide timescale in ticks per second. Streams without their
     * own `TimeScale` inherit it.
     */
    pub fn timescale(mut self, timescale: u64) -> Self {
        self.document.timescale = Some(timescale);
        self
    }

    pub fn stream(mut self, stream: StreamIndexNode) -> Self {
        self.document.streams.push(stream);
        self
    }

    pub fn document(&self) -> &ManifestDocument {
        &self.document
    }

    pub fn build_xml_string(&self) -> Result<String, Box<dyn std::error::Error>> {
        let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let mut root = BytesStart::new("SmoothStreamingMedia");
        root.push_attribute(("MajorVersion", "2"));
        root.push_attribute(("MinorVersion", "0"));
        if let Some(timescale) = self.document.timescale {
            root.push_attribute(("TimeScale", timescale.to_string().as_str()));
        }
        if let Some(duration) = self.document.duration {
            root.push_attribute(("Duration", duration.to_string().as_str()));
        }
        if self.document.is_live {
            root.push_attribute(("IsLive", "TRUE"));
        }
        writer.write_event(Event::Start(root))?;

        for stream in &self.document.streams {
            write_stream(&mut writer, stream)?;
        }

        writer.write_event(Event::End(BytesEnd::new("SmoothStreamingMedia")))?;

        let result = writer.into_inner().into_inner();
        Ok(String::from_utf8(result)?)
    }
}

fn write_stream(writer: &mut Writer<Cursor<Vec<u8>>>, stream: &StreamIndexNode) -> Result<(), Box<dyn std::error::Error>> {
    let mut element = BytesStart::new("StreamIndex");
    if let Some(stream_type) = &stream.stream_type {
        element.push_attribute(("Type", stream_type.as_str()));
    }
    if let Some(name) = &stream.name {
        element.push_attribute(("Name", name.as_str()));
    }
    if let Some(url) = &stream.url {
        element.push_attribute(("Url", url.as_str()));
    }
    if let Some(timescale) = stream.timescale {
        element.push_attribute(("TimeScale", timescale.to_string().as_str()));
    }
    element.push_attribute(("QualityLevels", stream.qualities.len().to_string().as_str()));
    element.push_attribute(("Chunks", stream.fragments.len().to_string().as_str()));
    writer.write_event(Event::Start(element))?;

    for (index, quality) in stream.qualities.iter().enumerate() {
        writer.write_event(Event::Empty(quality_element(index, quality)))?;
    }
    for fragment in &stream.fragments {
        writer.write_event(Event::Empty(fragment_element(fragment)))?;
    }

    writer.write_event(Event::End(BytesEnd::new("StreamIndex")))?;
    Ok(())
}

fn quality_element(index: usize, quality: &QualityLevel) -> BytesStart<'static> {
    let mut element = BytesStart::new("QualityLevel");
    element.push_attribute(("Index", index.to_string().as_str()));
    element.push_attribute(("Bitrate", quality.bitrate.to_string().as_str()));
    if let Some(fourcc) = &quality.fourcc {
        element.push_attribute(("FourCC", fourcc.as_str()));
    }

    let numbers = [
        ("MaxWidth", quality.max_width),
        ("MaxHeight", quality.max_height),
        ("SamplingRate", quality.sampling_rate),
        ("Channels", quality.channels),
        ("BitsPerSample", quality.bits_per_sample),
        ("PacketSize", quality.packet_size),
        ("AudioTag", quality.audio_tag),
        ("NALUnitLengthField", quality.nal_unit_length_field.map(u32::from)),
    ];
    for (name, value) in numbers {
        if let Some(value) = value {
            element.push_attribute((name, value.to_string().as_str()));
        }
    }

    if let Some(data) = &quality.codec_private_data {
        element.push_attribute(("CodecPrivateData", data.as_str()));
    }
    element
}

fn fragment_element(fragment: &FragmentNode) -> BytesStart<'static> {
    let mut element = BytesStart::new("c");
    let attributes = [
        ("n", fragment.number),
        ("t", fragment.time),
        ("d", fragment.duration),
        ("r", fragment.repeat),
    ];
    for (name, value) in attributes {
        if let Some(value) = value {
            element.push_attribute((name, value.to_string().as_str()));
        }
    }
    element
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Manifest;

    fn video_stream() -> StreamIndexNode {
        StreamIndexNode {
            stream_type: Some("video".into()),
            name: Some("video".into()),
            url: Some("QualityLevels({bitrate})/Fragments(video={start time})".into()),
            fragments: vec![
                FragmentNode::new().time(0).duration(20_000_000).repeat(2),
                FragmentNode::new().duration(10_000_000),
            ],
            qualities: vec![QualityLevel {
                bitrate: 500_000,
                fourcc: Some("H264".into()),
                codec_private_data: Some("000000016742C01EDA01E0089F96100000000168CE3C80".into()),
                max_width: Some(640),
                max_height: Some(360),
                ..QualityLevel::default()
            }],
            ..StreamIndexNode::default()
        }
    }

    #[test]
    fn written_document_parses_back() {
        let builder = ManifestBuilder::vod(50_000_000).stream(video_stream());
        let xml = builder.build_xml_string().unwrap();

        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        let parsed = ManifestDocument::parse(xml.as_bytes()).unwrap();
        assert_eq!(&parsed, builder.document());
    }

    #[test]
    fn live_document_has_no_duration() {
        let xml = ManifestBuilder::live()
            .timescale(1000)
            .stream(video_stream())
            .build_xml_string()
            .unwrap();
        assert!(xml.contains("IsLive=\"TRUE\""));
        assert!(!xml.contains("Duration="));

        let manifest = Manifest::parse(xml.as_bytes()).unwrap();
        assert!(manifest.is_live());
        assert_eq!(manifest.timescale(), 1000);
        let stream = manifest.streams()[0].lock();
        assert_eq!(stream.fragments().len(), 3);
    }
}

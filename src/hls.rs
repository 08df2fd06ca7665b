//! HLS playlist parsing and multi-period concatenation.
//!
//! For multi-period VOD, each period's packager writes its own master and
//! media playlists under `period_<n>/`. Concatenation parses every per-period
//! master, rewrites segment URIs to be relative to the common output
//! directory, matches stream variants across periods, and emits one combined
//! master plus one `stream_<n>.m3u8` per matched variant.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use crate::config::MediaKind;
use crate::error::{Error, Result};
use crate::stream::{OutputStreamPlan, StreamDetail};

/// Tags that must appear exactly once, at the top of a media playlist. They
/// are stripped during parsing and re-emitted by the concatenator.
const HEADER_TAGS: &[&str] = &["#EXTM3U", "#EXT-X-VERSION", "#EXT-X-PLAYLIST-TYPE"];

/// Extract the attributes of an `#EXT-X-…:K1=V1,K2="V2",…` line. Quoted
/// values keep embedded commas; unquoted values end at the next comma.
pub fn extract_attributes(line: &str) -> BTreeMap<String, String> {
    let mut attributes = BTreeMap::new();
    let Some((_, rest)) = line.split_once(':') else {
        return attributes;
    };
    // A trailing comma makes the regex terminate the last value.
    let rest = format!("{rest},");
    let re = regex::Regex::new(r#"([-A-Z0-9]+)=("[^"]*"|[^",]*),"#).unwrap();
    for caps in re.captures_iter(&rest) {
        attributes.insert(caps[1].to_string(), caps[2].trim_matches('"').to_string());
    }
    attributes
}

fn quote(s: &str) -> String {
    format!("\"{s}\"")
}

/// The tuple that matches a stream variant across periods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariantKey {
    Video { codec: String, resolution: String },
    Audio { codec: String, layout: String, language: String },
    Text { language: String },
}

/// One parsed media playlist, rewritten relative to the output directory.
#[derive(Debug, Clone)]
pub struct ParsedMediaPlaylist {
    pub content: String,
    pub duration: f64,
    pub target_duration: u64,
    pub version: Option<u64>,
    /// Basename of the first media segment, used to match the playlist to
    /// its output stream plan.
    pub first_segment: Option<String>,
}

/// Parse one media playlist, rewriting segment and init URIs under
/// `period_rel` (the period directory relative to the output directory).
pub fn parse_media_playlist(text: &str, period_rel: &str) -> Result<ParsedMediaPlaylist> {
    let mut parsed = ParsedMediaPlaylist {
        content: String::new(),
        duration: 0.0,
        target_duration: 0,
        version: None,
        first_segment: None,
    };

    let mut lines = text.lines();
    while let Some(line) = lines.next() {
        if let Some(info) = line.strip_prefix("#EXTINF:") {
            let duration: f64 = info
                .split(',')
                .next()
                .unwrap_or_default()
                .trim()
                .parse()
                .map_err(|_| {
                    Error::Internal(format!("unparseable #EXTINF line: {line}"))
                })?;
            parsed.duration += duration;
            parsed.content.push_str(line);
            parsed.content.push('\n');

            let mut next = lines.next().unwrap_or_default();
            if next.starts_with("#EXT-X-BYTERANGE") {
                parsed.content.push_str(next);
                parsed.content.push('\n');
                next = lines.next().unwrap_or_default();
            }
            if parsed.first_segment.is_none() {
                parsed.first_segment =
                    Some(next.rsplit('/').next().unwrap_or(next).to_string());
            }
            // Playlist URIs always use forward slashes.
            let _ = writeln!(parsed.content, "{period_rel}/{next}");
        } else if line.starts_with("#EXT-X-MAP") {
            // An EXT-X-MAP has a URI attribute and optionally a BYTERANGE.
            let attributes = extract_attributes(line);
            let uri = attributes.get("URI").cloned().unwrap_or_default();
            let _ = write!(
                parsed.content,
                "#EXT-X-MAP:URI={}",
                quote(&format!("{period_rel}/{uri}"))
            );
            if let Some(byterange) = attributes.get("BYTERANGE") {
                let _ = write!(parsed.content, ",BYTERANGE={}", quote(byterange));
            }
            parsed.content.push('\n');
        } else if let Some(value) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
            parsed.target_duration = value.trim().parse().map_err(|_| {
                Error::Internal(format!("unparseable #EXT-X-TARGETDURATION line: {line}"))
            })?;
        } else if let Some(value) = line.strip_prefix("#EXT-X-VERSION:") {
            parsed.version = value.trim().parse().ok();
        } else if line.starts_with("#EXT-X-ENDLIST")
            || HEADER_TAGS.iter().any(|tag| line.starts_with(tag))
        {
            // Header and end-list tags are emitted once by the concatenator.
        } else if line.trim().is_empty() {
            // Drop blank lines.
        } else {
            // Keep everything else: encryption keys, discontinuities, etc.
            parsed.content.push_str(line);
            parsed.content.push('\n');
        }
    }

    Ok(parsed)
}

/// Find the plan whose output file names produced `file_name`.
pub fn match_plan<'a>(
    plans: &'a [OutputStreamPlan],
    file_name: &str,
) -> Option<&'a OutputStreamPlan> {
    plans.iter().find(|plan| {
        if plan.single_seg_file() == file_name {
            return true;
        }
        let pattern = format!(
            "^{}$",
            regex::escape(&plan.media_seg_file()).replace(r"\$Number\$", r"\d+")
        );
        regex::Regex::new(&pattern)
            .map(|re| re.is_match(file_name))
            .unwrap_or(false)
    })
}

/// Build the cross-period matching key for a parsed playlist.
///
/// Codec, resolution, and channel layout come from the plan (the master's
/// CODECS attribute interleaves audio and video codecs and cannot be matched
/// per stream); the language comes from the master's attributes because the
/// packager normalises language tags.
pub fn variant_key(plan: &OutputStreamPlan, attributes: &BTreeMap<String, String>) -> VariantKey {
    let language = attributes
        .get("LANGUAGE")
        .cloned()
        .unwrap_or_else(|| "und".into());
    match plan.detail() {
        StreamDetail::Video {
            codec,
            resolution_name,
            ..
        } => VariantKey::Video {
            codec: codec.name.as_str().into(),
            resolution: resolution_name.clone(),
        },
        StreamDetail::Audio {
            codec, layout_name, ..
        } => VariantKey::Audio {
            codec: codec.as_str().into(),
            layout: layout_name.clone(),
            language,
        },
        StreamDetail::Text => VariantKey::Text { language },
    }
}

/// One stream referenced from a period's master playlist.
#[derive(Debug, Clone)]
pub struct ParsedStream {
    /// The raw attribute text of the referencing tag line.
    pub tag_attrs: String,
    pub key: VariantKey,
    pub media_kind: MediaKind,
    pub playlist: ParsedMediaPlaylist,
}

/// Everything the concatenator needs from one period.
#[derive(Debug, Clone, Default)]
pub struct ParsedMaster {
    /// `#EXT-X-MEDIA` entries (audio and subtitles).
    pub medias: Vec<ParsedStream>,
    /// `#EXT-X-STREAM-INF` entries (video variants).
    pub variants: Vec<ParsedStream>,
}

/// Parse one period's master playlist and every media playlist it references.
pub fn parse_period_master(
    output_dir: &Path,
    period_dir: &Path,
    hls_output: &str,
    plans: &[OutputStreamPlan],
) -> Result<ParsedMaster> {
    let period_rel = period_dir
        .strip_prefix(output_dir)
        .unwrap_or(period_dir)
        .to_string_lossy()
        .replace('\\', "/");

    let master_path = period_dir.join(hls_output);
    let master_text = std::fs::read_to_string(&master_path)?;

    let mut parsed = ParsedMaster::default();
    let mut lines = master_text.lines();

    while let Some(line) = lines.next() {
        if line.starts_with("#EXT-X-MEDIA:") {
            let attributes = extract_attributes(line);
            let Some(uri) = attributes.get("URI") else {
                continue;
            };
            let stream =
                parse_referenced(period_dir, &period_rel, uri, line, &attributes, plans)?;
            parsed.medias.push(stream);
        } else if line.starts_with("#EXT-X-STREAM-INF:") {
            let attributes = extract_attributes(line);
            let uri = lines
                .next()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .ok_or_else(|| {
                    Error::Internal(format!(
                        "master playlist {} has a variant tag without a URI",
                        master_path.display()
                    ))
                })?;
            let stream = parse_referenced(period_dir, &period_rel, uri, line, &attributes, plans)?;
            parsed.variants.push(stream);
        }
    }

    Ok(parsed)
}

fn parse_referenced(
    period_dir: &Path,
    period_rel: &str,
    uri: &str,
    tag_line: &str,
    attributes: &BTreeMap<String, String>,
    plans: &[OutputStreamPlan],
) -> Result<ParsedStream> {
    let text = std::fs::read_to_string(period_dir.join(uri))?;
    let playlist = parse_media_playlist(&text, period_rel)?;

    let first_segment = playlist.first_segment.as_deref().ok_or_else(|| {
        Error::Internal(format!("no media file found in playlist {uri}"))
    })?;
    let plan = match_plan(plans, first_segment).ok_or_else(|| {
        Error::Internal(format!(
            "no output stream matches playlist {uri} (first segment {first_segment})"
        ))
    })?;

    let tag_attrs = tag_line
        .split_once(':')
        .map(|(_, rest)| rest.to_string())
        .unwrap_or_default();

    let key = variant_key(plan, attributes);
    let media_kind = plan.media_kind();

    Ok(ParsedStream {
        tag_attrs,
        key,
        media_kind,
        playlist,
    })
}

struct ConcatGroup {
    tag_attrs: String,
    media_kind: MediaKind,
    key: VariantKey,
    playlists: Vec<ParsedMediaPlaylist>,
}

fn group_streams(
    periods: &[ParsedMaster],
    pick: fn(&ParsedMaster) -> &Vec<ParsedStream>,
) -> Vec<ConcatGroup> {
    let mut groups: Vec<ConcatGroup> = Vec::new();
    for period in periods {
        for stream in pick(period) {
            match groups.iter_mut().find(|g| g.key == stream.key) {
                Some(group) => group.playlists.push(stream.playlist.clone()),
                None => groups.push(ConcatGroup {
                    tag_attrs: stream.tag_attrs.clone(),
                    media_kind: stream.media_kind,
                    key: stream.key.clone(),
                    playlists: vec![stream.playlist.clone()],
                }),
            }
        }
    }
    groups
}

fn write_stream_playlist(group: &ConcatGroup) -> String {
    let version = group
        .playlists
        .iter()
        .filter_map(|p| p.version)
        .max()
        .unwrap_or(6);
    let target_duration = group
        .playlists
        .iter()
        .map(|p| p.target_duration)
        .max()
        .unwrap_or(0);

    let mut out = String::new();
    let _ = writeln!(out, "#EXTM3U");
    let _ = writeln!(out, "#EXT-X-VERSION:{version}");
    let _ = writeln!(out, "#EXT-X-PLAYLIST-TYPE:VOD");
    let _ = writeln!(out, "#EXT-X-TARGETDURATION:{target_duration}");
    for playlist in &group.playlists {
        out.push_str(&playlist.content);
    }
    let _ = writeln!(out, "#EXT-X-ENDLIST");
    out
}

fn replace_uri_attr(tag_attrs: &str, new_uri: &str) -> String {
    let re = regex::Regex::new(r#"URI="[^"]*""#).unwrap();
    re.replace(tag_attrs, format!("URI=\"{new_uri}\"").as_str())
        .into_owned()
}

/// Concatenate the per-period playlists into `output_dir`. Variant files are
/// named `stream_<n>.m3u8` with a counter shared across all stream kinds.
pub fn concat_periods(
    periods: &[ParsedMaster],
    output_dir: &Path,
    hls_output: &str,
) -> Result<()> {
    let media_groups = group_streams(periods, |p| &p.medias);
    let variant_groups = group_streams(periods, |p| &p.variants);

    let mut master = String::new();
    let _ = writeln!(master, "#EXTM3U");

    let mut stream_index = 0usize;
    for group in &media_groups {
        let file_name = format!("stream_{stream_index}.m3u8");
        stream_index += 1;
        std::fs::write(output_dir.join(&file_name), write_stream_playlist(group))?;
        let _ = writeln!(
            master,
            "#EXT-X-MEDIA:{}",
            replace_uri_attr(&group.tag_attrs, &file_name)
        );
    }

    for group in &variant_groups {
        let file_name = format!("stream_{stream_index}.m3u8");
        stream_index += 1;
        std::fs::write(output_dir.join(&file_name), write_stream_playlist(group))?;
        let _ = writeln!(master, "#EXT-X-STREAM-INF:{}", group.tag_attrs);
        let _ = writeln!(master, "{file_name}");
    }

    std::fs::write(output_dir.join(hls_output), master)?;
    Ok(())
}

/// Total duration of every variant group, keyed for tests and logging.
pub fn total_duration(periods: &[ParsedMaster]) -> f64 {
    group_streams(periods, |p| &p.variants)
        .first()
        .map(|group| group.playlists.iter().map(|p| p.duration).sum())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{from_yaml_str, AudioCodec, BitrateConfig, Input, VideoCodec, VideoCodecName};
    use std::fmt::Write as _;

    #[test]
    fn attribute_parsing_round_trip() {
        let line = r#"#EXT-X-MEDIA:TYPE=AUDIO,URI="audio.m3u8",GROUP-ID="default-audio-group",LANGUAGE="en",NAME="stream_1",CHANNELS="2""#;
        let attributes = extract_attributes(line);
        assert_eq!(attributes["TYPE"], "AUDIO");
        assert_eq!(attributes["URI"], "audio.m3u8");
        assert_eq!(attributes["GROUP-ID"], "default-audio-group");
        assert_eq!(attributes["LANGUAGE"], "en");
        assert_eq!(attributes["CHANNELS"], "2");
    }

    #[test]
    fn quoted_values_keep_embedded_commas() {
        let line = r#"#EXT-X-STREAM-INF:BANDWIDTH=2000000,CODECS="avc1.64001f,mp4a.40.2",RESOLUTION=1280x720"#;
        let attributes = extract_attributes(line);
        assert_eq!(attributes["CODECS"], "avc1.64001f,mp4a.40.2");
        assert_eq!(attributes["BANDWIDTH"], "2000000");
        assert_eq!(attributes["RESOLUTION"], "1280x720");
    }

    const MEDIA_PLAYLIST: &str = "#EXTM3U\n\
#EXT-X-VERSION:6\n\
#EXT-X-PLAYLIST-TYPE:VOD\n\
#EXT-X-TARGETDURATION:4\n\
#EXT-X-MAP:URI=\"video_720p_2M_h264_init.mp4\"\n\
#EXTINF:4.004,\n\
video_720p_2M_h264_1.mp4\n\
#EXTINF:2.002,\n\
video_720p_2M_h264_2.mp4\n\
#EXT-X-ENDLIST\n";

    #[test]
    fn media_playlist_parsing_rewrites_uris() {
        let parsed = parse_media_playlist(MEDIA_PLAYLIST, "period_1").unwrap();
        assert!((parsed.duration - 6.006).abs() < 1e-9);
        assert_eq!(parsed.target_duration, 4);
        assert_eq!(parsed.version, Some(6));
        assert_eq!(parsed.first_segment.as_deref(), Some("video_720p_2M_h264_1.mp4"));
        assert!(parsed
            .content
            .contains("#EXT-X-MAP:URI=\"period_1/video_720p_2M_h264_init.mp4\""));
        assert!(parsed.content.contains("period_1/video_720p_2M_h264_1.mp4"));
        // Header tags and ENDLIST are stripped.
        assert!(!parsed.content.contains("#EXTM3U"));
        assert!(!parsed.content.contains("#EXT-X-ENDLIST"));
        assert!(!parsed.content.contains("#EXT-X-TARGETDURATION"));
    }

    #[test]
    fn byterange_lines_are_kept_with_their_segment() {
        let text = "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXTINF:4.0,\n#EXT-X-BYTERANGE:1000@0\nseg.mp4\n#EXT-X-ENDLIST\n";
        let parsed = parse_media_playlist(text, "period_2").unwrap();
        assert!(parsed.content.contains("#EXT-X-BYTERANGE:1000@0\nperiod_2/seg.mp4"));
    }

    fn video_plan(dir: &Path) -> OutputStreamPlan {
        let input: Input = from_yaml_str(
            "Input",
            "name: in.mp4\nmedia_type: video\nframe_rate: 30\nresolution: 720p\n",
        )
        .unwrap();
        let bitrate = BitrateConfig::default();
        OutputStreamPlan::video(
            0,
            &input,
            VideoCodec::software(VideoCodecName::H264),
            "720p",
            bitrate.resolution("720p").unwrap(),
            dir,
        )
        .unwrap()
    }

    fn audio_plan(dir: &Path) -> OutputStreamPlan {
        let input: Input = from_yaml_str(
            "Input",
            "name: in.mp4\nmedia_type: audio\nlanguage: en\nchannel_layout: stereo\n",
        )
        .unwrap();
        let bitrate = BitrateConfig::default();
        OutputStreamPlan::audio(
            0,
            &input,
            AudioCodec::Aac,
            "stereo",
            bitrate.channel_layout("stereo").unwrap(),
            dir,
        )
        .unwrap()
    }

    #[test]
    fn plans_match_by_segment_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let plans = vec![video_plan(dir.path()), audio_plan(dir.path())];
        // Numbered media segment.
        let matched = match_plan(&plans, "video_720p_2M_h264_17.mp4").unwrap();
        assert_eq!(matched.media_kind(), MediaKind::Video);
        // Single-file output.
        let matched = match_plan(&plans, "audio_en_2c_128k_aac.mp4").unwrap();
        assert_eq!(matched.media_kind(), MediaKind::Audio);
        assert!(match_plan(&plans, "unrelated.mp4").is_none());
    }

    fn write_period(
        output_dir: &Path,
        period: &str,
        segment_prefix: &str,
        durations: &[f64],
    ) {
        let period_dir = output_dir.join(period);
        std::fs::create_dir_all(&period_dir).unwrap();

        let mut media = String::from(
            "#EXTM3U\n#EXT-X-VERSION:6\n#EXT-X-PLAYLIST-TYPE:VOD\n#EXT-X-TARGETDURATION:4\n",
        );
        let _ = writeln!(media, "#EXT-X-MAP:URI=\"{segment_prefix}_init.mp4\"");
        for (index, duration) in durations.iter().enumerate() {
            let _ = writeln!(media, "#EXTINF:{duration},");
            let _ = writeln!(media, "{segment_prefix}_{}.mp4", index + 1);
        }
        media.push_str("#EXT-X-ENDLIST\n");
        std::fs::write(period_dir.join("stream_0.m3u8"), media).unwrap();

        let master = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=2105056,AVERAGE-BANDWIDTH=2000000,CODECS=\"avc1.64001f\",RESOLUTION=1280x720,FRAME-RATE=30.000\nstream_0.m3u8\n";
        std::fs::write(period_dir.join("hls.m3u8"), master).unwrap();
    }

    #[test]
    fn single_period_concat_is_equivalent_to_the_input() {
        let out = tempfile::tempdir().unwrap();
        let pipe_dir = tempfile::tempdir().unwrap();
        write_period(out.path(), "period_1", "video_720p_2M_h264", &[4.0, 4.0, 2.0]);
        let plans = vec![video_plan(pipe_dir.path())];

        let parsed = parse_period_master(
            out.path(),
            &out.path().join("period_1"),
            "hls.m3u8",
            &plans,
        )
        .unwrap();
        assert_eq!(parsed.variants.len(), 1);
        assert!((total_duration(&[parsed.clone()]) - 10.0).abs() < 1e-9);

        concat_periods(&[parsed], out.path(), "hls.m3u8").unwrap();

        let master = std::fs::read_to_string(out.path().join("hls.m3u8")).unwrap();
        assert!(master.starts_with("#EXTM3U\n"));
        assert!(master.contains("#EXT-X-STREAM-INF:BANDWIDTH=2105056"));
        assert!(master.contains("\nstream_0.m3u8\n"));

        let stream = std::fs::read_to_string(out.path().join("stream_0.m3u8")).unwrap();
        assert_eq!(stream.matches("#EXTM3U").count(), 1);
        assert_eq!(stream.matches("#EXT-X-ENDLIST").count(), 1);
        assert!(stream.contains("#EXT-X-PLAYLIST-TYPE:VOD"));
        assert!(stream.contains("#EXT-X-TARGETDURATION:4"));
        assert!(stream.contains("period_1/video_720p_2M_h264_1.mp4"));
        assert!(stream.contains("#EXT-X-MAP:URI=\"period_1/video_720p_2M_h264_init.mp4\""));
    }

    #[test]
    fn two_periods_concatenate_with_summed_duration() {
        let out = tempfile::tempdir().unwrap();
        let pipe_dir = tempfile::tempdir().unwrap();
        write_period(out.path(), "period_1", "video_720p_2M_h264", &[4.0, 4.0]);
        write_period(out.path(), "period_2", "video_720p_2M_h264", &[4.0, 3.0]);
        let plans_one = vec![video_plan(pipe_dir.path())];
        let plans_two = vec![video_plan(pipe_dir.path())];

        let parsed: Vec<ParsedMaster> = [("period_1", &plans_one), ("period_2", &plans_two)]
            .into_iter()
            .map(|(period, plans)| {
                parse_period_master(out.path(), &out.path().join(period), "hls.m3u8", plans)
                    .unwrap()
            })
            .collect();

        assert!((total_duration(&parsed) - 15.0).abs() < 1e-9);
        concat_periods(&parsed, out.path(), "hls.m3u8").unwrap();

        let stream = std::fs::read_to_string(out.path().join("stream_0.m3u8")).unwrap();
        assert!(stream.contains("period_1/video_720p_2M_h264_1.mp4"));
        assert!(stream.contains("period_2/video_720p_2M_h264_1.mp4"));
        // One header, one end-list, even with two source playlists.
        assert_eq!(stream.matches("#EXTM3U").count(), 1);
        assert_eq!(stream.matches("#EXT-X-ENDLIST").count(), 1);
    }

    #[test]
    fn media_uri_attribute_is_replaced() {
        let attrs = r#"TYPE=AUDIO,URI="audio.m3u8",GROUP-ID="default-audio-group",LANGUAGE="en""#;
        let replaced = replace_uri_attr(attrs, "stream_3.m3u8");
        assert!(replaced.contains(r#"URI="stream_3.m3u8""#));
        assert!(replaced.contains(r#"LANGUAGE="en""#));
    }

    #[test]
    fn variant_keys_distinguish_streams() {
        let dir = tempfile::tempdir().unwrap();
        let video = video_plan(dir.path());
        let audio = audio_plan(dir.path());
        let mut attributes = BTreeMap::new();
        attributes.insert("LANGUAGE".to_string(), "en".to_string());

        assert_eq!(
            variant_key(&video, &BTreeMap::new()),
            VariantKey::Video {
                codec: "h264".into(),
                resolution: "720p".into()
            }
        );
        assert_eq!(
            variant_key(&audio, &attributes),
            VariantKey::Audio {
                codec: "aac".into(),
                layout: "stereo".into(),
                language: "en".into()
            }
        );
    }
}

//! Multi-period VOD manifest concatenation.
//!
//! Once every period's packager has finished, this node stitches the
//! per-period DASH MPDs into one multi-period MPD and the per-period HLS
//! playlists into one master (see [`crate::hls`]).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::config::{ManifestFormat, MediaKind, PipelineConfig};
use crate::error::{Error, Result};
use crate::hls;
use crate::nodes::{PipelineNode, ProcessStatus, TaskHandle};
use crate::stream::OutputStreamPlan;

/// One period's packager outputs, as the concatenator sees them.
#[derive(Clone)]
pub struct PeriodOutputs {
    /// The period's own output directory (`…/period_<n>`).
    pub dir: PathBuf,
    pub plans: Arc<Vec<OutputStreamPlan>>,
}

pub struct PeriodConcatNode {
    label: String,
    pipeline: Arc<PipelineConfig>,
    output_dir: PathBuf,
    periods: Vec<PeriodOutputs>,
    concat_will_fail: bool,
    task: Option<TaskHandle>,
}

impl PeriodConcatNode {
    pub fn new(
        pipeline: Arc<PipelineConfig>,
        output_dir: PathBuf,
        periods: Vec<PeriodOutputs>,
    ) -> Self {
        let shape = |period: &PeriodOutputs| {
            let has = |kind: MediaKind| period.plans.iter().any(|p| p.media_kind() == kind);
            (has(MediaKind::Video), has(MediaKind::Audio))
        };

        let mut concat_will_fail = false;
        if let Some(first) = periods.first() {
            let first_shape = shape(first);
            for (index, period) in periods.iter().enumerate().skip(1) {
                if shape(period) != first_shape {
                    tracing::warn!(
                        "Stopping period concatenation: period #{} and period #1 do not have \
                         the same set of media kinds.",
                        index + 1
                    );
                    tracing::warn!(
                        "Be sure that either all the periods have video or none do, and that \
                         all the periods have audio or none do."
                    );
                    concat_will_fail = true;
                    break;
                }
            }
        }

        Self {
            label: "PeriodConcatNode".into(),
            pipeline,
            output_dir,
            periods,
            concat_will_fail,
            task: None,
        }
    }

    fn concat(
        pipeline: &PipelineConfig,
        output_dir: &Path,
        periods: &[PeriodOutputs],
    ) -> Result<()> {
        if pipeline.has_format(ManifestFormat::Dash) {
            let mpds: Vec<PathBuf> = periods
                .iter()
                .map(|p| p.dir.join(&pipeline.dash_output))
                .collect();
            let stitched = concat_mpds(&mpds, output_dir)?;
            std::fs::write(output_dir.join(&pipeline.dash_output), stitched)?;
        }

        if pipeline.has_format(ManifestFormat::Hls) {
            let parsed: Result<Vec<hls::ParsedMaster>> = periods
                .iter()
                .map(|period| {
                    hls::parse_period_master(
                        output_dir,
                        &period.dir,
                        &pipeline.hls_output,
                        &period.plans,
                    )
                })
                .collect();
            hls::concat_periods(&parsed?, output_dir, &pipeline.hls_output)?;
        }

        Ok(())
    }
}

#[async_trait]
impl PipelineNode for PeriodConcatNode {
    fn label(&self) -> &str {
        &self.label
    }

    fn start(&mut self) -> Result<()> {
        let pipeline = self.pipeline.clone();
        let output_dir = self.output_dir.clone();
        let periods = self.periods.clone();
        let concat_will_fail = self.concat_will_fail;
        let label = self.label.clone();

        self.task = Some(TaskHandle::spawn(|cancel, status| async move {
            if concat_will_fail {
                tracing::error!("{label}: unable to concatenate the inputs");
                let _ = status.send(ProcessStatus::Errored);
                return;
            }
            if cancel.is_cancelled() {
                let _ = status.send(ProcessStatus::Finished);
                return;
            }
            match Self::concat(&pipeline, &output_dir, &periods) {
                Ok(()) => {
                    let _ = status.send(ProcessStatus::Finished);
                }
                Err(e) => {
                    tracing::error!("{label}: {e}");
                    let _ = status.send(ProcessStatus::Errored);
                }
            }
        }));
        Ok(())
    }

    fn check_status(&mut self) -> ProcessStatus {
        match &self.task {
            Some(task) => task.check_status(),
            None => ProcessStatus::Errored,
        }
    }

    async fn stop(&mut self) {
        if let Some(task) = &mut self.task {
            task.stop().await;
        }
    }
}

// ---------------------------------------------------------------------------
// DASH MPD stitching
// ---------------------------------------------------------------------------

/// The pieces of one MPD document.
struct SplitMpd {
    /// Everything before the first `<Period>`.
    header: String,
    /// Raw text of each `<Period>…</Period>` element.
    periods: Vec<String>,
    /// Everything after the last `</Period>`.
    footer: String,
    /// The document's `mediaPresentationDuration`, in seconds.
    duration: Option<f64>,
}

fn split_mpd(text: &str) -> Result<SplitMpd> {
    let mut reader = Reader::from_str(text);
    let mut spans: Vec<(usize, usize)> = Vec::new();
    let mut duration = None;
    let mut last_position = 0usize;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| Error::Internal(format!("malformed MPD: {e}")))?;
        match event {
            Event::Start(ref e) if e.name().as_ref() == b"MPD" => {
                duration = attribute_value(e, "mediaPresentationDuration")
                    .as_deref()
                    .and_then(parse_iso_duration);
            }
            Event::Start(ref e) if e.name().as_ref() == b"Period" => {
                let start = last_position;
                let end_name = e.to_end().into_owned();
                reader
                    .read_to_end(end_name.name())
                    .map_err(|e| Error::Internal(format!("malformed MPD: {e}")))?;
                spans.push((start, reader.buffer_position() as usize));
            }
            Event::Empty(ref e) if e.name().as_ref() == b"Period" => {
                spans.push((last_position, reader.buffer_position() as usize));
            }
            Event::Eof => break,
            _ => {}
        }
        last_position = reader.buffer_position() as usize;
    }

    let (first_start, last_end) = match (spans.first(), spans.last()) {
        (Some(first), Some(last)) => (first.0, last.1),
        _ => {
            return Err(Error::Internal(
                "MPD contains no Period element".into(),
            ))
        }
    };

    Ok(SplitMpd {
        header: text[..first_start].to_string(),
        periods: spans
            .iter()
            .map(|(start, end)| text[*start..*end].to_string())
            .collect(),
        footer: text[last_end..].to_string(),
        duration,
    })
}

fn attribute_value(e: &quick_xml::events::BytesStart<'_>, name: &str) -> Option<String> {
    e.try_get_attribute(name)
        .ok()
        .flatten()
        .and_then(|attr| attr.unescape_value().ok().map(|v| v.into_owned()))
}

/// Parse an ISO 8601 duration of the `PT…H…M…S` form.
pub fn parse_iso_duration(value: &str) -> Option<f64> {
    let re = regex::Regex::new(
        r"^PT(?:(\d+(?:\.\d+)?)H)?(?:(\d+(?:\.\d+)?)M)?(?:(\d+(?:\.\d+)?)S)?$",
    )
    .unwrap();
    let caps = re.captures(value.trim())?;
    let part = |index: usize| {
        caps.get(index)
            .map(|m| m.as_str().parse::<f64>().unwrap_or(0.0))
            .unwrap_or(0.0)
    };
    Some(part(1) * 3600.0 + part(2) * 60.0 + part(3))
}

fn format_iso_duration(seconds: f64) -> String {
    format!("PT{seconds:.3}S")
}

/// Prefix a period element with a `<BaseURL>` pointing at its subdirectory,
/// and give it an explicit duration if it has none.
fn rewrite_period(period: &str, base_url: &str, duration: Option<f64>) -> Result<String> {
    let tag_end = period.find('>').ok_or_else(|| {
        Error::Internal("MPD Period element has no closing bracket".into())
    })?;
    let mut start_tag = period[..tag_end].to_string();
    let self_closing = start_tag.ends_with('/');
    if self_closing {
        start_tag.pop();
    }

    if !start_tag.contains("duration=") {
        if let Some(seconds) = duration {
            start_tag.push_str(&format!(" duration=\"{}\"", format_iso_duration(seconds)));
        }
    }

    let body = if self_closing {
        String::new()
    } else {
        period[tag_end + 1..period.len() - "</Period>".len()].to_string()
    };

    Ok(format!(
        "{start_tag}><BaseURL>{base_url}</BaseURL>{body}</Period>"
    ))
}

/// Stitch the per-period MPDs into one multi-period MPD. Segment base URLs
/// are rewritten to the per-period subdirectories; the total presentation
/// duration is the sum of the per-period durations.
pub fn concat_mpds(mpd_paths: &[PathBuf], output_dir: &Path) -> Result<String> {
    let mut header = String::new();
    let mut footer = String::new();
    let mut all_periods: Vec<String> = Vec::new();
    let mut total_duration = 0.0f64;

    for (index, path) in mpd_paths.iter().enumerate() {
        let text = std::fs::read_to_string(path)?;
        let split = split_mpd(&text)?;

        let period_dir = path
            .parent()
            .and_then(|dir| dir.strip_prefix(output_dir).ok())
            .map(|rel| rel.to_string_lossy().replace('\\', "/"))
            .unwrap_or_else(|| format!("period_{}", index + 1));
        let base_url = format!("{period_dir}/");

        total_duration += split.duration.unwrap_or(0.0);
        for period in &split.periods {
            all_periods.push(rewrite_period(period, &base_url, split.duration)?);
        }

        if index == 0 {
            header = split.header;
            footer = split.footer;
        }
    }

    let duration_re = regex::Regex::new(r#"mediaPresentationDuration="[^"]*""#).unwrap();
    let header = duration_re
        .replace(
            &header,
            format!(
                "mediaPresentationDuration=\"{}\"",
                format_iso_duration(total_duration)
            )
            .as_str(),
        )
        .into_owned();

    Ok(format!("{header}{}{footer}", all_periods.join("\n")))
}

//! Fragment cursor of a [`LogicalStream`]: seeking, advancing, URL construction and live reload.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::{NoExpand, Regex};
use tracing::{debug, trace};

use crate::error::TimelineError;
use crate::manifest::fragments::FragmentListBuilder;
use crate::manifest::{FragmentNode, LogicalStream};
use crate::time::{duration_to_ticks, ticks_to_duration};

static BITRATE_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\{bitrate\}").unwrap());
static START_TIME_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\{start[ _]?time\}").unwrap());

/// Everything a fetch loop needs to download and timestamp the fragment under the cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentRequest {
    /// URL relative to the manifest's base URL.
    pub path: String,
    pub number: u64,
    /// Start time in stream ticks, used to recognise the fragment after the fetch.
    pub time: u64,
    pub timestamp: Duration,
    pub duration: Option<Duration>,
}

/// Replaces the bitrate and start time placeholders of a fragment URL template.
pub fn expand_url_template(template: &str, bitrate: u64, start_time: u64) -> String {
    let bitrate = bitrate.to_string();
    let start_time = start_time.to_string();
    let url = BITRATE_TOKEN.replace_all(template, NoExpand(&bitrate));
    START_TIME_TOKEN.replace_all(&url, NoExpand(&start_time)).into_owned()
}

impl LogicalStream {
    /// Moves the cursor to the fragment containing `time`.
    ///
    /// A target past the end of the last fragment leaves the stream at end of stream.
    /// Returns `false` only when the stream has no fragments.
    pub fn seek(&mut self, time: Duration) -> bool {
        if self.fragments.is_empty() {
            return false;
        }

        let target = duration_to_ticks(time, self.timescale());
        let after = self.fragments.partition_point(|fragment| fragment.time <= target);
        self.current_fragment = if after < self.fragments.len() {
            after.saturating_sub(1)
        } else {
            let last = self.fragments.len() - 1;
            match self.fragments[last].end() {
                Some(end) if target >= end => self.fragments.len(),
                _ => last,
            }
        };

        debug!(
            "Seeked {} stream to {:?}: fragment index {}",
            self.stream_type.name(),
            time,
            self.current_fragment
        );
        true
    }

    /// Steps the cursor forward, reporting end of stream once it runs off the list.
    pub fn advance(&mut self) -> Result<(), TimelineError> {
        if self.is_eos() {
            return Err(TimelineError::Eos);
        }
        self.current_fragment += 1;
        if self.is_eos() {
            Err(TimelineError::Eos)
        } else {
            Ok(())
        }
    }

    pub fn fragment_url(&self) -> Result<String, TimelineError> {
        let fragment = self.current_fragment().ok_or(TimelineError::Eos)?;
        let quality = self.current_quality().ok_or(TimelineError::NoQuality)?;
        let template = self.url_template.as_deref().ok_or(TimelineError::NoUrlTemplate)?;
        Ok(expand_url_template(template, quality.bitrate, fragment.time))
    }

    pub fn fragment_request(&self) -> Result<FragmentRequest, TimelineError> {
        let path = self.fragment_url()?;
        let fragment = self.current_fragment().ok_or(TimelineError::Eos)?;
        let timescale = self.timescale();

        Ok(FragmentRequest {
            path,
            number: fragment.number,
            time: fragment.time,
            timestamp: ticks_to_duration(fragment.time, timescale),
            duration: self.fragment_duration(),
        })
    }

    /// Start time of the fragment under the cursor, or the end of the last one at end of stream.
    pub fn fragment_timestamp(&self) -> Option<Duration> {
        let timescale = self.timescale();
        match self.current_fragment() {
            Some(fragment) => Some(ticks_to_duration(fragment.time, timescale)),
            None => self
                .fragments
                .last()
                .map(|last| ticks_to_duration(last.end().unwrap_or(last.time), timescale)),
        }
    }

    pub fn fragment_duration(&self) -> Option<Duration> {
        let duration = self.current_fragment()?.duration?;
        Some(ticks_to_duration(duration, self.timescale()))
    }

    /// Start time, in ticks, of the most recently consumed fragment.
    fn playback_time(&self) -> Option<u64> {
        if self.is_eos() {
            self.fragments.last().map(|fragment| fragment.time)
        } else if self.current_fragment > 0 {
            Some(self.fragments[self.current_fragment - 1].time)
        } else {
            None
        }
    }

    /// Splices a reloaded fragment list in place of the current one.
    ///
    /// Only fragments starting after the most recently consumed one are kept. Returns
    /// whether the list was replaced.
    pub fn reload_fragments(&mut self, nodes: &[FragmentNode]) -> bool {
        let playback_time = self.playback_time();
        let mut builder = match self.fragments.last() {
            Some(last) => FragmentListBuilder::seeded(last),
            None => FragmentListBuilder::new(),
        };
        for node in nodes {
            builder.add(node);
        }

        let mut survivors = builder
            .finish()
            .into_iter()
            .filter(|built| playback_time.map_or(true, |played| built.fragment.time > played))
            .collect::<Vec<_>>();
        let Some(first) = survivors.first() else {
            trace!("Reload brought no fragment after {:?}", playback_time);
            return false;
        };

        let first_time = first.fragment.time;
        let mut next_number = self
            .fragments
            .iter()
            .rev()
            .find(|fragment| fragment.time < first_time)
            .map(|fragment| fragment.number + 1)
            .unwrap_or(first.fragment.number);
        for built in &mut survivors {
            if !built.explicit_number {
                built.fragment.number = next_number;
            }
            next_number = built.fragment.number + 1;
        }

        debug!(
            "Reloaded {} stream: {} fragments from time {}",
            self.stream_type.name(),
            survivors.len(),
            first_time
        );
        self.fragments = survivors.into_iter().map(|built| built.fragment).collect();
        self.current_fragment = 0;
        true
    }
}

//! Observation intake: typed events from the browsing side of the house.
//!
//! Two streams describe each browser request. The body half arrives before
//! send with the raw payload; the header half arrives at send time with the
//! final header list. Events flow through an [`ObservationBus`] in arrival
//! order and are correlated into request templates by
//! [`correlator::CaptureCorrelator`].

pub mod correlator;
pub mod template;

use std::io::BufRead;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Originator value stamped on traffic the tool itself replays. Capture
/// drops anything carrying it so replays never overwrite templates.
pub const REPLAY_ORIGINATOR: &str = "threadtap/replay";

/// Pre-send half of one observed request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyObservation {
    pub request_id: String,
    pub originator: String,
    pub url: String,
    pub raw_body: String,
}

/// Send-time half of one observed request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderObservation {
    pub request_id: String,
    pub originator: String,
    pub url: String,
    pub headers: Vec<HeaderEntry>,
}

/// One header as observed on the wire; names keep their observed casing
/// until capture normalizes them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderEntry {
    pub name: String,
    pub value: String,
}

/// One event drawn from either observation stream.
///
/// The `phase` tag matches the NDJSON tap format: `"body"` or `"headers"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "lowercase")]
pub enum Observation {
    Body(BodyObservation),
    Headers(HeaderObservation),
}

impl Observation {
    pub fn url(&self) -> &str {
        match self {
            Self::Body(observation) => &observation.url,
            Self::Headers(observation) => &observation.url,
        }
    }

    pub fn request_id(&self) -> &str {
        match self {
            Self::Body(observation) => &observation.request_id,
            Self::Headers(observation) => &observation.request_id,
        }
    }
}

/// Ordered fan-in for the two observation streams.
///
/// A single channel carries both phases because relative arrival order is
/// what correlation keys on: a header half only completes a capture when
/// its body half was seen first. Producers go through
/// [`ObservationPublisher`]; the owner drains into a correlator.
#[derive(Debug)]
pub struct ObservationBus {
    tx: mpsc::UnboundedSender<Observation>,
    rx: mpsc::UnboundedReceiver<Observation>,
}

impl ObservationBus {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    pub fn publisher(&self) -> ObservationPublisher {
        ObservationPublisher {
            tx: self.tx.clone(),
        }
    }

    /// Feeds every queued observation to the correlator, in arrival order.
    pub fn drain_into(
        &mut self,
        correlator: &mut correlator::CaptureCorrelator,
        store: &mut template::TemplateStore,
    ) -> usize {
        let mut drained = 0;
        while let Ok(observation) = self.rx.try_recv() {
            correlator.observe(observation, store);
            drained += 1;
        }
        drained
    }
}

impl Default for ObservationBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable producer handle for one bus.
#[derive(Debug, Clone)]
pub struct ObservationPublisher {
    tx: mpsc::UnboundedSender<Observation>,
}

impl ObservationPublisher {
    pub fn publish_body(&self, observation: BodyObservation) {
        self.publish(Observation::Body(observation));
    }

    pub fn publish_headers(&self, observation: HeaderObservation) {
        self.publish(Observation::Headers(observation));
    }

    pub fn publish(&self, observation: Observation) {
        if self.tx.send(observation).is_err() {
            debug!("observation bus closed, event dropped");
        }
    }
}

/// Counts from one tap ingestion pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TapSummary {
    pub published: usize,
    pub filtered: usize,
    pub skipped: usize,
}

/// Reads an NDJSON observation tap and publishes the events that match the
/// upstream URL filter.
///
/// Each line is one JSON object with a `phase` discriminator. Lines that do
/// not parse are logged and skipped; a capture tap written mid-request can
/// legitimately end with a truncated line.
pub fn ingest_tap(
    reader: impl BufRead,
    url_filter: &str,
    publisher: &ObservationPublisher,
) -> TapSummary {
    let mut summary = TapSummary::default();
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, "unreadable tap line");
                summary.skipped += 1;
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let observation: Observation = match serde_json::from_str(&line) {
            Ok(observation) => observation,
            Err(err) => {
                debug!(error = %err, "skipping malformed tap line");
                summary.skipped += 1;
                continue;
            }
        };
        if !observation.url().contains(url_filter) {
            summary.filtered += 1;
            continue;
        }
        publisher.publish(observation);
        summary.published += 1;
    }
    summary
}

//! Index-ordered merging of unit outcomes.
//!
//! Outcomes arrive in completion order. The merger parks them in a holding
//! area keyed by unit index and releases a unit only once every lower index
//! has been fully written out, so the merged stream always reads in request
//! order no matter which target answered first.

use std::collections::BTreeMap;

use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use tracing::{debug, warn};

use crate::dispatch::{Outcome, OutcomeStream};
use crate::persistence::QueryStatus;
use crate::target::{ResultStream, Row};

/// One element of the merged result stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum MergedRecord {
    /// A row from a successful unit.
    Row { index: usize, row: Row },
    /// Closes a successful unit's segment.
    End { index: usize, rows: usize },
    /// Stands in for a unit that produced no data, or whose rows stopped
    /// early.
    Marker {
        index: usize,
        kind: QueryStatus,
        detail: String,
    },
}

impl MergedRecord {
    /// Index of the unit this record belongs to.
    pub fn index(&self) -> usize {
        match self {
            Self::Row { index, .. } | Self::End { index, .. } | Self::Marker { index, .. } => {
                *index
            }
        }
    }

    /// Returns true for the record that closes a unit's segment.
    pub fn closes_segment(&self) -> bool {
        !matches!(self, Self::Row { .. })
    }
}

/// Merged records in unit index order.
pub type MergedStream = BoxStream<'static, MergedRecord>;

struct Segment {
    index: usize,
    rows: ResultStream,
    delivered: usize,
}

struct MergeState {
    source: Option<OutcomeStream>,
    holding: BTreeMap<usize, Outcome>,
    next_index: usize,
    current: Option<Segment>,
}

impl MergeState {
    async fn next_record(&mut self) -> Option<MergedRecord> {
        loop {
            if let Some(segment) = self.current.as_mut() {
                let index = segment.index;
                match segment.rows.next().await {
                    Some(Ok(row)) => {
                        segment.delivered += 1;
                        return Some(MergedRecord::Row { index, row });
                    }
                    Some(Err(e)) => {
                        warn!(
                            "Unit #{index}: row stream broke after {} rows: {e}",
                            segment.delivered
                        );
                        self.finish(index);
                        return Some(MergedRecord::Marker {
                            index,
                            kind: QueryStatus::Failed,
                            detail: e.to_string(),
                        });
                    }
                    None => {
                        let rows = segment.delivered;
                        self.finish(index);
                        return Some(MergedRecord::End { index, rows });
                    }
                }
            }

            if let Some(outcome) = self.holding.remove(&self.next_index) {
                let index = self.next_index;
                match outcome {
                    Outcome::Success(response) => {
                        self.current = Some(Segment {
                            index,
                            rows: response.rows,
                            delivered: 0,
                        });
                        continue;
                    }
                    Outcome::Failure(e) => {
                        self.finish(index);
                        return Some(MergedRecord::Marker {
                            index,
                            kind: QueryStatus::Failed,
                            detail: e.to_string(),
                        });
                    }
                    Outcome::TimedOut => {
                        self.finish(index);
                        return Some(MergedRecord::Marker {
                            index,
                            kind: QueryStatus::TimedOut,
                            detail: crate::dispatch::TIMEOUT_DETAIL.to_string(),
                        });
                    }
                }
            }

            match self.source.as_mut() {
                Some(source) => match source.next().await {
                    Some((unit, outcome)) => self.park((unit.index(), outcome)),
                    None => self.source = None,
                },
                None => {
                    let (&lowest, _) = self.holding.iter().next()?;
                    warn!(
                        "Outcome source ended without unit #{}; skipping to #{lowest}",
                        self.next_index
                    );
                    self.next_index = lowest;
                }
            }
        }
    }

    fn park(&mut self, (index, outcome): (usize, Outcome)) {
        if index < self.next_index || self.holding.contains_key(&index) {
            warn!("Discarding duplicate outcome for unit #{index}");
            return;
        }
        debug!("Parked outcome for unit #{index}");
        self.holding.insert(index, outcome);
    }

    fn finish(&mut self, index: usize) {
        self.current = None;
        self.next_index = index + 1;
    }
}

/// Merges outcomes into one lazily evaluated stream in unit index order.
///
/// Every unit yields exactly one closing record: `End` after its rows, or a
/// `Marker`. Nothing is read from `outcomes` or from any row stream until the
/// merged stream is polled.
pub fn merge(outcomes: OutcomeStream) -> MergedStream {
    let state = MergeState {
        source: Some(outcomes),
        holding: BTreeMap::new(),
        next_index: 0,
        current: None,
    };

    stream::unfold(state, |mut state| async move {
        state.next_record().await.map(|record| (record, state))
    })
    .boxed()
}

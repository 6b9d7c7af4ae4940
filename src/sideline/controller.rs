//! Responds to start/stop triggers by mutating the firehose filter chain,
//! persisting sideline requests, and spawning bounded replay sources.
//!
//! Persistence always happens before the in-memory filter chain changes, so
//! a crash in between is recovered by the resume protocol instead of losing
//! the request.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::core::config::SidelineConfig;
use crate::core::time::Clock;
use crate::log::{OffsetMap, TopicPartition};
use crate::messaging::filter::FilterStep;
use crate::ops::metrics::MetricsRecorder;
use crate::sideline::coordinator::SourceCoordinator;
use crate::sideline::factory::VirtualSourceFactory;
use crate::sideline::{SidelineId, SidelinePayload, SidelineRequest, SidelineType};
use crate::storage::{PersistenceAdapter, SidelineRequestRecord};

const METRICS_SCOPE: &str = "sideline-controller";

/// The surface a trigger gets to drive sidelining with.
pub trait SidelineOps: Send + Sync {
    fn start_sideline(&self, request: &SidelineRequest) -> Result<SidelineId>;

    /// Stops the sideline whose steps structurally equal the request's.
    /// Returns `None` (and logs) when no such filter is attached.
    fn stop_sideline(&self, request: &SidelineRequest) -> Result<Option<SidelineId>>;
}

/// Cloneable handle handed to triggers.
#[derive(Clone)]
pub struct SidelineHandle {
    ops: Arc<dyn SidelineOps>,
}

impl SidelineHandle {
    pub fn start(&self, request: &SidelineRequest) -> Result<SidelineId> {
        self.ops.start_sideline(request)
    }

    pub fn stop(&self, request: &SidelineRequest) -> Result<Option<SidelineId>> {
        self.ops.stop_sideline(request)
    }
}

/// External code invoked around the stream lifecycle; given a handle at open
/// so it can start and stop sidelines for as long as the stream runs.
pub trait SidelineTrigger: Send {
    fn open(&mut self, handle: SidelineHandle);

    fn close(&mut self) {}
}

pub struct SidelineController<C: Clock> {
    config: Arc<SidelineConfig>,
    coordinator: SourceCoordinator<C>,
    factory: Arc<VirtualSourceFactory<C>>,
    persistence: Arc<dyn PersistenceAdapter>,
    metrics: Arc<dyn MetricsRecorder>,
}

impl<C: Clock> SidelineController<C> {
    pub fn new(
        config: Arc<SidelineConfig>,
        coordinator: SourceCoordinator<C>,
        factory: Arc<VirtualSourceFactory<C>>,
        persistence: Arc<dyn PersistenceAdapter>,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Self {
        Self {
            config,
            coordinator,
            factory,
            persistence,
            metrics,
        }
    }

    pub fn handle(self: &Arc<Self>) -> SidelineHandle {
        SidelineHandle {
            ops: Arc::clone(self) as Arc<dyn SidelineOps>,
        }
    }

    /// Rebuild in-memory state from persisted requests: re-attach START
    /// filters to the firehose, re-spawn the replay source of every STOP.
    pub fn resume(&self) -> Result<()> {
        let firehose = self
            .coordinator
            .firehose()
            .context("coordinator must be open before resume")?;
        for id in self.persistence.list_sideline_requests()? {
            let Some(payload) = self.load_payload(&id)? else {
                continue;
            };
            match payload.sideline_type {
                SidelineType::Start => {
                    info!("resuming active sideline {id}");
                    firehose
                        .filter_chain
                        .add_steps(id.clone(), payload.steps.clone());
                }
                SidelineType::Stop => {
                    let Some(ending) = payload.ending_state else {
                        warn!("stop payload for {id} has no ending state, skipping");
                        continue;
                    };
                    info!("resuming replay of stopped sideline {id}");
                    let negated = negate(&payload.steps);
                    let replay = self.factory.create_replay(
                        id.clone(),
                        negated,
                        payload.starting_state,
                        ending,
                    )?;
                    self.coordinator.add_replay_source(replay)?;
                }
            }
        }
        Ok(())
    }

    /// Reconstitute the payload for one identifier from its per-partition
    /// records. Records always carry the original (un-negated) steps.
    fn load_payload(&self, id: &SidelineId) -> Result<Option<SidelinePayload>> {
        let topic = &self.config.broker.topic;
        let mut starting = OffsetMap::new();
        let mut ending = OffsetMap::new();
        let mut steps: Option<Vec<FilterStep>> = None;
        let mut sideline_type = None;
        for partition in self.persistence.list_sideline_request_partitions(id)? {
            let Some(record) = self.persistence.retrieve_sideline_request(id, partition)? else {
                continue;
            };
            let tp = TopicPartition::new(topic.clone(), partition);
            if let Some(offset) = record.starting_offset {
                starting.set(tp.clone(), offset);
            }
            if let Some(offset) = record.ending_offset {
                ending.set(tp, offset);
            }
            steps.get_or_insert(record.steps);
            sideline_type = Some(record.sideline_type);
        }
        let (Some(sideline_type), Some(steps)) = (sideline_type, steps) else {
            return Ok(None);
        };
        Ok(Some(SidelinePayload {
            sideline_type,
            id: id.clone(),
            steps,
            starting_state: starting,
            ending_state: if sideline_type == SidelineType::Stop {
                Some(ending)
            } else {
                None
            },
        }))
    }
}

fn negate(steps: &[FilterStep]) -> Vec<FilterStep> {
    steps.iter().cloned().map(FilterStep::negated).collect()
}

impl<C: Clock> SidelineOps for SidelineController<C> {
    fn start_sideline(&self, request: &SidelineRequest) -> Result<SidelineId> {
        let firehose = self
            .coordinator
            .firehose()
            .context("cannot start a sideline before open")?;
        let id = SidelineId::generate();
        // The offset range starts where the firehose stands right now; the
        // stop side will use this persisted snapshot as the replay's
        // starting bound.
        let starting = firehose.state.current_state();
        for (partition, offset) in starting.iter() {
            let record = SidelineRequestRecord {
                sideline_type: SidelineType::Start,
                steps: request.steps.clone(),
                starting_offset: Some(offset),
                ending_offset: None,
            };
            self.persistence
                .persist_sideline_request(&id, partition.partition, &record)
                .with_context(|| format!("persist start of sideline {id}"))?;
        }
        firehose
            .filter_chain
            .add_steps(id.clone(), request.steps.clone());
        self.metrics.count(METRICS_SCOPE, "start-sideline", 1);
        info!("started sideline {id} at {starting}");
        Ok(id)
    }

    fn stop_sideline(&self, request: &SidelineRequest) -> Result<Option<SidelineId>> {
        let firehose = self
            .coordinator
            .firehose()
            .context("cannot stop a sideline before open")?;
        let Some(id) = firehose.filter_chain.find_by_value(&request.steps) else {
            warn!(
                "stop requested for filter steps that are not attached; \
                 check that the steps compare equal to the ones used at start"
            );
            return Ok(None);
        };

        let ending = firehose.state.current_state();
        let steps = firehose
            .filter_chain
            .remove_steps(&id)
            .unwrap_or_else(|| request.steps.clone());

        // The replay range begins at the filter-attach snapshot, not at
        // whatever the firehose has committed since.
        let starting = self
            .load_payload(&id)?
            .map(|payload| payload.starting_state)
            .unwrap_or_default();

        for (partition, end_offset) in ending.iter() {
            let record = SidelineRequestRecord {
                sideline_type: SidelineType::Stop,
                steps: steps.clone(),
                starting_offset: starting.get(partition),
                ending_offset: Some(end_offset),
            };
            self.persistence
                .persist_sideline_request(&id, partition.partition, &record)
                .with_context(|| format!("persist stop of sideline {id}"))?;
        }

        let replay =
            self.factory
                .create_replay(id.clone(), negate(&steps), starting, ending.clone())?;
        self.coordinator.add_replay_source(replay)?;
        self.metrics.count(METRICS_SCOPE, "stop-sideline", 1);
        info!("stopped sideline {id} at {ending}, replay source started");
        Ok(Some(id))
    }
}

//! Builds virtual sources out of configuration and the component registry.

use std::sync::Arc;

use anyhow::Result;

use crate::core::config::{SidelineConfig, TaskContext};
use crate::core::registry::ComponentRegistry;
use crate::core::time::Clock;
use crate::log::consumer::LogConsumer;
use crate::log::OffsetMap;
use crate::messaging::filter::{FilterStep, SharedFilterChain};
use crate::messaging::SourceId;
use crate::ops::metrics::MetricsRecorder;
use crate::sideline::virtual_source::{VirtualSource, VirtualSourceParts};
use crate::sideline::SidelineId;
use crate::storage::PersistenceAdapter;

pub struct VirtualSourceFactory<C: Clock> {
    config: Arc<SidelineConfig>,
    registry: Arc<ComponentRegistry<C>>,
    persistence: Arc<dyn PersistenceAdapter>,
    metrics: Arc<dyn MetricsRecorder>,
    clock: C,
    context: TaskContext,
}

impl<C: Clock> VirtualSourceFactory<C> {
    pub fn new(
        config: Arc<SidelineConfig>,
        registry: Arc<ComponentRegistry<C>>,
        persistence: Arc<dyn PersistenceAdapter>,
        metrics: Arc<dyn MetricsRecorder>,
        clock: C,
        context: TaskContext,
    ) -> Self {
        Self {
            config,
            registry,
            persistence,
            metrics,
            clock,
            context,
        }
    }

    /// The firehose id for this task: `<prefix>-<taskIndex>`.
    pub fn firehose_id(&self) -> SourceId {
        SourceId::new(format!(
            "{}-{}",
            self.config.consumer.id_prefix, self.context.task_index
        ))
    }

    /// The id a replay source gets: `<firehoseId>_<sidelineId>`.
    pub fn replay_id(&self, sideline_id: &SidelineId) -> SourceId {
        SourceId::new(format!("{}_{sideline_id}", self.firehose_id()))
    }

    /// The unbounded live source reading the full topic stream.
    pub fn create_firehose(&self) -> Result<VirtualSource> {
        self.create(self.firehose_id(), None, Vec::new(), None, None)
    }

    /// A bounded source replaying `(starting, ending]` with the given
    /// (already negated) steps attached.
    pub fn create_replay(
        &self,
        sideline_id: SidelineId,
        steps: Vec<FilterStep>,
        starting: OffsetMap,
        ending: OffsetMap,
    ) -> Result<VirtualSource> {
        self.create(
            self.replay_id(&sideline_id),
            Some(sideline_id),
            steps,
            Some(starting),
            Some(ending),
        )
    }

    fn create(
        &self,
        source_id: SourceId,
        sideline_id: Option<SidelineId>,
        steps: Vec<FilterStep>,
        starting_state: Option<OffsetMap>,
        ending_state: Option<OffsetMap>,
    ) -> Result<VirtualSource> {
        let deserializer = self.registry.build_deserializer(&self.config)?;
        let retry = self.registry.build_retry_policy(&self.config, &self.clock)?;
        let client = self.registry.build_client(&self.config, &source_id)?;
        let consumer = LogConsumer::new(
            client,
            Arc::clone(&self.persistence),
            source_id.clone(),
            self.config.broker.topic.clone(),
            self.context.total_tasks,
            self.context.task_index,
        );
        let filter_chain = Arc::new(SharedFilterChain::new());
        if !steps.is_empty() {
            let id = sideline_id
                .clone()
                .expect("replay steps always carry a sideline id");
            filter_chain.add_steps(id, steps);
        }
        Ok(VirtualSource::from_parts(VirtualSourceParts {
            source_id,
            consumer,
            deserializer,
            retry,
            filter_chain,
            persistence: Arc::clone(&self.persistence),
            metrics: Arc::clone(&self.metrics),
            starting_state,
            ending_state,
            sideline_id,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{BrokerConfig, ConsumerConfig};
    use crate::core::time::SystemClock;
    use crate::ops::metrics::NoopMetrics;
    use crate::storage::memory::InMemoryPersistenceAdapter;

    fn factory() -> VirtualSourceFactory<SystemClock> {
        let config = SidelineConfig {
            broker: BrokerConfig {
                hosts: vec![],
                topic: "events".into(),
                client: "in-memory".into(),
            },
            consumer: ConsumerConfig {
                id_prefix: "spout".into(),
                deserializer: "utf8".into(),
            },
            persistence: Default::default(),
            retry: Default::default(),
            buffer: Default::default(),
            flush_interval_ms: 100,
            output_stream_id: None,
        };
        let persistence = InMemoryPersistenceAdapter::new();
        persistence.open().unwrap();
        VirtualSourceFactory::new(
            Arc::new(config),
            Arc::new(ComponentRegistry::with_defaults()),
            Arc::new(persistence),
            Arc::new(NoopMetrics),
            SystemClock,
            TaskContext {
                task_index: 2,
                total_tasks: 4,
            },
        )
    }

    #[test]
    fn ids_compose_prefix_task_index_and_sideline() {
        let factory = factory();
        assert_eq!(factory.firehose_id().as_str(), "spout-2");
        let sideline = SidelineId::from("abc");
        assert_eq!(factory.replay_id(&sideline).as_str(), "spout-2_abc");
    }

    #[test]
    fn replay_sources_are_bounded_and_carry_their_filter() {
        let factory = factory();
        let source = factory
            .create_replay(
                SidelineId::from("abc"),
                vec![FilterStep::value_equals(1, "2").negated()],
                OffsetMap::new(),
                OffsetMap::new(),
            )
            .unwrap();
        assert!(source.is_bounded());
        assert_eq!(source.filter_chain().len(), 1);
        assert_eq!(source.sideline_id(), Some(&SidelineId::from("abc")));
    }

    #[test]
    fn firehose_is_unbounded_with_an_empty_chain() {
        let factory = factory();
        let source = factory.create_firehose().unwrap();
        assert!(!source.is_bounded());
        assert!(source.filter_chain().is_empty());
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Processor Registry
//!
//! The registry is built once, before consumption starts, from the consumer
//! groups' declared processors. Building validates every registration and
//! fails fast with a configuration error; resolution during consumption is a
//! pure lookup on an explicit routing tuple, never a partial match.

use crate::{
    errors::AmqpError,
    group::ConsumerGroup,
    message::Method,
    processor::{Processor, ProcessorBinding, ProcessorFactory},
};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tracing::debug;

/// Routing tuple a processor is registered and resolved under. Fields not
/// relevant to the method stay empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RouteKey {
    method: Method,
    queue: String,
    topic: String,
    routing_key: String,
    job: String,
}

/// One registered processor: its live instance, the factory that rebuilds
/// it, and its declared binding.
pub(crate) struct ProcessorSlot {
    pub(crate) group_index: usize,
    pub(crate) method: Method,
    pub(crate) binding: ProcessorBinding,
    pub(crate) instance: Box<dyn Processor>,
    factory: ProcessorFactory,
}

/// Holds every processor selected for one engine run, resolvable by the
/// routing tuple carried in incoming envelopes.
pub struct ProcessorRegistry {
    groups: Vec<Arc<dyn ConsumerGroup>>,
    slots: Vec<ProcessorSlot>,
    routes: HashMap<RouteKey, usize>,
}

impl ProcessorRegistry {
    /// Builds the registry from the given groups, keeping only the groups
    /// named in `filter` when it is non-empty.
    ///
    /// Fails with [`AmqpError::Configuration`] on: a reused group identify, a
    /// blank required name in a binding, the same `(method, queue)` declared
    /// by two different groups, or two processors registered under the same
    /// routing tuple. The same queue declared under two different methods
    /// would corrupt routing and is an [`AmqpError::ProtocolViolation`]. The
    /// same `(method, queue)` within one group is legal and maps to a single
    /// broker subscription.
    pub fn build(
        groups: &[Arc<dyn ConsumerGroup>],
        filter: &[&str],
    ) -> Result<ProcessorRegistry, AmqpError> {
        let mut registry = ProcessorRegistry {
            groups: Vec::new(),
            slots: Vec::new(),
            routes: HashMap::default(),
        };

        let mut identities = HashSet::new();
        // queue name -> (method, group index) claims across the whole run
        let mut queue_claims: HashMap<String, (Method, usize)> = HashMap::default();

        for group in groups {
            if !filter.is_empty() && !filter.contains(&group.identify()) {
                continue;
            }

            if !identities.insert(group.identify().to_owned()) {
                return Err(AmqpError::Configuration(format!(
                    "duplicate consumer identify `{}`",
                    group.identify()
                )));
            }

            let group_index = registry.groups.len();
            registry.groups.push(group.clone());
            debug!(consumer = group.identify(), "consumer loaded");

            for factory in group.processors() {
                registry.register(group_index, factory, &mut queue_claims)?;
            }
        }

        Ok(registry)
    }

    fn register(
        &mut self,
        group_index: usize,
        factory: ProcessorFactory,
        queue_claims: &mut HashMap<String, (Method, usize)>,
    ) -> Result<(), AmqpError> {
        let instance = factory();
        let binding = instance.binding();

        let (method, keys) = Self::routes_of(&binding)?;

        let queue = binding.queue().to_owned();
        match queue_claims.get(&queue) {
            Some((claimed_method, _)) if *claimed_method != method => {
                return Err(AmqpError::ProtocolViolation(format!(
                    "queue `{queue}` declared for both `{claimed_method}` and `{method}` methods"
                )));
            }
            Some((_, claimed_group)) if *claimed_group != group_index => {
                return Err(AmqpError::Configuration(format!(
                    "queue `{queue}` for method `{method}` declared by two consumer groups"
                )));
            }
            _ => {
                queue_claims.insert(queue, (method, group_index));
            }
        }

        let slot_index = self.slots.len();
        for key in keys {
            if self.routes.contains_key(&key) {
                return Err(AmqpError::Configuration(format!(
                    "duplicate processor registration for method `{}` queue `{}` topic `{}` \
                     routing key `{}` job `{}`",
                    key.method, key.queue, key.topic, key.routing_key, key.job
                )));
            }
            self.routes.insert(key, slot_index);
        }

        debug!(method = method.as_str(), queue = binding.queue(), "processor loaded");

        self.slots.push(ProcessorSlot {
            group_index,
            method,
            binding,
            instance,
            factory,
        });

        Ok(())
    }

    /// Computes the routing keys a binding registers under: one key per
    /// declared routing key for topic processors, a single key otherwise.
    fn routes_of(binding: &ProcessorBinding) -> Result<(Method, Vec<RouteKey>), AmqpError> {
        let blank = |field: &str, what: &str| {
            if field.trim().is_empty() {
                Err(AmqpError::Configuration(format!("{what} is required")))
            } else {
                Ok(())
            }
        };

        match binding {
            ProcessorBinding::Worker { queue, job } | ProcessorBinding::Command { queue, job } => {
                let method = match binding {
                    ProcessorBinding::Worker { .. } => Method::Worker,
                    _ => Method::Command,
                };
                blank(queue, "queue name")?;
                blank(job, "job name")?;
                Ok((
                    method,
                    vec![RouteKey {
                        method,
                        queue: queue.clone(),
                        topic: String::new(),
                        routing_key: String::new(),
                        job: job.clone(),
                    }],
                ))
            }
            ProcessorBinding::Emit { topic, queue } => {
                blank(topic, "topic name")?;
                blank(queue, "queue name")?;
                Ok((
                    Method::Emit,
                    vec![RouteKey {
                        method: Method::Emit,
                        queue: String::new(),
                        topic: topic.clone(),
                        routing_key: String::new(),
                        job: String::new(),
                    }],
                ))
            }
            ProcessorBinding::Topic {
                topic,
                queue,
                routing_keys,
            } => {
                blank(topic, "topic name")?;
                blank(queue, "queue name")?;
                if routing_keys.is_empty() {
                    return Err(AmqpError::Configuration("routing key is required".to_owned()));
                }
                let mut keys = Vec::with_capacity(routing_keys.len());
                for routing_key in routing_keys {
                    blank(routing_key, "routing key")?;
                    keys.push(RouteKey {
                        method: Method::Topic,
                        queue: String::new(),
                        topic: topic.clone(),
                        routing_key: routing_key.clone(),
                        job: String::new(),
                    });
                }
                Ok((Method::Topic, keys))
            }
        }
    }

    /// Groups selected for this run, in declaration order.
    pub(crate) fn groups(&self) -> &[Arc<dyn ConsumerGroup>] {
        &self.groups
    }

    /// Slots of one group for one method, in declaration order.
    pub(crate) fn slots_of(&self, group_index: usize, method: Method) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.group_index == group_index && slot.method == method)
            .map(|(index, _)| index)
            .collect()
    }

    pub(crate) fn slot(&self, index: usize) -> &ProcessorSlot {
        &self.slots[index]
    }

    /// Resolves a processor by the routing tuple of an incoming envelope.
    pub(crate) fn resolve(
        &self,
        method: Method,
        queue: &str,
        topic: &str,
        routing_key: &str,
        job: &str,
    ) -> Option<usize> {
        self.routes
            .get(&RouteKey {
                method,
                queue: queue.to_owned(),
                topic: topic.to_owned(),
                routing_key: routing_key.to_owned(),
                job: job.to_owned(),
            })
            .copied()
    }

    /// Replaces the instance in a slot with a freshly constructed one.
    /// Only ever called between messages.
    pub(crate) fn reset(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        slot.instance = (slot.factory)();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::Request;
    use async_trait::async_trait;
    use serde_json::Value;

    struct StaticProcessor {
        binding: ProcessorBinding,
    }

    #[async_trait]
    impl Processor for StaticProcessor {
        fn binding(&self) -> ProcessorBinding {
            self.binding.clone()
        }

        async fn execute(&self, _request: Request) -> Option<Value> {
            None
        }
    }

    struct StaticGroup {
        identify: String,
        bindings: Vec<ProcessorBinding>,
    }

    impl StaticGroup {
        fn new(identify: &str, bindings: Vec<ProcessorBinding>) -> Arc<dyn ConsumerGroup> {
            Arc::new(StaticGroup {
                identify: identify.to_owned(),
                bindings,
            })
        }
    }

    #[async_trait]
    impl ConsumerGroup for StaticGroup {
        fn identify(&self) -> &str {
            &self.identify
        }

        fn processors(&self) -> Vec<ProcessorFactory> {
            self.bindings
                .iter()
                .map(|binding| {
                    let binding = binding.clone();
                    Arc::new(move || {
                        Box::new(StaticProcessor {
                            binding: binding.clone(),
                        }) as Box<dyn Processor>
                    }) as ProcessorFactory
                })
                .collect()
        }
    }

    fn worker(queue: &str, job: &str) -> ProcessorBinding {
        ProcessorBinding::Worker {
            queue: queue.to_owned(),
            job: job.to_owned(),
        }
    }

    #[test]
    fn resolves_by_exact_tuple_only() {
        let groups = vec![StaticGroup::new(
            "first",
            vec![
                worker("user_worker", "user_profile"),
                ProcessorBinding::Topic {
                    topic: "user".into(),
                    queue: "user_events".into(),
                    routing_keys: vec!["user_topic_create".into(), "user_topic_update".into()],
                },
            ],
        )];
        let registry = ProcessorRegistry::build(&groups, &[]).unwrap();

        let worker_slot = registry
            .resolve(Method::Worker, "user_worker", "", "", "user_profile")
            .unwrap();
        assert_eq!(registry.slot(worker_slot).method, Method::Worker);

        // both declared routing keys map to the same slot
        let a = registry.resolve(Method::Topic, "", "user", "user_topic_create", "");
        let b = registry.resolve(Method::Topic, "", "user", "user_topic_update", "");
        assert_eq!(a, b);
        assert!(a.is_some());

        // no partial matches
        assert!(registry
            .resolve(Method::Worker, "user_worker", "", "", "other_job")
            .is_none());
        assert!(registry
            .resolve(Method::Topic, "", "user", "user_topic_delete", "")
            .is_none());
        assert!(registry
            .resolve(Method::Command, "user_worker", "", "", "user_profile")
            .is_none());
    }

    #[test]
    fn duplicate_identify_is_rejected() {
        let groups = vec![
            StaticGroup::new("same", vec![worker("q1", "j1")]),
            StaticGroup::new("same", vec![worker("q2", "j2")]),
        ];
        assert!(matches!(
            ProcessorRegistry::build(&groups, &[]),
            Err(AmqpError::Configuration(_))
        ));
    }

    #[test]
    fn same_queue_two_methods_is_a_protocol_violation() {
        let groups = vec![
            StaticGroup::new("first", vec![worker("shared_queue", "job_a")]),
            StaticGroup::new(
                "second",
                vec![ProcessorBinding::Command {
                    queue: "shared_queue".into(),
                    job: "job_b".into(),
                }],
            ),
        ];
        assert!(matches!(
            ProcessorRegistry::build(&groups, &[]),
            Err(AmqpError::ProtocolViolation(_))
        ));

        // within one group the clash is just as fatal
        let groups = vec![StaticGroup::new(
            "first",
            vec![
                worker("shared_queue", "job_a"),
                ProcessorBinding::Command {
                    queue: "shared_queue".into(),
                    job: "job_b".into(),
                },
            ],
        )];
        assert!(matches!(
            ProcessorRegistry::build(&groups, &[]),
            Err(AmqpError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn same_method_queue_across_groups_is_rejected() {
        let groups = vec![
            StaticGroup::new("first", vec![worker("shared_queue", "job_a")]),
            StaticGroup::new("second", vec![worker("shared_queue", "job_b")]),
        ];
        assert!(matches!(
            ProcessorRegistry::build(&groups, &[]),
            Err(AmqpError::Configuration(_))
        ));
    }

    #[test]
    fn same_method_queue_within_group_is_deduplicated() {
        let groups = vec![StaticGroup::new(
            "first",
            vec![worker("shared_queue", "job_a"), worker("shared_queue", "job_b")],
        )];
        let registry = ProcessorRegistry::build(&groups, &[]).unwrap();

        // two slots, both resolvable, one subscription target
        assert!(registry
            .resolve(Method::Worker, "shared_queue", "", "", "job_a")
            .is_some());
        assert!(registry
            .resolve(Method::Worker, "shared_queue", "", "", "job_b")
            .is_some());
        assert_eq!(registry.slots_of(0, Method::Worker).len(), 2);
    }

    #[test]
    fn blank_names_are_rejected() {
        let groups = vec![StaticGroup::new("first", vec![worker("  ", "job")])];
        assert!(matches!(
            ProcessorRegistry::build(&groups, &[]),
            Err(AmqpError::Configuration(_))
        ));

        let groups = vec![StaticGroup::new(
            "first",
            vec![ProcessorBinding::Topic {
                topic: "user".into(),
                queue: "user_events".into(),
                routing_keys: vec![],
            }],
        )];
        assert!(matches!(
            ProcessorRegistry::build(&groups, &[]),
            Err(AmqpError::Configuration(_))
        ));
    }

    #[test]
    fn filter_selects_groups() {
        let groups = vec![
            StaticGroup::new("first", vec![worker("q1", "j1")]),
            StaticGroup::new("second", vec![worker("q2", "j2")]),
        ];
        let registry = ProcessorRegistry::build(&groups, &["second"]).unwrap();
        assert_eq!(registry.groups().len(), 1);
        assert!(registry.resolve(Method::Worker, "q1", "", "", "j1").is_none());
        assert!(registry.resolve(Method::Worker, "q2", "", "", "j2").is_some());
    }
}

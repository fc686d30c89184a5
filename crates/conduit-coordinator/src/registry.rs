use std::collections::BTreeMap;

use log::debug;

use crate::datastream::Datastream;
use crate::error::CoordinatorResult;
use crate::group::DatastreamGroup;

/// The current set of datastream definitions, grouped by task prefix.
///
/// The registry is refreshed from the store on every rebalance; grouping
/// is recomputed on demand so a paused or deleted datastream drops out of
/// the assignable groups without further bookkeeping.
#[derive(Debug, Default)]
pub struct StreamRegistry {
    datastreams: BTreeMap<String, Datastream>,
}

impl StreamRegistry {
    pub fn new(datastreams: impl IntoIterator<Item = Datastream>) -> Self {
        let mut registry = Self::default();
        registry.refresh(datastreams);
        registry
    }

    pub fn refresh(&mut self, datastreams: impl IntoIterator<Item = Datastream>) {
        self.datastreams = datastreams
            .into_iter()
            .map(|ds| (ds.name.clone(), ds))
            .collect();
    }

    pub fn datastream(&self, name: &str) -> Option<&Datastream> {
        self.datastreams.get(name)
    }

    pub fn len(&self) -> usize {
        self.datastreams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datastreams.is_empty()
    }

    /// The groups eligible for assignment: datastreams whose status allows
    /// work, grouped by task prefix in prefix order.
    pub fn assignable_groups(&self) -> CoordinatorResult<Vec<DatastreamGroup>> {
        let mut by_prefix: BTreeMap<&str, Vec<Datastream>> = BTreeMap::new();
        for ds in self.datastreams.values() {
            if !ds.status.is_assignable() {
                debug!("datastream {} is not assignable in status {:?}", ds.name, ds.status);
                continue;
            }
            by_prefix.entry(ds.task_prefix()).or_default().push(ds.clone());
        }
        by_prefix
            .into_values()
            .map(DatastreamGroup::try_new)
            .collect()
    }
}

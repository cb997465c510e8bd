// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./metadata_test.rs"]
mod metadata_test;

use super::aggregation_type::AggregationTypes;
use super::policy::StoragePolicy;
use crate::pipeline::Pipeline;

//
// PipelineMetadata
//

// One aggregation binding requested for a metric. Empty storage policies select the configured
// defaults.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineMetadata {
  pub aggregation_types: AggregationTypes,
  pub storage_policies: Vec<StoragePolicy>,
  pub pipeline: Pipeline,
}

impl PipelineMetadata {
  #[must_use]
  pub fn is_default(&self) -> bool {
    self.aggregation_types.is_default()
      && self.storage_policies.is_empty()
      && self.pipeline.is_empty()
  }
}

//
// Metadata
//

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Metadata {
  pub pipelines: Vec<PipelineMetadata>,
}

impl Metadata {
  #[must_use]
  pub fn is_default(&self) -> bool {
    self.pipelines.len() == 1 && self.pipelines[0].is_default()
  }
}

//
// StagedMetadata
//

// A metadata version that becomes active at its cutover time.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StagedMetadata {
  pub cutover_nanos: i64,
  pub tombstoned: bool,
  pub metadata: Metadata,
}

impl StagedMetadata {
  #[must_use]
  pub fn is_default(&self) -> bool {
    self.cutover_nanos == 0 && !self.tombstoned && self.metadata.is_default()
  }
}

//
// StagedMetadatas
//

// Metadata versions ordered by ascending cutover time.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StagedMetadatas(pub Vec<StagedMetadata>);

impl StagedMetadatas {
  // The marker used for metrics that match no rules: one default pipeline, effective forever.
  #[must_use]
  pub fn default_metadatas() -> Self {
    Self(vec![StagedMetadata {
      cutover_nanos: 0,
      tombstoned: false,
      metadata: Metadata {
        pipelines: vec![PipelineMetadata::default()],
      },
    }])
  }

  #[must_use]
  pub fn is_default(&self) -> bool {
    self.0.len() == 1 && self.0[0].is_default()
  }

  // The latest version whose cutover is not in the future.
  #[must_use]
  pub fn active_at(&self, now_nanos: i64) -> Option<&StagedMetadata> {
    self.0.iter().rev().find(|sm| sm.cutover_nanos <= now_nanos)
  }
}

//
// TimedMetadata
//

// Describes how a timed metric is aggregated. Timed metrics are never transformed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TimedMetadata {
  pub aggregation_types: AggregationTypes,
  pub storage_policy: StoragePolicy,
}

//
// ForwardMetadata
//

// Describes how a forwarded metric is aggregated at this hop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForwardMetadata {
  pub aggregation_types: AggregationTypes,
  pub storage_policy: StoragePolicy,
  pub pipeline: Pipeline,
  pub source_id: u32,
  pub num_forwarded_times: u32,
}

// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt


pub mod transformation;

use crate::metric::aggregation_type::{AggregationType, AggregationTypes};
use bytes::Bytes;
use transformation::TransformationType;

// Highest derivative order that can be computed locally. Each order requires retaining one more
// previous value per aggregation type.
pub const MAX_DERIVATIVE_ORDER: usize = 1;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PipelineError {
  #[error("step {index} is {op}, expected a transformation or rollup")]
  InvalidStep { index: usize, op: &'static str },
  #[error("pipeline has no rollup step")]
  NoRollup,
  #[error("transformation derivative order {order} exceeds the maximum of {max}")]
  DerivativeOrderTooHigh { order: usize, max: usize },
}

//
// RollupOp
//

// Renames a metric and re-aggregates it downstream with the given aggregation types.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RollupOp {
  pub new_name: Bytes,
  pub aggregation_types: AggregationTypes,
}

//
// PipelineOp
//

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PipelineOp {
  // Only present in pipelines that have not been applied yet.
  Aggregation(AggregationType),
  Transformation(TransformationType),
  Rollup(RollupOp),
}

impl PipelineOp {
  const fn name(&self) -> &'static str {
    match self {
      Self::Aggregation(_) => "aggregation",
      Self::Transformation(_) => "transformation",
      Self::Rollup(_) => "rollup",
    }
  }
}

//
// Pipeline
//

// An applied pipeline. Equality is structural.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Pipeline(Vec<PipelineOp>);

impl Pipeline {
  #[must_use]
  pub fn new(ops: Vec<PipelineOp>) -> Self {
    Self(ops)
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.0.len()
  }

  #[must_use]
  pub fn ops(&self) -> &[PipelineOp] {
    &self.0
  }
}

impl From<Vec<PipelineOp>> for Pipeline {
  fn from(ops: Vec<PipelineOp>) -> Self {
    Self(ops)
  }
}

//
// ParsedPipeline
//

// An applied pipeline split at its first rollup. The transformations before the rollup run locally
// and everything after it is forwarded with the rolled up metric.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParsedPipeline {
  pub has_derivative_transform: bool,
  pub transformations: Vec<TransformationType>,
  pub rollup: Option<RollupOp>,
  pub remainder: Pipeline,
}

impl ParsedPipeline {
  pub fn parse(pipeline: &Pipeline) -> Result<Self, PipelineError> {
    if pipeline.is_empty() {
      return Ok(Self::default());
    }

    let mut first_rollup = None;
    let mut transformations = Vec::new();
    let mut derivative_order = 0;
    for (index, op) in pipeline.ops().iter().enumerate() {
      match op {
        PipelineOp::Transformation(transformation) => {
          if first_rollup.is_none() {
            transformations.push(*transformation);
            derivative_order += transformation.derivative_order();
          }
        },
        PipelineOp::Rollup(rollup) => {
          if first_rollup.is_none() {
            first_rollup = Some((index, rollup.clone()));
          }
        },
        PipelineOp::Aggregation(_) => {
          return Err(PipelineError::InvalidStep {
            index,
            op: op.name(),
          });
        },
      }
    }

    let Some((rollup_index, rollup)) = first_rollup else {
      return Err(PipelineError::NoRollup);
    };
    if derivative_order > MAX_DERIVATIVE_ORDER {
      return Err(PipelineError::DerivativeOrderTooHigh {
        order: derivative_order,
        max: MAX_DERIVATIVE_ORDER,
      });
    }

    Ok(Self {
      has_derivative_transform: derivative_order > 0,
      transformations,
      rollup: Some(rollup),
      remainder: Pipeline(pipeline.ops()[rollup_index + 1 ..].to_vec()),
    })
  }

  #[must_use]
  pub const fn has_rollup(&self) -> bool {
    self.rollup.is_some()
  }
}

// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use crate::metric::UntimedValue;
use crate::num::LossyIntToFloat;
use crate::pipeline::{PipelineOp, RollupOp};
use crate::pipeline::transformation::TransformationType;
use crate::test::{CapturingFlushHandler, Flushed, OptionsBuilder, seconds, storage_policy};
use pretty_assertions::assert_eq;
use quickcheck_macros::quickcheck;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

fn make_elem(metric_type: MetricType, data: ElemData) -> MetricElem {
  let options = OptionsBuilder::default().build();
  let mut elem = MetricElem::new(metric_type, options.elem_options.clone());
  elem.reset_set_data(data).unwrap();
  elem
}

fn elem_data(aggregation_types: Vec<AggregationType>, pipeline: Vec<PipelineOp>) -> ElemData {
  ElemData {
    id: Bytes::from_static(b"foo"),
    storage_policy: storage_policy("10s:2d"),
    aggregation_types: AggregationTypes::new(aggregation_types),
    pipeline: Pipeline::new(pipeline),
    num_forwarded_times: 0,
    id_prefix_suffix: IdPrefixSuffix::WithPrefixWithSuffix,
  }
}

fn rollup(name: &'static str) -> RollupOp {
  RollupOp {
    new_name: Bytes::from_static(name.as_bytes()),
    aggregation_types: AggregationTypes::new(vec![AggregationType::Sum]),
  }
}

#[test]
fn counter_consume() {
  let elem = make_elem(MetricType::Counter, elem_data(vec![], vec![]));
  let metric = MetricUnion::counter("foo", 1234);
  elem.add_union(seconds(216), &metric).unwrap();
  elem.add_union(seconds(217), &metric).unwrap();
  elem.add_union(seconds(221), &metric).unwrap();
  assert_eq!(vec![seconds(210), seconds(220)], elem.window_starts());

  let handler = CapturingFlushHandler::default();
  assert!(!elem.consume(seconds(220), ConsumeTimeFns::STANDARD, &handler));
  assert_eq!(
    vec![Flushed::local(
      "counters.foo",
      seconds(220),
      2468.0,
      storage_policy("10s:2d")
    )],
    handler.take()
  );
  assert_eq!(vec![seconds(220)], elem.window_starts());
}

#[test]
fn consume_never_returns_later_windows() {
  let elem = make_elem(MetricType::Counter, elem_data(vec![], vec![]));
  for second in [5, 15, 25, 35] {
    elem.add_value(seconds(second), 1.0).unwrap();
  }

  let handler = CapturingFlushHandler::default();
  elem.consume(seconds(25), ConsumeTimeFns::STANDARD, &handler);
  let times: Vec<i64> = handler
    .take()
    .into_iter()
    .map(|f| match f {
      Flushed::Local { time_nanos, .. } => time_nanos,
      _ => unreachable!(),
    })
    .collect();
  assert_eq!(vec![seconds(10), seconds(20), seconds(30)], times);
  assert_eq!(vec![seconds(30)], elem.window_starts());
}

#[test]
fn late_write_after_consume() {
  let elem = make_elem(MetricType::Counter, elem_data(vec![], vec![]));
  elem.add_value(seconds(5), 1.0).unwrap();
  let window = elem.find_or_create(seconds(5), false).unwrap();
  elem.consume(seconds(10), ConsumeTimeFns::STANDARD, &CapturingFlushHandler::default());
  assert!(window.lock().closed);

  // A new write for the same window creates a fresh one since the old one was detached.
  elem.add_value(seconds(5), 1.0).unwrap();
  assert_eq!(vec![0], elem.window_starts());
}

#[test]
fn custom_aggregation_suffixes() {
  let elem = make_elem(
    MetricType::Counter,
    elem_data(vec![AggregationType::Sum, AggregationType::Max], vec![]),
  );
  elem.add_value(seconds(1), 3.0).unwrap();
  elem.add_value(seconds(2), 5.0).unwrap();

  let handler = CapturingFlushHandler::default();
  elem.consume(seconds(10), ConsumeTimeFns::STANDARD, &handler);
  assert_eq!(
    vec![
      Flushed::local("counters.foo.sum", seconds(10), 8.0, storage_policy("10s:2d")),
      Flushed::local("counters.foo.upper", seconds(10), 5.0, storage_policy("10s:2d")),
    ],
    handler.take()
  );
}

#[test]
fn timer_default_aggregations() {
  let elem = make_elem(MetricType::Timer, elem_data(vec![], vec![]));
  elem
    .add_union(seconds(1), &MetricUnion::batch_timer("foo", vec![1.0, 2.0, 3.0]))
    .unwrap();

  let handler = CapturingFlushHandler::default();
  elem.consume(seconds(10), ConsumeTimeFns::STANDARD, &handler);
  let flushed = handler.take();
  assert_eq!(11, flushed.len());
  assert_eq!(
    Flushed::local("timers.foo.sum", seconds(10), 6.0, storage_policy("10s:2d")),
    flushed[0]
  );
  assert_eq!(
    Flushed::local("timers.foo.median", seconds(10), 2.0, storage_policy("10s:2d")),
    flushed[7]
  );
}

#[test]
fn gauge_no_prefix_no_suffix() {
  let elem = make_elem(
    MetricType::Gauge,
    ElemData {
      id_prefix_suffix: IdPrefixSuffix::NoPrefixNoSuffix,
      ..elem_data(vec![AggregationType::Max], vec![])
    },
  );
  elem.add_value(seconds(1), 3.0).unwrap();

  let handler = CapturingFlushHandler::default();
  elem.consume(seconds(10), ConsumeTimeFns::FORWARDED, &handler);
  assert_eq!(
    vec![Flushed::local("foo", 0, 3.0, storage_policy("10s:2d"))],
    handler.take()
  );
}

#[test]
fn type_mismatch() {
  let elem = make_elem(MetricType::Counter, elem_data(vec![], vec![]));
  assert_eq!(
    Err(ElemError::MetricTypeMismatch {
      expected: MetricType::Counter,
      got: MetricType::Gauge
    }),
    elem.add_union(0, &MetricUnion::gauge("foo", 1.0))
  );
}

#[test]
fn invalid_data() {
  let options = OptionsBuilder::default().build();
  let mut elem = MetricElem::new(MetricType::Counter, options.elem_options.clone());
  assert_eq!(
    Err(ElemError::InvalidAggregationTypes(MetricType::Counter)),
    elem.reset_set_data(elem_data(vec![AggregationType::P99], vec![]))
  );
  assert_eq!(
    Err(ElemError::InvalidPipeline(PipelineError::NoRollup)),
    elem.reset_set_data(elem_data(
      vec![],
      vec![PipelineOp::Transformation(TransformationType::Absolute)]
    ))
  );
}

#[test]
fn add_unique_dedups_sources() {
  let elem = make_elem(MetricType::Counter, elem_data(vec![], vec![]));
  elem.add_unique(seconds(1), &[10.0], 1).unwrap();
  assert_eq!(
    Err(ElemError::DuplicateForwardingSource),
    elem.add_unique(seconds(2), &[10.0], 1)
  );
  elem.add_unique(seconds(3), &[5.0], 2).unwrap();
  // Same source in a different window is accepted.
  elem.add_unique(seconds(11), &[1.0], 1).unwrap();

  let handler = CapturingFlushHandler::default();
  elem.consume(seconds(20), ConsumeTimeFns::STANDARD, &handler);
  assert_eq!(
    vec![
      Flushed::local("counters.foo", seconds(10), 15.0, storage_policy("10s:2d")),
      Flushed::local("counters.foo", seconds(20), 1.0, storage_policy("10s:2d")),
    ],
    handler.take()
  );

  // Source sets are returned to the element cache.
  assert_eq!(2, elem.cached_source_sets.lock().len());
}

#[test]
fn tombstoned_drains_then_collects() {
  let elem = make_elem(MetricType::Counter, elem_data(vec![], vec![]));
  elem.add_value(seconds(1), 1.0).unwrap();
  elem.add_value(seconds(11), 1.0).unwrap();
  elem.mark_as_tombstoned();
  elem.mark_as_tombstoned();

  let handler = CapturingFlushHandler::default();
  assert!(!elem.consume(seconds(10), ConsumeTimeFns::STANDARD, &handler));
  assert!(elem.consume(seconds(20), ConsumeTimeFns::STANDARD, &handler));
  assert_eq!(2, handler.take().len());

  // Not tombstoned and empty is not collectable.
  let elem = make_elem(MetricType::Counter, elem_data(vec![], vec![]));
  assert!(!elem.consume(seconds(20), ConsumeTimeFns::STANDARD, &handler));
}

#[test]
fn close() {
  let elem = make_elem(MetricType::Timer, elem_data(vec![AggregationType::P99], vec![]));
  elem.add_value(seconds(1), 1.0).unwrap();
  elem.close();
  elem.close();
  assert!(elem.is_closed());
  assert_eq!(Err(ElemError::Closed), elem.add_value(seconds(1), 1.0));
  assert_eq!(1, elem.options.stream_pool.len());
}

#[test]
fn per_second_transformation() {
  let elem = make_elem(
    MetricType::Gauge,
    elem_data(
      vec![],
      vec![
        PipelineOp::Transformation(TransformationType::PerSecond),
        PipelineOp::Rollup(rollup("bar")),
      ],
    ),
  );
  let key = elem.forwarded_aggregation_key().unwrap().clone();
  assert_eq!(Bytes::from_static(b"bar"), key.id);
  assert_eq!(1, key.num_forwarded_times);
  assert!(key.pipeline.is_empty());

  elem.add_value(seconds(1), 10.0).unwrap();
  elem.add_value(seconds(11), 30.0).unwrap();
  elem.add_value(seconds(21), 25.0).unwrap();

  let handler = CapturingFlushHandler::default();
  elem.consume(seconds(30), ConsumeTimeFns::STANDARD, &handler);
  // The first window has no previous value and the last one decreased, so both are empty and
  // discarded.
  assert_eq!(
    vec![
      Flushed::Forwarded {
        key: key.clone(),
        time_nanos: seconds(20),
        value: 2.0,
      },
      Flushed::ForwardedFlushed(key.clone()),
    ],
    handler.take()
  );

  // Nothing left to flush but the forwarding callback still fires.
  elem.consume(seconds(40), ConsumeTimeFns::STANDARD, &handler);
  assert_eq!(vec![Flushed::ForwardedFlushed(key)], handler.take());
}

#[test]
fn per_second_spans_empty_windows() {
  let elem = make_elem(
    MetricType::Gauge,
    elem_data(
      vec![AggregationType::Max],
      vec![
        PipelineOp::Transformation(TransformationType::PerSecond),
        PipelineOp::Rollup(rollup("bar")),
      ],
    ),
  );
  let key = elem.forwarded_aggregation_key().unwrap().clone();
  elem.add_value(seconds(5), 10.0).unwrap();
  elem.add_value(seconds(15), f64::NAN).unwrap();
  elem.add_value(seconds(25), 40.0).unwrap();

  let handler = CapturingFlushHandler::default();
  elem.consume(seconds(30), ConsumeTimeFns::STANDARD, &handler);
  // The empty middle window keeps the previous datapoint, so the rate covers 20s.
  assert_eq!(
    vec![
      Flushed::Forwarded {
        key: key.clone(),
        time_nanos: seconds(30),
        value: 1.5,
      },
      Flushed::ForwardedFlushed(key),
    ],
    handler.take()
  );
}

#[test]
fn reset_transformation() {
  let elem = make_elem(
    MetricType::Counter,
    elem_data(
      vec![],
      vec![
        PipelineOp::Transformation(TransformationType::Reset),
        PipelineOp::Rollup(rollup("bar")),
      ],
    ),
  );
  let key = elem.forwarded_aggregation_key().unwrap().clone();
  elem.add_value(seconds(1), 4.0).unwrap();

  let handler = CapturingFlushHandler::default();
  elem.consume(seconds(10), ConsumeTimeFns::STANDARD, &handler);
  assert_eq!(
    vec![
      Flushed::Forwarded {
        key: key.clone(),
        time_nanos: seconds(10),
        value: 4.0,
      },
      Flushed::Forwarded {
        key: key.clone(),
        time_nanos: seconds(15),
        value: 0.0,
      },
      Flushed::ForwardedFlushed(key),
    ],
    handler.take()
  );
}

#[test]
fn nan_kept_when_configured() {
  let options = OptionsBuilder::default()
    .config(|c| c.discard_nan_aggregated_values = false)
    .build();
  let mut elem = MetricElem::new(MetricType::Gauge, options.elem_options.clone());
  elem
    .reset_set_data(elem_data(vec![AggregationType::Min], vec![]))
    .unwrap();
  elem.add_value(seconds(1), f64::NAN).unwrap();

  let handler = CapturingFlushHandler::default();
  elem.consume(seconds(10), ConsumeTimeFns::STANDARD, &handler);
  let flushed = handler.take();
  assert_eq!(1, flushed.len());
  assert!(matches!(&flushed[0], Flushed::Local { value, .. } if value.is_nan()));
}

#[test]
fn pooled_reuse() {
  let mut elem = make_elem(MetricType::Counter, elem_data(vec![], vec![]));
  elem.add_value(seconds(1), 1.0).unwrap();
  elem.mark_as_tombstoned();
  elem.reset();
  assert!(elem.window_starts().is_empty());
  assert!(!elem.is_tombstoned());

  elem
    .reset_set_data(ElemData {
      id: Bytes::from_static(b"bar"),
      ..elem_data(vec![], vec![])
    })
    .unwrap();
  elem
    .add_union(seconds(1), &MetricUnion {
      id: Bytes::from_static(b"bar"),
      value: UntimedValue::Counter(2),
    })
    .unwrap();
  let handler = CapturingFlushHandler::default();
  elem.consume(seconds(10), ConsumeTimeFns::STANDARD, &handler);
  assert_eq!(
    vec![Flushed::local("counters.bar", seconds(10), 2.0, storage_policy("10s:2d"))],
    handler.take()
  );
}

fn flushed_sum(flushed: Vec<Flushed>) -> f64 {
  flushed
    .into_iter()
    .map(|f| match f {
      Flushed::Local { value, .. } => value,
      _ => unreachable!(),
    })
    .sum()
}

#[test]
fn concurrent_writes_racing_consume() {
  let elem = make_elem(MetricType::Counter, elem_data(vec![], vec![]));
  let handler = CapturingFlushHandler::default();
  let accepted = AtomicU64::new(0);
  let done = AtomicBool::new(false);

  std::thread::scope(|s| {
    let writers: Vec<_> = (0 .. 4)
      .map(|writer| {
        let elem = &elem;
        let accepted = &accepted;
        s.spawn(move || {
          for i in 0 .. 2000 {
            // Writers alternate between a shared window and their own.
            let second = if i % 2 == 0 { i % 50 } else { writer * 10 + 1 };
            match elem.add_value(seconds(second), 1.0) {
              Ok(()) => {
                accepted.fetch_add(1, Ordering::Relaxed);
              },
              Err(e) => assert_eq!(ElemError::AggregationClosed, e),
            }
          }
        })
      })
      .collect();

    let consumer = s.spawn(|| {
      let mut target = 0;
      while !done.load(Ordering::Relaxed) {
        target = (target + 10) % 60;
        elem.consume(seconds(target), ConsumeTimeFns::STANDARD, &handler);
      }
    });

    for writer in writers {
      writer.join().unwrap();
    }
    done.store(true, Ordering::Relaxed);
    consumer.join().unwrap();
  });

  elem.consume(i64::MAX, ConsumeTimeFns::STANDARD, &handler);
  assert!(elem.window_starts().is_empty());
  // Every accepted value is flushed exactly once.
  assert_eq!(
    accepted.load(Ordering::Relaxed).lossy_to_f64(),
    flushed_sum(handler.take())
  );
}

fn add_unique_all(writes: &[(u8, u8, i8)]) -> Vec<Flushed> {
  let elem = make_elem(MetricType::Counter, elem_data(vec![], vec![]));
  for (window, source, value) in writes {
    let time_nanos = seconds(i64::from(window % 4) * 10 + 1);
    match elem.add_unique(time_nanos, &[f64::from(*value)], u32::from(source % 4)) {
      Ok(()) | Err(ElemError::DuplicateForwardingSource) => {},
      Err(e) => panic!("unexpected error {e}"),
    }
  }
  let handler = CapturingFlushHandler::default();
  elem.consume(seconds(40), ConsumeTimeFns::STANDARD, &handler);
  handler.take()
}

// Repeating a (window, source) pair never changes what the window accumulates.
#[quickcheck]
fn add_unique_ignores_repeated_sources(writes: Vec<(u8, u8, i8)>) -> bool {
  let repeated: Vec<(u8, u8, i8)> = writes.iter().flat_map(|w| [*w, *w]).collect();
  add_unique_all(&writes) == add_unique_all(&repeated)
}

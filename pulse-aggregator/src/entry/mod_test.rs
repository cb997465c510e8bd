// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use crate::config::AggregatorConfig;
use crate::metric::aggregation_type::AggregationType;
use crate::metric::metadata::PipelineMetadata;
use crate::test::{CapturingFlushHandler, Flushed, OptionsBuilder, seconds, storage_policy};
use matches::assert_matches;
use pretty_assertions::assert_eq;
use time::ext::NumericalDuration;

struct Helper {
  builder: OptionsBuilder,
  handler: Arc<CapturingFlushHandler>,
  lists: Arc<MetricLists>,
  entry: Entry,
}

impl Helper {
  fn new() -> Self {
    Self::with_config(|_| {})
  }

  fn with_config(f: impl FnOnce(&mut AggregatorConfig)) -> Self {
    let builder = OptionsBuilder::default().config(f);
    builder.time_provider.set(100.seconds());
    let options = builder.build();
    let handler = Arc::new(CapturingFlushHandler::default());
    let lists = Arc::new(MetricLists::new(0, options.clone(), handler.clone()));
    let entry = Entry::new(lists.clone(), options);
    Self {
      builder,
      handler,
      lists,
      entry,
    }
  }

  fn advance(&self, by: time::Duration) {
    self.builder.time_provider.advance(by);
  }

  fn flush_standard(&self, resolution: time::Duration, target_nanos: i64) -> Vec<Flushed> {
    self
      .lists
      .find_or_create(MetricListId::Standard { resolution })
      .flush_before(target_nanos);
    self.handler.take()
  }
}

fn pipeline(aggregation_types: Vec<AggregationType>, policies: &[&str]) -> PipelineMetadata {
  PipelineMetadata {
    aggregation_types: AggregationTypes::new(aggregation_types),
    storage_policies: policies.iter().map(|p| storage_policy(p)).collect(),
    pipeline: Pipeline::default(),
  }
}

fn staged_metadata(cutover_nanos: i64, pipelines: Vec<PipelineMetadata>) -> StagedMetadata {
  StagedMetadata {
    cutover_nanos,
    tombstoned: false,
    metadata: Metadata { pipelines },
  }
}

fn staged(cutover_nanos: i64, pipelines: Vec<PipelineMetadata>) -> StagedMetadatas {
  StagedMetadatas(vec![staged_metadata(cutover_nanos, pipelines)])
}

fn key(aggregation_types: Vec<AggregationType>, policy: &str) -> AggregationKey {
  AggregationKey {
    aggregation_types: AggregationTypes::new(aggregation_types),
    storage_policy: storage_policy(policy),
    pipeline: Pipeline::default(),
    num_forwarded_times: 0,
  }
}

#[test]
fn default_metadatas() {
  let helper = Helper::new();
  let metadatas = StagedMetadatas::default_metadatas();
  helper
    .entry
    .add_untimed(&MetricUnion::counter("foo", 1), &metadatas)
    .unwrap();
  helper
    .entry
    .add_untimed(&MetricUnion::counter("foo", 1), &metadatas)
    .unwrap();
  helper.advance(12.seconds());
  helper
    .entry
    .add_untimed(&MetricUnion::counter("foo", 3), &metadatas)
    .unwrap();
  assert_eq!(vec![key(vec![], "10s:2d")], helper.entry.bound_keys());

  assert_eq!(
    vec![
      Flushed::local("counters.foo", seconds(110), 2.0, storage_policy("10s:2d")),
      Flushed::local("counters.foo", seconds(120), 3.0, storage_policy("10s:2d")),
    ],
    helper.flush_standard(10.seconds(), seconds(120))
  );
}

#[test]
fn staged_metadata_binds_one_element_per_key() {
  let helper = Helper::new();
  let metadatas = staged(
    0,
    vec![
      pipeline(vec![AggregationType::Max], &["10s:2d", "1m:40d"]),
      pipeline(vec![AggregationType::Max], &["10s:2d"]),
      pipeline(vec![AggregationType::Sum], &[]),
    ],
  );
  helper
    .entry
    .add_untimed(&MetricUnion::counter("foo", 4), &metadatas)
    .unwrap();
  assert_eq!(
    vec![
      key(vec![AggregationType::Max], "10s:2d"),
      key(vec![AggregationType::Max], "1m:40d"),
      key(vec![AggregationType::Sum], "10s:2d"),
    ],
    helper.entry.bound_keys()
  );

  assert_eq!(
    vec![
      Flushed::local(
        "counters.foo.upper",
        seconds(110),
        4.0,
        storage_policy("10s:2d")
      ),
      Flushed::local(
        "counters.foo.sum",
        seconds(110),
        4.0,
        storage_policy("10s:2d")
      ),
    ],
    helper.flush_standard(10.seconds(), seconds(110))
  );
  assert_eq!(
    vec![Flushed::local(
      "counters.foo.upper",
      seconds(120),
      4.0,
      storage_policy("1m:40d")
    )],
    helper.flush_standard(1.minutes(), seconds(120))
  );
}

#[test]
fn metadata_update_rebinds() {
  let helper = Helper::new();
  helper
    .entry
    .add_untimed(
      &MetricUnion::counter("foo", 1),
      &staged(
        0,
        vec![pipeline(vec![AggregationType::Max], &["10s:2d", "1m:40d"])],
      ),
    )
    .unwrap();
  let before = helper.entry.bound_elems();

  helper.advance(5.seconds());
  let metadatas = StagedMetadatas(vec![
    staged_metadata(
      0,
      vec![pipeline(vec![AggregationType::Max], &["10s:2d", "1m:40d"])],
    ),
    staged_metadata(
      seconds(105),
      vec![pipeline(vec![AggregationType::Max], &["10s:2d"])],
    ),
  ]);
  helper
    .entry
    .add_untimed(&MetricUnion::counter("foo", 2), &metadatas)
    .unwrap();

  let after = helper.entry.bound_elems();
  assert_eq!(1, after.len());
  assert!(Arc::ptr_eq(&before[0], &after[0]));
  assert!(!before[0].is_tombstoned());
  assert!(before[1].is_tombstoned());

  // The dropped element still drains what it buffered.
  assert_eq!(
    vec![Flushed::local(
      "counters.foo.upper",
      seconds(120),
      1.0,
      storage_policy("1m:40d")
    )],
    helper.flush_standard(1.minutes(), seconds(120))
  );
}

#[test]
fn stale_metadata_keeps_bindings() {
  let helper = Helper::new();
  helper
    .entry
    .add_untimed(
      &MetricUnion::counter("foo", 1),
      &staged(seconds(50), vec![pipeline(vec![AggregationType::Max], &["10s:2d"])]),
    )
    .unwrap();
  helper
    .entry
    .add_untimed(
      &MetricUnion::counter("foo", 1),
      &staged(seconds(10), vec![pipeline(vec![AggregationType::Min], &["10s:2d"])]),
    )
    .unwrap();
  assert_eq!(
    vec![key(vec![AggregationType::Max], "10s:2d")],
    helper.entry.bound_keys()
  );
  assert_eq!(1, helper.builder.counter("entry", "stale_metadata"));
}

#[test]
fn tombstoned_metadata_is_dropped() {
  let helper = Helper::new();
  let mut metadatas = staged(0, vec![pipeline(vec![], &[])]);
  metadatas.0[0].tombstoned = true;
  helper
    .entry
    .add_untimed(&MetricUnion::counter("foo", 1), &metadatas)
    .unwrap();
  assert!(helper.entry.bound_keys().is_empty());
  assert!(helper.lists.is_empty());
  assert_eq!(1, helper.builder.counter("entry", "tombstoned_metadata"));
}

#[test]
fn metadata_errors() {
  let helper = Helper::new();
  assert_eq!(
    Err(EntryError::NoPipelines),
    helper
      .entry
      .add_untimed(&MetricUnion::counter("foo", 1), &staged(0, vec![]))
  );
  assert_eq!(
    Err(EntryError::NoApplicableMetadata),
    helper.entry.add_untimed(
      &MetricUnion::counter("foo", 1),
      &staged(seconds(1000), vec![pipeline(vec![], &[])])
    )
  );
  assert_eq!(
    Err(EntryError::NoApplicableMetadata),
    helper
      .entry
      .add_untimed(&MetricUnion::counter("foo", 1), &StagedMetadatas::default())
  );
}

#[test]
fn failed_update_keeps_previous_bindings() {
  let helper = Helper::new();
  helper
    .entry
    .add_untimed(
      &MetricUnion::counter("foo", 1),
      &staged(0, vec![pipeline(vec![AggregationType::Max], &["10s:2d"])]),
    )
    .unwrap();

  let result = helper.entry.add_untimed(
    &MetricUnion::counter("foo", 1),
    &staged(
      seconds(50),
      vec![
        pipeline(vec![AggregationType::Sum], &["10s:2d"]),
        pipeline(vec![AggregationType::P99], &["10s:2d"]),
      ],
    ),
  );
  assert_eq!(
    Err(EntryError::Elem(ElemError::InvalidAggregationTypes(
      MetricType::Counter
    ))),
    result
  );
  assert_eq!(
    vec![key(vec![AggregationType::Max], "10s:2d")],
    helper.entry.bound_keys()
  );

  // The element created for the sum binding was tombstoned and is collected on flush.
  let list = helper.lists.find_or_create(MetricListId::Standard {
    resolution: 10.seconds(),
  });
  assert_eq!(2, list.len());
  list.flush_before(seconds(110));
  assert_eq!(1, list.len());
}

#[test]
fn rate_limited() {
  let helper = Helper::with_config(|config| config.max_values_per_entry_per_second = 3);
  let metadatas = StagedMetadatas::default_metadatas();
  helper
    .entry
    .add_untimed(&MetricUnion::batch_timer("foo", vec![1.0, 2.0]), &metadatas)
    .unwrap();
  assert_eq!(
    Err(EntryError::RateLimited),
    helper
      .entry
      .add_untimed(&MetricUnion::batch_timer("foo", vec![1.0, 2.0]), &metadatas)
  );
  assert_eq!(1, helper.builder.counter("entry", "rate_limited"));

  helper.advance(1.seconds());
  helper
    .entry
    .add_untimed(&MetricUnion::batch_timer("foo", vec![1.0, 2.0]), &metadatas)
    .unwrap();
}

fn forward_metadata(aggregation_types: Vec<AggregationType>, source_id: u32) -> ForwardMetadata {
  ForwardMetadata {
    aggregation_types: AggregationTypes::new(aggregation_types),
    storage_policy: storage_policy("10s:2d"),
    pipeline: Pipeline::default(),
    source_id,
    num_forwarded_times: 1,
  }
}

fn forwarded_metric(time_nanos: i64, value: f64) -> ForwardedMetric {
  ForwardedMetric {
    metric_type: MetricType::Counter,
    id: Bytes::from_static(b"foo"),
    time_nanos,
    values: vec![value],
  }
}

#[test]
fn add_forwarded() {
  let helper = Helper::new();

  // 10s of resolution plus 15s for the one hop.
  assert_eq!(
    Err(EntryError::ArrivedTooLate {
      time_nanos: seconds(70),
      cutoff_nanos: seconds(75),
    }),
    helper
      .entry
      .add_forwarded(&forwarded_metric(seconds(70), 1.0), &forward_metadata(vec![], 1))
  );

  helper
    .entry
    .add_forwarded(&forwarded_metric(seconds(90), 4.0), &forward_metadata(vec![], 1))
    .unwrap();
  helper
    .entry
    .add_forwarded(&forwarded_metric(seconds(90), 4.0), &forward_metadata(vec![], 1))
    .unwrap();
  helper
    .entry
    .add_forwarded(&forwarded_metric(seconds(90), 6.0), &forward_metadata(vec![], 2))
    .unwrap();
  assert_eq!(1, helper.builder.counter("entry", "arrived_too_late"));
  assert_eq!(1, helper.builder.counter("entry", "duplicate_sources"));

  let list = helper.lists.find_or_create(MetricListId::Forwarded {
    resolution: 10.seconds(),
    num_forwarded_times: 1,
  });
  list.flush_before(seconds(100));
  assert_eq!(
    vec![Flushed::local("foo", seconds(90), 10.0, storage_policy("10s:2d"))],
    helper.handler.take()
  );
}

#[test]
fn forwarded_entry_has_one_binding() {
  let helper = Helper::new();
  helper
    .entry
    .add_forwarded(&forwarded_metric(seconds(90), 1.0), &forward_metadata(vec![], 1))
    .unwrap();
  let before = helper.entry.bound_elems();

  helper
    .entry
    .add_forwarded(
      &forwarded_metric(seconds(90), 1.0),
      &forward_metadata(vec![AggregationType::Max], 1),
    )
    .unwrap();
  let after = helper.entry.bound_elems();
  assert_eq!(1, after.len());
  assert!(before[0].is_tombstoned());
  assert!(!after[0].is_tombstoned());
  assert_eq!(
    vec![AggregationKey {
      num_forwarded_times: 1,
      ..key(vec![AggregationType::Max], "10s:2d")
    }],
    helper.entry.bound_keys()
  );
}

fn timed_metric(time_nanos: i64, value: f64) -> TimedMetric {
  TimedMetric {
    metric_type: MetricType::Counter,
    id: Bytes::from_static(b"foo"),
    time_nanos,
    value,
  }
}

fn timed_metadata(aggregation_types: Vec<AggregationType>) -> TimedMetadata {
  TimedMetadata {
    aggregation_types: AggregationTypes::new(aggregation_types),
    storage_policy: storage_policy("10s:2d"),
  }
}

#[test]
fn timed() {
  let helper = Helper::new();
  let metadata = timed_metadata(vec![]);

  assert_eq!(
    Err(EntryError::TooFarInPast {
      time_nanos: seconds(39),
      cutoff_nanos: seconds(40),
    }),
    helper.entry.add_timed(&timed_metric(seconds(39), 1.0), &metadata)
  );
  assert_eq!(
    Err(EntryError::TooFarInFuture {
      time_nanos: seconds(111),
      cutoff_nanos: seconds(110),
    }),
    helper.entry.add_timed(&timed_metric(seconds(111), 1.0), &metadata)
  );
  assert_eq!(1, helper.builder.counter("entry", "timed_too_far_in_past"));
  assert_eq!(1, helper.builder.counter("entry", "timed_too_far_in_future"));

  // Samples land in the window of their own timestamp, not the arrival time.
  helper
    .entry
    .add_timed(&timed_metric(seconds(40), 2.0), &metadata)
    .unwrap();
  helper
    .entry
    .add_timed(&timed_metric(seconds(45), 3.0), &metadata)
    .unwrap();
  helper
    .entry
    .add_timed(&timed_metric(seconds(110), 5.0), &metadata)
    .unwrap();

  let list = helper.lists.find_or_create(MetricListId::Timed {
    resolution: 10.seconds(),
  });
  list.flush_before(seconds(120));
  assert_eq!(
    vec![
      Flushed::local("counters.foo", seconds(50), 5.0, storage_policy("10s:2d")),
      Flushed::local("counters.foo", seconds(120), 5.0, storage_policy("10s:2d")),
    ],
    helper.handler.take()
  );
}

#[test]
fn timed_entry_has_one_binding() {
  let helper = Helper::new();
  helper
    .entry
    .add_timed(&timed_metric(seconds(90), 1.0), &timed_metadata(vec![]))
    .unwrap();
  let before = helper.entry.bound_elems();

  helper
    .entry
    .add_timed(
      &timed_metric(seconds(90), 1.0),
      &timed_metadata(vec![AggregationType::Max]),
    )
    .unwrap();
  let after = helper.entry.bound_elems();
  assert_eq!(1, after.len());
  assert!(before[0].is_tombstoned());
  assert!(!after[0].is_tombstoned());
  assert_eq!(
    vec![key(vec![AggregationType::Max], "10s:2d")],
    helper.entry.bound_keys()
  );
  assert_eq!(2, helper.builder.counter("entry", "metadata_updates"));

  helper.entry.close();
  assert_eq!(
    Err(EntryError::Closed),
    helper
      .entry
      .add_timed(&timed_metric(seconds(90), 1.0), &timed_metadata(vec![]))
  );
}

#[test]
fn expiry() {
  let helper = Helper::with_config(|config| {
    config.entry_ttl = std::time::Duration::from_secs(60);
  });
  let metadatas = StagedMetadatas::default_metadatas();
  helper
    .entry
    .add_untimed(&MetricUnion::counter("foo", 1), &metadatas)
    .unwrap();
  let elems = helper.entry.bound_elems();
  let now = seconds(160);
  assert!(!helper.entry.should_expire(now));

  helper.advance(61.seconds());
  let now = seconds(161);
  helper.entry.inc_writer();
  assert!(!helper.entry.should_expire(now));
  assert!(!helper.entry.try_expire(now));
  helper.entry.dec_writer();
  assert!(helper.entry.should_expire(now));
  assert!(helper.entry.try_expire(now));
  assert!(!helper.entry.try_expire(now));

  assert!(helper.entry.is_closed());
  assert!(elems[0].is_tombstoned());
  assert!(helper.entry.bound_keys().is_empty());
  assert_eq!(
    Err(EntryError::Closed),
    helper
      .entry
      .add_untimed(&MetricUnion::counter("foo", 1), &metadatas)
  );
}

#[test]
fn multi_error() {
  let result = MultiError::into_result(vec![EntryError::Closed, EntryError::RateLimited]);
  assert_matches!(&result, Err(EntryError::Multiple(MultiError(errors))) if errors.len() == 2);
  assert_eq!(
    "2 errors: [entry is closed, entry is rate limited]",
    result.unwrap_err().to_string()
  );
  assert_eq!(Ok(()), MultiError::into_result(vec![]));
  assert_eq!(
    Err(EntryError::NoPipelines),
    MultiError::into_result(vec![EntryError::NoPipelines])
  );
}

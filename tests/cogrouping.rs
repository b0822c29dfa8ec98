//! End-to-end co-grouping: two channels aggregated per key into one store,
//! across restarts.

use stateweave::channel::Channels;
use stateweave::codec::{JsonSerde, Serde, StringSerde};
use stateweave::config::StreamsConfig;
use stateweave::processor::{CoGroupProcessor, CoGrouped, MapProcessor};
use stateweave::runtime::{Runtime, RuntimeState};
use stateweave::state::{CleanupPolicy, LogConfig, Stores};
use stateweave::topology::Topology;
use std::time::Duration;
use tempfile::TempDir;

type Tuple = CoGrouped<u32, String>;

/// A page view: (user, page)
type View = (String, u32);

fn topology(persistent: bool) -> Topology {
  let store = Stores::key_value::<String, Tuple>("clicks-and-purchases", StringSerde, JsonSerde::new())
    .with_logging_enabled(LogConfig {
      retention: Duration::from_secs(120),
      cleanup_policy: CleanupPolicy::Compact,
      ..LogConfig::default()
    });
  let store = if persistent { store.persistent() } else { store.in_memory() };

  let mut topology = Topology::new();
  topology
    .add_source("views-source", "views", StringSerde, JsonSerde::<View>::new())
    .unwrap()
    .add_source("purchases-source", "purchases", StringSerde, StringSerde)
    .unwrap()
    // views are keyed by page; re-key them by user
    .add_processor(
      "rekey-views",
      || MapProcessor::typed(|_: &String, view: &View| Some((view.0.clone(), view.1))),
      &["views-source"],
    )
    .unwrap()
    .add_processor(
      "cogroup",
      || CoGroupProcessor::<String, u32, String>::new("clicks-and-purchases"),
      &["rekey-views", "purchases-source"],
    )
    .unwrap()
    .add_state_store(store.build(), &["cogroup"])
    .unwrap()
    .add_sink("sink", "tuples", StringSerde, JsonSerde::<Tuple>::new(), &["cogroup"])
    .unwrap();
  topology
}

fn config(tmp: &TempDir) -> StreamsConfig {
  StreamsConfig::new("cogrouping")
    .with_state_dir(tmp.path())
    .with_poll_timeout(Duration::from_millis(10))
    .with_commit_interval(Duration::from_millis(50))
}

async fn wait_for(channels: &Channels, channel: &str, count: u64) {
  let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
  while channels.end_offset(channel) < count {
    assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {channel}");
    tokio::time::sleep(Duration::from_millis(5)).await;
  }
}

fn last_tuple(channels: &Channels, key: &str) -> Tuple {
  let serde = JsonSerde::<Tuple>::new();
  channels
    .records("tuples")
    .iter()
    .rev()
    .find(|r| r.key.as_ref() == key.as_bytes())
    .map(|r| serde.deserialize(&r.value).unwrap())
    .unwrap()
}

fn send_view(channels: &Channels, page: &str, user: &str, dwell: u32) {
  channels
    .producer("views", StringSerde, JsonSerde::<View>::new())
    .send(&page.to_string(), &(user.to_string(), dwell))
    .unwrap();
}

fn send_purchase(channels: &Channels, user: &str, item: &str) {
  channels
    .producer("purchases", StringSerde, StringSerde)
    .send(&user.to_string(), &item.to_string())
    .unwrap();
}

#[tokio::test]
async fn test_one_record_per_side_in_either_order() {
  for views_first in [true, false] {
    let tmp = TempDir::new().unwrap();
    let channels = Channels::new();
    let mut runtime = Runtime::new(topology(false), channels.clone(), config(&tmp)).unwrap();
    runtime.start().await.unwrap();

    if views_first {
      send_view(&channels, "home", "K", 7);
      wait_for(&channels, "tuples", 1).await;
      send_purchase(&channels, "K", "book");
    } else {
      send_purchase(&channels, "K", "book");
      wait_for(&channels, "tuples", 1).await;
      send_view(&channels, "home", "K", 7);
    }
    wait_for(&channels, "tuples", 2).await;
    runtime.close().await.unwrap();

    assert_eq!(
      last_tuple(&channels, "K"),
      CoGrouped {
        left: vec![7],
        right: vec!["book".to_string()],
      }
    );
  }
}

#[tokio::test]
async fn test_aggregate_survives_restart() {
  for persistent in [true, false] {
    let tmp = TempDir::new().unwrap();
    let channels = Channels::new();

    let mut first = Runtime::new(topology(persistent), channels.clone(), config(&tmp)).unwrap();
    first.start().await.unwrap();
    send_view(&channels, "home", "alice", 1);
    send_purchase(&channels, "alice", "lamp");
    send_view(&channels, "cart", "bob", 2);
    wait_for(&channels, "tuples", 3).await;
    first.close().await.unwrap();

    let mut second = Runtime::new(topology(persistent), channels.clone(), config(&tmp)).unwrap();
    second.start().await.unwrap();
    assert_eq!(second.state(), RuntimeState::Running);
    if persistent {
      // the store file and its checkpoint already hold everything
      assert!(second.restored().is_empty());
    } else {
      assert_eq!(second.restored().len(), 1);
      assert_eq!(second.restored()[0].restored, 3);
    }

    send_view(&channels, "checkout", "alice", 3);
    wait_for(&channels, "tuples", 4).await;
    second.close().await.unwrap();

    assert_eq!(
      last_tuple(&channels, "alice"),
      CoGrouped {
        left: vec![1, 3],
        right: vec!["lamp".to_string()],
      }
    );
    // consumed records are not processed again
    assert_eq!(channels.end_offset("tuples"), 4);
  }
}

#[tokio::test]
async fn test_clean_up_restores_from_changelog() {
  let tmp = TempDir::new().unwrap();
  let channels = Channels::new();

  let mut first = Runtime::new(topology(true), channels.clone(), config(&tmp)).unwrap();
  first.start().await.unwrap();
  send_purchase(&channels, "carol", "pen");
  send_purchase(&channels, "carol", "ink");
  wait_for(&channels, "tuples", 2).await;
  first.close().await.unwrap();
  first.clean_up().unwrap();

  let mut second = Runtime::new(topology(true), channels.clone(), config(&tmp)).unwrap();
  second.start().await.unwrap();
  assert_eq!(second.restored().len(), 1);
  assert_eq!(second.restored()[0].start_offset, 0);
  assert_eq!(second.restored()[0].restored, 2);

  send_view(&channels, "home", "carol", 9);
  wait_for(&channels, "tuples", 3).await;
  second.close().await.unwrap();

  assert_eq!(
    last_tuple(&channels, "carol"),
    CoGrouped {
      left: vec![9],
      right: vec!["pen".to_string(), "ink".to_string()],
    }
  );
}

#[test]
fn test_description_lists_the_wiring() {
  let text = topology(true).describe().to_string();
  assert!(text.contains("Source: views-source (channels: [views])"));
  assert!(text.contains("Processor: cogroup (stores: [clicks-and-purchases])"));
  assert!(text.contains("<-- rekey-views, purchases-source"));
  assert!(text.contains("clicks-and-purchases (persistent: true, logged: true)"));
}

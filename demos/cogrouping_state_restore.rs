//! # Co-grouping with state restoration
//!
//! Demonstrates:
//! - **Co-grouping**: day-trading click events and stock transactions keyed by
//!   symbol, aggregated into one `(clicks, transactions)` tuple per symbol.
//! - **Change-logged state**: the aggregate store is persistent and its change
//!   log is compacted.
//! - **Restoration**: the application runs, stops, wipes its local state and
//!   starts again; the logging listener reports the replay of the change log.
//!
//! Run with `cargo run --example cogrouping_state_restore`.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use stateweave::channel::{ChannelProducer, Channels};
use stateweave::codec::{JsonSerde, StringSerde};
use stateweave::config::{StreamsConfig, TimestampExtractor};
use stateweave::processor::{CoGroupProcessor, CoGrouped, EmitMode, MapProcessor, PrintProcessor};
use stateweave::restore::LoggingRestoreListener;
use stateweave::runtime::Runtime;
use stateweave::state::{LogConfig, Stores};
use stateweave::topology::Topology;
use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, info};

const SYMBOLS: [&str; 5] = ["AAPL", "AMZN", "GOOG", "MSFT", "NFLX"];
const TUPLE_STORE: &str = "tupleCoGroupStore";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ClickEvent {
  symbol: String,
  link: String,
  timestamp_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StockTransaction {
  symbol: String,
  customer_id: String,
  shares: u32,
  share_price: f64,
  purchase: bool,
}

type EventPerformance = CoGrouped<ClickEvent, StockTransaction>;

fn build_topology() -> Result<Topology, Box<dyn Error>> {
  let mut changelog_settings = HashMap::new();
  changelog_settings.insert("retention.ms".to_string(), "120000".to_string());
  changelog_settings.insert("cleanup.policy".to_string(), "compact".to_string());
  let log_config = LogConfig::from_map(&changelog_settings)?;

  let mut topology = Topology::new();
  topology
    .add_source(
      "Txn-Source",
      "stock-transactions",
      StringSerde,
      JsonSerde::<StockTransaction>::new(),
    )?
    .add_source("Events-Source", "events", StringSerde, JsonSerde::<ClickEvent>::new())?
    .add_processor(
      "Txn-Processor",
      || {
        MapProcessor::typed(|_: &String, txn: &StockTransaction| {
          Some((txn.symbol.clone(), txn.clone()))
        })
      },
      &["Txn-Source"],
    )?
    .add_processor(
      "Events-Processor",
      || {
        MapProcessor::typed(|_: &String, click: &ClickEvent| {
          Some((click.symbol.clone(), click.clone()))
        })
      },
      &["Events-Source"],
    )?
    .add_processor(
      "CoGrouping-Processor",
      || {
        CoGroupProcessor::<String, ClickEvent, StockTransaction>::new(TUPLE_STORE)
          .with_emit_mode(EmitMode::Interval(Duration::from_secs(2)))
      },
      &["Txn-Processor", "Events-Processor"],
    )?
    .add_state_store(
      Stores::key_value::<String, EventPerformance>(TUPLE_STORE, StringSerde, JsonSerde::new())
        .persistent()
        .with_logging_enabled(log_config)
        .build(),
      &["CoGrouping-Processor"],
    )?
    .add_sink(
      "Tuple-Sink",
      "cogrouped-results",
      StringSerde,
      JsonSerde::<EventPerformance>::new(),
      &["CoGrouping-Processor"],
    )?
    .add_processor(
      "Print",
      || PrintProcessor::<String, EventPerformance>::new("Co-Grouping"),
      &["CoGrouping-Processor"],
    )?;
  Ok(topology)
}

struct MockData {
  rng: StdRng,
  transactions: ChannelProducer<String, StockTransaction>,
  clicks: ChannelProducer<String, ClickEvent>,
}

impl MockData {
  fn new(channels: &Channels) -> Self {
    Self {
      rng: StdRng::from_entropy(),
      transactions: channels.producer("stock-transactions", StringSerde, JsonSerde::new()),
      clicks: channels.producer("events", StringSerde, JsonSerde::new()),
    }
  }

  fn symbol(&mut self) -> String {
    SYMBOLS.choose(&mut self.rng).copied().unwrap_or("AAPL").to_string()
  }

  /// Produces `transactions` stock transactions and `clicks` click events.
  fn produce(&mut self, transactions: usize, clicks: usize) -> Result<(), Box<dyn Error>> {
    for _ in 0..transactions {
      let txn = StockTransaction {
        symbol: self.symbol(),
        customer_id: format!("customer-{}", self.rng.gen_range(1..20)),
        shares: self.rng.gen_range(1..500),
        share_price: (self.rng.gen_range(1_000..50_000) as f64) / 100.0,
        purchase: self.rng.gen_bool(0.5),
      };
      self.transactions.send(&txn.customer_id, &txn)?;
    }
    for _ in 0..clicks {
      let symbol = self.symbol();
      let click = ClickEvent {
        link: format!("https://finance.example.com/{}", symbol.to_lowercase()),
        timestamp_ms: chrono::Utc::now().timestamp_millis(),
        symbol,
      };
      self.clicks.send(&click.link, &click)?;
    }
    Ok(())
  }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
  tracing_subscriber::fmt().with_max_level(Level::INFO).init();

  let state_dir = tempfile::tempdir()?;
  let channels = Channels::new();
  let config = StreamsConfig::new("cogrouping-restoring-appid")
    .with_client_id("cogrouping-restoring-client")
    .with_state_dir(state_dir.path())
    .with_commit_interval(Duration::from_secs(1))
    .with_timestamp_extractor(TimestampExtractor::WallClock);

  let topology = build_topology()?;
  info!("\n{}", topology.describe());

  let mut mock = MockData::new(&channels);

  // first run: builds the store and its change log
  let mut runtime = Runtime::new(topology.clone(), channels.clone(), config.clone())?;
  runtime.clean_up()?;
  runtime.start().await?;
  info!("Co-Grouping App Started");
  for _ in 0..5 {
    mock.produce(50, 100)?;
    tokio::time::sleep(Duration::from_millis(500)).await;
  }
  tokio::time::sleep(Duration::from_secs(3)).await;
  info!("Shutting down the Co-Grouping App now");
  runtime.close().await?;

  // second run: local state is gone, the store is rebuilt from its change log
  let mut runtime = Runtime::new(topology, channels.clone(), config)?;
  runtime.set_restore_listener(Arc::new(LoggingRestoreListener::new()));
  runtime.clean_up()?;
  runtime.start().await?;
  for summary in runtime.restored() {
    info!(
      store = %summary.store,
      restored = summary.restored,
      "store rebuilt from offsets {}..{}",
      summary.start_offset,
      summary.end_offset
    );
  }
  mock.produce(10, 20)?;
  tokio::time::sleep(Duration::from_secs(3)).await;
  runtime.close().await?;

  info!(
    results = channels.end_offset("cogrouped-results"),
    "co-grouped results written"
  );
  Ok(())
}

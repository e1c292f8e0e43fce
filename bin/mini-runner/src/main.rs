use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use confluence_core::{
    Headers, JoinType, PartitionId, Record, StreamMessage, StreamSide, Timestamp,
    WINDOW_END_TIME, WINDOW_START_TIME,
};
use confluence_operators::{
    AggregateWindowConfig, JoinInput, JoinWindowConfig, JoinWindowProcessor, TimeUnit,
    WindowAggregateProcessor, WindowConfig,
};
use confluence_runtime::{
    spawn_partition_worker, stream_channel, Downstream, FnSink, Sender, StreamContext,
    TaskContext, WatermarkPolicy,
};
use confluence_state::{FileStateLog, FileStateLogConfig, StateLog};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum JoinKind {
    Inner,
    Left,
    Right,
}

impl From<JoinKind> for JoinType {
    fn from(kind: JoinKind) -> Self {
        match kind {
            JoinKind::Inner => JoinType::Inner,
            JoinKind::Left => JoinType::Left,
            JoinKind::Right => JoinType::Right,
        }
    }
}

/// Joins a synthetic order stream with a payment stream and counts orders
/// per window, keeping state in a local file log.
#[derive(Debug, Parser)]
#[command(name = "mini-runner")]
struct Args {
    /// Directory of the state log segments.
    #[arg(long, default_value = "./state")]
    state_dir: PathBuf,

    /// Join variant.
    #[arg(long, value_enum, default_value = "inner")]
    join: JoinKind,

    /// Tumbling window size in milliseconds.
    #[arg(long, default_value_t = 5_000)]
    window_ms: u64,

    /// Watermark lag behind the newest event time.
    #[arg(long, default_value_t = 2_000)]
    lateness_ms: u64,

    /// JSON join config; overrides --join and --window-ms.
    #[arg(long)]
    config: Option<PathBuf>,
}

type Order = String;
type Payment = i64;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let args = Args::parse();
    let join_config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("read {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?
        }
        None => JoinWindowConfig::new(
            "orders-payments",
            WindowConfig::tumbling(args.window_ms, TimeUnit::Millis),
            args.join.into(),
        ),
    };
    info!(?join_config, state_dir = %args.state_dir.display(), "starting mini runner");

    let log: Arc<dyn StateLog> = Arc::new(FileStateLog::open(FileStateLogConfig {
        dir: args.state_dir.clone(),
        ..FileStateLogConfig::default()
    })?);
    let policy = WatermarkPolicy::BoundedLateness {
        allowed_lateness_ms: args.lateness_ms,
    };

    let joined = FnSink::new(|ctx: &StreamContext<String>, value: String| {
        println!(
            "join window=[{}..{}] key={} {}",
            ctx.headers.get_int(WINDOW_START_TIME).unwrap_or_default(),
            ctx.headers.get_int(WINDOW_END_TIME).unwrap_or_default(),
            ctx.key,
            value
        );
        Ok(())
    });
    let join = JoinWindowProcessor::new(join_config, describe)?
        .with_downstream(Downstream::new().with(joined));

    let counted = FnSink::new(|ctx: &StreamContext<String>, count: u64| {
        println!(
            "count window=[{}..{}] key={} orders={}",
            ctx.headers.get_int(WINDOW_START_TIME).unwrap_or_default(),
            ctx.headers.get_int(WINDOW_END_TIME).unwrap_or_default(),
            ctx.key,
            count
        );
        Ok(())
    });
    let counter = WindowAggregateProcessor::new(
        AggregateWindowConfig::new(
            "order-count",
            WindowConfig::tumbling(args.window_ms, TimeUnit::Millis),
        ),
        |acc: &mut u64, _order: &Order| *acc += 1,
        |acc: &u64| *acc,
    )?
    .with_downstream(Downstream::new().with(counted));

    let (join_tx, join_rx) = stream_channel(32);
    let join_task = TaskContext::new(PartitionId::new("orders", "local", 0), log.clone());
    let join_handle = spawn_partition_worker("join", join_task, join, policy, join_rx);

    let (count_tx, count_rx) = stream_channel(32);
    let count_task = TaskContext::new(PartitionId::new("orders", "local", 1), log);
    let count_handle = spawn_partition_worker("count", count_task, counter, policy, count_rx);

    source(join_tx, count_tx).await?;

    let join_metrics = join_handle.await??;
    let count_metrics = count_handle.await??;
    info!(?join_metrics, ?count_metrics, "mini runner finished");
    Ok(())
}

fn describe(order: Option<&Order>, payment: Option<&Payment>) -> Result<String> {
    Ok(format!(
        "order={} payment={}",
        order.map(String::as_str).unwrap_or("-"),
        payment.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string())
    ))
}

async fn source(
    join_tx: Sender<Record<String, JoinInput<Order, Payment>>>,
    count_tx: Sender<Record<String, Order>>,
) -> Result<()> {
    // Synthetic, slightly out-of-order streams.
    let events: Vec<(Timestamp, &str, JoinInput<Order, Payment>)> = vec![
        (1_000, "alice", JoinInput::Left("book".into())),
        (1_500, "alice", JoinInput::Right(12)),
        (2_000, "bob", JoinInput::Left("pen".into())),
        (6_000, "carol", JoinInput::Left("lamp".into())),
        (3_000, "bob", JoinInput::Right(2)),
        (7_500, "carol", JoinInput::Right(40)),
        (8_000, "dave", JoinInput::Right(7)),
        (12_000, "alice", JoinInput::Left("mug".into())),
        (4_000, "erin", JoinInput::Left("late".into())),
    ];

    let mut max_ts: Timestamp = 0;
    for (ts, key, value) in events {
        max_ts = max_ts.max(ts);
        let side = match &value {
            JoinInput::Left(_) => StreamSide::Left,
            JoinInput::Right(_) => StreamSide::Right,
        };
        if let JoinInput::Left(order) = &value {
            count_tx
                .send(StreamMessage::Data(Record::new(key.to_string(), order.clone(), ts)))
                .await?;
        }
        let record = Record::new(key.to_string(), value, ts)
            .with_headers(Headers::new().with_side(side));
        join_tx.send(StreamMessage::Data(record)).await?;
    }

    // A final record past every window flushes what is still buffered.
    let flush = max_ts + 10_000;
    join_tx.send(StreamMessage::Watermark(flush)).await?;
    join_tx
        .send(StreamMessage::Data(
            Record::new("flush".to_string(), JoinInput::Left("-".into()), flush)
                .with_headers(Headers::new().with_side(StreamSide::Left)),
        ))
        .await?;
    count_tx.send(StreamMessage::Watermark(flush)).await?;
    count_tx
        .send(StreamMessage::Data(Record::new("flush".to_string(), "-".to_string(), flush)))
        .await?;

    join_tx.send(StreamMessage::End).await?;
    count_tx.send(StreamMessage::End).await?;
    Ok(())
}

//! Per-record context and downstream dispatch.

use anyhow::Result;
use async_trait::async_trait;
use confluence_core::{Headers, Record, StreamSide, Timestamp};
use std::marker::PhantomData;

use crate::{Processor, TaskContext};

/// Runtime metadata of the record being processed.
///
/// Built fresh for every record and every downstream hop, so a processor
/// changing its headers never affects what a sibling sees.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamContext<K> {
    pub key: K,
    pub event_time: Timestamp,
    pub watermark: Timestamp,
    pub headers: Headers,
}

impl<K> StreamContext<K> {
    pub fn new(key: K, event_time: Timestamp, watermark: Timestamp) -> Self {
        Self {
            key,
            event_time,
            watermark,
            headers: Headers::new(),
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// An owned copy of the headers for building an outgoing record.
    pub fn header_copy(&self) -> Headers {
        self.headers.clone()
    }

    pub fn stream_side(&self) -> Option<StreamSide> {
        self.headers.stream_side()
    }
}

/// The downstream processors of one operator.
pub struct Downstream<K, V> {
    children: Vec<Box<dyn Processor<Key = K, In = V>>>,
}

impl<K, V> Downstream<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            children: Vec::new(),
        }
    }

    pub fn add<P>(&mut self, child: P)
    where
        P: Processor<Key = K, In = V>,
    {
        self.children.push(Box::new(child));
    }

    pub fn with<P>(mut self, child: P) -> Self
    where
        P: Processor<Key = K, In = V>,
    {
        self.add(child);
        self
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub async fn open_all(&mut self, task: &TaskContext) -> Result<()> {
        for child in self.children.iter_mut() {
            child.open(task).await?;
        }
        Ok(())
    }

    pub async fn close_all(&mut self) -> Result<()> {
        for child in self.children.iter_mut() {
            child.close().await?;
        }
        Ok(())
    }

    /// Hand a record to every child, each with its own context.
    pub async fn forward(&mut self, record: Record<K, V>, watermark: Timestamp) -> Result<()> {
        for child in self.children.iter_mut() {
            let ctx = StreamContext::new(record.key.clone(), record.timestamp, watermark)
                .with_headers(record.headers.clone());
            child.process(&ctx, record.value.clone()).await?;
        }
        Ok(())
    }
}

impl<K, V> Default for Downstream<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Terminal processor backed by a closure.
pub struct FnSink<K, V, F> {
    f: F,
    _phantom: PhantomData<fn(K, V)>,
}

impl<K, V, F> FnSink<K, V, F>
where
    F: FnMut(&StreamContext<K>, V) -> Result<()> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _phantom: PhantomData,
        }
    }
}

#[async_trait]
impl<K, V, F> Processor for FnSink<K, V, F>
where
    K: Clone + Send + Sync + 'static,
    V: Send + 'static,
    F: FnMut(&StreamContext<K>, V) -> Result<()> + Send + 'static,
{
    type Key = K;
    type In = V;

    async fn process(&mut self, ctx: &StreamContext<K>, value: V) -> Result<()> {
        (self.f)(ctx, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use confluence_core::{HeaderValue, TimeWindow, WINDOW_END_TIME};
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Mutates its own context copy before recording it.
    struct Scribbler {
        seen: Arc<Mutex<Vec<Headers>>>,
    }

    #[async_trait]
    impl Processor for Scribbler {
        type Key = String;
        type In = i64;

        async fn process(&mut self, ctx: &StreamContext<String>, _value: i64) -> Result<()> {
            let mut headers = ctx.header_copy();
            headers.insert("scribbled", HeaderValue::Int(1));
            self.seen.lock().push(headers);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_each_child_gets_its_own_headers() {
        let scribbled = Arc::new(Mutex::new(Vec::new()));
        let plain = Arc::new(Mutex::new(Vec::new()));
        let plain_sink = plain.clone();

        let mut downstream = Downstream::new()
            .with(Scribbler {
                seen: scribbled.clone(),
            })
            .with(FnSink::new(move |ctx: &StreamContext<String>, v: i64| {
                plain_sink.lock().push((ctx.headers.clone(), v, ctx.watermark));
                Ok(())
            }));
        assert_eq!(downstream.len(), 2);

        let mut headers = Headers::new();
        headers.set_window(TimeWindow::new(0, 60));
        let record = Record::new("k".to_string(), 7, 10).with_headers(headers);
        downstream.forward(record, 65).await.unwrap();

        assert_eq!(scribbled.lock()[0].get_int("scribbled"), Some(1));
        let plain = plain.lock();
        assert_eq!(plain[0].0.get("scribbled"), None);
        assert_eq!(plain[0].0.get_int(WINDOW_END_TIME), Some(60));
        assert_eq!(plain[0].1, 7);
        assert_eq!(plain[0].2, 65);
    }

    #[tokio::test]
    async fn test_child_error_propagates() {
        let mut downstream: Downstream<String, i64> =
            Downstream::new().with(FnSink::new(|_: &StreamContext<String>, _: i64| {
                anyhow::bail!("sink full")
            }));
        let res = downstream
            .forward(Record::new("k".to_string(), 1, 1), 0)
            .await;
        assert!(res.is_err());
    }
}

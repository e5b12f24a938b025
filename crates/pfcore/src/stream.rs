use crate::Value;
use futures::stream::{BoxStream, Stream, StreamExt};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

struct Shared {
    source: tokio::sync::Mutex<Option<BoxStream<'static, Value>>>,
    recorded: Mutex<Vec<Value>>,
    exhausted: AtomicBool,
}

/// Pull-based, single-pass sequence of chunks produced by a streaming tool.
///
/// Clones share the same underlying source: every item pulled through any
/// clone is recorded, so run records that hold a clone see the materialized
/// content once the consumer has drained it. Once exhausted the source is
/// dropped and later pulls return `None`.
#[derive(Clone)]
pub struct GeneratorOutput {
    shared: Arc<Shared>,
}

impl GeneratorOutput {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Value> + Send + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                source: tokio::sync::Mutex::new(Some(stream.boxed())),
                recorded: Mutex::new(Vec::new()),
                exhausted: AtomicBool::new(false),
            }),
        }
    }

    pub fn from_items(items: Vec<Value>) -> Self {
        Self::new(futures::stream::iter(items))
    }

    /// Pull the next chunk. Returns `None` once the source is drained.
    pub async fn next(&self) -> Option<Value> {
        let mut source = self.shared.source.lock().await;
        let stream = source.as_mut()?;
        match stream.next().await {
            Some(item) => {
                if let Ok(mut recorded) = self.shared.recorded.lock() {
                    recorded.push(item.clone());
                }
                Some(item)
            }
            None => {
                // drop the source so the underlying connection closes promptly
                *source = None;
                self.shared.exhausted.store(true, Ordering::SeqCst);
                None
            }
        }
    }

    /// Drain every remaining chunk.
    pub async fn collect(&self) -> Vec<Value> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item);
        }
        items
    }

    /// Drain the remaining chunks and join their string forms.
    pub async fn join(&self) -> String {
        self.collect()
            .await
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join("")
    }

    /// Stop pulling and release the source without draining it.
    pub async fn close(&self) {
        let mut source = self.shared.source.lock().await;
        *source = None;
        self.shared.exhausted.store(true, Ordering::SeqCst);
    }

    pub fn is_exhausted(&self) -> bool {
        self.shared.exhausted.load(Ordering::SeqCst)
    }

    /// Items pulled so far, in emission order.
    pub fn recorded(&self) -> Vec<Value> {
        self.shared
            .recorded
            .lock()
            .map(|items| items.clone())
            .unwrap_or_default()
    }

    pub fn ptr_eq(&self, other: &GeneratorOutput) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Adapt into a `Stream` that pulls through this generator.
    pub fn into_stream(self) -> impl Stream<Item = Value> + Send + 'static {
        futures::stream::unfold(self, |gen| async move {
            let item = gen.next().await?;
            Some((item, gen))
        })
    }
}

impl fmt::Debug for GeneratorOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratorOutput")
            .field("recorded", &self.recorded().len())
            .field("exhausted", &self.is_exhausted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_consumption_is_empty() {
        let gen = GeneratorOutput::from_items(vec!["a".into(), "b".into(), "c".into()]);
        let first = gen.collect().await;
        assert_eq!(first, vec![Value::from("a"), Value::from("b"), Value::from("c")]);
        assert!(gen.is_exhausted());

        let second = gen.collect().await;
        assert!(second.is_empty(), "generator must not restart");
    }

    #[tokio::test]
    async fn test_clones_share_recorded_items() {
        let gen = GeneratorOutput::from_items(vec!["Hel".into(), "lo".into()]);
        let snapshot = gen.clone();
        assert!(snapshot.recorded().is_empty());

        assert_eq!(gen.join().await, "Hello");
        assert_eq!(snapshot.recorded(), vec![Value::from("Hel"), Value::from("lo")]);
        assert_eq!(
            serde_json::to_value(Value::Stream(snapshot)).unwrap(),
            serde_json::json!(["Hel", "lo"])
        );
    }
}

//! Typed page access operations.
//!
//! Features rarely speak raw bytes; these operations wrap the common
//! read/write shapes with `serde_json` encoding and a completion callback.
//! Each one is a regular [`Operation`], so enqueueing it on a
//! [`PageClient`](crate::PageClient) queue gives the usual ordering
//! guarantees, and each carries its callback in a [`FlowToken`], so the
//! callback fires exactly once even when the operation bails out early or is
//! dropped unrun.
//!
//! Stored bytes that fail to decode are logged and treated as absent; a
//! malformed value never panics a reader and never produces a placeholder.

use async_trait::async_trait;
use quire_core::{Page, PageSnapshot, PageToken, StoreResult};
use quire_tasks::{FlowToken, Operation};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::warn;

/// Read one key and decode it as `T`.
///
/// The callback receives `None` when the key is absent, the store call
/// fails, or the stored bytes do not decode as `T`.
pub struct ReadData<T: Send + 'static> {
    page: Arc<dyn Page>,
    key: Vec<u8>,
    token: Option<FlowToken<Option<T>>>,
}

impl<T: DeserializeOwned + Send + 'static> ReadData<T> {
    /// Read `key` from a fresh snapshot of `page`.
    pub fn new(
        page: Arc<dyn Page>,
        key: impl Into<Vec<u8>>,
        on_done: impl FnOnce(Option<T>) + Send + 'static,
    ) -> Self {
        Self {
            page,
            key: key.into(),
            token: Some(FlowToken::new(None, on_done)),
        }
    }
}

#[async_trait]
impl<T> Operation for ReadData<T>
where
    T: DeserializeOwned + Send + 'static,
{
    fn trace_name(&self) -> &str {
        "read_data"
    }

    async fn run(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        let snapshot = match self.page.snapshot(&self.key, None).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(error = %err, "read_data snapshot failed");
                return;
            }
        };
        let bytes = match snapshot.get(&self.key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return,
            Err(err) => {
                warn!(error = %err, "read_data get failed");
                return;
            }
        };
        match serde_json::from_slice::<T>(&bytes) {
            Ok(value) => token.set_result(Some(value)),
            Err(err) => {
                warn!(
                    key = %String::from_utf8_lossy(&self.key),
                    error = %err,
                    "stored value does not decode, treating as absent"
                );
            }
        }
    }
}

/// Read every entry under a prefix and decode each value as `T`.
///
/// Values that fail to decode are logged and skipped. On a store failure
/// the callback receives whatever was decoded up to that point.
pub struct ReadAllData<T: Send + 'static> {
    page: Arc<dyn Page>,
    prefix: Vec<u8>,
    token: Option<FlowToken<Vec<T>>>,
}

impl<T: DeserializeOwned + Send + 'static> ReadAllData<T> {
    /// Read all values under `prefix`, in key order.
    pub fn new(
        page: Arc<dyn Page>,
        prefix: impl Into<Vec<u8>>,
        on_done: impl FnOnce(Vec<T>) + Send + 'static,
    ) -> Self {
        Self {
            page,
            prefix: prefix.into(),
            token: Some(FlowToken::new(Vec::new(), on_done)),
        }
    }
}

#[async_trait]
impl<T> Operation for ReadAllData<T>
where
    T: DeserializeOwned + Send + 'static,
{
    fn trace_name(&self) -> &str {
        "read_all_data"
    }

    async fn run(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        let snapshot = match self.page.snapshot(&self.prefix, None).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(error = %err, "read_all_data snapshot failed");
                return;
            }
        };

        let mut values = Vec::new();
        let outcome = collect_entries(snapshot.as_ref(), &self.prefix, |entry| {
            match serde_json::from_slice::<T>(&entry.value) {
                Ok(value) => values.push(value),
                Err(err) => {
                    warn!(
                        key = %String::from_utf8_lossy(&entry.key),
                        error = %err,
                        "stored value does not decode, skipping"
                    );
                }
            }
        })
        .await;
        if let Err(err) = outcome {
            warn!(error = %err, "read_all_data listing failed");
        }
        token.set_result(values);
    }
}

/// Encode `value` as JSON and write it under `key`.
///
/// The callback receives `true` once the write was applied, `false` when
/// encoding or the store call failed.
pub struct WriteData<T: Send + 'static> {
    page: Arc<dyn Page>,
    key: Vec<u8>,
    value: Option<T>,
    token: Option<FlowToken<bool>>,
}

impl<T: Serialize + Send + 'static> WriteData<T> {
    /// Write `value` under `key` on `page`.
    pub fn new(
        page: Arc<dyn Page>,
        key: impl Into<Vec<u8>>,
        value: T,
        on_done: impl FnOnce(bool) + Send + 'static,
    ) -> Self {
        Self {
            page,
            key: key.into(),
            value: Some(value),
            token: Some(FlowToken::new(false, on_done)),
        }
    }
}

#[async_trait]
impl<T> Operation for WriteData<T>
where
    T: Serialize + Send + 'static,
{
    fn trace_name(&self) -> &str {
        "write_data"
    }

    async fn run(&mut self) {
        let (Some(token), Some(value)) = (self.token.take(), self.value.take()) else {
            return;
        };
        let bytes = match serde_json::to_vec(&value) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "write_data failed to encode value");
                return;
            }
        };
        match self.page.put(&self.key, &bytes).await {
            Ok(()) => token.set_result(true),
            Err(err) => {
                warn!(error = %err, "write_data put failed");
            }
        }
    }
}

/// Render every entry under a prefix as text, for diagnostics.
pub struct DumpPage {
    page: Arc<dyn Page>,
    prefix: Vec<u8>,
    token: Option<FlowToken<String>>,
}

impl DumpPage {
    /// Dump the entries under `prefix` on `page`.
    pub fn new(
        page: Arc<dyn Page>,
        prefix: impl Into<Vec<u8>>,
        on_done: impl FnOnce(String) + Send + 'static,
    ) -> Self {
        Self {
            page,
            prefix: prefix.into(),
            token: Some(FlowToken::new(String::new(), on_done)),
        }
    }
}

#[async_trait]
impl Operation for DumpPage {
    fn trace_name(&self) -> &str {
        "dump_page"
    }

    async fn run(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        let snapshot = match self.page.snapshot(&self.prefix, None).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(error = %err, "dump_page snapshot failed");
                return;
            }
        };

        let mut out = String::new();
        let _ = writeln!(out, "{}:", self.page.id());
        let outcome = collect_entries(snapshot.as_ref(), &self.prefix, |entry| {
            let _ = writeln!(
                out,
                "  {} = {}",
                String::from_utf8_lossy(&entry.key),
                String::from_utf8_lossy(&entry.value)
            );
        })
        .await;
        if let Err(err) = outcome {
            warn!(error = %err, "dump_page listing failed");
        }
        token.set_result(out);
    }
}

/// Feed every entry under `prefix` to `sink`, following pagination tokens.
async fn collect_entries(
    snapshot: &dyn PageSnapshot,
    prefix: &[u8],
    mut sink: impl FnMut(quire_core::Entry),
) -> StoreResult<()> {
    let mut token: Option<PageToken> = None;
    loop {
        let (entries, next) = snapshot.entries(prefix, token).await?;
        for entry in entries {
            sink(entry);
        }
        match next {
            Some(next) => token = Some(next),
            None => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LedgerClient, PageClient, PageObserver};
    use quire_testkit::{test_page_id, MemoryPageStore};
    use serde::Deserialize;
    use std::sync::mpsc;

    struct Quiet;
    impl PageObserver for Quiet {}

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Note {
        title: String,
        stars: u32,
    }

    async fn page_client(tag: u8) -> PageClient {
        let store = MemoryPageStore::new();
        let ledger = LedgerClient::new(store.connect());
        PageClient::new(&ledger, "notes", test_page_id(tag), "", Arc::new(Quiet))
            .await
            .expect("client")
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let client = page_client(50).await;
        let note = Note {
            title: "quire".into(),
            stars: 3,
        };

        let (wrote_tx, wrote_rx) = mpsc::channel();
        client.enqueue(WriteData::new(
            client.page().clone(),
            "notes/1",
            note.clone(),
            move |ok| {
                let _ = wrote_tx.send(ok);
            },
        ));

        let (read_tx, read_rx) = mpsc::channel();
        client.enqueue(ReadData::<Note>::new(
            client.page().clone(),
            "notes/1",
            move |value| {
                let _ = read_tx.send(value);
            },
        ));
        client.sync().await.expect("queue alive");

        assert_eq!(wrote_rx.try_recv(), Ok(true));
        assert_eq!(read_rx.try_recv(), Ok(Some(note)));
    }

    #[tokio::test]
    async fn read_all_collects_only_the_prefix_in_key_order() {
        let client = page_client(51).await;
        for (key, title) in [("n/2", "b"), ("n/1", "a"), ("other/1", "x")] {
            let note = Note {
                title: title.into(),
                stars: 0,
            };
            client
                .page()
                .put(key.as_bytes(), &serde_json::to_vec(&note).expect("encode"))
                .await
                .expect("put");
        }

        let (tx, rx) = mpsc::channel();
        client.enqueue(ReadAllData::<Note>::new(
            client.page().clone(),
            "n/",
            move |values| {
                let _ = tx.send(values);
            },
        ));
        client.sync().await.expect("queue alive");

        let titles: Vec<String> = rx
            .try_recv()
            .expect("callback fired")
            .into_iter()
            .map(|note| note.title)
            .collect();
        assert_eq!(titles, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn malformed_values_read_as_absent() {
        let client = page_client(52).await;
        client
            .page()
            .put(b"bad", b"definitely not json")
            .await
            .expect("put");

        let (tx, rx) = mpsc::channel();
        client.enqueue(ReadData::<Note>::new(
            client.page().clone(),
            "bad",
            move |value| {
                let _ = tx.send(value);
            },
        ));
        client.sync().await.expect("queue alive");

        assert_eq!(rx.try_recv(), Ok(None));
    }

    #[tokio::test]
    async fn read_all_skips_undecodable_entries() {
        let client = page_client(53).await;
        let good = Note {
            title: "ok".into(),
            stars: 1,
        };
        client
            .page()
            .put(b"n/1", &serde_json::to_vec(&good).expect("encode"))
            .await
            .expect("put");
        client.page().put(b"n/2", b"{broken").await.expect("put");

        let (tx, rx) = mpsc::channel();
        client.enqueue(ReadAllData::<Note>::new(
            client.page().clone(),
            "n/",
            move |values| {
                let _ = tx.send(values);
            },
        ));
        client.sync().await.expect("queue alive");

        assert_eq!(rx.try_recv(), Ok(vec![good]));
    }

    #[tokio::test]
    async fn dump_page_lists_entries_under_prefix() {
        let client = page_client(54).await;
        client.page().put(b"d/a", b"1").await.expect("put");
        client.page().put(b"d/b", b"2").await.expect("put");

        let (tx, rx) = mpsc::channel();
        client.enqueue(DumpPage::new(client.page().clone(), "d/", move |dump| {
            let _ = tx.send(dump);
        }));
        client.sync().await.expect("queue alive");

        let dump = rx.try_recv().expect("callback fired");
        assert!(dump.contains("d/a = 1"));
        assert!(dump.contains("d/b = 2"));
    }

    #[tokio::test]
    async fn dropped_unrun_read_still_fires_callback() {
        let client = page_client(55).await;
        let (tx, rx) = mpsc::channel();
        let op = ReadData::<Note>::new(client.page().clone(), "never", move |value| {
            let _ = tx.send(value);
        });
        drop(op);

        assert_eq!(rx.try_recv(), Ok(None));
    }
}

//! The sync orchestrator.

use anyhow::{Context, Result, anyhow};
use base64::Engine as _;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use crossbeam::channel::{Receiver, SendError, Sender, bounded};
use log::{info, warn};
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use super::{MsgOp, OpKind, compute_labels, labels_changed};
use crate::cache::RedbCache;
use crate::config::GmailCredentials;
use crate::gmail::{
    GmailAuth, GmailService, HistoryExpired, MailCache, MessageNotFound, RestGmailService,
};
use crate::maildir::Maildir;
use crate::message::ParsedMessage;
use crate::models::{MessageId, Progress};
use crate::ratelimit::RateLimit;

/// Cache filename within the Maildir root.
const CACHE_FILE: &str = ".outtake";

/// Message bodies arrive base64url-encoded; the server is inconsistent
/// about padding, so accept both.
const BASE64_URL: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Engine tuning knobs, read once per sync.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Capacity of every inter-stage channel.
    pub buffer_size: usize,
    /// Download worker count (and shard count in incremental mode).
    pub concurrency: usize,
    /// REST requests allowed per second.
    pub max_qps: usize,
    /// Retry budget for transient request failures.
    pub max_retries: u32,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            buffer_size: 128,
            concurrency: 8,
            max_qps: 50,
            max_retries: 8,
        }
    }
}

/// A Gmail-to-Maildir synchronizer.
pub struct GmailSync {
    svc: Box<dyn GmailService>,
    cache: MailCache,
    dir: Maildir,
    label: Option<String>,
    label_id: Option<String>,
    opts: SyncOptions,
}

impl GmailSync {
    /// Open (or initialize) the Maildir and cache at `dir` and wire up the
    /// REST service with OAuth and rate limiting.
    pub fn connect(dir: impl AsRef<Path>, label: Option<String>, opts: SyncOptions) -> Result<Self> {
        let dir = dir.as_ref();
        let maildir = Maildir::create(dir)?;
        let cache = MailCache::new(Arc::new(RedbCache::open(dir.join(CACHE_FILE))?));
        let creds = GmailCredentials::load()?;
        let auth = GmailAuth::new(creds, cache.clone());
        let limiter = RateLimit::start(
            Duration::from_secs(1),
            opts.max_qps,
            opts.max_retries,
            Duration::from_secs(1),
        );
        let svc = RestGmailService::new(auth, limiter);
        Ok(Self::with_service(Box::new(svc), cache, maildir, label, opts))
    }

    /// Build a synchronizer from preconstructed parts. This is how the test
    /// suite substitutes a scripted service and an in-memory cache.
    pub fn with_service(
        svc: Box<dyn GmailService>,
        cache: MailCache,
        dir: Maildir,
        label: Option<String>,
        opts: SyncOptions,
    ) -> Self {
        Self {
            svc,
            cache,
            dir,
            label,
            label_id: None,
            opts,
        }
    }

    /// Synchronize the Maildir with the server.
    ///
    /// Runs incrementally from the persisted history index when one exists
    /// and `force_full` is false; an expired journal silently falls back to
    /// a full sync. Progress reports are emitted on `progress` if provided.
    pub fn sync(&mut self, force_full: bool, progress: Option<Sender<Progress>>) -> Result<()> {
        if let Some(label) = self.label.clone() {
            self.label_id = Some(self.label_to_id(&label)?);
        }
        let progress = progress.as_ref();
        let history_idx = self.cache.history_idx()?;
        if history_idx > 0 && !force_full {
            return match self.incremental(history_idx, progress) {
                Err(e) if e.downcast_ref::<HistoryExpired>().is_some() => {
                    info!("History index expired; falling back to full sync");
                    self.full(progress)
                }
                result => result,
            };
        }
        self.full(progress)
    }

    fn label_to_id(&self, name: &str) -> Result<String> {
        let labels = self.svc.get_labels()?;
        labels
            .into_iter()
            .find(|l| l.name == name)
            .map(|l| l.id)
            .with_context(|| format!("label {name:?} not found"))
    }

    /// Full sync: list every message, download the unknown ones, reconcile
    /// labels on the known ones, then delete whatever the listing no longer
    /// mentions.
    fn full(&self, progress: Option<&Sender<Progress>>) -> Result<()> {
        info!("Performing full sync");
        let workers = self.opts.concurrency.max(1);
        let (msg_tx, msg_rx) = bounded::<MessageId>(self.opts.buffer_size);
        let (op_tx, op_rx) = bounded::<MsgOp>(self.opts.buffer_size);
        let total = AtomicU64::new(0);

        let (seen, history_id) = thread::scope(|s| {
            let this = self;
            for _ in 0..workers {
                let rx = msg_rx.clone();
                let tx = op_tx.clone();
                s.spawn(move || {
                    for mid in rx.iter() {
                        if tx.send(this.handle_new_message(&mid)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(msg_rx);

            let producer = {
                let tx = op_tx.clone();
                let total = &total;
                s.spawn(move || this.list_all_messages(msg_tx, tx, total))
            };
            drop(op_tx);

            let applied = self.apply_all(op_rx, progress, &total);
            let seen = producer
                .join()
                .map_err(|_| anyhow!("message listing thread panicked"));
            Ok::<_, anyhow::Error>((seen?, applied?))
        })?;

        // Anything cached but absent from the listing was deleted on the
        // server.
        for mid in self.cache.msg_ids()? {
            if !seen.contains(&mid) {
                self.delete_message(&MessageId::new(mid))?;
            }
        }

        // A run that saw no new work must not drag the high-water mark
        // backwards.
        let floor = self.cache.history_idx()?;
        self.cache.set_history_idx(history_id.max(floor))?;
        Ok(())
    }

    /// Incremental sync: replay the change journal, sharding events by
    /// message id so each message's events are handled in order by a single
    /// worker while unrelated messages proceed in parallel.
    fn incremental(&self, since: u64, progress: Option<&Sender<Progress>>) -> Result<()> {
        info!("Performing incremental sync from history index {since}");
        let workers = self.opts.concurrency.max(1);
        let (op_tx, op_rx) = bounded::<MsgOp>(self.opts.buffer_size);
        let mut shard_txs = Vec::with_capacity(workers);
        let mut shard_rxs = Vec::with_capacity(workers);
        for _ in 0..workers {
            let (tx, rx) = bounded::<MsgOp>(self.opts.buffer_size);
            shard_txs.push(tx);
            shard_rxs.push(rx);
        }
        let total = AtomicU64::new(0);

        let history_id = thread::scope(|s| {
            let this = self;
            for rx in shard_rxs {
                let tx = op_tx.clone();
                s.spawn(move || {
                    for op in rx.iter() {
                        let out = if op.kind == OpKind::Add {
                            this.handle_new_message(&op.mid)
                        } else {
                            op
                        };
                        if tx.send(out).is_err() {
                            break;
                        }
                    }
                });
            }
            let producer = {
                let tx = op_tx.clone();
                let total = &total;
                s.spawn(move || this.list_history(since, shard_txs, tx, total))
            };
            drop(op_tx);

            let applied = self.apply_all(op_rx, progress, &total);
            let journal_high = producer
                .join()
                .map_err(|_| anyhow!("history listing thread panicked"));
            applied?;
            journal_high
        })?;

        self.cache.set_history_idx(history_id)?;
        Ok(())
    }

    /// Full-sync producer: paginate the message listing, forwarding ids to
    /// the worker pool and recording them for delete reconciliation.
    fn list_all_messages(
        &self,
        msgs: Sender<MessageId>,
        ops: Sender<MsgOp>,
        total: &AtomicU64,
    ) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut page: Option<String> = None;
        loop {
            let response = match self.svc.get_messages(self.label_id.as_deref(), page.as_deref())
            {
                Ok(r) => r,
                Err(e) => {
                    let _ = ops.send(MsgOp::failed(e.context("failed to list messages")));
                    break;
                }
            };
            total.fetch_add(u64::from(response.result_size_estimate), Ordering::Relaxed);
            for m in response.messages {
                seen.insert(m.id.clone());
                if msgs.send(MessageId::new(m.id)).is_err() {
                    return seen;
                }
            }
            match response.next_page_token {
                Some(t) if !t.is_empty() => page = Some(t),
                _ => break,
            }
        }
        seen
    }

    /// Incremental producer: paginate the change journal and fan events out
    /// to the per-mid shards. Returns the highest record id observed.
    fn list_history(
        &self,
        since: u64,
        shards: Vec<Sender<MsgOp>>,
        ops: Sender<MsgOp>,
        total: &AtomicU64,
    ) -> u64 {
        let mut history_id = since;
        let mut page: Option<String> = None;
        loop {
            let response =
                match self
                    .svc
                    .get_history(since, self.label_id.as_deref(), page.as_deref())
                {
                    Ok(r) => r,
                    Err(e) => {
                        // An expired journal on the first page means "full
                        // sync required"; sync() handles the fallback.
                        let err = if page.is_none() && since > 0 {
                            e
                        } else {
                            e.context("failed to list history")
                        };
                        let _ = ops.send(MsgOp::failed(err));
                        return history_id;
                    }
                };
            total.fetch_add(response.history.len() as u64, Ordering::Relaxed);
            for record in &response.history {
                if record.id > history_id {
                    history_id = record.id;
                }
                for added in &record.messages_added {
                    let mid = MessageId::new(added.message.id.clone());
                    if self
                        .dispatch(&shards, MsgOp::event(mid, OpKind::Add, record.id))
                        .is_err()
                    {
                        return history_id;
                    }
                }
                for deleted in &record.messages_deleted {
                    let mid = MessageId::new(deleted.message.id.clone());
                    if self
                        .dispatch(&shards, MsgOp::event(mid, OpKind::Delete, record.id))
                        .is_err()
                    {
                        return history_id;
                    }
                }
                // Multiple label events for one mid can share a record;
                // collapse them into a single (added, removed) pair before
                // computing the new set.
                let mut changes: HashMap<&str, (Vec<String>, Vec<String>)> = HashMap::new();
                for change in &record.labels_added {
                    let entry = changes.entry(change.message.id.as_str()).or_default();
                    entry.0.extend(change.label_ids.iter().cloned());
                }
                for change in &record.labels_removed {
                    let entry = changes.entry(change.message.id.as_str()).or_default();
                    entry.1.extend(change.label_ids.iter().cloned());
                }
                for (mid, (added, removed)) in changes {
                    let mid = MessageId::new(mid);
                    let mut labels = match compute_labels(&self.cache, &mid, added, removed) {
                        Ok(l) => l,
                        Err(e) => {
                            let _ = ops.send(MsgOp::failed(e));
                            return history_id;
                        }
                    };
                    match labels_changed(&self.cache, &mid, &mut labels) {
                        Ok(true) => {
                            let mut op = MsgOp::event(mid, OpKind::WriteLabels, record.id);
                            op.labels = labels;
                            if self.dispatch(&shards, op).is_err() {
                                return history_id;
                            }
                        }
                        Ok(false) => {}
                        Err(e) => {
                            let _ = ops.send(MsgOp::failed(e));
                            return history_id;
                        }
                    }
                }
            }
            match response.next_page_token {
                Some(t) if !t.is_empty() => page = Some(t),
                _ => return history_id,
            }
        }
    }

    fn dispatch(&self, shards: &[Sender<MsgOp>], op: MsgOp) -> Result<(), SendError<MsgOp>> {
        let shard = shard_for(&op.mid, shards.len());
        shards[shard].send(op)
    }

    /// The single-threaded apply stage: drain `ops`, write each mutation,
    /// and report the highest history position observed. The first record
    /// carrying an error aborts the sync.
    fn apply_all(
        &self,
        ops: Receiver<MsgOp>,
        progress: Option<&Sender<Progress>>,
        total: &AtomicU64,
    ) -> Result<u64> {
        let mut history_id = 0;
        let mut current = 0;
        for mut op in ops.iter() {
            if let Some(p) = progress {
                let _ = p.send(Progress {
                    current,
                    total: total.load(Ordering::Relaxed),
                });
            }
            current += 1;
            if let Some(e) = op.error.take() {
                return Err(e);
            }
            // Even a no-op record can carry a fresh history position from
            // its metadata fetch.
            if op.history_id > history_id {
                history_id = op.history_id;
            }
            if op.kind == OpKind::None {
                continue;
            }
            self.apply(op)?;
        }
        Ok(history_id)
    }

    /// Decide what to do about a message: download it if unknown, rewrite
    /// its labels if they changed, or nothing.
    fn handle_new_message(&self, mid: &MessageId) -> MsgOp {
        let mut op = MsgOp::new(mid.clone());
        let key = match self.cache.msg_key(mid) {
            Ok(k) => k,
            Err(e) => return op.fail(e),
        };
        if key.is_none() {
            op.kind = OpKind::Add;
            let raw = match self.svc.get_raw_message(mid) {
                Ok(r) => r,
                Err(e) if e.downcast_ref::<MessageNotFound>().is_some() => {
                    // Deleted between enumeration and download.
                    op.kind = OpKind::None;
                    return op;
                }
                Err(e) => return op.fail(e),
            };
            let bytes = match BASE64_URL.decode(raw.as_bytes()) {
                Ok(b) => b,
                Err(e) => {
                    return op.fail(anyhow!(e).context(format!("undecodable raw message {mid}")));
                }
            };
            match ParsedMessage::parse(&bytes) {
                Ok(msg) => op.msg = Some(msg),
                Err(e) => {
                    // Often chats and similar non-MIME items; skip them.
                    warn!("Failed to parse message {mid}: {e:#}");
                    op.kind = OpKind::None;
                    return op;
                }
            }
        }
        let meta = match self.svc.get_metadata(mid) {
            Ok(m) => m,
            Err(e) => return op.fail(e),
        };
        op.labels = meta.label_ids;
        op.history_id = meta.history_id;
        if let Some(key) = key {
            let changed = match labels_changed(&self.cache, mid, &mut op.labels) {
                Ok(c) => c,
                Err(e) => return op.fail(e),
            };
            if changed {
                let mut msg = match self.dir.message(&key) {
                    Ok(m) => m,
                    Err(e) => return op.fail(e),
                };
                msg.set_labels(&op.labels);
                op.msg = Some(msg);
                op.kind = OpKind::WriteLabels;
            } else {
                op.kind = OpKind::None;
            }
        } else if let Some(msg) = op.msg.as_mut() {
            msg.set_labels(&op.labels);
        }
        op
    }

    /// Write one mutation to the Maildir and cache.
    fn apply(&self, op: MsgOp) -> Result<()> {
        match op.kind {
            OpKind::Add => {
                let msg = op.msg.context("add operation without a message body")?;
                let key = self.dir.deliver(&msg)?;
                self.cache.set_msg_labels(&op.mid, &op.labels)?;
                self.cache.set_msg_key(&op.mid, &key)?;
                Ok(())
            }
            OpKind::Delete => self.delete_message(&op.mid),
            OpKind::WriteLabels => self.rewrite_labels(&op.mid, &op.labels, op.msg),
            OpKind::None => Ok(()),
        }
    }

    fn delete_message(&self, mid: &MessageId) -> Result<()> {
        let Some(key) = self.cache.msg_key(mid)? else {
            // Already gone; deletes are idempotent.
            return Ok(());
        };
        self.dir.delete(&key)?;
        self.cache.del_msg(mid)
    }

    fn rewrite_labels(
        &self,
        mid: &MessageId,
        labels: &[String],
        prefetched: Option<ParsedMessage>,
    ) -> Result<()> {
        let Some(key) = self.cache.msg_key(mid)? else {
            // The server emits label events for messages we never
            // downloaded.
            warn!("Label change for unknown message {mid}; skipping");
            return Ok(());
        };
        let mut msg = match prefetched {
            Some(m) => m,
            None => self.dir.message(&key)?,
        };
        msg.set_labels(labels);
        // Republishing into new/ is the only way to rewrite a header in a
        // maildir; clients will see the message as unread again.
        let new_key = self.dir.deliver(&msg)?;
        self.cache.set_msg_labels(mid, labels)?;
        self.cache.set_msg_key(mid, &new_key)?;
        self.dir.delete(&key)
    }
}

/// Shard assignment: hex mids map by value, anything else by a stable hash,
/// so all events for one mid land in the same lane.
fn shard_for(mid: &MessageId, shards: usize) -> usize {
    let hex = mid.as_str().trim_start_matches("0x");
    let value = u64::from_str_radix(hex, 16).unwrap_or_else(|_| {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        mid.as_str().hash(&mut hasher);
        hasher.finish()
    });
    (value % shards as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_for_hex_ids() {
        assert_eq!(shard_for(&MessageId::new("0x7b"), 8), 123 % 8);
        assert_eq!(shard_for(&MessageId::new("7b"), 8), 123 % 8);
        assert_eq!(shard_for(&MessageId::new("10"), 4), 0);
    }

    #[test]
    fn test_shard_for_is_stable() {
        let mid = MessageId::new("not-hex!");
        let first = shard_for(&mid, 8);
        for _ in 0..10 {
            assert_eq!(shard_for(&mid, 8), first);
        }
    }

    #[test]
    fn test_shard_for_stays_in_range() {
        for id in ["0x1", "ff", "zzz", "", "deadbeefdeadbeefdead"] {
            assert!(shard_for(&MessageId::new(id), 3) < 3);
        }
    }
}

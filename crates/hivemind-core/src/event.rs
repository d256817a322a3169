//! EventHub: per-execution, per-channel frame log with replay.
//!
//! Every execution owns a `token`, a `control`, and a `metrics` channel.
//! Each channel is a bounded ring of [`HubEntry`] values addressed by a
//! monotonically increasing position, plus a tokio broadcast sender for
//! live delivery. A subscriber snapshots the retained history and attaches
//! its broadcast receiver under the same lock a publisher takes, so the
//! replay and the live tail meet without a gap or a duplicate.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, warn};

use crate::config::HubConfig;
use crate::error::{HivemindError, Result};
use crate::frame::{Channel, ControlFrame, ControlType, Frame, MetricFrame, TokenFrame};
use crate::types::ExecutionId;

/// A frame as stored in a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct HubEntry {
    pub channel: Channel,
    /// Position within the channel, starting at 1. Never reused.
    pub position: u64,
    pub frame: Frame,
}

/// Where a subscription starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFrom {
    /// Replay everything retained, then tail.
    Start,
    /// Only frames published after subscribing.
    Latest,
    /// Replay from this position (inclusive), then tail.
    Position(u64),
}

/// Ordered frame stream. Ends once the execution is cleaned up.
pub type Subscription = BoxStream<'static, HubEntry>;

struct ChannelLog {
    channel: Channel,
    entries: VecDeque<HubEntry>,
    next_position: u64,
    capacity: usize,
    /// Entries dropped from the front of the ring so far.
    evicted: u64,
    tx: Option<broadcast::Sender<HubEntry>>,
}

impl ChannelLog {
    fn new(channel: Channel, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            channel,
            entries: VecDeque::new(),
            next_position: 1,
            capacity: capacity.max(1),
            evicted: 0,
            tx: Some(tx),
        }
    }

    fn append(&mut self, frame: Frame) -> u64 {
        let position = self.next_position;
        self.next_position += 1;

        let entry = HubEntry {
            channel: self.channel,
            position,
            frame,
        };
        self.entries.push_back(entry.clone());
        while self.entries.len() > self.capacity {
            let Some(oldest) = self.entries.pop_front() else {
                break;
            };
            if self.evicted == 0 {
                warn!(
                    channel = %self.channel,
                    position = oldest.position,
                    capacity = self.capacity,
                    "Channel full, evicting oldest frames"
                );
            }
            self.evicted += 1;
        }
        if let Some(ref tx) = self.tx {
            // Ignore error if no receivers
            let _ = tx.send(entry);
        }
        position
    }

    fn since(&self, position: u64) -> VecDeque<HubEntry> {
        self.entries
            .iter()
            .filter(|e| e.position >= position)
            .cloned()
            .collect()
    }

    fn last_position(&self) -> u64 {
        self.next_position - 1
    }
}

#[derive(Debug, Default)]
struct AgentSegment {
    last_sequence: Option<u64>,
    finalized: bool,
}

struct ExecutionStreams {
    channels: HashMap<Channel, ChannelLog>,
    agents: HashMap<String, AgentSegment>,
    capacity: usize,
    closed: bool,
}

impl ExecutionStreams {
    fn new(capacity: usize) -> Self {
        let channels = Channel::ALL
            .iter()
            .map(|c| (*c, ChannelLog::new(*c, capacity)))
            .collect();
        Self {
            channels,
            agents: HashMap::new(),
            capacity,
            closed: false,
        }
    }

    fn log(&self, channel: Channel) -> &ChannelLog {
        // All three channels are created up front.
        &self.channels[&channel]
    }

    fn log_mut(&mut self, channel: Channel) -> &mut ChannelLog {
        let capacity = self.capacity;
        self.channels
            .entry(channel)
            .or_insert_with(|| ChannelLog::new(channel, capacity))
    }

    fn check_token(&mut self, frame: &TokenFrame) -> Result<()> {
        let segment = self.agents.entry(frame.agent_id.clone()).or_default();
        if segment.finalized {
            return Err(HivemindError::SegmentClosed(frame.agent_id.clone()));
        }
        if let Some(last) = segment.last_sequence {
            if frame.sequence <= last {
                return Err(HivemindError::SequenceViolation {
                    agent_id: frame.agent_id.clone(),
                    got: frame.sequence,
                    last,
                });
            }
        }
        segment.last_sequence = Some(frame.sequence);
        segment.finalized = frame.is_final;
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
        for log in self.channels.values_mut() {
            log.tx = None;
        }
    }
}

/// Append-only frame log shared by all executions of one engine.
pub struct EventHub {
    executions: Arc<RwLock<HashMap<ExecutionId, Arc<Mutex<ExecutionStreams>>>>>,
    capacity: usize,
    retention: Duration,
}

impl EventHub {
    pub fn new(config: &HubConfig) -> Self {
        Self {
            executions: Arc::new(RwLock::new(HashMap::new())),
            capacity: config.channel_capacity,
            retention: Duration::from_secs(config.retention_secs),
        }
    }

    /// Open the channels of an execution. Re-opening a closed execution
    /// replaces its retained history.
    pub async fn open(&self, execution_id: &ExecutionId) {
        let mut map = self.executions.write().await;
        let reopen = match map.get(execution_id) {
            Some(existing) => existing.lock().await.closed,
            None => true,
        };
        if reopen {
            debug!(execution_id = %execution_id, "Opening execution channels");
            map.insert(
                execution_id.clone(),
                Arc::new(Mutex::new(ExecutionStreams::new(self.capacity))),
            );
        }
    }

    /// Whether the execution accepts frames.
    pub async fn is_open(&self, execution_id: &ExecutionId) -> bool {
        match self.streams(execution_id).await {
            Ok(streams) => !streams.lock().await.closed,
            Err(_) => false,
        }
    }

    /// Append a frame to the channel its kind belongs to.
    ///
    /// Returns the frame's position. Fails if the execution is unknown or
    /// closed, or if a token frame breaks its agent's sequence.
    pub async fn publish(&self, frame: Frame) -> Result<u64> {
        let streams = self.streams(frame.execution_id()).await?;
        let mut streams = streams.lock().await;
        if streams.closed {
            return Err(HivemindError::ExecutionClosed(
                frame.execution_id().to_string(),
            ));
        }

        match &frame {
            Frame::Token(token) => streams.check_token(token)?,
            Frame::Control(control) if control.kind == ControlType::AgentStarted => {
                if let Some(ref agent_id) = control.agent_id {
                    // A new step opens a new segment for the agent.
                    streams.agents.entry(agent_id.clone()).or_default().finalized = false;
                }
            }
            _ => {}
        }

        let channel = frame.channel();
        Ok(streams.log_mut(channel).append(frame))
    }

    pub async fn publish_token(&self, frame: TokenFrame) -> Result<u64> {
        self.publish(Frame::Token(frame)).await
    }

    pub async fn publish_control(&self, frame: ControlFrame) -> Result<u64> {
        self.publish(Frame::Control(frame)).await
    }

    pub async fn publish_metric(&self, frame: MetricFrame) -> Result<u64> {
        self.publish(Frame::Metric(frame)).await
    }

    /// The next token sequence number an agent may use.
    pub async fn next_sequence(&self, execution_id: &ExecutionId, agent_id: &str) -> Result<u64> {
        let streams = self.streams(execution_id).await?;
        let streams = streams.lock().await;
        Ok(streams
            .agents
            .get(agent_id)
            .and_then(|s| s.last_sequence)
            .map_or(1, |last| last + 1))
    }

    /// Number of frames evicted from a channel because it was full.
    pub async fn evicted(&self, execution_id: &ExecutionId, channel: Channel) -> Result<u64> {
        let streams = self.streams(execution_id).await?;
        let streams = streams.lock().await;
        Ok(streams.log(channel).evicted)
    }

    /// Retained entries of one channel, without tailing.
    pub async fn snapshot(
        &self,
        execution_id: &ExecutionId,
        channel: Channel,
        from: StartFrom,
    ) -> Result<Vec<HubEntry>> {
        let streams = self.streams(execution_id).await?;
        let streams = streams.lock().await;
        let log = streams.log(channel);
        let entries = match from {
            StartFrom::Start => log.since(0),
            StartFrom::Latest => VecDeque::new(),
            StartFrom::Position(p) => log.since(p),
        };
        Ok(entries.into())
    }

    /// Subscribe to one or more channels of an execution.
    ///
    /// Order is preserved within each channel; frames of different channels
    /// are interleaved in arrival order at the subscriber.
    pub async fn subscribe(
        &self,
        execution_id: &ExecutionId,
        channels: &[Channel],
        from: StartFrom,
    ) -> Result<Subscription> {
        let streams = self.streams(execution_id).await?;
        let mut per_channel = Vec::with_capacity(channels.len());

        for channel in channels {
            let state = {
                let guard = streams.lock().await;
                let log = guard.log(*channel);
                let (buffer, last) = match from {
                    StartFrom::Start => (log.since(0), 0),
                    StartFrom::Latest => (VecDeque::new(), log.last_position()),
                    StartFrom::Position(p) => (log.since(p), p.saturating_sub(1)),
                };
                TailState {
                    channel: *channel,
                    buffer,
                    last,
                    rx: log.tx.as_ref().map(|tx| tx.subscribe()),
                    streams: streams.clone(),
                }
            };
            per_channel.push(tail(state));
        }

        Ok(futures::stream::select_all(per_channel).boxed())
    }

    /// Close an execution for writes and drop its history after the
    /// retention period. Live subscriptions end once drained.
    pub async fn cleanup(&self, execution_id: &ExecutionId) -> Result<()> {
        let streams = self.streams(execution_id).await?;
        streams.lock().await.close();
        debug!(
            execution_id = %execution_id,
            retention_secs = self.retention.as_secs(),
            "Execution channels closed"
        );

        let executions = self.executions.clone();
        let retention = self.retention;
        let execution_id = execution_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            let mut map = executions.write().await;
            // Only drop the instance we closed, not a later re-open.
            if map
                .get(&execution_id)
                .is_some_and(|current| Arc::ptr_eq(current, &streams))
            {
                map.remove(&execution_id);
                debug!(execution_id = %execution_id, "Execution history purged");
            }
        });
        Ok(())
    }

    /// Drop an execution and its history immediately.
    pub async fn delete_now(&self, execution_id: &ExecutionId) -> bool {
        let removed = self.executions.write().await.remove(execution_id);
        match removed {
            Some(streams) => {
                streams.lock().await.close();
                debug!(execution_id = %execution_id, "Execution channels deleted");
                true
            }
            None => false,
        }
    }

    /// Executions currently held by the hub (open or within retention).
    pub async fn executions(&self) -> Vec<ExecutionId> {
        self.executions.read().await.keys().cloned().collect()
    }

    async fn streams(&self, execution_id: &ExecutionId) -> Result<Arc<Mutex<ExecutionStreams>>> {
        self.executions
            .read()
            .await
            .get(execution_id)
            .cloned()
            .ok_or_else(|| HivemindError::UnknownExecution(execution_id.to_string()))
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(&HubConfig::default())
    }
}

struct TailState {
    channel: Channel,
    buffer: VecDeque<HubEntry>,
    last: u64,
    rx: Option<broadcast::Receiver<HubEntry>>,
    streams: Arc<Mutex<ExecutionStreams>>,
}

impl TailState {
    async fn refill(&mut self) {
        let guard = self.streams.lock().await;
        self.buffer = guard.log(self.channel).since(self.last + 1);
    }

    fn advance(&mut self, entry: &HubEntry) {
        if entry.position > self.last + 1 {
            warn!(
                channel = %self.channel,
                missed_from = self.last + 1,
                missed_to = entry.position - 1,
                "Subscriber skipped evicted frames"
            );
        }
        self.last = entry.position;
    }
}

fn tail(state: TailState) -> Subscription {
    futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(entry) = st.buffer.pop_front() {
                st.advance(&entry);
                return Some((entry, st));
            }
            let rx = st.rx.as_mut()?;
            match rx.recv().await {
                Ok(entry) => {
                    if entry.position > st.last {
                        st.advance(&entry);
                        return Some((entry, st));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        channel = %st.channel,
                        skipped,
                        "Subscriber lagged, refilling from retained log"
                    );
                    st.refill().await;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    st.rx = None;
                    st.refill().await;
                }
            }
        }
    })
    .boxed()
}

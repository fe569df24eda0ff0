use std::collections::{HashMap, VecDeque};

use clickup_orchestrator_core::model::UnitId;
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// One line of process output as seen by terminal clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub line: String,
    pub is_stderr: bool,
}

/// A client's view of one stream: what it missed, then everything after.
pub struct Subscription {
    pub replay: Vec<OutputLine>,
    pub live: mpsc::UnboundedReceiver<OutputLine>,
}

#[derive(Default)]
struct Channel {
    buffer: VecDeque<OutputLine>,
    subscribers: Vec<mpsc::UnboundedSender<OutputLine>>,
}

/// Fans process output out to every connected terminal client.
///
/// Each task/session keeps the tail of its current run so a client that
/// (re)connects mid-run sees what it missed. Taking the replay snapshot and
/// registering the subscriber happen under the same lock as publishing, so a
/// line is either in the replay or delivered live, never both or neither.
/// Per-subscriber queues are unbounded: a slow client delays only itself and
/// never loses lines.
pub struct StreamGateway {
    channels: Mutex<HashMap<UnitId, Channel>>,
    replay_lines: usize,
}

impl StreamGateway {
    pub fn new(replay_lines: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            replay_lines,
        }
    }

    pub fn publish(&self, id: &UnitId, line: &str, is_stderr: bool) {
        let msg = OutputLine {
            line: line.to_string(),
            is_stderr,
        };
        let mut channels = self.channels.lock();
        let channel = channels.entry(id.clone()).or_default();
        if self.replay_lines > 0 {
            if channel.buffer.len() == self.replay_lines {
                channel.buffer.pop_front();
            }
            channel.buffer.push_back(msg.clone());
        }
        channel.subscribers.retain(|tx| tx.send(msg.clone()).is_ok());
    }

    /// Starts a fresh run: drops the previous run's replay tail.
    pub fn reset(&self, id: &UnitId) {
        if let Some(channel) = self.channels.lock().get_mut(id) {
            channel.buffer.clear();
        }
    }

    pub fn subscribe(&self, id: &UnitId) -> Subscription {
        let (tx, live) = mpsc::unbounded_channel();
        let mut channels = self.channels.lock();
        let channel = channels.entry(id.clone()).or_default();
        channel.subscribers.push(tx);
        Subscription {
            replay: channel.buffer.iter().cloned().collect(),
            live,
        }
    }

    pub fn subscriber_count(&self, id: &UnitId) -> usize {
        self.channels
            .lock()
            .get_mut(id)
            .map(|c| {
                c.subscribers.retain(|tx| !tx.is_closed());
                c.subscribers.len()
            })
            .unwrap_or(0)
    }

    /// Forgets the stream; connected clients see their live queue end.
    pub fn remove(&self, id: &UnitId) {
        self.channels.lock().remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_then_live_without_gaps() {
        let gw = StreamGateway::new(3);
        let id = UnitId::Task(5);
        for i in 0..5 {
            gw.publish(&id, &format!("l{i}"), false);
        }
        let mut sub = gw.subscribe(&id);
        let replay: Vec<_> = sub.replay.iter().map(|l| l.line.as_str()).collect();
        assert_eq!(replay, vec!["l2", "l3", "l4"]);

        gw.publish(&id, "l5", true);
        let next = sub.live.try_recv().unwrap();
        assert_eq!(next, OutputLine { line: "l5".into(), is_stderr: true });
        assert!(sub.live.try_recv().is_err());
    }

    #[test]
    fn every_subscriber_sees_the_same_order() {
        let gw = StreamGateway::new(0);
        let id = UnitId::Session("s".into());
        let mut a = gw.subscribe(&id);
        let mut b = gw.subscribe(&id);
        for i in 0..100 {
            gw.publish(&id, &i.to_string(), i % 2 == 0);
        }
        for sub in [&mut a, &mut b] {
            assert!(sub.replay.is_empty());
            for i in 0..100 {
                assert_eq!(sub.live.try_recv().unwrap().line, i.to_string());
            }
        }
    }

    #[test]
    fn dropped_clients_are_pruned_and_reset_clears_tail() {
        let gw = StreamGateway::new(10);
        let id = UnitId::Task(1);
        let sub = gw.subscribe(&id);
        assert_eq!(gw.subscriber_count(&id), 1);
        drop(sub);
        gw.publish(&id, "x", false);
        assert_eq!(gw.subscriber_count(&id), 0);

        gw.reset(&id);
        assert!(gw.subscribe(&id).replay.is_empty());
    }
}

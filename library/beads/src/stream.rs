use crate::event::{EventKind, LifecycleEvent};
use crate::types::{AgentBead, Bead};
use crate::meta;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use error::*;
use futures_util::StreamExt;
use log::{debug, warn};
use result::Result;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use term_colors::*;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::watch;

/// How many decoded events may sit in the channel before the producer
/// starts dropping. Losing a push event cannot cause permanent divergence;
/// the periodic reconciler is the safety net.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// The first reconnect delay after a failure.
const BACKOFF_FLOOR: Duration = Duration::from_secs(1);

/// The ceiling the reconnect delay doubles up to.
const BACKOFF_CEILING: Duration = Duration::from_secs(30);

/// The server-side topic family this controller subscribes to. Everything
/// else on the stream is noise to us.
const TOPIC_PREFIX: &str = "beads.bead.";

/// An `EventStream` maintains one long-lived subscription to the bead
/// store's server-sent-events endpoint and decodes bead mutations into
/// [LifecycleEvent](crate::LifecycleEvent)s on a bounded channel.
///
/// On every reconnect the most recently seen server-assigned record id is
/// replayed in a `Last-Event-ID` header so the server can resend anything
/// missed during the gap.
pub struct EventStream {
    endpoint: String,
    http: reqwest::Client,
    tx: mpsc::Sender<LifecycleEvent>,
    last_event_id: Arc<RwLock<Option<String>>>,
}

/// What became of one subscription attempt.
enum Outcome {
    /// The shutdown signal fired.
    Cancelled,
    /// Nobody is consuming events anymore.
    ReceiverGone,
    /// The connection failed or ended; reconnect after backoff.
    Retry(String),
}

impl EventStream {
    /// Builds the stream client and hands back the read side of its event
    /// channel. `base_url` is the bead store base (e.g.
    /// `http://localhost:8080`).
    pub fn new<T: AsRef<str>>(base_url: T) -> Result<(EventStream, mpsc::Receiver<LifecycleEvent>)> {
        // Deliberately NO total request timeout: the subscription is
        // expected to stay open forever. Only the connect is bounded.
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|source| StreamError::Client { source })?;
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let stream = EventStream {
            endpoint: format!("{}/v1/events/stream?topics=beads.bead", base_url.as_ref()),
            http,
            tx,
            last_event_id: Arc::new(RwLock::new(None)),
        };
        Ok((stream, rx))
    }

    /// The most recently seen server-assigned event id, if any. This is the
    /// replay high-water mark; it advances even for records the decoder
    /// drops.
    pub fn last_event_id(&self) -> Option<String> {
        self.last_event_id
            .read()
            .expect("event id lock poisoned")
            .clone()
    }

    /// Runs until the shutdown signal fires or every receiver is gone.
    /// Dropping `self` on return closes the event channel, which is how
    /// consumers observe the stream winding down.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = ExponentialBackoff::default();
        backoff.initial_interval = BACKOFF_FLOOR;
        backoff.multiplier = 2.0;
        backoff.randomization_factor = 0.0;
        backoff.max_interval = BACKOFF_CEILING;
        // No elapsed-time ceiling: next_backoff never returns None.
        backoff.max_elapsed_time = None;
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.subscribe(&mut shutdown, &mut backoff).await {
                Outcome::Cancelled => break,
                Outcome::ReceiverGone => {
                    debug!("event channel closed; stopping the stream reader");
                    break;
                }
                Outcome::Retry(reason) => {
                    let wait = backoff.next_backoff().unwrap_or(BACKOFF_CEILING);
                    warn!(
                        "event stream interrupted ({}), reconnecting in {}",
                        reason,
                        orange(format!("{:?}", wait))
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => (),
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }
        debug!("event stream reader shut down");
    }

    /// The subscription request, including the replay header when we have a
    /// high-water mark to offer.
    fn connect_request(&self) -> reqwest::RequestBuilder {
        let mut request = self
            .http
            .get(&self.endpoint)
            .header("Accept", "text/event-stream");
        if let Some(id) = self.last_event_id() {
            request = request.header("Last-Event-ID", id);
        }
        request
    }

    async fn subscribe(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        backoff: &mut ExponentialBackoff,
    ) -> Outcome {
        let response = tokio::select! {
            response = self.connect_request().send() => response,
            _ = shutdown.changed() => return Outcome::Cancelled,
        };
        let response = match response {
            Ok(response) => response,
            Err(err) => return Outcome::Retry(format!("connect failed: {}", err)),
        };
        if response.status().as_u16() != 200 {
            return Outcome::Retry(format!("server answered HTTP {}", response.status()));
        }
        // Any 200 counts as a successful connect; the next failure starts
        // over from the one second floor.
        backoff.reset();
        debug!("subscribed to {}", cyan(&self.endpoint));
        let mut body = response.bytes_stream();
        let mut parser = SseParser::default();
        loop {
            let chunk = tokio::select! {
                chunk = body.next() => chunk,
                _ = shutdown.changed() => return Outcome::Cancelled,
            };
            match chunk {
                None => return Outcome::Retry("server closed the stream".to_string()),
                Some(Err(err)) => return Outcome::Retry(format!("read failed: {}", err)),
                Some(Ok(bytes)) => {
                    for record in parser.feed(&bytes) {
                        if let Absorb::ReceiverGone = self.absorb(record) {
                            return Outcome::ReceiverGone;
                        }
                    }
                }
            }
        }
    }

    /// Takes one wire record: advances the high-water mark, decodes, and
    /// offers the result to the channel. A full channel drops the event
    /// with a warning rather than stalling the read loop.
    fn absorb(&self, record: SseRecord) -> Absorb {
        if let Some(id) = record.id {
            *self.last_event_id.write().expect("event id lock poisoned") = Some(id);
        }
        let topic = match record.event {
            Some(topic) => topic,
            // No event field: nothing to decode, but the id above stands.
            None => return Absorb::Dropped,
        };
        if record.data.is_empty() {
            return Absorb::Dropped;
        }
        let event = match decode(&topic, &record.data) {
            Some(event) => event,
            None => return Absorb::Dropped,
        };
        match self.tx.try_send(event) {
            Ok(()) => Absorb::Delivered,
            Err(TrySendError::Full(event)) => {
                warn!(
                    "event channel full; dropping {} for {} (the reconciler will catch up)",
                    event.kind,
                    cyan(event.pod_name())
                );
                Absorb::Dropped
            }
            Err(TrySendError::Closed(_)) => Absorb::ReceiverGone,
        }
    }
}

#[derive(Debug, Eq, PartialEq)]
enum Absorb {
    Delivered,
    Dropped,
    ReceiverGone,
}

/// The JSON envelope inside a record's `data` field.
#[derive(Deserialize)]
struct Envelope {
    bead: Option<Bead>,
    changes: Option<HashMap<String, serde_json::Value>>,
    closed_by: Option<String>,
    #[allow(unused)]
    bead_id: Option<String>,
}

/// Maps one `(topic, data)` pair onto a lifecycle event. `None` means the
/// record is not ours to act on; the reasons are only ever interesting at
/// debug level.
fn decode(topic: &str, data: &str) -> Option<LifecycleEvent> {
    let action = match topic.strip_prefix(TOPIC_PREFIX) {
        Some(action) => action,
        None => {
            debug!("ignoring record on foreign topic {}", topic);
            return None;
        }
    };
    let envelope: Envelope = match serde_json::from_str(data) {
        Ok(envelope) => envelope,
        Err(err) => {
            debug!("unparseable event payload on {}: {}", topic, err);
            return None;
        }
    };
    if action == "deleted" {
        // Deletions carry only a bead id. That is not enough to name a pod,
        // so the periodic reconciler owns the cleanup.
        debug!("ignoring deletion event (no coordinates on the wire)");
        return None;
    }
    let bead = match envelope.bead {
        Some(bead) => bead,
        None => {
            debug!("record on {} carried no bead payload", topic);
            return None;
        }
    };
    if !bead.is_agent() {
        return None;
    }
    let stopping = bead.meta(meta::AGENT_STATE) == Some("stopping");
    let closed_by = envelope.closed_by;
    let status_changed = envelope
        .changes
        .as_ref()
        .map(|changes| changes.contains_key("status"))
        .unwrap_or(false);
    let kind = match action {
        "created" => EventKind::Spawn,
        "updated" if stopping => EventKind::Stop,
        // A re-opened bead moving back to in_progress wants its pod back.
        "updated" if status_changed && bead.status == "in_progress" => EventKind::Spawn,
        "updated" => EventKind::Update,
        "closed" => {
            if let Some(who) = closed_by.as_ref() {
                debug!("bead {} closed by {}", cyan(&bead.id), who);
            }
            EventKind::Done
        }
        other => {
            debug!("ignoring unknown bead action {}", other);
            return None;
        }
    };
    let agent = match AgentBead::validate(bead) {
        Some(agent) => agent,
        // validate already logged the reason.
        None => return None,
    };
    Some(LifecycleEvent {
        kind,
        bead_id: agent.id,
        coords: agent.coords,
        metadata: agent.metadata,
    })
}

/// One wire record, assembled from consecutive `id:`/`event:`/`data:`
/// lines up to a blank line.
#[derive(Debug, Default, Eq, PartialEq)]
struct SseRecord {
    id: Option<String>,
    event: Option<String>,
    data: String,
}

impl SseRecord {
    fn is_blank(&self) -> bool {
        self.id.is_none() && self.event.is_none() && self.data.is_empty()
    }
}

/// An incremental `text/event-stream` scanner. Chunks arrive on arbitrary
/// byte boundaries; complete records come out.
#[derive(Default)]
struct SseParser {
    buffer: Vec<u8>,
    current: SseRecord,
}

impl SseParser {
    fn feed(&mut self, chunk: &[u8]) -> Vec<SseRecord> {
        self.buffer.extend_from_slice(chunk);
        let mut records = Vec::new();
        while let Some(at) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=at).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(|c| c == '\n' || c == '\r');
            if line.is_empty() {
                if !self.current.is_blank() {
                    records.push(std::mem::take(&mut self.current));
                }
                continue;
            }
            // A leading colon marks a keepalive comment.
            if line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                // A bare field name is legal SSE; none of ours are.
                None => continue,
            };
            match field {
                "id" => self.current.id = Some(value.to_string()),
                "event" => self.current.event = Some(value.to_string()),
                "data" => {
                    if !self.current.data.is_empty() {
                        self.current.data.push('\n');
                    }
                    self.current.data.push_str(value);
                }
                _ => (),
            }
        }
        records
    }
}

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("failed to construct the event stream HTTP client")]
    Client {
        #[source]
        source: reqwest::Error,
    },
}

impl FleetError for StreamError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_payload(id: &str) -> String {
        format!(
            r#"{{"bead":{{"id":"{}","type":"agent","status":"open","project":"p","mode":"crew","role":"dev","agent_name":"alpha","metadata":{{}}}}}}"#,
            id
        )
    }

    #[test]
    fn parser_assembles_records_across_chunks() {
        let mut parser = SseParser::default();
        assert!(parser.feed(b"id: 7\nev").is_empty());
        let records = parser.feed(b"ent: beads.bead.created\ndata: {\"x\":1}\n\n");
        assert_eq!(1, records.len());
        assert_eq!(Some("7".to_string()), records[0].id);
        assert_eq!(Some("beads.bead.created".to_string()), records[0].event);
        assert_eq!("{\"x\":1}", records[0].data);
    }

    #[test]
    fn parser_discards_keepalive_comments() {
        let mut parser = SseParser::default();
        let records = parser.feed(b": keepalive\n\nid: 9\nevent: t\ndata: d\n\n");
        assert_eq!(1, records.len());
        assert_eq!(Some("9".to_string()), records[0].id);
    }

    #[test]
    fn parser_handles_crlf_and_multiple_records() {
        let mut parser = SseParser::default();
        let records =
            parser.feed(b"id: 1\r\nevent: a\r\ndata: x\r\n\r\nid: 2\r\nevent: b\r\ndata: y\r\n\r\n");
        assert_eq!(2, records.len());
        assert_eq!("x", records[0].data);
        assert_eq!(Some("2".to_string()), records[1].id);
    }

    #[test]
    fn decode_created_is_spawn() {
        let event = decode("beads.bead.created", &spawn_payload("bd-1")).unwrap();
        assert_eq!(EventKind::Spawn, event.kind);
        assert_eq!("bd-1", event.bead_id);
        assert_eq!("crew-p-dev-alpha", event.pod_name());
    }

    #[test]
    fn decode_closed_is_done() {
        let payload = r#"{"bead":{"id":"bd-1","type":"agent","status":"closed","project":"p","role":"dev","agent_name":"alpha"},"closed_by":"operator"}"#;
        let event = decode("beads.bead.closed", payload).unwrap();
        assert_eq!(EventKind::Done, event.kind);
    }

    #[test]
    fn decode_updated_stopping_is_stop() {
        let payload = r#"{"bead":{"id":"bd-1","type":"agent","status":"open","project":"p","role":"dev","agent_name":"alpha","metadata":{"agent_state":"stopping"}}}"#;
        let event = decode("beads.bead.updated", payload).unwrap();
        assert_eq!(EventKind::Stop, event.kind);
    }

    #[test]
    fn decode_updated_reopened_is_spawn() {
        let payload = r#"{"bead":{"id":"bd-1","type":"agent","status":"in_progress","project":"p","role":"dev","agent_name":"alpha"},"changes":{"status":"in_progress"}}"#;
        let event = decode("beads.bead.updated", payload).unwrap();
        assert_eq!(EventKind::Spawn, event.kind);
    }

    #[test]
    fn decode_plain_update_is_update() {
        let payload = r#"{"bead":{"id":"bd-1","type":"agent","status":"open","project":"p","role":"dev","agent_name":"alpha"},"changes":{"notes":"x"}}"#;
        let event = decode("beads.bead.updated", payload).unwrap();
        assert_eq!(EventKind::Update, event.kind);
    }

    #[test]
    fn decode_deleted_is_dropped() {
        assert!(decode("beads.bead.deleted", r#"{"bead_id":"bd-1"}"#).is_none());
    }

    #[test]
    fn decode_foreign_topic_is_dropped() {
        assert!(decode("ci.run.created", &spawn_payload("bd-1")).is_none());
    }

    #[test]
    fn decode_non_agent_bead_is_dropped() {
        let payload = r#"{"bead":{"id":"bd-1","type":"task","project":"p","role":"dev","agent_name":"alpha"}}"#;
        assert!(decode("beads.bead.created", payload).is_none());
    }

    #[test]
    fn decode_malformed_json_is_dropped() {
        assert!(decode("beads.bead.created", "{not json").is_none());
    }

    #[test]
    fn decode_incomplete_coordinates_are_dropped() {
        let payload = r#"{"bead":{"id":"bd-1","type":"agent","project":"p","role":"","agent_name":"alpha"}}"#;
        assert!(decode("beads.bead.created", payload).is_none());
    }

    #[test]
    fn absorb_advances_id_even_for_dropped_records() {
        let (stream, _rx) = EventStream::new("http://localhost:8080").unwrap();
        let outcome = stream.absorb(SseRecord {
            id: Some("42".to_string()),
            event: None,
            data: String::new(),
        });
        assert_eq!(Absorb::Dropped, outcome);
        assert_eq!(Some("42".to_string()), stream.last_event_id());
    }

    #[test]
    fn absorb_delivers_decoded_events_in_order() {
        let (stream, mut rx) = EventStream::new("http://localhost:8080").unwrap();
        for &(id, bead) in &[("1", "bd-1"), ("2", "bd-2")] {
            stream.absorb(SseRecord {
                id: Some(id.to_string()),
                event: Some("beads.bead.created".to_string()),
                data: spawn_payload(bead),
            });
        }
        assert_eq!("bd-1", rx.try_recv().unwrap().bead_id);
        assert_eq!("bd-2", rx.try_recv().unwrap().bead_id);
        assert_eq!(Some("2".to_string()), stream.last_event_id());
    }

    #[test]
    fn absorb_drops_on_full_channel() {
        let (stream, mut rx) = EventStream::new("http://localhost:8080").unwrap();
        for n in 0..=EVENT_CHANNEL_CAPACITY {
            let outcome = stream.absorb(SseRecord {
                id: Some(format!("{}", n)),
                event: Some("beads.bead.created".to_string()),
                data: spawn_payload(&format!("bd-{}", n)),
            });
            if n < EVENT_CHANNEL_CAPACITY {
                assert_eq!(Absorb::Delivered, outcome);
            } else {
                // The overflow event is shed, never queued.
                assert_eq!(Absorb::Dropped, outcome);
            }
        }
        let mut delivered = 0;
        while rx.try_recv().is_ok() {
            delivered += 1;
        }
        assert_eq!(EVENT_CHANNEL_CAPACITY, delivered);
    }

    #[test]
    fn reconnect_carries_last_event_id() {
        let (stream, _rx) = EventStream::new("http://localhost:8080").unwrap();
        stream.absorb(SseRecord {
            id: Some("99".to_string()),
            event: None,
            data: String::new(),
        });
        let request = stream.connect_request().build().unwrap();
        assert_eq!(
            "99",
            request.headers().get("Last-Event-ID").unwrap().to_str().unwrap()
        );
    }

    #[test]
    fn first_connect_has_no_replay_header() {
        let (stream, _rx) = EventStream::new("http://localhost:8080").unwrap();
        let request = stream.connect_request().build().unwrap();
        assert!(request.headers().get("Last-Event-ID").is_none());
    }
}

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{fast_config, wait_until, MockPort};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use vlcchat::config::SessionConfig;
use vlcchat::device::{DeviceError, LinkState, VlcDevice};
use vlcchat::session::{ChatSession, SessionError, SessionEvent};
use vlcchat::storage::{AckStatus, ConversationStore, SharedStore};

const WAIT: Duration = Duration::from_secs(2);

struct Harness {
    _dir: tempfile::TempDir,
    port: MockPort,
    store: SharedStore,
    session: ChatSession,
    events: UnboundedReceiver<SessionEvent>,
}

fn harness_with_history(ack_timeout_ms: u64, history: Option<&str>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.json");
    if let Some(history) = history {
        std::fs::write(&path, history).unwrap();
    }
    let store = ConversationStore::open(&path).unwrap().into_shared();
    let port = MockPort::new();
    let device = Arc::new(VlcDevice::with_opener(fast_config(), port.opener()));
    let (session, events) =
        ChatSession::new(device, Arc::clone(&store), &SessionConfig { ack_timeout_ms });
    Harness {
        _dir: dir,
        port,
        store,
        session,
        events,
    }
}

async fn started(ack_timeout_ms: u64) -> Harness {
    let harness = harness_with_history(ack_timeout_ms, None);
    harness.session.start().await.unwrap();
    harness.port.clear_written();
    harness
}

async fn next_event(events: &mut UnboundedReceiver<SessionEvent>) -> SessionEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("event within limit")
        .expect("event channel open")
}

fn sent_status(store: &SharedStore, contact: &str) -> Option<AckStatus> {
    store.lock().unwrap().get_conversation(contact).unwrap().sent[0].ack_status
}

#[tokio::test]
async fn ack_before_timeout_confirms_once() {
    let mut h = started(200).await;
    let record = h.session.send_text("cd", "hello").unwrap();
    assert_eq!(record.ack_status, Some(AckStatus::Outstanding));
    assert_eq!(h.port.written(), "m[hello\0,CD]\n");
    assert_eq!(sent_status(&h.store, "CD"), Some(AckStatus::Outstanding));

    h.port.feed("m[P,1,CD]\n");
    assert_eq!(
        next_event(&mut h.events).await,
        SessionEvent::Delivered {
            contact: "CD".into(),
            timestamp: record.timestamp,
        }
    );

    // the timer fires but finds the message already confirmed
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert!(h.events.try_recv().is_err());
    assert_eq!(sent_status(&h.store, "CD"), Some(AckStatus::Confirmed));
    h.session.stop().await;
}

#[tokio::test]
async fn missing_ack_times_out_exactly_once() {
    let mut h = started(100).await;
    let record = h.session.send_text("EF", "anyone?").unwrap();

    assert_eq!(
        next_event(&mut h.events).await,
        SessionEvent::TimedOut {
            contact: "EF".into(),
            timestamp: record.timestamp,
        }
    );
    assert_eq!(sent_status(&h.store, "EF"), Some(AckStatus::Failed));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(h.events.try_recv().is_err());
    h.session.stop().await;
}

#[tokio::test]
async fn late_ack_overrides_timeout() {
    let mut h = started(50).await;
    let record = h.session.send_text("EF", "slow").unwrap();
    assert!(matches!(
        next_event(&mut h.events).await,
        SessionEvent::TimedOut { .. }
    ));

    h.port.feed("m[P,1,EF]\n");
    assert_eq!(
        next_event(&mut h.events).await,
        SessionEvent::Delivered {
            contact: "EF".into(),
            timestamp: record.timestamp,
        }
    );
    assert_eq!(sent_status(&h.store, "EF"), Some(AckStatus::Confirmed));
    h.session.stop().await;
}

#[tokio::test]
async fn received_messages_are_stored_with_normalized_sequence() {
    let history = r#"[{"MAC": "AB", "SentMessages": [{"timestamp": "2025-01-01T00:00:00Z", "message": "old", "ack": "true", "seq": 10}]}]"#;
    let mut h = harness_with_history(5000, Some(history));
    h.session.start().await.unwrap();

    h.port.feed("m[R,CD,hello]\ns[R,D,CD->AA,5,2]\n");
    match next_event(&mut h.events).await {
        SessionEvent::Received {
            contact,
            text,
            stats,
        } => {
            assert_eq!(contact, "CD");
            assert_eq!(text, "hello");
            assert_eq!(stats.and_then(|s| s.seq), Some(2));
        }
        other => panic!("unexpected event {:?}", other),
    }
    let conversation = h.store.lock().unwrap().get_conversation("CD").unwrap();
    assert_eq!(conversation.received[0].seq, Some(13));
    assert_eq!(conversation.received[0].ack_status, None);
    h.session.stop().await;
}

#[tokio::test]
async fn broadcast_messages_are_stored_under_ff() {
    let mut h = started(5000).await;
    h.port.feed("m[R,CD,to all]\ns[R,D,CD->FF,6,0]\n");
    assert!(matches!(
        next_event(&mut h.events).await,
        SessionEvent::Received { ref contact, .. } if contact == "FF"
    ));
    let store = h.store.lock().unwrap();
    assert_eq!(store.list_contacts(), vec!["FF".to_string()]);
    assert_eq!(store.get_conversation("FF").unwrap().received[0].text, "to all");
    drop(store);
    h.session.stop().await;
}

#[tokio::test]
async fn colliding_receive_sequence_keeps_the_message() {
    let mut h = started(5000).await;
    h.port.feed("m[R,CD,first]\ns[R,D,CD->AA,5,0]\n");
    next_event(&mut h.events).await;
    h.port.feed("m[R,CD,second]\ns[R,D,CD->AA,6,0]\n");
    next_event(&mut h.events).await;

    let conversation = h.store.lock().unwrap().get_conversation("CD").unwrap();
    assert_eq!(conversation.received.len(), 2);
    assert_eq!(conversation.received[0].seq, Some(1));
    assert_eq!(conversation.received[1].seq, None);
    h.session.stop().await;
}

#[tokio::test]
async fn sequence_number_links_receive_ack_to_message() {
    let mut h = started(5000).await;
    let record = h.session.send_text("CD", "tracked").unwrap();

    h.port.feed("s[T,D,AA->CD,7(9),4]\n");
    let store = Arc::clone(&h.store);
    assert!(
        wait_until(
            || store.lock().unwrap().get_conversation("CD").unwrap().sent[0].seq == Some(5),
            WAIT
        )
        .await
    );

    h.port.feed("s[R,A,CD->AA,3,4]\n");
    assert_eq!(
        next_event(&mut h.events).await,
        SessionEvent::Delivered {
            contact: "CD".into(),
            timestamp: record.timestamp,
        }
    );
    assert_eq!(sent_status(&h.store, "CD"), Some(AckStatus::Confirmed));

    // the ack line for the same message adds nothing further
    h.port.feed("m[P,1,CD]\n");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.events.try_recv().is_err());
    h.session.stop().await;
}

#[tokio::test]
async fn rejected_sends_record_nothing() {
    let h = harness_with_history(5000, None);
    let err = h.session.send_text("CD", "too early").unwrap_err();
    assert!(matches!(
        err,
        SessionError::Device(DeviceError::NotReady(LinkState::Stopped))
    ));

    h.session.start().await.unwrap();
    h.port.clear_written();
    let err = h.session.send_text("CD", "na\u{ef}ve").unwrap_err();
    assert!(matches!(err, SessionError::Device(DeviceError::InvalidText(_))));
    let err = h.session.send_text("C D E", "hello").unwrap_err();
    assert!(matches!(
        err,
        SessionError::Device(DeviceError::InvalidAddress(_))
    ));

    assert!(h.store.lock().unwrap().list_contacts().is_empty());
    assert_eq!(h.port.written(), "");
    h.session.stop().await;
}

#[tokio::test]
async fn write_failure_marks_message_failed() {
    let h = started(5000).await;
    h.port.set_fail_writes(true);
    let err = h.session.send_text("CD", "lost").unwrap_err();
    assert!(matches!(err, SessionError::Device(DeviceError::Io(_))));
    assert_eq!(sent_status(&h.store, "CD"), Some(AckStatus::Failed));
    h.session.stop().await;
}

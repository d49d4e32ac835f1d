mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use common::{collector, fast_config, wait_until, MockPort};
use vlcchat::config::DeviceConfig;
use vlcchat::device::{DeviceError, LinkPort, LinkState, VlcDevice};
use vlcchat::protocol::LinkStats;

const WAIT: Duration = Duration::from_secs(2);

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_750_000_000 + secs, 0).unwrap()
}

async fn started(port: &MockPort) -> VlcDevice {
    let device = VlcDevice::with_opener(fast_config(), port.opener());
    device.start().await.expect("start");
    port.clear_written();
    device
}

#[tokio::test]
async fn start_runs_configuration_handshake() {
    let port = MockPort::new();
    let device = VlcDevice::with_opener(fast_config(), port.opener());
    assert_eq!(device.state(), LinkState::Stopped);

    device.start().await.unwrap();
    assert_eq!(device.state(), LinkState::Ready);
    assert_eq!(port.written(), "a[AA]\nc[1,0,5]\nc[0,1,30]\nc[0,2,20]\n");
    assert_eq!(port.clears(), 1);

    // second start is a no-op
    device.start().await.unwrap();
    assert_eq!(port.written(), "a[AA]\nc[1,0,5]\nc[0,1,30]\nc[0,2,20]\n");
    device.stop().await;
}

#[tokio::test]
async fn handshake_floors_fec_and_sends_optional_log_level() {
    let port = MockPort::new();
    let mut config = fast_config();
    config.mac = "bb".into();
    config.fec_threshold = 3;
    config.n_retransmissions = 2;
    config.log_level = Some(7);
    let device = VlcDevice::with_opener(config, port.opener());
    device.start().await.unwrap();
    assert_eq!(
        port.written(),
        "a[BB]\nc[1,0,2]\nc[0,1,10]\nc[0,2,20]\nc[2,0,7]\n"
    );
    device.stop().await;
}

#[tokio::test]
async fn open_failure_is_a_connection_error() {
    let mut config = fast_config();
    config.port = "/dev/does-not-exist".into();
    let device = VlcDevice::with_opener(
        config,
        Box::new(|config: &DeviceConfig| -> Result<Box<dyn LinkPort>, DeviceError> {
            Err(DeviceError::Connection {
                port: config.port.clone(),
                reason: "no such device".into(),
            })
        }),
    );
    let err = device.start().await.unwrap_err();
    assert!(matches!(err, DeviceError::Connection { ref port, .. } if port == "/dev/does-not-exist"));
    assert_eq!(device.state(), LinkState::Stopped);
}

#[tokio::test]
async fn send_requires_ready_device() {
    let port = MockPort::new();
    let device = VlcDevice::with_opener(fast_config(), port.opener());
    let err = device.send("CD", "hello", ts(0)).unwrap_err();
    assert!(matches!(err, DeviceError::NotReady(LinkState::Stopped)));
    assert_eq!(port.written(), "");
}

#[tokio::test]
async fn invalid_sends_are_rejected_before_writing() {
    let port = MockPort::new();
    let device = started(&port).await;

    assert!(matches!(
        device.send("CD", "caf\u{e9}", ts(0)),
        Err(DeviceError::InvalidText(_))
    ));
    assert!(matches!(
        device.send("CD", &"x".repeat(200), ts(1)),
        Err(DeviceError::InvalidText(_))
    ));
    assert!(matches!(
        device.send("", "hello", ts(2)),
        Err(DeviceError::InvalidAddress(_))
    ));
    assert_eq!(port.written(), "");
    assert_eq!(device.pending_acks("CD"), 0);
    device.stop().await;
}

#[tokio::test]
async fn send_writes_message_command() {
    let port = MockPort::new();
    let device = started(&port).await;
    device.send("cd", "hi\tthere", ts(0)).unwrap();
    assert_eq!(port.written(), "m[hi\\tthere\0,CD]\n");
    assert_eq!(device.pending_acks("CD"), 1);
    device.stop().await;
}

#[tokio::test]
async fn failed_write_leaves_nothing_pending() {
    let port = MockPort::new();
    let device = started(&port).await;
    port.set_fail_writes(true);
    let err = device.send("CD", "hello", ts(0)).unwrap_err();
    assert!(matches!(err, DeviceError::Io(_)));
    assert_eq!(device.pending_acks("CD"), 0);
    device.stop().await;
}

#[tokio::test]
async fn acks_confirm_sends_in_order_per_destination() {
    let port = MockPort::new();
    let device = started(&port).await;
    let acks = collector::<(String, DateTime<Utc>)>();
    let sink = Arc::clone(&acks);
    device.subscribe_ack(move |contact, timestamp| {
        sink.lock().unwrap().push((contact.to_string(), timestamp));
    });

    device.send("AB", "one", ts(1)).unwrap();
    device.send("CD", "other", ts(2)).unwrap();
    device.send("AB", "two", ts(3)).unwrap();
    device.send("AB", "three", ts(4)).unwrap();
    port.feed("m[P,1,AB]\nm[P,1,CD]\nm[P,1,AB]\n");
    port.feed("m[P,1,AB]\n");

    assert!(wait_until(|| acks.lock().unwrap().len() == 4, WAIT).await);
    let got = acks.lock().unwrap().clone();
    assert_eq!(
        got,
        vec![
            ("AB".to_string(), ts(1)),
            ("CD".to_string(), ts(2)),
            ("AB".to_string(), ts(3)),
            ("AB".to_string(), ts(4)),
        ]
    );
    assert_eq!(device.pending_acks("AB"), 0);
    device.stop().await;
}

#[tokio::test]
async fn unmatched_and_dropped_acks_do_not_notify() {
    let port = MockPort::new();
    let device = started(&port).await;
    let acks = collector::<String>();
    let sink = Arc::clone(&acks);
    device.subscribe_ack(move |contact, _| sink.lock().unwrap().push(contact.to_string()));

    device.send("CD", "lost", ts(1)).unwrap();
    device.send("CD", "kept", ts(2)).unwrap();
    let before = vlcchat::metrics::snapshot();
    port.feed("m[P,1,EF]\nm[P,0,CD]\nm[P,1,CD]\n");

    assert!(wait_until(|| acks.lock().unwrap().len() == 1, WAIT).await);
    // the drop consumed the first send, so the success belongs to the second
    assert_eq!(acks.lock().unwrap().as_slice(), ["CD".to_string()]);
    let after = vlcchat::metrics::snapshot();
    assert!(after.acks_unmatched > before.acks_unmatched);
    assert!(after.acks_dropped > before.acks_dropped);
    device.stop().await;
}

#[tokio::test]
async fn received_message_is_paired_with_statistics() {
    let port = MockPort::new();
    let device = started(&port).await;
    let messages = collector::<(String, String, Option<LinkStats>)>();
    let sink = Arc::clone(&messages);
    device.subscribe_message(move |contact, text, stats| {
        sink.lock()
            .unwrap()
            .push((contact.to_string(), text.to_string(), stats.cloned()));
    });
    let stats_seen = collector::<LinkStats>();
    let stats_sink = Arc::clone(&stats_seen);
    device.subscribe_stats(move |stats| stats_sink.lock().unwrap().push(stats.clone()));

    port.feed("boot noise\nm[R,CD,hi\\nthere]\n");
    port.feed("s[R,A,CD->AA,3,1]\n");
    port.feed("s[R,D,CD->AA,12(15),7,3,16,1.5,1024.25]\n");

    assert!(wait_until(|| messages.lock().unwrap().len() == 1, WAIT).await);
    let (contact, text, stats) = messages.lock().unwrap()[0].clone();
    assert_eq!(contact, "CD");
    assert_eq!(text, "hi\nthere");
    let stats = stats.expect("paired statistics");
    assert!(stats.is_data());
    assert_eq!(stats.seq, Some(7));
    assert_eq!(stats.tx_size, Some(15));
    // every statistics line is published, paired or not
    assert!(wait_until(|| stats_seen.lock().unwrap().len() == 2, WAIT).await);
    device.stop().await;
}

#[tokio::test]
async fn broadcast_statistics_map_contact_to_ff() {
    let port = MockPort::new();
    let device = started(&port).await;
    let contacts = collector::<String>();
    let sink = Arc::clone(&contacts);
    device.subscribe_message(move |contact, _, _| sink.lock().unwrap().push(contact.to_string()));

    port.feed("m[R,CD,to everyone]\ns[R,D,CD->FF,11,2]\n");
    assert!(wait_until(|| contacts.lock().unwrap().len() == 1, WAIT).await);
    assert_eq!(contacts.lock().unwrap()[0], "FF");
    device.stop().await;
}

#[tokio::test]
async fn unpaired_message_is_delivered_after_grace() {
    let port = MockPort::new();
    let mut config = fast_config();
    config.receive_stats_grace_ms = 50;
    let device = VlcDevice::with_opener(config, port.opener());
    let messages = collector::<(String, bool)>();
    let sink = Arc::clone(&messages);
    device.subscribe_message(move |contact, _, stats| {
        sink.lock().unwrap().push((contact.to_string(), stats.is_some()));
    });
    device.start().await.unwrap();

    port.feed("m[R,EF,anyone?]\n");
    assert!(wait_until(|| messages.lock().unwrap().len() == 1, WAIT).await);
    assert_eq!(messages.lock().unwrap()[0], ("EF".to_string(), false));
    device.stop().await;
}

#[tokio::test]
async fn transmit_statistics_assign_sequence_numbers() {
    let port = MockPort::new();
    let device = started(&port).await;
    let assigned = collector::<(String, u32, DateTime<Utc>)>();
    let sink = Arc::clone(&assigned);
    device.subscribe_sequence(move |contact, seq, timestamp| {
        sink.lock().unwrap().push((contact.to_string(), seq, timestamp));
    });

    device.send("CD", "first", ts(1)).unwrap();
    device.send("CD", "second", ts(2)).unwrap();
    // the repeated seq 4 is a retransmission of the first message
    port.feed("s[T,D,AA->CD,10(12),4]\ns[T,D,AA->CD,10(12),4]\ns[T,D,AA->CD,11(13),5]\n");

    assert!(wait_until(|| assigned.lock().unwrap().len() == 2, WAIT).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        assigned.lock().unwrap().clone(),
        vec![("CD".to_string(), 4, ts(1)), ("CD".to_string(), 5, ts(2))]
    );
    device.stop().await;
}

#[tokio::test]
async fn stop_is_idempotent_and_blocks_sends() {
    let port = MockPort::new();
    let device = started(&port).await;
    device.stop().await;
    device.stop().await;
    assert_eq!(device.state(), LinkState::Stopped);
    assert!(matches!(
        device.send("CD", "late", ts(0)),
        Err(DeviceError::NotReady(LinkState::Stopped))
    ));
}

#[tokio::test]
async fn read_failure_stops_reader_and_restart_recovers() {
    let port = MockPort::new();
    let device = started(&port).await;
    port.set_fail_reads(true);
    assert!(wait_until(|| device.state() == LinkState::Stopped, WAIT).await);

    port.set_fail_reads(false);
    device.start().await.unwrap();
    assert_eq!(device.state(), LinkState::Ready);
    device.send("CD", "back again", ts(0)).unwrap();
    device.stop().await;
}

use serde_json::json;

use super::{Processor, mailbox, new_processor_id, run};
use crate::broker::message::Message;
use crate::utils::testing::{RecordingProcessor, wait_until};

#[test]
fn processor_ids_are_unique() {
    assert_ne!(new_processor_id(), new_processor_id());
}

#[tokio::test]
async fn run_processes_messages_in_mailbox_order() {
    let processor = RecordingProcessor::new("p1");
    let (handle, mailbox) = mailbox("p1", 8);

    let first = Message::new("lists", "created", json!({ "n": 1 }));
    let second = Message::new("lists", "created", json!({ "n": 2 }));
    handle.try_deliver(first.clone().into()).unwrap();
    handle.try_deliver(second.clone().into()).unwrap();

    let task = {
        let processor = processor.clone();
        tokio::spawn(async move { run(&processor, mailbox).await })
    };

    let recorded = &processor;
    assert!(wait_until(move || async move { recorded.seen().len() == 2 }).await);
    assert_eq!(processor.seen(), vec![first, second]);

    handle.close();
    task.await.unwrap().unwrap();
    assert_eq!(processor.close_count(), 1);
}

#[tokio::test]
async fn closing_the_handle_calls_handle_close_once() {
    let processor = RecordingProcessor::new("p1");
    let (handle, mailbox) = mailbox("p1", 1);

    handle.close();
    handle.close();
    run(&processor, mailbox).await.unwrap();

    assert_eq!(processor.close_count(), 1);
    assert!(processor.seen().is_empty());
    assert!(handle.is_closed());
}

#[tokio::test]
async fn process_error_stops_the_loop_and_fires_done() {
    let processor = RecordingProcessor::failing("p1");
    let (handle, mailbox) = mailbox("p1", 4);
    handle
        .try_deliver(Message::new("lists", "created", json!(null)).into())
        .unwrap();

    let result = run(&processor, mailbox).await;

    assert!(result.is_err());
    assert_eq!(processor.close_count(), 1);
    assert!(handle.is_closed());
}

#[tokio::test]
async fn dropped_handle_ends_the_run_loop() {
    let processor = RecordingProcessor::new("p1");
    let (handle, mailbox) = mailbox("p1", 4);
    drop(handle);

    run(&processor, mailbox).await.unwrap();
    assert_eq!(processor.close_count(), 1);
}

#[tokio::test]
async fn full_mailbox_rejects_delivery() {
    let (handle, mut mailbox) = mailbox("p1", 1);
    let message = Message::new("lists", "created", json!(null));

    handle.try_deliver(message.clone().into()).unwrap();
    assert!(handle.try_deliver(message.clone().into()).is_err());

    assert_eq!(mailbox.try_recv().as_deref(), Some(&message));
    assert!(mailbox.try_recv().is_none());
}

#[test]
fn processor_reports_its_id() {
    let processor = RecordingProcessor::new("abc");
    assert_eq!(processor.id(), "abc");
}

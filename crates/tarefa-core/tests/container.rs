//! End-to-end broker scenarios over the in-memory template: enqueue through
//! handler execution, delay fidelity, retry exhaustion, visibility-timeout
//! recovery and pool-bounded draining.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::time::sleep;

use tarefa_core::template::{epoch_ms, keys};
use tarefa_core::{
    handler_fn, ContainerConfig, HandlerRegistry, ListenerContainer, MemoryTemplate, Message,
    MessageProcessor, MessageTemplate, QueueDescriptor,
};

/// Visibility window small enough for tests but above the validation floor.
const TEST_VISIBILITY_MS: u64 = 1_600;

#[derive(Default)]
struct CountingProcessor(AtomicU32);

#[async_trait]
impl MessageProcessor for CountingProcessor {
    async fn process(&self, _message: &Message) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn test_config() -> ContainerConfig {
    ContainerConfig {
        poll_interval_ms: 20,
        tick_floor_ms: 5,
        tick_ceiling_ms: 50,
        shutdown_grace_ms: 2_000,
        ..ContainerConfig::default()
    }
}

async fn queue_totals(template: &MemoryTemplate, queue: &str) -> (u64, u64, u64) {
    (
        template.size(&keys::ready_key(queue)).await.unwrap(),
        template.size(&keys::delayed_key(queue)).await.unwrap(),
        template.size(&keys::processing_key(queue)).await.unwrap(),
    )
}

async fn wait_for<F, Fut>(what: &str, timeout: Duration, condition: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let result = tokio::time::timeout(timeout, async {
        loop {
            if condition().await {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread")]
async fn successful_message_is_handled_exactly_once() {
    let template = Arc::new(MemoryTemplate::new());
    let calls = Arc::new(AtomicU32::new(0));
    let payloads = Arc::new(Mutex::new(Vec::new()));

    let mut registry = HandlerRegistry::new();
    let (calls_in, payloads_in) = (calls.clone(), payloads.clone());
    registry
        .register(
            QueueDescriptor::new("q1").max_job_execution_time_ms(TEST_VISIBILITY_MS),
            handler_fn(move |_message, value| {
                let calls = calls_in.clone();
                let payloads = payloads_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    payloads.lock().unwrap().push(value);
                    Ok(())
                }
            }),
        )
        .unwrap();

    let container = ListenerContainer::builder()
        .registry(registry)
        .template(template.clone())
        .config(test_config())
        .build()
        .unwrap();
    container.start().await.unwrap();

    let sender = container.sender().unwrap();
    sender.enqueue("q1", &json!("A")).await.unwrap();

    let (template_ref, calls_ref) = (template.clone(), calls.clone());
    wait_for("handler to run and settle", Duration::from_secs(5), || {
        let template = template_ref.clone();
        let calls = calls_ref.clone();
        async move {
            calls.load(Ordering::SeqCst) == 1
                && queue_totals(&template, "q1").await == (0, 0, 0)
        }
    })
    .await;

    // Give the broker a moment to prove it will not deliver again.
    sleep(Duration::from_millis(200)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(*payloads.lock().unwrap(), vec![json!("A")]);

    container.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn delayed_message_is_not_delivered_early() {
    let template = Arc::new(MemoryTemplate::new());
    let handled_at = Arc::new(Mutex::new(None::<u64>));

    let mut registry = HandlerRegistry::new();
    let handled_in = handled_at.clone();
    registry
        .register(
            QueueDescriptor::new("q1")
                .delayed(true)
                .max_job_execution_time_ms(TEST_VISIBILITY_MS),
            handler_fn(move |_message, _value| {
                let handled = handled_in.clone();
                async move {
                    *handled.lock().unwrap() = Some(epoch_ms());
                    Ok(())
                }
            }),
        )
        .unwrap();

    let container = ListenerContainer::builder()
        .registry(registry)
        .template(template.clone())
        .config(test_config())
        .build()
        .unwrap();
    container.start().await.unwrap();

    let delay = Duration::from_millis(700);
    let not_before = epoch_ms() + delay.as_millis() as u64;
    let sender = container.sender().unwrap();
    sender.enqueue_in("q1", &json!("B"), delay).await.unwrap();

    sleep(Duration::from_millis(200)).await;
    assert_eq!(queue_totals(&template, "q1").await, (0, 1, 0));
    assert!(handled_at.lock().unwrap().is_none());

    let handled_ref = handled_at.clone();
    wait_for("delayed delivery", Duration::from_secs(5), || {
        let handled = handled_ref.clone();
        async move { handled.lock().unwrap().is_some() }
    })
    .await;

    // Delivered no earlier than the schedule, modulo one scheduler tick.
    let at = handled_at.lock().unwrap().unwrap();
    assert!(at + 50 >= not_before, "delivered {}ms early", not_before - at);

    container.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_retries_move_the_message_to_the_dlq() {
    let template = Arc::new(MemoryTemplate::new());
    let calls = Arc::new(AtomicU32::new(0));
    let dlq_hook = Arc::new(CountingProcessor::default());

    let mut registry = HandlerRegistry::new();
    let calls_in = calls.clone();
    registry
        .register(
            QueueDescriptor::new("q1")
                .num_retries(2)
                .dead_letter_queue("q1_dlq")
                .max_job_execution_time_ms(TEST_VISIBILITY_MS),
            handler_fn(move |_message, _value| {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("always fails".into())
                }
            }),
        )
        .unwrap();

    let container = ListenerContainer::builder()
        .registry(registry)
        .template(template.clone())
        .config(test_config())
        .dead_letter_queue_message_processor(dlq_hook.clone())
        .build()
        .unwrap();
    container.start().await.unwrap();

    let sender = container.sender().unwrap();
    sender.enqueue("q1", &json!("C")).await.unwrap();

    let template_ref = template.clone();
    wait_for("message to reach the DLQ", Duration::from_secs(5), || {
        let template = template_ref.clone();
        async move { template.size("q1_dlq").await.unwrap() == 1 }
    })
    .await;

    // Initial attempt plus two retries.
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(queue_totals(&template, "q1").await, (0, 0, 0));
    assert_eq!(dlq_hook.0.load(Ordering::SeqCst), 1);

    let dead = template.read_from_list("q1_dlq", 0, -1).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert!(dead[0].re_enqueued_at.is_some());
    assert_eq!(dead[0].retry_count, 2);

    container.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn visibility_timeout_recovers_a_stuck_handler() {
    let template = Arc::new(MemoryTemplate::new());
    let calls = Arc::new(AtomicU32::new(0));
    let observed_retries = Arc::new(Mutex::new(Vec::new()));

    let mut registry = HandlerRegistry::new();
    let (calls_in, retries_in) = (calls.clone(), observed_retries.clone());
    registry
        .register(
            QueueDescriptor::new("q1")
                .num_retries(3)
                .max_job_execution_time_ms(TEST_VISIBILITY_MS),
            handler_fn(move |message, _value| {
                let calls = calls_in.clone();
                let retries = retries_in.clone();
                async move {
                    let call = calls.fetch_add(1, Ordering::SeqCst);
                    retries.lock().unwrap().push(message.retry_count);
                    if call == 0 {
                        // Outlive the visibility window on the first attempt.
                        sleep(Duration::from_millis(TEST_VISIBILITY_MS + 2_000)).await;
                    }
                    Ok(())
                }
            }),
        )
        .unwrap();

    let container = ListenerContainer::builder()
        .registry(registry)
        .template(template.clone())
        .config(test_config())
        .build()
        .unwrap();
    container.start().await.unwrap();

    let sender = container.sender().unwrap();
    sender.enqueue("q1", &json!("D")).await.unwrap();

    let (template_ref, calls_ref) = (template.clone(), calls.clone());
    wait_for(
        "reaper to redeliver the stuck message",
        Duration::from_secs(10),
        || {
            let template = template_ref.clone();
            let calls = calls_ref.clone();
            async move {
                calls.load(Ordering::SeqCst) == 2
                    && queue_totals(&template, "q1").await == (0, 0, 0)
            }
        },
    )
    .await;

    assert_eq!(*observed_retries.lock().unwrap(), vec![0, 1]);

    container.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_retries_without_dlq_invoke_the_discard_hook() {
    let template = Arc::new(MemoryTemplate::new());
    let calls = Arc::new(AtomicU32::new(0));
    let discard_hook = Arc::new(CountingProcessor::default());

    let mut registry = HandlerRegistry::new();
    let calls_in = calls.clone();
    registry
        .register(
            QueueDescriptor::new("q1")
                .num_retries(1)
                .max_job_execution_time_ms(TEST_VISIBILITY_MS),
            handler_fn(move |_message, _value| {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("always fails".into())
                }
            }),
        )
        .unwrap();

    let container = ListenerContainer::builder()
        .registry(registry)
        .template(template.clone())
        .config(test_config())
        .discard_message_processor(discard_hook.clone())
        .build()
        .unwrap();
    container.start().await.unwrap();

    let sender = container.sender().unwrap();
    sender.enqueue("q1", &json!("E")).await.unwrap();

    let hook_ref = discard_hook.clone();
    wait_for("discard hook", Duration::from_secs(5), || {
        let hook = hook_ref.clone();
        async move { hook.0.load(Ordering::SeqCst) == 1 }
    })
    .await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(queue_totals(&template, "q1").await, (0, 0, 0));

    container.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn bulk_enqueue_drains_through_a_bounded_pool() {
    const TOTAL: u32 = 1_000;

    let template = Arc::new(MemoryTemplate::new());
    let calls = Arc::new(AtomicU32::new(0));

    let mut registry = HandlerRegistry::new();
    let calls_in = calls.clone();
    registry
        .register(
            QueueDescriptor::new("q1").max_job_execution_time_ms(TEST_VISIBILITY_MS),
            handler_fn(move |_message, _value| {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .unwrap();

    let container = ListenerContainer::builder()
        .registry(registry)
        .template(template.clone())
        .config(ContainerConfig {
            max_num_workers: Some(8),
            ..test_config()
        })
        .build()
        .unwrap();
    container.start().await.unwrap();

    let sender = container.sender().unwrap();
    for i in 0..TOTAL {
        sender.enqueue("q1", &json!({ "n": i })).await.unwrap();
    }

    let (template_ref, calls_ref) = (template.clone(), calls.clone());
    wait_for("all messages to drain", Duration::from_secs(30), || {
        let template = template_ref.clone();
        let calls = calls_ref.clone();
        async move {
            calls.load(Ordering::SeqCst) == TOTAL
                && queue_totals(&template, "q1").await == (0, 0, 0)
        }
    })
    .await;

    container.stop().await.unwrap();
}

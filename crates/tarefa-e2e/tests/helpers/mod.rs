#![allow(dead_code)]

use tarefa_core::template::keys;
use tarefa_core::{MessageTemplate, RedisMessageTemplate};
use uuid::Uuid;

/// Redis endpoint for the e2e suite.
pub fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string())
}

/// Connect a template to the test Redis.
pub async fn template() -> RedisMessageTemplate {
    RedisMessageTemplate::connect(&redis_url())
        .await
        .expect("connect to Redis — set REDIS_URL or start a local instance")
}

/// A queue name no other test run will collide with.
pub fn unique_queue(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::now_v7().simple())
}

/// Ready/delayed/processing sizes for a queue.
pub async fn queue_totals(template: &RedisMessageTemplate, queue: &str) -> (u64, u64, u64) {
    (
        template.size(&keys::ready_key(queue)).await.unwrap(),
        template.size(&keys::delayed_key(queue)).await.unwrap(),
        template.size(&keys::processing_key(queue)).await.unwrap(),
    )
}

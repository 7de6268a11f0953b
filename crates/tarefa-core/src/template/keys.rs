//! Redis key layout.
//!
//! This layout is an external contract shared with existing deployments and
//! the admin tooling — the ready list lives at the bare queue name, every
//! derived structure is the queue name plus a fixed suffix. Changing any
//! suffix is a breaking migration.

/// Suffix for the per-queue delayed sorted set (score = scheduled-at ms).
pub const DELAYED_SUFFIX: &str = ":delayed";

/// Suffix for the per-queue processing sorted set (score = visibility
/// deadline ms).
pub const PROCESSING_SUFFIX: &str = ":processing";

/// Suffix for the per-message metadata hash.
pub const META_SUFFIX: &str = ":meta";

/// Suffix for the per-queue configuration hash.
pub const CONFIG_SUFFIX: &str = ":config";

/// The ready list key is the queue name itself.
pub fn ready_key(queue: &str) -> String {
    queue.to_string()
}

/// Sorted set of future-scheduled messages for `queue`.
pub fn delayed_key(queue: &str) -> String {
    format!("{queue}{DELAYED_SUFFIX}")
}

/// Sorted set of in-flight messages for `queue`.
pub fn processing_key(queue: &str) -> String {
    format!("{queue}{PROCESSING_SUFFIX}")
}

/// Metadata hash for a message ID (`retry_count`, `max_retries`,
/// `re_enqueued_at`).
pub fn meta_key(message_id: &uuid::Uuid) -> String {
    format!("{message_id}{META_SUFFIX}")
}

/// Configuration hash for `queue`.
pub fn config_key(queue: &str) -> String {
    format!("{queue}{CONFIG_SUFFIX}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn ready_key_is_bare_queue_name() {
        assert_eq!(ready_key("orders"), "orders");
    }

    #[test]
    fn derived_keys_use_fixed_suffixes() {
        assert_eq!(delayed_key("orders"), "orders:delayed");
        assert_eq!(processing_key("orders"), "orders:processing");
        assert_eq!(config_key("orders"), "orders:config");
    }

    #[test]
    fn meta_key_uses_message_id() {
        let id = Uuid::now_v7();
        assert_eq!(meta_key(&id), format!("{id}:meta"));
    }

    #[test]
    fn derived_keys_never_collide_with_ready_list() {
        // A queue named "a" and a queue named "a:delayed" are distinct user
        // choices; within a single queue the four roles must be distinct.
        let q = "a";
        let keys = [
            ready_key(q),
            delayed_key(q),
            processing_key(q),
            config_key(q),
        ];
        for (i, a) in keys.iter().enumerate() {
            for b in keys.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn queue_name() -> impl Strategy<Value = String> {
            "[a-zA-Z0-9_.-]{1,100}"
        }

        proptest! {
            #[test]
            fn derived_keys_start_with_queue_name(queue in queue_name()) {
                prop_assert!(delayed_key(&queue).starts_with(&queue));
                prop_assert!(processing_key(&queue).starts_with(&queue));
                prop_assert!(config_key(&queue).starts_with(&queue));
            }

            #[test]
            fn delayed_and_processing_are_distinct(queue in queue_name()) {
                prop_assert_ne!(delayed_key(&queue), processing_key(&queue));
            }

            #[test]
            fn queue_name_is_recoverable_from_delayed_key(queue in queue_name()) {
                let key = delayed_key(&queue);
                prop_assert_eq!(key.strip_suffix(DELAYED_SUFFIX), Some(queue.as_str()));
            }
        }
    }
}

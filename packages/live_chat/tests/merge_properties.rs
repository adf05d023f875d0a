use chrono::{TimeZone, Utc};
use proptest::prelude::*;

use live_chat::log::{append, merge};
use live_chat::{ChannelKey, Message, MessageId, MessageLog};

// --- Generators ---

/// Messages are a function of their id, so two deliveries of the same id are
/// the same message. Timestamps collide on purpose to exercise tie-breaking.
fn message(id: u8) -> Message {
    let minute = u32::from(id) * 7 % 13;
    Message {
        id: MessageId::new(format!("m{id:02}")),
        channel: ChannelKey::Global,
        sender: format!("user{}", id % 4),
        body: format!("body {id}"),
        timestamp: Utc.with_ymd_and_hms(2024, 11, 25, 10, minute, 0).unwrap(),
    }
}

fn arb_batch() -> impl Strategy<Value = Vec<Message>> {
    prop::collection::vec(0u8..40, 0..25).prop_map(|ids| ids.into_iter().map(message).collect())
}

fn ids(log: &[Message]) -> Vec<&str> {
    log.iter().map(|m| m.id.as_str()).collect()
}

proptest! {
    #[test]
    fn merge_is_idempotent(a in arb_batch(), b in arb_batch()) {
        let once = merge(&a, &b);
        let twice = merge(&once, &b);
        prop_assert_eq!(ids(&once), ids(&twice));
    }

    #[test]
    fn merge_is_commutative(a in arb_batch(), b in arb_batch()) {
        prop_assert_eq!(merge(&a, &b), merge(&b, &a));
    }

    #[test]
    fn merge_output_is_sorted_and_unique(a in arb_batch(), b in arb_batch()) {
        let merged = merge(&a, &b);
        for pair in merged.windows(2) {
            prop_assert!(pair[0].timestamp <= pair[1].timestamp);
            prop_assert!(pair[0].id != pair[1].id);
        }
        let mut unique: Vec<_> = a.iter().chain(&b).map(|m| m.id.clone()).collect();
        unique.sort();
        unique.dedup();
        prop_assert_eq!(merged.len(), unique.len());
    }

    #[test]
    fn live_arrival_order_does_not_matter(
        history in arb_batch(),
        live in arb_batch().prop_shuffle(),
    ) {
        let expected = merge(&history, &live);

        // history first, then live one by one
        let mut first = MessageLog::new();
        first.merge_batch(history.clone());
        for msg in &live {
            first.append(msg.clone());
        }

        // live first (reversed), history lands last
        let mut second = MessageLog::new();
        for msg in live.iter().rev() {
            second.append(msg.clone());
        }
        second.merge_batch(history);

        prop_assert_eq!(first.messages(), expected.as_slice());
        prop_assert_eq!(second.messages(), expected.as_slice());
    }

    #[test]
    fn append_agrees_with_single_merge(base in arb_batch(), id in 0u8..40) {
        let log = merge(&base, &[]);
        prop_assert_eq!(append(&log, message(id)), merge(&log, &[message(id)]));
    }
}
